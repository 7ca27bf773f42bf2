use crate::engine::SqliteConfigStore;
use crate::error::StorageError;
use crate::{AlertMuteRow, AlertRuleRow, ConfigStore, CurEventRow, HeartbeatRow, HisEventRow, TargetRow};
use tempfile::TempDir;

fn setup() -> (TempDir, SqliteConfigStore) {
    let dir = TempDir::new().unwrap();
    let store = SqliteConfigStore::open(&dir.path().join("ringwatch.db")).unwrap();
    (dir, store)
}

fn rule(id: i64, disabled: bool) -> AlertRuleRow {
    AlertRuleRow {
        id,
        name: format!("rule-{id}"),
        cluster: "default".to_string(),
        severity: 2,
        disabled,
        rule_type: "threshold".to_string(),
        config_json: r#"{"metric":"cpu_usage","op":">","threshold":80}"#.to_string(),
        group_by: String::new(),
        for_duration: 120,
        recovery_duration: 60,
        eval_interval: 15,
        append_tags: String::new(),
        notify_channels: "webhook".to_string(),
        notify_groups: "ops".to_string(),
        notify_repeat_step: 3600,
        notify_max_number: 0,
        notify_on_recover: true,
        enable_days_of_week: String::new(),
        enable_stime: String::new(),
        enable_etime: String::new(),
        update_at: 1_700_000_000,
    }
}

fn cur_event(hash: &str, owner: &str) -> CurEventRow {
    CurEventRow {
        hash: hash.to_string(),
        rule_id: 1,
        series_hash: "series".to_string(),
        owner: owner.to_string(),
        cluster: "default".to_string(),
        severity: 2,
        first_trigger_ts: 100,
        last_eval_ts: 160,
        last_sent_ts: 100,
        notify_repeat_next_ts: 3700,
        notify_count: 1,
        tags: "host=web-01".to_string(),
        trigger_value: "85".to_string(),
    }
}

#[test]
fn heartbeat_upsert_replaces_row() {
    let (_dir, store) = setup();
    let mut hb = HeartbeatRow {
        instance_id: "a".to_string(),
        cluster: "default".to_string(),
        endpoint: "http://10.0.0.1:9400".to_string(),
        last_heartbeat_ts: 100,
    };
    store.upsert_heartbeat(&hb).unwrap();
    hb.last_heartbeat_ts = 200;
    store.upsert_heartbeat(&hb).unwrap();

    let rows = store.list_heartbeats("default").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].last_heartbeat_ts, 200);
    assert!(store.list_heartbeats("other").unwrap().is_empty());
}

#[test]
fn heartbeats_listed_per_cluster_sorted() {
    let (_dir, store) = setup();
    for (id, cluster) in [("c", "default"), ("a", "default"), ("b", "east")] {
        store
            .upsert_heartbeat(&HeartbeatRow {
                instance_id: id.to_string(),
                cluster: cluster.to_string(),
                endpoint: format!("http://{id}:9400"),
                last_heartbeat_ts: 1,
            })
            .unwrap();
    }
    let ids: Vec<String> = store
        .list_heartbeats("default")
        .unwrap()
        .into_iter()
        .map(|r| r.instance_id)
        .collect();
    assert_eq!(ids, vec!["a", "c"]);
}

#[test]
fn list_enabled_rules_skips_disabled() {
    let (_dir, store) = setup();
    store.upsert_rule(&rule(1, false)).unwrap();
    store.upsert_rule(&rule(2, true)).unwrap();
    store.upsert_rule(&rule(3, false)).unwrap();

    let rules = store.list_enabled_rules().unwrap();
    let ids: Vec<i64> = rules.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(rules[0], rule(1, false));
}

#[test]
fn delete_rules_by_id() {
    let (_dir, store) = setup();
    store.upsert_rule(&rule(1, false)).unwrap();
    store.upsert_rule(&rule(2, false)).unwrap();
    assert_eq!(store.delete_rules(&[1, 99]).unwrap(), 1);
    assert_eq!(store.delete_rules(&[]).unwrap(), 0);
    assert_eq!(store.list_enabled_rules().unwrap().len(), 1);
}

#[test]
fn mute_with_invalid_json_rejected() {
    let (_dir, store) = setup();
    let mute = AlertMuteRow {
        id: 1,
        cluster: "default".to_string(),
        tags: "not json".to_string(),
        cause: "maintenance".to_string(),
        begin_ts: 0,
        end_ts: 100,
        disabled: false,
    };
    let err = store.upsert_mute(&mute).unwrap_err();
    assert!(matches!(err, StorageError::Json(_)));
}

#[test]
fn mutes_round_trip_and_delete() {
    let (_dir, store) = setup();
    let mute = AlertMuteRow {
        id: 7,
        cluster: "default".to_string(),
        tags: r#"[{"key":"host","op":"=","value":"web-01"}]"#.to_string(),
        cause: "maintenance".to_string(),
        begin_ts: 0,
        end_ts: 100,
        disabled: false,
    };
    store.upsert_mute(&mute).unwrap();
    store
        .upsert_mute(&AlertMuteRow {
            id: 8,
            disabled: true,
            ..mute.clone()
        })
        .unwrap();

    assert_eq!(store.list_mutes().unwrap(), vec![mute]);
    assert_eq!(store.delete_mutes(&[7, 8]).unwrap(), 2);
    assert!(store.list_mutes().unwrap().is_empty());
}

#[test]
fn target_lookup() {
    let (_dir, store) = setup();
    assert!(store.get_target("web-01").unwrap().is_none());
    let target = TargetRow {
        ident: "web-01".to_string(),
        tags: "dc=east team=core".to_string(),
        note: String::new(),
    };
    store.upsert_target(&target).unwrap();
    assert_eq!(store.get_target("web-01").unwrap(), Some(target));
}

#[test]
fn cur_events_filtered_by_owner() {
    let (_dir, store) = setup();
    store.upsert_cur_event(&cur_event("h1", "a")).unwrap();
    store.upsert_cur_event(&cur_event("h2", "b")).unwrap();

    let mut updated = cur_event("h1", "a");
    updated.last_eval_ts = 220;
    store.upsert_cur_event(&updated).unwrap();

    let rows = store.list_cur_events("a").unwrap();
    assert_eq!(rows, vec![updated]);

    assert_eq!(store.delete_cur_events(&["h1".to_string()]).unwrap(), 1);
    assert!(store.list_cur_events("a").unwrap().is_empty());
    assert_eq!(store.list_cur_events("b").unwrap().len(), 1);
}

#[test]
fn history_is_append_only() {
    let (_dir, store) = setup();
    let his = HisEventRow {
        id: 0,
        hash: "h1".to_string(),
        rule_id: 1,
        series_hash: "series".to_string(),
        cluster: "default".to_string(),
        severity: 2,
        first_trigger_ts: 100,
        last_eval_ts: 400,
        last_sent_ts: 100,
        notify_count: 1,
        tags: String::new(),
        trigger_value: "70".to_string(),
        recover_ts: 400,
    };
    let first = store.insert_his_event(&his).unwrap();
    let second = store.insert_his_event(&his).unwrap();
    assert!(second > first);

    let rows = store.list_his_events(1).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].id, first);
    assert_eq!(rows[0].recover_ts, 400);
    assert!(store.list_his_events(2).unwrap().is_empty());
}

#[test]
fn reopen_keeps_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("ringwatch.db");
    {
        let store = SqliteConfigStore::open(&path).unwrap();
        store.upsert_rule(&rule(5, false)).unwrap();
    }
    let store = SqliteConfigStore::open(&path).unwrap();
    assert_eq!(store.list_enabled_rules().unwrap().len(), 1);
}

#[test]
fn in_memory_store_works() {
    let store = SqliteConfigStore::open_in_memory().unwrap();
    store.upsert_cur_event(&cur_event("h", "a")).unwrap();
    assert_eq!(store.list_cur_events("a").unwrap().len(), 1);
}
