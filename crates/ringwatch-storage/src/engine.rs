use crate::error::Result;
use crate::{
    AlertMuteRow, AlertRuleRow, ConfigStore, CurEventRow, HeartbeatRow, HisEventRow, TargetRow,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS heartbeat (
    instance_id TEXT PRIMARY KEY,
    cluster TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    last_heartbeat_ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_heartbeat_cluster ON heartbeat(cluster);

CREATE TABLE IF NOT EXISTS alert_rule (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    cluster TEXT NOT NULL DEFAULT '',
    severity INTEGER NOT NULL DEFAULT 2,
    disabled INTEGER NOT NULL DEFAULT 0,
    rule_type TEXT NOT NULL,
    config_json TEXT NOT NULL DEFAULT '{}',
    group_by TEXT NOT NULL DEFAULT '',
    for_duration INTEGER NOT NULL DEFAULT 0,
    recovery_duration INTEGER NOT NULL DEFAULT 0,
    eval_interval INTEGER NOT NULL DEFAULT 15,
    append_tags TEXT NOT NULL DEFAULT '',
    notify_channels TEXT NOT NULL DEFAULT '',
    notify_groups TEXT NOT NULL DEFAULT '',
    notify_repeat_step INTEGER NOT NULL DEFAULT 0,
    notify_max_number INTEGER NOT NULL DEFAULT 0,
    notify_on_recover INTEGER NOT NULL DEFAULT 0,
    enable_days_of_week TEXT NOT NULL DEFAULT '',
    enable_stime TEXT NOT NULL DEFAULT '',
    enable_etime TEXT NOT NULL DEFAULT '',
    update_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS alert_mute (
    id INTEGER PRIMARY KEY,
    cluster TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    cause TEXT NOT NULL DEFAULT '',
    begin_ts INTEGER NOT NULL,
    end_ts INTEGER NOT NULL,
    disabled INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS target (
    ident TEXT PRIMARY KEY,
    tags TEXT NOT NULL DEFAULT '',
    note TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS alert_cur_event (
    hash TEXT PRIMARY KEY,
    rule_id INTEGER NOT NULL,
    series_hash TEXT NOT NULL,
    owner TEXT NOT NULL,
    cluster TEXT NOT NULL,
    severity INTEGER NOT NULL,
    first_trigger_ts INTEGER NOT NULL,
    last_eval_ts INTEGER NOT NULL,
    last_sent_ts INTEGER NOT NULL DEFAULT 0,
    notify_repeat_next_ts INTEGER NOT NULL DEFAULT 0,
    notify_count INTEGER NOT NULL DEFAULT 0,
    tags TEXT NOT NULL DEFAULT '',
    trigger_value TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_cur_event_owner ON alert_cur_event(owner);

CREATE TABLE IF NOT EXISTS alert_his_event (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL,
    rule_id INTEGER NOT NULL,
    series_hash TEXT NOT NULL,
    cluster TEXT NOT NULL,
    severity INTEGER NOT NULL,
    first_trigger_ts INTEGER NOT NULL,
    last_eval_ts INTEGER NOT NULL,
    last_sent_ts INTEGER NOT NULL,
    notify_count INTEGER NOT NULL,
    tags TEXT NOT NULL,
    trigger_value TEXT NOT NULL,
    recover_ts INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_his_event_rule ON alert_his_event(rule_id);
";

const RULE_COLUMNS: &str = "id, name, cluster, severity, disabled, rule_type, config_json, \
    group_by, for_duration, recovery_duration, eval_interval, append_tags, notify_channels, \
    notify_groups, notify_repeat_step, notify_max_number, notify_on_recover, \
    enable_days_of_week, enable_stime, enable_etime, update_at";

const CUR_EVENT_COLUMNS: &str = "hash, rule_id, series_hash, owner, cluster, severity, \
    first_trigger_ts, last_eval_ts, last_sent_ts, notify_repeat_next_ts, notify_count, tags, \
    trigger_value";

const HIS_EVENT_COLUMNS: &str = "id, hash, rule_id, series_hash, cluster, severity, \
    first_trigger_ts, last_eval_ts, last_sent_ts, notify_count, tags, trigger_value, recover_ts";

/// [`ConfigStore`] backed by a single SQLite database.
///
/// All statements run on one connection guarded by a mutex; SQLite WAL mode
/// keeps readers of other processes unblocked.
pub struct SqliteConfigStore {
    conn: Mutex<Connection>,
}

impl SqliteConfigStore {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("Config store schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the connection, recovering from a poisoned Mutex if necessary.
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn delete_where_in<T: rusqlite::ToSql>(
        &self,
        table: &str,
        column: &str,
        keys: &[T],
    ) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!("DELETE FROM {table} WHERE {column} IN ({placeholders})");
        let conn = self.lock_conn();
        let n = conn.execute(&sql, params_from_iter(keys.iter()))?;
        Ok(n)
    }
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<AlertRuleRow> {
    Ok(AlertRuleRow {
        id: row.get(0)?,
        name: row.get(1)?,
        cluster: row.get(2)?,
        severity: row.get(3)?,
        disabled: row.get(4)?,
        rule_type: row.get(5)?,
        config_json: row.get(6)?,
        group_by: row.get(7)?,
        for_duration: row.get(8)?,
        recovery_duration: row.get(9)?,
        eval_interval: row.get(10)?,
        append_tags: row.get(11)?,
        notify_channels: row.get(12)?,
        notify_groups: row.get(13)?,
        notify_repeat_step: row.get(14)?,
        notify_max_number: row.get(15)?,
        notify_on_recover: row.get(16)?,
        enable_days_of_week: row.get(17)?,
        enable_stime: row.get(18)?,
        enable_etime: row.get(19)?,
        update_at: row.get(20)?,
    })
}

fn cur_event_from_row(row: &Row<'_>) -> rusqlite::Result<CurEventRow> {
    Ok(CurEventRow {
        hash: row.get(0)?,
        rule_id: row.get(1)?,
        series_hash: row.get(2)?,
        owner: row.get(3)?,
        cluster: row.get(4)?,
        severity: row.get(5)?,
        first_trigger_ts: row.get(6)?,
        last_eval_ts: row.get(7)?,
        last_sent_ts: row.get(8)?,
        notify_repeat_next_ts: row.get(9)?,
        notify_count: row.get(10)?,
        tags: row.get(11)?,
        trigger_value: row.get(12)?,
    })
}

fn his_event_from_row(row: &Row<'_>) -> rusqlite::Result<HisEventRow> {
    Ok(HisEventRow {
        id: row.get(0)?,
        hash: row.get(1)?,
        rule_id: row.get(2)?,
        series_hash: row.get(3)?,
        cluster: row.get(4)?,
        severity: row.get(5)?,
        first_trigger_ts: row.get(6)?,
        last_eval_ts: row.get(7)?,
        last_sent_ts: row.get(8)?,
        notify_count: row.get(9)?,
        tags: row.get(10)?,
        trigger_value: row.get(11)?,
        recover_ts: row.get(12)?,
    })
}

impl ConfigStore for SqliteConfigStore {
    fn upsert_heartbeat(&self, row: &HeartbeatRow) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO heartbeat (instance_id, cluster, endpoint, last_heartbeat_ts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(instance_id) DO UPDATE SET
                cluster = excluded.cluster,
                endpoint = excluded.endpoint,
                last_heartbeat_ts = excluded.last_heartbeat_ts",
            params![row.instance_id, row.cluster, row.endpoint, row.last_heartbeat_ts],
        )?;
        Ok(())
    }

    fn list_heartbeats(&self, cluster: &str) -> Result<Vec<HeartbeatRow>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT instance_id, cluster, endpoint, last_heartbeat_ts
             FROM heartbeat WHERE cluster = ?1 ORDER BY instance_id",
        )?;
        let rows = stmt.query_map(params![cluster], |row| {
            Ok(HeartbeatRow {
                instance_id: row.get(0)?,
                cluster: row.get(1)?,
                endpoint: row.get(2)?,
                last_heartbeat_ts: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn list_enabled_rules(&self) -> Result<Vec<AlertRuleRow>> {
        let conn = self.lock_conn();
        let sql = format!("SELECT {RULE_COLUMNS} FROM alert_rule WHERE disabled = 0 ORDER BY id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], rule_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn upsert_rule(&self, row: &AlertRuleRow) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO alert_rule ({RULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17, ?18, ?19, ?20, ?21)"
            ),
            params![
                row.id,
                row.name,
                row.cluster,
                row.severity,
                row.disabled,
                row.rule_type,
                row.config_json,
                row.group_by,
                row.for_duration,
                row.recovery_duration,
                row.eval_interval,
                row.append_tags,
                row.notify_channels,
                row.notify_groups,
                row.notify_repeat_step,
                row.notify_max_number,
                row.notify_on_recover,
                row.enable_days_of_week,
                row.enable_stime,
                row.enable_etime,
                row.update_at,
            ],
        )?;
        Ok(())
    }

    fn delete_rules(&self, ids: &[i64]) -> Result<usize> {
        self.delete_where_in("alert_rule", "id", ids)
    }

    fn list_mutes(&self) -> Result<Vec<AlertMuteRow>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, cluster, tags, cause, begin_ts, end_ts, disabled
             FROM alert_mute WHERE disabled = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AlertMuteRow {
                id: row.get(0)?,
                cluster: row.get(1)?,
                tags: row.get(2)?,
                cause: row.get(3)?,
                begin_ts: row.get(4)?,
                end_ts: row.get(5)?,
                disabled: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn upsert_mute(&self, row: &AlertMuteRow) -> Result<()> {
        // Filters are validated as JSON before they land in the table.
        let _: serde_json::Value = serde_json::from_str(&row.tags)?;
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO alert_mute (id, cluster, tags, cause, begin_ts, end_ts, disabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.cluster,
                row.tags,
                row.cause,
                row.begin_ts,
                row.end_ts,
                row.disabled
            ],
        )?;
        Ok(())
    }

    fn delete_mutes(&self, ids: &[i64]) -> Result<usize> {
        self.delete_where_in("alert_mute", "id", ids)
    }

    fn get_target(&self, ident: &str) -> Result<Option<TargetRow>> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT ident, tags, note FROM target WHERE ident = ?1",
                params![ident],
                |row| {
                    Ok(TargetRow {
                        ident: row.get(0)?,
                        tags: row.get(1)?,
                        note: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn upsert_target(&self, row: &TargetRow) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT OR REPLACE INTO target (ident, tags, note) VALUES (?1, ?2, ?3)",
            params![row.ident, row.tags, row.note],
        )?;
        Ok(())
    }

    fn upsert_cur_event(&self, row: &CurEventRow) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO alert_cur_event ({CUR_EVENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                row.hash,
                row.rule_id,
                row.series_hash,
                row.owner,
                row.cluster,
                row.severity,
                row.first_trigger_ts,
                row.last_eval_ts,
                row.last_sent_ts,
                row.notify_repeat_next_ts,
                row.notify_count,
                row.tags,
                row.trigger_value,
            ],
        )?;
        Ok(())
    }

    fn delete_cur_events(&self, hashes: &[String]) -> Result<usize> {
        self.delete_where_in("alert_cur_event", "hash", hashes)
    }

    fn list_cur_events(&self, owner: &str) -> Result<Vec<CurEventRow>> {
        let conn = self.lock_conn();
        let sql = format!(
            "SELECT {CUR_EVENT_COLUMNS} FROM alert_cur_event WHERE owner = ?1 ORDER BY hash"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![owner], cur_event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn insert_his_event(&self, row: &HisEventRow) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO alert_his_event (hash, rule_id, series_hash, cluster, severity,
                first_trigger_ts, last_eval_ts, last_sent_ts, notify_count, tags,
                trigger_value, recover_ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                row.hash,
                row.rule_id,
                row.series_hash,
                row.cluster,
                row.severity,
                row.first_trigger_ts,
                row.last_eval_ts,
                row.last_sent_ts,
                row.notify_count,
                row.tags,
                row.trigger_value,
                row.recover_ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_his_events(&self, rule_id: i64) -> Result<Vec<HisEventRow>> {
        let conn = self.lock_conn();
        let sql = format!(
            "SELECT {HIS_EVENT_COLUMNS} FROM alert_his_event WHERE rule_id = ?1 ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![rule_id], his_event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl std::fmt::Debug for SqliteConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConfigStore").finish_non_exhaustive()
    }
}
