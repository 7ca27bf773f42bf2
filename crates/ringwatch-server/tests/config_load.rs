use ringwatch_server::config::EvaluatorConfig;
use std::io::Write;
use std::time::Duration;

#[test]
fn config_file_is_loaded_with_defaults_for_missing_fields() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
instance_id = "eval-1"
listen = "0.0.0.0:9500"
store = "/var/lib/ringwatch/config.db"

[cluster]
name = "prod"
liveness_ttl = "15s"

[dispatch]
queue_max = 5000

[notify]
webhook_url = "http://hooks.local/alerts"
"#
    )
    .unwrap();

    let config = EvaluatorConfig::load(file.path().to_str().unwrap()).unwrap();
    assert_eq!(config.instance_id, "eval-1");
    assert_eq!(config.cluster.name, "prod");
    assert_eq!(config.cluster.liveness_ttl, Duration::from_secs(15));
    assert_eq!(config.cluster.heartbeat_interval, Duration::from_secs(1));
    assert_eq!(config.dispatch.queue_max, 5000);
    assert_eq!(config.dispatch.read_batch, 2000);
    assert_eq!(config.notify.webhook_url.as_deref(), Some("http://hooks.local/alerts"));
    assert_eq!(config.advertise_url(), "http://127.0.0.1:9500");
    assert!(config.validate().is_ok());
}

#[test]
fn malformed_file_fails_to_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[cluster\nname = ").unwrap();
    assert!(EvaluatorConfig::load(file.path().to_str().unwrap()).is_err());
}
