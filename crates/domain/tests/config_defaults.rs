use std::path::PathBuf;

use courier_domain::config::{Config, ConfigSeverity, DropStrategy};

#[test]
fn server_and_state_defaults() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 3720);
    assert_eq!(config.state.path, PathBuf::from("./data/state"));
    assert_eq!(config.state.flush_interval_secs, 30);
}

#[test]
fn listen_address_and_state_dir_override() {
    let toml_str = r#"
[server]
host = "0.0.0.0"
port = 8443

[state]
path = "/var/lib/courier"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 8443);
    assert_eq!(config.state.path, PathBuf::from("/var/lib/courier"));
    // Keys left unset inside an overridden section keep their defaults.
    assert_eq!(config.state.flush_interval_secs, 30);
    assert!(config.validate().is_empty());
}

#[test]
fn run_policy_defaults() {
    let config = Config::default();
    assert_eq!(config.runs.idle_timeout_ms, 7_200_000);
    assert_eq!(config.runs.confirm_timeout_ms, 300_000);
    assert_eq!(config.runs.cancel_grace_ms, 1_000);
    assert_eq!(config.runs.followup_grace_ms, 50);
    assert_eq!(config.runs.zero_answer_max_retries, 1);
}

#[test]
fn outbox_defaults() {
    let config = Config::default();
    assert_eq!(config.outbox.throttle_ms, 400);
    assert_eq!(config.outbox.max_rate_limit_retries, 5);
    assert_eq!(config.outbox.max_transient_retries, 3);
    assert_eq!(config.outbox.transient_backoff_base_ms, 500);
    assert_eq!(config.outbox.min_rate_limit_delay_ms, 1_000);
    assert_eq!(config.outbox.media_batch_max, 10);
    assert_eq!(config.outbox.media_send_delay_ms, 1_000);
    assert_eq!(config.outbox.dedupe_retention_secs, 3_600);
}

#[test]
fn compaction_defaults() {
    let config = Config::default();
    assert_eq!(config.compaction.reserve_tokens, 16_384);
    assert!((config.compaction.trigger_ratio - 0.9).abs() < f64::EPSILON);
    assert_eq!(config.compaction.default_context_window, 400_000);
}

#[test]
fn full_config_round_trips_through_toml() {
    let config = Config::default();
    let rendered = toml::to_string(&config).unwrap();
    let parsed: Config = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed.server.port, config.server.port);
    assert_eq!(parsed.stream.drop_strategy, DropStrategy::Error);
    assert_eq!(parsed.inbound.dedupe_ttl_secs, 600);
    assert!(parsed.validate().is_empty());
}

#[test]
fn partial_override_keeps_other_sections_default() {
    let toml_str = r#"
[outbox]
throttle_ms = 250

[engines]
default_engine = "codex"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.outbox.throttle_ms, 250);
    assert_eq!(config.engines.default_engine, "codex");
    assert_eq!(config.runs.idle_timeout_ms, 7_200_000);
}

#[test]
fn validation_reports_errors_with_fields() {
    let toml_str = r#"
[server]
port = 0

[stream]
max_queue = 0
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let issues = config.validate();
    let errors: Vec<_> = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|i| i.field == "server.port"));
    assert!(errors.iter().any(|i| i.field == "stream.max_queue"));
}
