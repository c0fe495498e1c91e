use std::collections::HashMap;

use fleet_core::config::{AgentRuntime, Config, NotificationLevel};
use fleet_core::lifecycle::LifecyclePolicy;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.db_path, "~/.fleet/team.db");
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.health.stale_minutes, 30);
    assert_eq!(cfg.health.offline_minutes, 60);
    assert_eq!(cfg.health.stuck_minutes, 120);
    assert_eq!(cfg.health.stuck_autoblock_minutes, 180);
    assert_eq!(cfg.lifecycle.fix_loop_limit, 10);
    assert_eq!(cfg.review.grace_minutes, 60);
    assert_eq!(cfg.review.reviewer_stale_minutes, 20);
    assert_eq!(cfg.review.default_reviewer, "qa");
    assert_eq!(cfg.spawn.timeout_secs, 3600);
    assert_eq!(cfg.launcher.runtime, AgentRuntime::Openclaw);
    assert_eq!(cfg.notifications.level, NotificationLevel::Normal);
    assert_eq!(cfg.daemon.sweep_interval_secs, 300);
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("team.db"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed, cfg);
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[review]
grace_minutes = 15
reviewers = ["qa-a", "qa-b"]

[notifications]
level = "verbose"
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.review.grace_minutes, 15);
    assert_eq!(cfg.review.reviewers, vec!["qa-a", "qa-b"]);
    assert_eq!(cfg.notifications.level, NotificationLevel::Verbose);
    // untouched fields keep their defaults
    assert_eq!(cfg.review.reviewer_stale_minutes, 20);
    assert_eq!(cfg.health.stale_minutes, 30);
}

#[test]
fn threshold_ordering_is_enforced() {
    let mut cfg = Config::default();
    cfg.health.stale_minutes = 90;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.health.stuck_autoblock_minutes = cfg.health.stuck_minutes;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.lifecycle.fix_loop_warning = 10;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.review.grace_minutes = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn env_overrides_apply() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("FLEET_DB", "/tmp/fleet-test.db"),
        ("FLEET_REVIEW_GRACE_MINUTES", "5"),
        ("FLEET_REVIEWERS", "qa-1, qa-2,,"),
        ("FLEET_AGENT_RUNTIME", "claude_code"),
        ("FLEET_RUNTIME_DRY_RUN", "1"),
    ]);
    let mut cfg = Config::default();
    cfg.apply_env(|key| env.get(key).map(|v| v.to_string()))
        .expect("overrides apply");

    assert_eq!(cfg.general.db_path, "/tmp/fleet-test.db");
    assert_eq!(cfg.review.grace_minutes, 5);
    assert_eq!(cfg.review.reviewers, vec!["qa-1", "qa-2"]);
    assert_eq!(cfg.launcher.runtime, AgentRuntime::ClaudeCode);
    assert!(cfg.launcher.dry_run);
}

#[test]
fn bad_env_value_is_rejected() {
    let mut cfg = Config::default();
    let err = cfg
        .apply_env(|key| (key == "FLEET_REVIEW_GRACE_MINUTES").then(|| "soon".to_string()))
        .unwrap_err();
    assert!(err.to_string().contains("FLEET_REVIEW_GRACE_MINUTES"));

    let err = cfg
        .apply_env(|key| (key == "FLEET_AGENT_RUNTIME").then(|| "cron".to_string()))
        .unwrap_err();
    assert!(err.to_string().contains("unsupported runtime"));
}

#[test]
fn policies_follow_config() {
    let mut cfg = Config::default();
    cfg.lifecycle.working_memory_max_age_minutes = 45;
    cfg.review.human_only_markers = vec!["[owner]".into()];

    let policy = LifecyclePolicy::from_config(&cfg);
    assert_eq!(policy.working_memory_max_age.num_minutes(), 45);
    assert!(policy.human_only.is_human_only("sign off [OWNER]"));
    assert!(!policy.human_only.is_human_only("Approve @human"));

    let health = cfg.health.policy();
    assert_eq!(health.autoblock_after.num_minutes(), 180);
    assert_eq!(health.alert_retention.num_hours(), 24);
}
