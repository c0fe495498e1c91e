use std::path::PathBuf;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::checklist::HumanOnlyMatcher;

/// Top-level configuration loaded from `~/.fleet/config.toml`.
///
/// Secrets are never stored here: sections name the environment variable
/// that holds a credential and [`CredentialProvider`] resolves it on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub spawn: SpawnConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from `~/.fleet/config.toml`, falling back to defaults
    /// when the file does not exist. Environment overrides are applied last.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::read(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path, then apply environment overrides.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut cfg = Self::read(&path.into())?;
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn read(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `FLEET_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("FLEET_DB") {
            self.general.db_path = path;
        }
        if let Some(raw) = lookup("FLEET_REVIEW_GRACE_MINUTES") {
            self.review.grace_minutes = parse_env("FLEET_REVIEW_GRACE_MINUTES", &raw)?;
        }
        if let Some(raw) = lookup("FLEET_REVIEWER_STALE_MINUTES") {
            self.review.reviewer_stale_minutes = parse_env("FLEET_REVIEWER_STALE_MINUTES", &raw)?;
        }
        if let Some(raw) = lookup("FLEET_REVIEWERS") {
            self.review.reviewers = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup("FLEET_AGENT_RUNTIME") {
            self.launcher.runtime = match raw.trim().to_lowercase().as_str() {
                "openclaw" => AgentRuntime::Openclaw,
                "claude_code" => AgentRuntime::ClaudeCode,
                other => {
                    return Err(ConfigError::Validation(format!(
                        "FLEET_AGENT_RUNTIME: unsupported runtime `{other}`"
                    )))
                }
            };
        }
        if let Some(raw) = lookup("FLEET_RUNTIME_DRY_RUN") {
            self.launcher.dry_run = raw.trim() == "1" || raw.trim().eq_ignore_ascii_case("true");
        }
        if let Some(template) = lookup("FLEET_WORKER_CMD_TEMPLATE") {
            self.launcher.command_template = Some(template);
        }
        Ok(())
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.health.validate()?;
        self.lifecycle.validate()?;
        self.review.validate()?;
        Ok(())
    }

    fn default_path() -> PathBuf {
        fleet_home().join("config.toml")
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Validation(format!("{key}: cannot parse `{raw}`")))
}

/// `~/.fleet`, or `./.fleet` when no home directory is available.
pub fn fleet_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleet")
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_db_path() -> String {
    "~/.fleet/team.db".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Agent staleness and stuck-task thresholds, in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_stale_minutes")]
    pub stale_minutes: i64,
    #[serde(default = "default_offline_minutes")]
    pub offline_minutes: i64,
    #[serde(default = "default_stuck_minutes")]
    pub stuck_minutes: i64,
    #[serde(default = "default_stuck_autoblock_minutes")]
    pub stuck_autoblock_minutes: i64,
    #[serde(default = "default_alert_cooldown_minutes")]
    pub alert_cooldown_minutes: i64,
    #[serde(default = "default_long_session_minutes")]
    pub long_session_minutes: i64,
    #[serde(default = "default_alert_retention_hours")]
    pub alert_retention_hours: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_minutes: default_stale_minutes(),
            offline_minutes: default_offline_minutes(),
            stuck_minutes: default_stuck_minutes(),
            stuck_autoblock_minutes: default_stuck_autoblock_minutes(),
            alert_cooldown_minutes: default_alert_cooldown_minutes(),
            long_session_minutes: default_long_session_minutes(),
            alert_retention_hours: default_alert_retention_hours(),
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = 0 < self.stale_minutes
            && self.stale_minutes < self.offline_minutes
            && self.offline_minutes <= self.stuck_minutes
            && self.stuck_minutes < self.stuck_autoblock_minutes;
        if !ordered {
            return Err(ConfigError::Validation(format!(
                "health thresholds must satisfy 0 < stale ({}) < offline ({}) <= stuck ({}) < stuck_autoblock ({})",
                self.stale_minutes, self.offline_minutes, self.stuck_minutes, self.stuck_autoblock_minutes
            )));
        }
        if self.alert_cooldown_minutes < 0 || self.alert_retention_hours <= 0 {
            return Err(ConfigError::Validation(
                "alert cooldown must be >= 0 and retention > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            stale_after: Duration::minutes(self.stale_minutes),
            offline_after: Duration::minutes(self.offline_minutes),
            stuck_after: Duration::minutes(self.stuck_minutes),
            autoblock_after: Duration::minutes(self.stuck_autoblock_minutes),
            alert_cooldown: Duration::minutes(self.alert_cooldown_minutes),
            long_session_after: Duration::minutes(self.long_session_minutes),
            alert_retention: Duration::hours(self.alert_retention_hours),
        }
    }
}

fn default_stale_minutes() -> i64 {
    30
}
fn default_offline_minutes() -> i64 {
    60
}
fn default_stuck_minutes() -> i64 {
    120
}
fn default_stuck_autoblock_minutes() -> i64 {
    180
}
fn default_alert_cooldown_minutes() -> i64 {
    30
}
fn default_long_session_minutes() -> i64 {
    180
}
fn default_alert_retention_hours() -> i64 {
    24
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_fix_loop_limit")]
    pub fix_loop_limit: u32,
    #[serde(default = "default_fix_loop_warning")]
    pub fix_loop_warning: u32,
    #[serde(default = "default_working_memory_max_age_minutes")]
    pub working_memory_max_age_minutes: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            fix_loop_limit: default_fix_loop_limit(),
            fix_loop_warning: default_fix_loop_warning(),
            working_memory_max_age_minutes: default_working_memory_max_age_minutes(),
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fix_loop_warning == 0 || self.fix_loop_warning >= self.fix_loop_limit {
            return Err(ConfigError::Validation(format!(
                "fix loop thresholds must satisfy 0 < warning ({}) < limit ({})",
                self.fix_loop_warning, self.fix_loop_limit
            )));
        }
        if self.working_memory_max_age_minutes <= 0 {
            return Err(ConfigError::Validation(
                "working_memory_max_age_minutes must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_fix_loop_limit() -> u32 {
    10
}
fn default_fix_loop_warning() -> u32 {
    8
}
fn default_working_memory_max_age_minutes() -> i64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: i64,
    #[serde(default = "default_reviewer_stale_minutes")]
    pub reviewer_stale_minutes: i64,
    #[serde(default = "default_clock_skew_tolerance_minutes")]
    pub clock_skew_tolerance_minutes: i64,
    /// Explicit reviewer pool; when empty the pool is discovered by pattern.
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default = "default_reviewer")]
    pub default_reviewer: String,
    #[serde(default = "default_reviewer_id_prefixes")]
    pub reviewer_id_prefixes: Vec<String>,
    #[serde(default = "default_reviewer_role_keywords")]
    pub reviewer_role_keywords: Vec<String>,
    #[serde(default = "default_human_only_markers")]
    pub human_only_markers: Vec<String>,
    #[serde(default = "default_human_only_prefixes")]
    pub human_only_prefixes: Vec<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            grace_minutes: default_grace_minutes(),
            reviewer_stale_minutes: default_reviewer_stale_minutes(),
            clock_skew_tolerance_minutes: default_clock_skew_tolerance_minutes(),
            reviewers: Vec::new(),
            default_reviewer: default_reviewer(),
            reviewer_id_prefixes: default_reviewer_id_prefixes(),
            reviewer_role_keywords: default_reviewer_role_keywords(),
            human_only_markers: default_human_only_markers(),
            human_only_prefixes: default_human_only_prefixes(),
        }
    }
}

impl ReviewConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grace_minutes <= 0 || self.reviewer_stale_minutes <= 0 {
            return Err(ConfigError::Validation(
                "review grace and reviewer stale minutes must be positive".into(),
            ));
        }
        if self.clock_skew_tolerance_minutes < 0 {
            return Err(ConfigError::Validation(
                "clock_skew_tolerance_minutes must be >= 0".into(),
            ));
        }
        Ok(())
    }

    pub fn human_only(&self) -> HumanOnlyMatcher {
        HumanOnlyMatcher::new(
            self.human_only_markers.clone(),
            self.human_only_prefixes.clone(),
        )
    }
}

fn default_grace_minutes() -> i64 {
    60
}
fn default_reviewer_stale_minutes() -> i64 {
    20
}
fn default_clock_skew_tolerance_minutes() -> i64 {
    5
}
fn default_reviewer() -> String {
    "qa".into()
}
fn default_reviewer_id_prefixes() -> Vec<String> {
    vec!["qa".into()]
}
fn default_reviewer_role_keywords() -> Vec<String> {
    vec!["qa".into(), "review".into()]
}
fn default_human_only_markers() -> Vec<String> {
    vec!["@human".into(), "human-only".into(), "🔒".into()]
}
fn default_human_only_prefixes() -> Vec<String> {
    vec!["human:".into()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfig {
    #[serde(default = "default_settle_minutes")]
    pub settle_minutes: i64,
    #[serde(default = "default_recent_spawn_minutes")]
    pub recent_spawn_minutes: i64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            settle_minutes: default_settle_minutes(),
            recent_spawn_minutes: default_recent_spawn_minutes(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_settle_minutes() -> i64 {
    2
}
fn default_recent_spawn_minutes() -> i64 {
    10
}
fn default_timeout_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRuntime {
    #[default]
    Openclaw,
    ClaudeCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub runtime: AgentRuntime,
    /// Whitespace-separated argv with `{agent_id}`, `{message}` and
    /// `{timeout}` placeholders.
    #[serde(default)]
    pub command_template: Option<String>,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            runtime: AgentRuntime::default(),
            command_template: None,
            log_dir: default_log_dir(),
            dry_run: false,
        }
    }
}

fn default_log_dir() -> String {
    "~/.fleet/logs".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Minimal,
    #[default]
    Normal,
    Verbose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub level: NotificationLevel,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_per_minute")]
    pub per_minute: u64,
    /// Sends tried per notification before it is dropped.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// First retry delay; doubles per attempt up to a minute.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: NotificationLevel::default(),
            telegram_chat_id: None,
            bot_token_env: default_bot_token_env(),
            api_base: default_api_base(),
            per_minute: default_per_minute(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_bot_token_env() -> String {
    "FLEET_TELEGRAM_BOT_TOKEN".into()
}
fn default_api_base() -> String {
    "https://api.telegram.org".into()
}
fn default_per_minute() -> u64 {
    20
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// Policies handed to components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    pub stale_after: Duration,
    pub offline_after: Duration,
    pub stuck_after: Duration,
    pub autoblock_after: Duration,
    pub alert_cooldown: Duration,
    pub long_session_after: Duration,
    pub alert_retention: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        HealthConfig::default().policy()
    }
}

// ---------------------------------------------------------------------------
// Credential provider
// ---------------------------------------------------------------------------

/// Resolves credentials named in config from the environment at runtime.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read a credential from a named env var; blank values count as unset.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}
