pub mod agent;
pub mod alerts;
pub mod status;
pub mod sweep;
pub mod task;

use std::path::Path;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use fleet_core::config::{expand_home, Config};
use fleet_core::lifecycle::{Lifecycle, LifecyclePolicy};
use fleet_core::store::FleetStore;
use fleet_core::types::Task;
use fleet_daemon::notify::NotificationDispatcher;
use fleet_telemetry::logging::{self, LogFormat};
use serde::Serialize;

/// Loaded config plus an open store, shared by every subcommand.
pub struct Context {
    pub config: Config,
    pub lifecycle: Lifecycle,
    pub notifications: NotificationDispatcher,
    pub json: bool,
}

impl Context {
    pub async fn open(config_path: Option<&Path>, json: bool) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from(path).with_context(|| format!("failed to load {}", path.display()))?,
            None => Config::load().context("failed to load config")?,
        };
        // diagnostics go to stderr; keep them quiet unless RUST_LOG asks
        logging::init("fleet", "warn", LogFormat::from_flag(config.general.log_json));

        let db_path = expand_home(&config.general.db_path);
        let store = FleetStore::new(&db_path)
            .await
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        let notifications = NotificationDispatcher::from_config(store.clone(), &config.notifications);
        let lifecycle = Lifecycle::new(store, LifecyclePolicy::from_config(&config));
        Ok(Self {
            config,
            lifecycle,
            notifications,
            json,
        })
    }

    pub fn store(&self) -> &FleetStore {
        self.lifecycle.store()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Deliver whatever the command queued, retries included.
    pub async fn finish(&self) {
        let report = self.notifications.flush_settled().await;
        if report.failed > 0 {
            eprintln!("warning: {} notification(s) could not be delivered", report.failed);
        }
    }

    /// Print `value` as pretty JSON in `--json` mode, else the text form.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{}", text());
        }
        Ok(())
    }
}

/// One-line task summary used by most task commands.
pub fn task_line(task: &Task) -> String {
    format!(
        "{}  [{}]  {}  (assignee: {}, progress: {}%, fix loops: {})",
        task.id,
        task.status,
        task.title,
        task.assignee.as_deref().unwrap_or("-"),
        task.progress,
        task.fix_loop_count
    )
}
