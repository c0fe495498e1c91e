//! Starting external worker processes.
//!
//! Launching is fire-and-forget: the child is detached into its own process
//! group and the launcher only waits long enough to catch an immediate
//! failure. Completion is observed later through the store and the log file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::config::{AgentRuntime, LauncherConfig};
use fleet_core::types::TaskId;
use thiserror::Error;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub agent_id: String,
    pub task_id: TaskId,
    pub working_dir: PathBuf,
    pub prompt: String,
    pub log_path: PathBuf,
    pub timeout_secs: u64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub ok: bool,
    /// Log location on success, failure description otherwise.
    pub detail: String,
}

impl LaunchOutcome {
    pub fn started(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Starts one worker run bound to a task.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> LaunchOutcome;
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("command template is empty")]
    EmptyCommand,
    #[error("{program} exited with {code:?}; see {log}")]
    Exited {
        program: String,
        code: Option<i32>,
        log: String,
    },
}

// ---------------------------------------------------------------------------
// Log paths
// ---------------------------------------------------------------------------

fn stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// `spawn_<task>_<ts>.log` under `log_dir`.
pub fn spawn_log_path(log_dir: &Path, task_id: &TaskId, now: DateTime<Utc>) -> PathBuf {
    log_dir.join(format!("spawn_{}_{}.log", task_id, stamp(now)))
}

/// `review_<task>_<reviewer>_<ts>.log` under `log_dir`.
pub fn review_log_path(log_dir: &Path, task_id: &TaskId, reviewer: &str, now: DateTime<Utc>) -> PathBuf {
    log_dir.join(format!("review_{}_{}_{}.log", task_id, reviewer, stamp(now)))
}

// ---------------------------------------------------------------------------
// ProcessLauncher
// ---------------------------------------------------------------------------

pub struct ProcessLauncher {
    runtime: AgentRuntime,
    command_template: Option<String>,
    dry_run: bool,
    settle: Duration,
}

impl ProcessLauncher {
    pub fn from_config(cfg: &LauncherConfig) -> Self {
        Self {
            runtime: cfg.runtime,
            command_template: cfg.command_template.clone(),
            dry_run: cfg.dry_run,
            settle: Duration::from_secs(1),
        }
    }

    /// How long to wait before checking for an immediate exit.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Header plus prompt, as delivered to the worker.
    pub fn wrap_message(request: &LaunchRequest) -> String {
        format!(
            "[fleet] label: {}\n[fleet] working_dir: {}\n[fleet] task: {}\n[fleet] agent: {}\n\n{}",
            request.label,
            request.working_dir.display(),
            request.task_id,
            request.agent_id,
            request.prompt
        )
    }

    /// Render the argv for this runtime.
    pub fn command_for(&self, request: &LaunchRequest, message: &str) -> Result<Vec<String>, LaunchError> {
        let timeout = request.timeout_secs.to_string();
        match (self.runtime, &self.command_template) {
            (AgentRuntime::Openclaw, _) => Ok(vec![
                "openclaw".into(),
                "agent".into(),
                "--agent".into(),
                request.agent_id.clone(),
                "--message".into(),
                message.to_string(),
                "--timeout".into(),
                timeout,
            ]),
            (AgentRuntime::ClaudeCode, Some(template)) => {
                let argv: Vec<String> = template
                    .split_whitespace()
                    .map(|arg| {
                        arg.replace("{agent_id}", &request.agent_id)
                            .replace("{task_id}", request.task_id.as_str())
                            .replace("{timeout}", &timeout)
                            .replace("{message}", message)
                    })
                    .collect();
                if argv.is_empty() {
                    return Err(LaunchError::EmptyCommand);
                }
                Ok(argv)
            }
            (AgentRuntime::ClaudeCode, None) => {
                Ok(vec!["claude".into(), "-p".into(), message.to_string()])
            }
        }
    }

    async fn try_launch(&self, request: &LaunchRequest) -> Result<String, LaunchError> {
        let message = Self::wrap_message(request);
        let argv = self.command_for(request, &message)?;
        if let Some(parent) = request.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log_display = request.log_path.display().to_string();

        if self.dry_run {
            let body = format!("[DRY RUN] runtime={:?}\ncommand={:?}\n\n{}", self.runtime, argv, message);
            tokio::fs::write(&request.log_path, body).await?;
            return Ok(log_display);
        }

        let stdout = std::fs::File::create(&request.log_path)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env("FLEET_MESSAGE", &message)
            .env("FLEET_AGENT_ID", &request.agent_id)
            .env("FLEET_TASK_ID", request.task_id.as_str())
            .env("FLEET_WORKING_DIR", &request.working_dir)
            .kill_on_drop(false);
        if request.working_dir.is_dir() {
            cmd.current_dir(&request.working_dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        tokio::time::sleep(self.settle).await;
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                return Err(LaunchError::Exited {
                    program: argv[0].clone(),
                    code: status.code(),
                    log: log_display,
                });
            }
        }

        // Enforce the wall-clock budget for as long as this runtime lives.
        let budget = Duration::from_secs(request.timeout_secs);
        let task_id = request.task_id.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(budget, child.wait()).await.is_err() {
                warn!(task_id = %task_id, "worker exceeded its time budget; killing");
                if let Err(e) = child.start_kill() {
                    warn!(task_id = %task_id, error = %e, "failed to kill worker");
                }
            }
        });

        Ok(log_display)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> LaunchOutcome {
        match self.try_launch(request).await {
            Ok(log) => {
                info!(
                    task_id = %request.task_id,
                    agent_id = %request.agent_id,
                    label = %request.label,
                    dry_run = self.dry_run,
                    log = %log,
                    "worker launched"
                );
                LaunchOutcome::started(log)
            }
            Err(e) => {
                warn!(
                    task_id = %request.task_id,
                    agent_id = %request.agent_id,
                    error = %e,
                    "worker launch failed"
                );
                LaunchOutcome::failed(e.to_string())
            }
        }
    }
}
