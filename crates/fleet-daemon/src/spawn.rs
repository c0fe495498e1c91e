use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleet_agents::launcher::{spawn_log_path, LaunchRequest, WorkerLauncher};
use fleet_agents::prompts::worker_prompt;
use fleet_core::config::{expand_home, Config};
use fleet_core::error::Result;
use fleet_core::lifecycle::Lifecycle;
use fleet_core::store::StoreSnapshot;
use fleet_core::types::{Task, TaskId, TaskStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::notify::{NotificationDispatcher, NotificationEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnPolicy {
    /// A freshly assigned task waits this long before its worker starts.
    pub settle: Duration,
    /// No second launch while a `spawned` entry is younger than this.
    pub recent_spawn: Duration,
    pub timeout_secs: u64,
    pub log_dir: PathBuf,
}

impl SpawnPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            settle: Duration::minutes(cfg.spawn.settle_minutes),
            recent_spawn: Duration::minutes(cfg.spawn.recent_spawn_minutes),
            timeout_secs: cfg.spawn.timeout_secs,
            log_dir: expand_home(&cfg.launcher.log_dir),
        }
    }
}

impl Default for SpawnPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SpawnSkip {
    Settling,
    NoWorkingDir,
    MissingWorkingDir { path: PathBuf },
    UnknownAssignee { agent_id: String },
    AssigneeBusy { agent_id: String },
    AlreadyBound { agent_id: String },
    RecentlySpawned { at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnCandidate {
    pub task: Task,
    pub agent_id: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnPlan {
    pub candidates: Vec<SpawnCandidate>,
    pub skipped: Vec<(TaskId, SpawnSkip)>,
}

fn check(
    snapshot: &StoreSnapshot,
    task: &Task,
    agent_id: &str,
    now: DateTime<Utc>,
    policy: &SpawnPolicy,
    dir_exists: &dyn Fn(&Path) -> bool,
) -> std::result::Result<PathBuf, SpawnSkip> {
    if now.signed_duration_since(task.updated_at) < policy.settle {
        return Err(SpawnSkip::Settling);
    }
    let dir = task
        .working_dir
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .map(expand_home)
        .ok_or(SpawnSkip::NoWorkingDir)?;
    if !dir_exists(&dir) {
        return Err(SpawnSkip::MissingWorkingDir { path: dir });
    }
    let agent = snapshot.agent(agent_id).ok_or_else(|| SpawnSkip::UnknownAssignee {
        agent_id: agent_id.to_string(),
    })?;
    if !agent.is_free() {
        return Err(SpawnSkip::AssigneeBusy {
            agent_id: agent_id.to_string(),
        });
    }
    if let Some(bound) = snapshot.bound_agents(&task.id).next() {
        return Err(SpawnSkip::AlreadyBound {
            agent_id: bound.id.clone(),
        });
    }
    if let Some(at) = snapshot.last_spawns.get(&task.id) {
        if now.signed_duration_since(*at) < policy.recent_spawn {
            return Err(SpawnSkip::RecentlySpawned { at: *at });
        }
    }
    Ok(dir)
}

/// Assigned `todo` tasks that need a worker, by priority then age.
pub fn plan(
    snapshot: &StoreSnapshot,
    now: DateTime<Utc>,
    policy: &SpawnPolicy,
    dir_exists: &dyn Fn(&Path) -> bool,
) -> SpawnPlan {
    let mut todo: Vec<&Task> = snapshot
        .tasks_in(TaskStatus::Todo)
        .filter(|t| t.assignee.is_some())
        .collect();
    todo.sort_by(|a, b| (a.priority.rank(), a.updated_at).cmp(&(b.priority.rank(), b.updated_at)));

    let mut out = SpawnPlan::default();
    for task in todo {
        let Some(agent_id) = task.assignee.as_deref() else {
            continue;
        };
        match check(snapshot, task, agent_id, now, policy, dir_exists) {
            Ok(working_dir) => out.candidates.push(SpawnCandidate {
                task: task.clone(),
                agent_id: agent_id.to_string(),
                working_dir,
            }),
            Err(skip) => out.skipped.push((task.id.clone(), skip)),
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpawnReport {
    pub launched: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub skipped: Vec<(TaskId, SpawnSkip)>,
}

pub struct SpawnSweep {
    lifecycle: Lifecycle,
    launcher: Arc<dyn WorkerLauncher>,
    policy: SpawnPolicy,
    notifications: Option<NotificationDispatcher>,
}

impl SpawnSweep {
    pub fn new(lifecycle: Lifecycle, launcher: Arc<dyn WorkerLauncher>, policy: SpawnPolicy) -> Self {
        Self {
            lifecycle,
            launcher,
            policy,
            notifications: None,
        }
    }

    pub fn with_notifications(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.notifications = Some(dispatcher);
        self
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<SpawnReport> {
        let snapshot = self.lifecycle.store().snapshot(now).await?;
        let plan = plan(&snapshot, now, &self.policy, &|p: &Path| p.is_dir());
        for (task_id, skip) in &plan.skipped {
            debug!(%task_id, ?skip, "spawn skipped");
        }

        let mut report = SpawnReport {
            skipped: plan.skipped,
            ..SpawnReport::default()
        };
        // one launch per agent per sweep
        let mut launched_agents = Vec::new();
        for candidate in plan.candidates {
            if launched_agents.contains(&candidate.agent_id) {
                continue;
            }
            let task_id = candidate.task.id.clone();
            let request = LaunchRequest {
                agent_id: candidate.agent_id.clone(),
                task_id: task_id.clone(),
                working_dir: candidate.working_dir.clone(),
                prompt: worker_prompt(&candidate.task, &candidate.agent_id),
                log_path: spawn_log_path(&self.policy.log_dir, &task_id, now),
                timeout_secs: self.policy.timeout_secs,
                label: format!("{}-{}", candidate.agent_id, task_id),
            };
            let outcome = self.launcher.launch(&request).await;
            if let Err(e) = self
                .lifecycle
                .record_spawn(&task_id, &candidate.agent_id, outcome.ok, &outcome.detail, now)
                .await
            {
                warn!(%task_id, error = %e, "failed to record spawn");
            }
            if outcome.ok {
                info!(%task_id, agent_id = %candidate.agent_id, log = %outcome.detail, "worker spawned");
                if let Some(dispatcher) = &self.notifications {
                    dispatcher.enqueue(
                        NotificationEvent::Start,
                        vec![task_id.to_string(), candidate.agent_id.clone()],
                        format!("{} spawned for {task_id}: {}", candidate.agent_id, candidate.task.title),
                    );
                }
                launched_agents.push(candidate.agent_id);
                report.launched.push(task_id);
            } else {
                warn!(%task_id, agent_id = %candidate.agent_id, detail = %outcome.detail, "worker spawn failed");
                if let Some(dispatcher) = &self.notifications {
                    dispatcher.enqueue(
                        NotificationEvent::Error,
                        vec![task_id.to_string(), candidate.agent_id.clone()],
                        format!("Spawn failed for {task_id} ({}): {}", candidate.agent_id, outcome.detail),
                    );
                }
                report.failed.push(task_id);
            }
        }
        info!(
            launched = report.launched.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "spawn sweep completed"
        );
        Ok(report)
    }
}
