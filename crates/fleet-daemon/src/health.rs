use chrono::{DateTime, Utc};
use fleet_core::config::HealthPolicy;
use fleet_core::error::Result;
use fleet_core::lifecycle::{Lifecycle, Mutation};
use fleet_core::store::StoreSnapshot;
use fleet_core::types::{AgentStatus, AlertKind, HealthStatus, TaskStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cycle::{apply_planned, ApplyTally};
use crate::notify::{NotificationDispatcher, NotificationEvent};

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub severity: Severity,
    pub entity_id: String,
    pub message: String,
}

/// An alert that goes out if the dedup table lets it through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAlert {
    pub kind: AlertKind,
    pub entity_id: String,
    pub event: NotificationEvent,
    pub message: String,
}

/// A mutation plus the alert to raise once it has been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMutation {
    pub mutation: Mutation,
    pub alert: Option<PlannedAlert>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthPlan {
    pub mutations: Vec<PlannedMutation>,
    pub alerts: Vec<PlannedAlert>,
    pub resolutions: Vec<(AlertKind, String)>,
    pub issues: Vec<HealthIssue>,
}

impl HealthPlan {
    fn issue(&mut self, severity: Severity, entity_id: &str, message: String) {
        self.issues.push(HealthIssue {
            severity,
            entity_id: entity_id.to_string(),
            message,
        });
    }

    fn resolve(&mut self, kind: AlertKind, entity_id: &str) {
        self.resolutions.push((kind, entity_id.to_string()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixLoopLimits {
    pub warning: u32,
    pub limit: u32,
}

/// Health derived from heartbeat age alone.
pub fn classify(last_heartbeat: Option<DateTime<Utc>>, now: DateTime<Utc>, policy: &HealthPolicy) -> HealthStatus {
    let Some(heartbeat) = last_heartbeat else {
        return HealthStatus::Unknown;
    };
    let age = now.signed_duration_since(heartbeat);
    if age > policy.offline_after {
        HealthStatus::Offline
    } else if age > policy.stale_after {
        HealthStatus::Stale
    } else {
        HealthStatus::Healthy
    }
}

fn alert(kind: AlertKind, entity_id: &str, event: NotificationEvent, message: &str) -> PlannedAlert {
    PlannedAlert {
        kind,
        entity_id: entity_id.to_string(),
        event,
        message: message.to_string(),
    }
}

/// Plan one health sweep from a snapshot.
pub fn plan(snapshot: &StoreSnapshot, now: DateTime<Utc>, policy: &HealthPolicy, limits: FixLoopLimits) -> HealthPlan {
    let mut plan = HealthPlan::default();

    for agent in &snapshot.agents {
        let health = classify(agent.last_heartbeat, now, policy);
        let age = agent.heartbeat_age_minutes(now);
        if health != agent.health_status {
            plan.mutations.push(PlannedMutation {
                mutation: Mutation::RecordHealth {
                    agent_id: agent.id.clone(),
                    health,
                },
                alert: None,
            });
        }

        match health {
            HealthStatus::Offline if agent.health_status != HealthStatus::Offline => {
                let msg = format!(
                    "Agent {} is OFFLINE (no heartbeat for {} minutes)",
                    agent.id,
                    age.unwrap_or_default()
                );
                plan.alerts.push(alert(AlertKind::AgentOffline, &agent.id, NotificationEvent::Alert, &msg));
                plan.issue(Severity::Critical, &agent.id, msg);
            }
            HealthStatus::Stale if agent.health_status == HealthStatus::Healthy => {
                let msg = format!(
                    "Agent {} is STALE (no heartbeat for {} minutes)",
                    agent.id,
                    age.unwrap_or_default()
                );
                plan.alerts.push(alert(AlertKind::AgentStale, &agent.id, NotificationEvent::Alert, &msg));
                plan.issue(Severity::Warning, &agent.id, msg);
            }
            HealthStatus::Healthy => {
                plan.resolve(AlertKind::AgentStale, &agent.id);
                plan.resolve(AlertKind::AgentOffline, &agent.id);
                plan.resolve(AlertKind::AgentTimeout, &agent.id);
            }
            _ => {}
        }

        let silent = match agent.last_heartbeat {
            None => true,
            Some(hb) => now.signed_duration_since(hb) > policy.stale_after,
        };
        if agent.status == AgentStatus::Active && silent {
            let held = agent
                .current_task_id
                .as_ref()
                .map(|t| format!("; released {t}"))
                .unwrap_or_default();
            let msg = match age {
                Some(minutes) => format!("Agent {} timed out after {minutes} minutes{held}", agent.id),
                None => format!("Agent {} is active but never sent a heartbeat{held}", agent.id),
            };
            plan.mutations.push(PlannedMutation {
                mutation: Mutation::ResetAgent {
                    agent_id: agent.id.clone(),
                    observed_heartbeat: agent.last_heartbeat,
                },
                alert: Some(alert(AlertKind::AgentTimeout, &agent.id, NotificationEvent::Block, &msg)),
            });
            plan.issue(Severity::Warning, &agent.id, msg);
        }
    }

    for task in &snapshot.tasks {
        let id = task.id.as_str();

        if task.status == TaskStatus::InProgress {
            let idle = now.signed_duration_since(task.updated_at);
            let minutes = idle.num_minutes();
            if idle >= policy.autoblock_after {
                let msg = format!("Task {id} stuck for {minutes} minutes; auto-blocked");
                plan.mutations.push(PlannedMutation {
                    mutation: Mutation::AutoBlockStuck {
                        task_id: task.id.clone(),
                        stuck_minutes: minutes,
                        observed_updated_at: task.updated_at,
                    },
                    alert: Some(alert(AlertKind::TaskAutoBlocked, id, NotificationEvent::Block, &msg)),
                });
                plan.issue(Severity::Warning, id, msg);
            } else if idle >= policy.stuck_after {
                let assignee = task.assignee.as_deref().unwrap_or("nobody");
                let msg = format!("Task {id} stuck for {minutes} minutes (assigned to {assignee})");
                plan.alerts.push(alert(AlertKind::TaskStuck, id, NotificationEvent::Alert, &msg));
                plan.issue(Severity::Warning, id, msg);
            } else {
                plan.resolve(AlertKind::TaskStuck, id);
                plan.resolve(AlertKind::TaskAutoBlocked, id);
            }

            if let Some(started) = task.started_at {
                let running = now.signed_duration_since(started);
                if running > policy.long_session_after {
                    plan.issue(
                        Severity::Info,
                        id,
                        format!(
                            "Long-running session: {} on {id} for {} minutes",
                            task.assignee.as_deref().unwrap_or("unassigned"),
                            running.num_minutes()
                        ),
                    );
                }
            }
        }

        if task.status == TaskStatus::Blocked {
            if task.is_auto_stopped() {
                let msg = format!(
                    "Task {id} auto-stopped after {} fix loops; manual unblock required",
                    task.fix_loop_count
                );
                plan.alerts.push(alert(AlertKind::AutoStop, id, NotificationEvent::AutoStop, &msg));
                plan.issue(Severity::Critical, id, msg);
            }
            continue;
        }
        let loops = task.fix_loop_count;
        if loops >= limits.limit {
            let msg = format!("Task {id} reached {loops} fix loops; auto-stopped");
            plan.mutations.push(PlannedMutation {
                mutation: Mutation::AutoStop {
                    task_id: task.id.clone(),
                },
                alert: Some(alert(AlertKind::AutoStop, id, NotificationEvent::AutoStop, &msg)),
            });
            plan.issue(Severity::Critical, id, msg);
        } else if loops >= limits.warning {
            let msg = format!("Task {id} at {loops}/{} fix loops", limits.limit);
            plan.alerts.push(alert(AlertKind::FixLoopWarning, id, NotificationEvent::Alert, &msg));
            plan.issue(Severity::Warning, id, msg);
        } else {
            plan.resolve(AlertKind::FixLoopWarning, id);
            plan.resolve(AlertKind::AutoStop, id);
        }
    }

    plan
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub agents_checked: usize,
    pub tasks_checked: usize,
    pub mutations: ApplyTally,
    pub alerts_sent: usize,
    pub alerts_suppressed: usize,
    pub alerts_resolved: usize,
    pub alerts_purged: usize,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// 0 when nothing notable, 1 for warnings, 2 for critical issues.
    pub fn exit_code(&self) -> i32 {
        if self.count(Severity::Critical) > 0 {
            2
        } else if self.count(Severity::Warning) > 0 {
            1
        } else {
            0
        }
    }
}

pub struct HealthSweep {
    lifecycle: Lifecycle,
    policy: HealthPolicy,
    limits: FixLoopLimits,
    notifications: Option<NotificationDispatcher>,
}

impl HealthSweep {
    pub fn new(lifecycle: Lifecycle, policy: HealthPolicy) -> Self {
        let limits = FixLoopLimits {
            warning: lifecycle.policy().fix_loop_warning,
            limit: lifecycle.policy().fix_loop_limit,
        };
        Self {
            lifecycle,
            policy,
            limits,
            notifications: None,
        }
    }

    pub fn with_notifications(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.notifications = Some(dispatcher);
        self
    }

    async fn raise(&self, alert: &PlannedAlert, now: DateTime<Utc>, report: &mut HealthReport) -> Result<()> {
        let store = self.lifecycle.store();
        if !store
            .should_alert(alert.kind, &alert.entity_id, now, self.policy.alert_cooldown)
            .await?
        {
            debug!(kind = alert.kind.as_str(), entity_id = %alert.entity_id, "alert suppressed");
            report.alerts_suppressed += 1;
            return Ok(());
        }
        report.alerts_sent += 1;
        if let Some(dispatcher) = &self.notifications {
            dispatcher.enqueue(alert.event, vec![alert.entity_id.clone()], alert.message.clone());
        }
        Ok(())
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let store = self.lifecycle.store();
        let snapshot = store.snapshot(now).await?;
        let plan = plan(&snapshot, now, &self.policy, self.limits);
        debug!(
            mutations = plan.mutations.len(),
            alerts = plan.alerts.len(),
            issues = plan.issues.len(),
            "health sweep planned"
        );

        let mut report = HealthReport {
            agents_checked: snapshot.agents.len(),
            tasks_checked: snapshot.tasks.len(),
            ..HealthReport::default()
        };

        for planned in plan.mutations {
            let applied = apply_planned(&self.lifecycle, planned.mutation, now, &mut report.mutations).await;
            if let (true, Some(alert)) = (applied, &planned.alert) {
                self.raise(alert, now, &mut report).await?;
            }
        }
        for alert in &plan.alerts {
            self.raise(alert, now, &mut report).await?;
        }
        for (kind, entity_id) in &plan.resolutions {
            if store.resolve_alert(*kind, entity_id).await? {
                report.alerts_resolved += 1;
            }
        }
        report.alerts_purged = store.cleanup_alerts(now, self.policy.alert_retention).await?;
        report.issues = plan.issues;

        let critical = report.count(Severity::Critical);
        let warnings = report.count(Severity::Warning);
        if critical > 0 {
            warn!(critical, warnings, "health sweep found critical issues");
        }
        info!(
            agents = report.agents_checked,
            tasks = report.tasks_checked,
            applied = report.mutations.applied,
            alerts_sent = report.alerts_sent,
            warnings,
            critical,
            "health sweep completed"
        );
        Ok(report)
    }
}
