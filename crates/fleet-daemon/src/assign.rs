use std::collections::HashSet;

use chrono::{DateTime, Utc};
use fleet_core::error::Result;
use fleet_core::lifecycle::{ApplyOutcome, Lifecycle, Mutation};
use fleet_core::store::StoreSnapshot;
use fleet_core::types::{Agent, Task, TaskId, TaskStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::notify::{NotificationDispatcher, NotificationEvent};

/// Keyword in a task's title or description, and the agent ids or roles it
/// points at.
pub const ROLE_KEYWORDS: &[(&str, &[&str])] = &[
    ("dev", &["dev", "solo-dev"]),
    ("frontend", &["dev", "ux-designer"]),
    ("backend", &["dev", "architect"]),
    ("database", &["architect", "dev"]),
    ("api", &["dev", "architect"]),
    ("ui", &["ux-designer"]),
    ("ux", &["ux-designer"]),
    ("test", &["qa"]),
    ("qa", &["qa"]),
    ("doc", &["tech-writer"]),
    ("document", &["tech-writer"]),
    ("design", &["ux-designer"]),
    ("plan", &["pm", "analyst"]),
    ("analyze", &["analyst"]),
    ("review", &["qa"]),
];

const KEYWORD_POINTS: u32 = 10;

/// Keyword affinity of `agent` for `task`.
pub fn score(task: &Task, agent: &Agent) -> u32 {
    let text = format!(
        "{} {}",
        task.title.to_lowercase(),
        task.description.as_deref().unwrap_or_default().to_lowercase()
    );
    let role = agent.role.to_lowercase();
    ROLE_KEYWORDS
        .iter()
        .filter(|(keyword, _)| text.contains(keyword))
        .filter(|(_, targets)| targets.iter().any(|t| *t == agent.id || *t == role))
        .count() as u32
        * KEYWORD_POINTS
}

/// Pair unassigned `todo` tasks with idle agents, one task per agent.
pub fn plan(snapshot: &StoreSnapshot) -> Vec<Mutation> {
    let holding: HashSet<&str> = snapshot
        .tasks_in(TaskStatus::Todo)
        .filter_map(|t| t.assignee.as_deref())
        .collect();
    let mut idle: Vec<&Agent> = snapshot
        .agents
        .iter()
        .filter(|a| a.is_free() && !holding.contains(a.id.as_str()))
        .collect();

    let mut queue: Vec<&Task> = snapshot
        .tasks_in(TaskStatus::Todo)
        .filter(|t| t.assignee.is_none())
        .collect();
    queue.sort_by(|a, b| (a.priority.rank(), a.created_at, &a.id).cmp(&(b.priority.rank(), b.created_at, &b.id)));

    let mut out = Vec::new();
    for task in queue {
        // highest score, then fewest completions, then id
        let best = idle
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                score(task, a)
                    .cmp(&score(task, b))
                    .then(b.total_tasks_completed.cmp(&a.total_tasks_completed))
                    .then(b.id.cmp(&a.id))
            })
            .map(|(i, _)| i);
        let Some(index) = best else {
            break;
        };
        let agent = idle.swap_remove(index);
        out.push(Mutation::AssignTask {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
        });
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignReport {
    pub assigned: Vec<(TaskId, String)>,
    pub skipped: usize,
}

pub struct AutoAssigner {
    lifecycle: Lifecycle,
    notifications: Option<NotificationDispatcher>,
}

impl AutoAssigner {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self {
            lifecycle,
            notifications: None,
        }
    }

    pub fn with_notifications(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.notifications = Some(dispatcher);
        self
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<AssignReport> {
        let snapshot = self.lifecycle.store().snapshot(now).await?;
        let mut report = AssignReport::default();
        for mutation in plan(&snapshot) {
            let Mutation::AssignTask { task_id, agent_id } = &mutation else {
                continue;
            };
            let (task_id, agent_id) = (task_id.clone(), agent_id.clone());
            match self.lifecycle.apply(mutation, now).await {
                Ok(ApplyOutcome::Applied { task }) => {
                    let title = task.map(|t| t.title).unwrap_or_default();
                    if let Some(dispatcher) = &self.notifications {
                        dispatcher.enqueue(
                            NotificationEvent::Assign,
                            vec![task_id.to_string(), agent_id.clone()],
                            format!("{task_id} ({title}) assigned to {agent_id}"),
                        );
                    }
                    report.assigned.push((task_id, agent_id));
                }
                Ok(ApplyOutcome::Skipped { reason }) => {
                    debug!(%task_id, %agent_id, %reason, "assignment skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(%task_id, %agent_id, error = %e, "assignment failed");
                    report.skipped += 1;
                }
            }
        }
        info!(assigned = report.assigned.len(), skipped = report.skipped, "auto-assign completed");
        Ok(report)
    }
}
