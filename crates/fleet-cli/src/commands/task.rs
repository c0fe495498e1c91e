use anyhow::Context as _;
use clap::Subcommand;
use fleet_core::lifecycle::{ChecklistField, NewTask, TransitionOutcome};
use fleet_core::types::{AlertKind, Priority, Task, TaskId, TaskStatus};
use fleet_daemon::notify::NotificationEvent;

use super::{task_line, Context};

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Create a task in `todo` (or `backlog` with --deferred).
    Create {
        title: String,
        /// What "done" looks like.
        #[arg(long)]
        outcome: String,
        /// Prerequisite checklist, markdown `- [ ]` lines.
        #[arg(long)]
        prerequisites: String,
        /// Acceptance checklist, markdown `- [ ]` lines.
        #[arg(long)]
        acceptance: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        working_dir: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long)]
        deferred: bool,
    },
    /// Assign a task to an agent.
    Assign { id: String, agent: String },
    /// Start work; runs the prerequisite gate.
    Start {
        id: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Report progress (0-99; 100 completes the task).
    Progress {
        id: String,
        percent: u8,
        #[arg(long)]
        note: Option<String>,
    },
    /// Mark the work finished and move it to review.
    Complete {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
    Block {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Resume a blocked task; resets the fix-loop counter.
    Unblock {
        id: String,
        #[arg(long)]
        agent: Option<String>,
    },
    Backlog {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Cancel {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Send an `info_needed` task back to `todo`.
    Requeue {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Park a review task until a human supplies information.
    InfoNeeded {
        id: String,
        #[arg(long)]
        details: String,
    },
    /// Toggle a checklist item (1-based index).
    Check {
        id: String,
        /// prerequisites or acceptance.
        #[arg(long, default_value = "prerequisites")]
        field: ChecklistField,
        #[arg(long)]
        index: usize,
        #[arg(long)]
        uncheck: bool,
        /// Who is checking; only `human` may check human-only items.
        #[arg(long, default_value = "agent")]
        actor: String,
    },
    Approve {
        id: String,
        #[arg(long)]
        reviewer: Option<String>,
    },
    Reject {
        id: String,
        #[arg(long)]
        reviewer: Option<String>,
        #[arg(long)]
        reason: String,
    },
    /// Show a task with its history.
    Show { id: String },
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
    },
}

/// The event a transition raises: auto-stops, gates and hand-offs to
/// review take precedence over the operation's own event.
fn event_for(task: &Task, moved: NotificationEvent) -> NotificationEvent {
    if task.is_auto_stopped() {
        return NotificationEvent::AutoStop;
    }
    match task.status {
        TaskStatus::Blocked => NotificationEvent::Block,
        TaskStatus::Review => NotificationEvent::Review,
        _ => moved,
    }
}

fn describe(event: NotificationEvent, task: &Task) -> String {
    let id = &task.id;
    let who = task.assignee.as_deref().unwrap_or("unassigned");
    let reason = task.blocked_reason.as_deref().unwrap_or("no reason given");
    match event {
        NotificationEvent::Create => format!("Task {id} created: {}", task.title),
        NotificationEvent::Assign => format!("Task {id} assigned to {who}: {}", task.title),
        NotificationEvent::Start => format!("Task {id} started by {who}"),
        NotificationEvent::Progress => format!("Task {id} at {}%", task.progress),
        NotificationEvent::Review => format!("Task {id} ready for review: {}", task.title),
        NotificationEvent::Complete => format!("Task {id} approved: {}", task.title),
        NotificationEvent::Unblock => format!("Task {id} unblocked; back with {who}"),
        NotificationEvent::Backlog => format!("Task {id} moved to backlog"),
        NotificationEvent::AutoStop => format!("Task {id} auto-stopped: {reason}"),
        NotificationEvent::Block => match task.status {
            TaskStatus::InfoNeeded => format!("Task {id} needs information: {reason}"),
            TaskStatus::Todo => format!(
                "Task {id} rejected (fix loop {}): {}",
                task.fix_loop_count,
                task.review_feedback.as_deref().unwrap_or("no feedback")
            ),
            _ => format!("Task {id} blocked: {reason}"),
        },
        NotificationEvent::Error | NotificationEvent::Alert => format!("Task {id} is {}", task.status),
    }
}

/// Queue the notification for a task the command just moved.
fn announce(ctx: &Context, event: NotificationEvent, task: &Task) {
    let mut entity_ids = vec![task.id.to_string()];
    entity_ids.extend(task.assignee.clone());
    ctx.notifications.enqueue(event, entity_ids, describe(event, task));
}

/// Auto-stops share the dedup table with the health sweep so only one
/// alert goes out per stop.
async fn announce_auto_stop(ctx: &Context, task: &Task) -> anyhow::Result<()> {
    let cooldown = ctx.config.health.policy().alert_cooldown;
    if ctx
        .store()
        .should_alert(AlertKind::AutoStop, task.id.as_str(), ctx.now(), cooldown)
        .await?
    {
        announce(ctx, NotificationEvent::AutoStop, task);
    }
    Ok(())
}

fn print_outcome(ctx: &Context, op: &str, outcome: &TransitionOutcome) -> anyhow::Result<()> {
    let task = outcome.task();
    ctx.emit(task, || match outcome {
        TransitionOutcome::Moved(task) => format!("{op}: {}", task_line(task)),
        TransitionOutcome::Gated { task, reason } => format!("{op} gated: {}\n  {reason}", task_line(task)),
    })?;
    if outcome.is_gated() {
        anyhow::bail!("{} was blocked by its prerequisite gate", task.id);
    }
    Ok(())
}

pub async fn run(ctx: &Context, cmd: TaskCommand) -> anyhow::Result<()> {
    let lc = &ctx.lifecycle;
    let now = ctx.now();
    match cmd {
        TaskCommand::Create {
            title,
            outcome,
            prerequisites,
            acceptance,
            description,
            project,
            working_dir,
            priority,
            deferred,
        } => {
            let task = lc
                .create_task(
                    NewTask {
                        title,
                        description,
                        project,
                        working_dir,
                        priority,
                        prerequisites,
                        acceptance_criteria: acceptance,
                        expected_outcome: outcome,
                        deferred,
                    },
                    now,
                )
                .await?;
            let event = if task.status == TaskStatus::Backlog {
                NotificationEvent::Backlog
            } else {
                NotificationEvent::Create
            };
            announce(ctx, event, &task);
            ctx.emit(&task, || format!("created: {}", task_line(&task)))
        }
        TaskCommand::Assign { id, agent } => {
            let task = lc.assign(&TaskId::from(id.as_str()), &agent, now).await?;
            announce(ctx, NotificationEvent::Assign, &task);
            ctx.emit(&task, || format!("assigned: {}", task_line(&task)))
        }
        TaskCommand::Start { id, agent } => {
            let outcome = lc.start(&TaskId::from(id.as_str()), agent.as_deref(), now).await?;
            announce(ctx, event_for(outcome.task(), NotificationEvent::Start), outcome.task());
            print_outcome(ctx, "started", &outcome)
        }
        TaskCommand::Progress { id, percent, note } => {
            let outcome = lc
                .update_progress(&TaskId::from(id.as_str()), percent, note.as_deref(), now)
                .await?;
            announce(ctx, event_for(outcome.task(), NotificationEvent::Progress), outcome.task());
            print_outcome(ctx, "progress", &outcome)
        }
        TaskCommand::Complete { id, note } => {
            let outcome = lc.complete(&TaskId::from(id.as_str()), note.as_deref(), now).await?;
            announce(ctx, event_for(outcome.task(), NotificationEvent::Review), outcome.task());
            print_outcome(ctx, "completed", &outcome)
        }
        TaskCommand::Block { id, reason } => {
            let task = lc.block(&TaskId::from(id.as_str()), &reason, now).await?;
            announce(ctx, NotificationEvent::Block, &task);
            ctx.emit(&task, || format!("blocked: {}", task_line(&task)))
        }
        TaskCommand::Unblock { id, agent } => {
            let task = lc.unblock(&TaskId::from(id.as_str()), agent.as_deref(), now).await?;
            announce(ctx, NotificationEvent::Unblock, &task);
            ctx.emit(&task, || format!("unblocked: {}", task_line(&task)))
        }
        TaskCommand::Backlog { id, reason } => {
            let task = lc.backlog(&TaskId::from(id.as_str()), reason.as_deref(), now).await?;
            announce(ctx, NotificationEvent::Backlog, &task);
            ctx.emit(&task, || format!("backlogged: {}", task_line(&task)))
        }
        TaskCommand::Cancel { id, reason } => {
            let task = lc.cancel(&TaskId::from(id.as_str()), reason.as_deref(), now).await?;
            ctx.emit(&task, || format!("cancelled: {}", task_line(&task)))
        }
        TaskCommand::Requeue { id, reason } => {
            let task = lc.requeue(&TaskId::from(id.as_str()), reason.as_deref(), now).await?;
            ctx.emit(&task, || format!("requeued: {}", task_line(&task)))
        }
        TaskCommand::InfoNeeded { id, details } => {
            let task = lc.info_needed(&TaskId::from(id.as_str()), &details, now).await?;
            announce(ctx, NotificationEvent::Block, &task);
            ctx.emit(&task, || format!("info needed: {}", task_line(&task)))
        }
        TaskCommand::Check {
            id,
            field,
            index,
            uncheck,
            actor,
        } => {
            let task = lc
                .check_item(&TaskId::from(id.as_str()), field, index, !uncheck, &actor, now)
                .await?;
            let text = match field {
                ChecklistField::Prerequisites => &task.prerequisites,
                ChecklistField::AcceptanceCriteria => &task.acceptance_criteria,
            };
            ctx.emit(&task, || format!("{}\n{text}", task_line(&task)))
        }
        TaskCommand::Approve { id, reviewer } => {
            let task = lc.approve(&TaskId::from(id.as_str()), reviewer.as_deref(), now).await?;
            announce(ctx, NotificationEvent::Complete, &task);
            ctx.emit(&task, || format!("approved: {}", task_line(&task)))
        }
        TaskCommand::Reject { id, reviewer, reason } => {
            let task = lc
                .reject(&TaskId::from(id.as_str()), reviewer.as_deref(), &reason, now)
                .await?;
            if task.is_auto_stopped() {
                announce_auto_stop(ctx, &task).await?;
            } else {
                announce(ctx, NotificationEvent::Block, &task);
            }
            ctx.emit(&task, || {
                if task.status == TaskStatus::Blocked {
                    format!("rejected and auto-stopped: {}", task_line(&task))
                } else {
                    format!("rejected: {}", task_line(&task))
                }
            })
        }
        TaskCommand::Show { id } => {
            let id = TaskId::from(id.as_str());
            let task = ctx
                .store()
                .get_task(&id)
                .await?
                .with_context(|| format!("task not found: {id}"))?;
            let history = ctx.store().history(&id).await?;
            let value = serde_json::json!({ "task": task, "history": history });
            ctx.emit(&value, || {
                let mut out = task_line(&task);
                if let Some(reason) = &task.blocked_reason {
                    out.push_str(&format!("\n  blocked: {reason}"));
                }
                if let Some(feedback) = &task.review_feedback {
                    out.push_str(&format!("\n  feedback: {feedback}"));
                }
                out.push_str(&format!(
                    "\n  prerequisites:\n{}\n  acceptance:\n{}",
                    task.prerequisites, task.acceptance_criteria
                ));
                for entry in &history {
                    out.push_str(&format!(
                        "\n  {}  {:?}  {} -> {}  {}  {}",
                        entry.created_at.format("%Y-%m-%d %H:%M"),
                        entry.action,
                        entry.old_status.map(|s| s.to_string()).unwrap_or_default(),
                        entry.new_status.map(|s| s.to_string()).unwrap_or_default(),
                        entry.agent_id.as_deref().unwrap_or("-"),
                        entry.notes.as_deref().unwrap_or_default(),
                    ));
                }
                out
            })
        }
        TaskCommand::List { status } => {
            let tasks = ctx.store().list_tasks(status).await?;
            ctx.emit(&tasks, || {
                if tasks.is_empty() {
                    return "no tasks".to_string();
                }
                tasks.iter().map(task_line).collect::<Vec<_>>().join("\n")
            })
        }
    }
}
