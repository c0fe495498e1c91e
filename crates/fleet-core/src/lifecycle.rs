//! Task lifecycle transitions.
//!
//! Every operation runs inside one store transaction: it re-reads the rows it
//! touches, validates the edge against [`TaskStatus::can_transition_to`],
//! writes the task and any agent it binds or releases, and appends exactly one
//! history entry for the status change.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::checklist::{self, ChecklistState, HumanOnlyMatcher};
use crate::config::Config;
use crate::error::{FleetError, Result};
use crate::store::{
    agents_bound_to, append_history, load_working_memory, next_task_seq, record_audit,
    require_agent, require_task, write_agent, write_task, write_working_memory, FleetStore,
    NewHistory,
};
use crate::types::{
    Agent, AgentStatus, AuditEvent, HealthStatus, HistoryAction, Priority, Task, TaskId,
    TaskStatus, WorkingMemory, AUTO_STOP_MARKER,
};

pub const AUTO_REVIEW_ACTOR: &str = "auto-review";
pub const HUMAN_ACTOR: &str = "human";
pub const NO_EVIDENCE_REASON: &str = "Auto-review failed: no evidence of completion";

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    pub fix_loop_limit: u32,
    pub fix_loop_warning: u32,
    pub working_memory_max_age: Duration,
    pub human_only: HumanOnlyMatcher,
}

impl LifecyclePolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            fix_loop_limit: cfg.lifecycle.fix_loop_limit,
            fix_loop_warning: cfg.lifecycle.fix_loop_warning,
            working_memory_max_age: Duration::minutes(cfg.lifecycle.working_memory_max_age_minutes),
            human_only: cfg.review.human_only(),
        }
    }
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ---------------------------------------------------------------------------
// Inputs and outcomes
// ---------------------------------------------------------------------------

/// Fields accepted when creating a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub project: Option<String>,
    pub working_dir: Option<String>,
    pub priority: Priority,
    pub prerequisites: String,
    pub acceptance_criteria: String,
    pub expected_outcome: String,
    /// Create in `backlog` instead of `todo`.
    pub deferred: bool,
}

/// Result of an operation that may be diverted by a checklist gate.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Moved(Task),
    /// The gate failed and the task was moved to a safe status instead.
    Gated { task: Task, reason: String },
}

impl TransitionOutcome {
    pub fn task(&self) -> &Task {
        match self {
            TransitionOutcome::Moved(task) | TransitionOutcome::Gated { task, .. } => task,
        }
    }

    pub fn is_gated(&self) -> bool {
        matches!(self, TransitionOutcome::Gated { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecklistField {
    Prerequisites,
    AcceptanceCriteria,
}

impl FromStr for ChecklistField {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prerequisites" | "prereq" => Ok(ChecklistField::Prerequisites),
            "acceptance" | "acceptance_criteria" => Ok(ChecklistField::AcceptanceCriteria),
            other => Err(format!("unknown checklist field `{other}`")),
        }
    }
}

/// A state change planned by a sweep against a snapshot.
///
/// `observed_*` fields carry what the sweep saw; [`Lifecycle::apply`] skips
/// the mutation when the row changed since.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    RecordHealth {
        agent_id: String,
        health: HealthStatus,
    },
    ResetAgent {
        agent_id: String,
        observed_heartbeat: Option<DateTime<Utc>>,
    },
    AutoBlockStuck {
        task_id: TaskId,
        stuck_minutes: i64,
        observed_updated_at: DateTime<Utc>,
    },
    AutoStop {
        task_id: TaskId,
    },
    PromoteToReview {
        task_id: TaskId,
    },
    SoftReturn {
        task_id: TaskId,
        unchecked: Vec<String>,
    },
    InfoNeeded {
        task_id: TaskId,
        unchecked: Vec<String>,
    },
    AutoReject {
        task_id: TaskId,
        observed_updated_at: DateTime<Utc>,
    },
    ClaimReview {
        task_id: TaskId,
        reviewer: String,
    },
    BindReviewer {
        task_id: TaskId,
        reviewer: String,
    },
    ReturnToReview {
        task_id: TaskId,
        reason: String,
    },
    AssignTask {
        task_id: TaskId,
        agent_id: String,
    },
}

impl Mutation {
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::RecordHealth { .. } => "record_health",
            Mutation::ResetAgent { .. } => "reset_agent",
            Mutation::AutoBlockStuck { .. } => "auto_block_stuck",
            Mutation::AutoStop { .. } => "auto_stop",
            Mutation::PromoteToReview { .. } => "promote_to_review",
            Mutation::SoftReturn { .. } => "soft_return",
            Mutation::InfoNeeded { .. } => "info_needed",
            Mutation::AutoReject { .. } => "auto_reject",
            Mutation::ClaimReview { .. } => "claim_review",
            Mutation::BindReviewer { .. } => "bind_reviewer",
            Mutation::ReturnToReview { .. } => "return_to_review",
            Mutation::AssignTask { .. } => "assign_task",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Applied; carries the task that changed, if any.
    Applied { task: Option<Task> },
    /// The store no longer matches what the sweep observed.
    Skipped { reason: String },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// The transition engine. Cheap to clone.
#[derive(Clone)]
pub struct Lifecycle {
    store: FleetStore,
    policy: Arc<LifecyclePolicy>,
}

impl Lifecycle {
    pub fn new(store: FleetStore, policy: LifecyclePolicy) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
        }
    }

    pub fn store(&self) -> &FleetStore {
        &self.store
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub async fn create_task(&self, new: NewTask, now: DateTime<Utc>) -> Result<Task> {
        validate_new_task(&new)?;
        let task = self.store.transact(move |tx| create_in(tx, new, now)).await?;
        info!(task_id = %task.id, status = %task.status, "task created");
        Ok(task)
    }

    pub async fn assign(&self, task_id: &TaskId, agent_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let task_id = task_id.clone();
        let agent_id = agent_id.to_string();
        let task = self
            .store
            .transact(move |tx| assign_in(tx, &task_id, &agent_id, now))
            .await?;
        info!(task_id = %task.id, assignee = ?task.assignee, "task assigned");
        Ok(task)
    }

    pub async fn start(
        &self,
        task_id: &TaskId,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let task_id = task_id.clone();
        let agent_id = agent_id.map(str::to_string);
        let outcome = self
            .store
            .transact(move |tx| start_in(tx, &task_id, agent_id.as_deref(), now))
            .await?;
        log_outcome("start", &outcome);
        Ok(outcome)
    }

    pub async fn complete(
        &self,
        task_id: &TaskId,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let task_id = task_id.clone();
        let notes = notes.map(str::to_string);
        let outcome = self
            .store
            .transact(move |tx| complete_in(tx, &task_id, notes.as_deref(), now))
            .await?;
        log_outcome("complete", &outcome);
        Ok(outcome)
    }

    /// Progress is clamped to 0..=99; a request for 100 completes the task.
    pub async fn update_progress(
        &self,
        task_id: &TaskId,
        progress: u8,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let task_id = task_id.clone();
        let note = note.map(str::to_string);
        let outcome = self
            .store
            .transact(move |tx| {
                if progress >= 100 {
                    return complete_in(tx, &task_id, note.as_deref(), now);
                }
                let mut task = require_task(tx, &task_id)?;
                if task.status != TaskStatus::InProgress {
                    return Err(FleetError::Validation(format!(
                        "progress can only be reported on in_progress tasks ({} is {})",
                        task.id, task.status
                    )));
                }
                task.progress = progress;
                task.updated_at = now;
                write_task(tx, &task)?;
                let notes = match &note {
                    Some(note) => format!("Progress {progress}%: {note}"),
                    None => format!("Progress {progress}%"),
                };
                record(tx, &task, HistoryAction::Updated, task.assignee.as_deref(), Some(notes.as_str()), now)?;
                if let Some(assignee) = task.assignee.clone() {
                    touch_working_memory(tx, &assignee, &task.id, &notes, now)?;
                }
                Ok(TransitionOutcome::Moved(task))
            })
            .await?;
        Ok(outcome)
    }

    pub async fn block(&self, task_id: &TaskId, reason: &str, now: DateTime<Utc>) -> Result<Task> {
        let reason = non_empty(reason, "block reason")?;
        let task_id = task_id.clone();
        let task = self
            .store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                task.blocked_reason = Some(reason.clone());
                release_agents_bound_to(tx, &task.id, now)?;
                move_to(tx, &mut task, TaskStatus::Blocked, HistoryAction::Blocked, None, Some(reason.as_str()), now)?;
                Ok(task)
            })
            .await?;
        warn!(task_id = %task.id, reason = ?task.blocked_reason, "task blocked");
        Ok(task)
    }

    /// Resume a blocked task. This is the only path that resets the fix-loop
    /// counter.
    pub async fn unblock(
        &self,
        task_id: &TaskId,
        agent_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let task_id = task_id.clone();
        let agent_id = agent_id.map(str::to_string);
        let task = self
            .store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                if task.status != TaskStatus::Blocked {
                    return Err(invalid(&task, TaskStatus::InProgress));
                }
                let previous = task.fix_loop_count;
                task.fix_loop_count = 0;
                task.blocked_reason = None;
                if let Some(agent_id) = agent_id.or_else(|| task.assignee.clone()) {
                    let mut agent = require_agent(tx, &agent_id)?;
                    if agent.is_free() || agent.is_bound_to(&task.id) {
                        bind(&mut agent, &task.id, now);
                        write_agent(tx, &agent)?;
                        task.assignee = Some(agent.id);
                    }
                }
                let notes = format!("Fix loop counter reset to 0 (was {previous})");
                let assignee = task.assignee.clone();
                move_to(
                    tx,
                    &mut task,
                    TaskStatus::InProgress,
                    HistoryAction::Unblocked,
                    assignee.as_deref(),
                    Some(notes.as_str()),
                    now,
                )?;
                Ok(task)
            })
            .await?;
        info!(task_id = %task.id, assignee = ?task.assignee, "task unblocked");
        Ok(task)
    }

    pub async fn backlog(&self, task_id: &TaskId, reason: Option<&str>, now: DateTime<Utc>) -> Result<Task> {
        let task_id = task_id.clone();
        let reason = reason.map(str::to_string);
        self.store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                release_agents_bound_to(tx, &task.id, now)?;
                move_to(tx, &mut task, TaskStatus::Backlog, HistoryAction::Backlogged, None, reason.as_deref(), now)?;
                Ok(task)
            })
            .await
    }

    pub async fn cancel(&self, task_id: &TaskId, reason: Option<&str>, now: DateTime<Utc>) -> Result<Task> {
        let task_id = task_id.clone();
        let reason = reason.map(str::to_string);
        let task = self
            .store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                release_agents_bound_to(tx, &task.id, now)?;
                move_to(tx, &mut task, TaskStatus::Cancelled, HistoryAction::Cancelled, None, reason.as_deref(), now)?;
                Ok(task)
            })
            .await?;
        info!(task_id = %task.id, "task cancelled");
        Ok(task)
    }

    /// `info_needed -> todo` once a human supplied what was missing.
    pub async fn requeue(&self, task_id: &TaskId, reason: Option<&str>, now: DateTime<Utc>) -> Result<Task> {
        let task_id = task_id.clone();
        let reason = reason.map(str::to_string);
        self.store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                if task.status != TaskStatus::InfoNeeded {
                    return Err(invalid(&task, TaskStatus::Todo));
                }
                task.blocked_reason = None;
                move_to(tx, &mut task, TaskStatus::Todo, HistoryAction::Requeued, None, reason.as_deref(), now)?;
                Ok(task)
            })
            .await
    }

    pub async fn info_needed(&self, task_id: &TaskId, details: &str, now: DateTime<Utc>) -> Result<Task> {
        let details = non_empty(details, "info_needed details")?;
        let task_id = task_id.clone();
        self.store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                info_needed_in(tx, &mut task, &details, now)?;
                Ok(task)
            })
            .await
    }

    /// Toggle the `index`-th (1-based) box of a checklist field.
    pub async fn check_item(
        &self,
        task_id: &TaskId,
        field: ChecklistField,
        index: usize,
        checked: bool,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let task_id = task_id.clone();
        let actor = actor.to_string();
        let policy = Arc::clone(&self.policy);
        self.store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                let text = match field {
                    ChecklistField::Prerequisites => &task.prerequisites,
                    ChecklistField::AcceptanceCriteria => &task.acceptance_criteria,
                };
                let items = checklist::parse(text);
                let item = index
                    .checked_sub(1)
                    .and_then(|i| items.get(i))
                    .ok_or_else(|| FleetError::Validation(format!("{task_id} has no checklist item #{index}")))?;
                if field == ChecklistField::Prerequisites
                    && checked
                    && actor != HUMAN_ACTOR
                    && policy.human_only.is_human_only(&item.label)
                {
                    return Err(FleetError::HumanOnly {
                        task: task.id.clone(),
                        index,
                        label: item.label.clone(),
                    });
                }
                let label = item.label.clone();
                let updated = checklist::set_item(text, index, checked)
                    .ok_or_else(|| FleetError::Validation(format!("{task_id} has no checklist item #{index}")))?;
                match field {
                    ChecklistField::Prerequisites => task.prerequisites = updated,
                    ChecklistField::AcceptanceCriteria => task.acceptance_criteria = updated,
                }
                task.updated_at = now;
                write_task(tx, &task)?;
                let mark = if checked { "checked" } else { "unchecked" };
                let notes = format!("{label} {mark} by {actor}");
                record(tx, &task, HistoryAction::Updated, Some(actor.as_str()), Some(notes.as_str()), now)?;
                Ok(task)
            })
            .await
    }

    /// Bind `reviewer` and move `review -> reviewing`.
    pub async fn claim_review(&self, task_id: &TaskId, reviewer: &str, now: DateTime<Utc>) -> Result<Task> {
        let task_id = task_id.clone();
        let reviewer = reviewer.to_string();
        self.store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                claim_review_in(tx, &mut task, &reviewer, now)?;
                Ok(task)
            })
            .await
    }

    pub async fn return_to_review(&self, task_id: &TaskId, reason: &str, now: DateTime<Utc>) -> Result<Task> {
        let task_id = task_id.clone();
        let reason = reason.to_string();
        self.store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                return_to_review_in(tx, &mut task, &reason, now)?;
                Ok(task)
            })
            .await
    }

    /// Approve a task in `review` or `reviewing`.
    ///
    /// Refused unless both checklists are complete and the assignee's working
    /// memory was updated within the policy window.
    pub async fn approve(&self, task_id: &TaskId, reviewer: Option<&str>, now: DateTime<Utc>) -> Result<Task> {
        let task_id = task_id.clone();
        let reviewer = reviewer.map(str::to_string);
        let policy = Arc::clone(&self.policy);
        let result = self
            .store
            .transact(move |tx| approve_in(tx, &policy, &task_id, reviewer.as_deref(), now))
            .await;
        match &result {
            Ok(task) => info!(task_id = %task.id, assignee = ?task.assignee, "task approved"),
            Err(FleetError::ApprovalRefused { task, reason }) => {
                warn!(task_id = %task, %reason, "approval refused")
            }
            Err(_) => {}
        }
        result
    }

    /// Content rejection: increments the fix-loop counter and auto-stops at
    /// the limit.
    pub async fn reject(
        &self,
        task_id: &TaskId,
        reviewer: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let reason = non_empty(reason, "rejection reason")?;
        let task_id = task_id.clone();
        let reviewer = reviewer.map(str::to_string);
        let policy = Arc::clone(&self.policy);
        let task = self
            .store
            .transact(move |tx| {
                let mut task = require_task(tx, &task_id)?;
                reject_in(tx, &policy, &mut task, reviewer.as_deref(), &reason, now)?;
                Ok(task)
            })
            .await?;
        warn!(
            task_id = %task.id,
            fix_loop_count = task.fix_loop_count,
            status = %task.status,
            "task rejected"
        );
        Ok(task)
    }

    pub async fn heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<Agent> {
        let agent_id = agent_id.to_string();
        self.store
            .transact(move |tx| {
                let mut agent = require_agent(tx, &agent_id)?;
                agent.last_heartbeat = Some(now);
                agent.updated_at = now;
                write_agent(tx, &agent)?;
                Ok(agent)
            })
            .await
    }

    /// Create an agent, or update the name and role of an existing one.
    pub async fn register_agent(&self, id: &str, name: &str, role: &str, now: DateTime<Utc>) -> Result<Agent> {
        let id = non_empty(id, "agent id")?;
        let name = name.to_string();
        let role = role.to_string();
        let agent = self
            .store
            .transact(move |tx| {
                let agent = match crate::store::load_agent(tx, &id)? {
                    Some(mut existing) => {
                        existing.name = name;
                        existing.role = role;
                        existing.updated_at = now;
                        existing
                    }
                    None => Agent::new(id, name, role, now),
                };
                write_agent(tx, &agent)?;
                Ok(agent)
            })
            .await?;
        info!(agent_id = %agent.id, role = %agent.role, "agent registered");
        Ok(agent)
    }

    pub async fn update_working_memory(
        &self,
        agent_id: &str,
        task_id: Option<&TaskId>,
        notes: &str,
        blockers: &str,
        next_steps: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkingMemory> {
        let memory = WorkingMemory {
            agent_id: agent_id.to_string(),
            current_task_id: task_id.cloned(),
            working_notes: notes.to_string(),
            blockers: blockers.to_string(),
            next_steps: next_steps.to_string(),
            last_updated: now,
        };
        self.store
            .transact(move |tx| {
                require_agent(tx, &memory.agent_id)?;
                write_working_memory(tx, &memory)?;
                Ok(memory)
            })
            .await
    }

    /// Record the outcome of a worker launch for `task_id`.
    ///
    /// A successful launch appends a `spawned` entry and marks the assignee
    /// active while the task is still `todo`; a failed one is only audited.
    pub async fn record_spawn(
        &self,
        task_id: &TaskId,
        agent_id: &str,
        ok: bool,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let task_id = task_id.clone();
        let agent_id = agent_id.to_string();
        let detail = detail.to_string();
        self.store
            .transact(move |tx| {
                let task = require_task(tx, &task_id)?;
                let mut agent = require_agent(tx, &agent_id)?;
                let before = serde_json::to_value(&agent).ok();
                if ok {
                    record(tx, &task, HistoryAction::Spawned, Some(agent_id.as_str()), Some(detail.as_str()), now)?;
                    if task.status == TaskStatus::Todo {
                        agent.status = AgentStatus::Active;
                        agent.last_heartbeat = Some(now);
                        agent.updated_at = now;
                        write_agent(tx, &agent)?;
                    }
                }
                let details = if ok {
                    format!("spawned worker: {detail}")
                } else {
                    format!("spawn failed: {detail}")
                };
                record_audit(
                    tx,
                    AuditEvent::AgentSpawn,
                    Some(agent_id.as_str()),
                    Some(&task.id),
                    &details,
                    before,
                    serde_json::to_value(&agent).ok(),
                    now,
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Sweep mutations
    // -----------------------------------------------------------------------

    /// Apply one planned mutation inside its own transaction.
    pub async fn apply(&self, mutation: Mutation, now: DateTime<Utc>) -> Result<ApplyOutcome> {
        let label = mutation.label();
        let policy = Arc::clone(&self.policy);
        let outcome = self
            .store
            .transact(move |tx| apply_in(tx, &policy, mutation, now))
            .await?;
        match &outcome {
            ApplyOutcome::Applied { task: Some(task) } => {
                info!(mutation = label, task_id = %task.id, status = %task.status, "mutation applied")
            }
            ApplyOutcome::Applied { task: None } => info!(mutation = label, "mutation applied"),
            ApplyOutcome::Skipped { reason } => {
                info!(mutation = label, %reason, "mutation skipped")
            }
        }
        Ok(outcome)
    }
}

fn log_outcome(op: &str, outcome: &TransitionOutcome) {
    match outcome {
        TransitionOutcome::Moved(task) => {
            info!(op, task_id = %task.id, status = %task.status, "task moved")
        }
        TransitionOutcome::Gated { task, reason } => {
            warn!(op, task_id = %task.id, %reason, "gate failed; task blocked")
        }
    }
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

fn invalid(task: &Task, to: TaskStatus) -> FleetError {
    FleetError::InvalidTransition {
        task: task.id.clone(),
        from: task.status,
        to,
    }
}

fn non_empty(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FleetError::Validation(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Validate the edge, stamp the status timestamp, persist the task and append
/// its single history entry.
fn move_to(
    conn: &Connection,
    task: &mut Task,
    to: TaskStatus,
    action: HistoryAction,
    agent_id: Option<&str>,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let from = task.status;
    if !from.can_transition_to(&to) {
        return Err(invalid(task, to));
    }
    task.enter(to, now);
    write_task(conn, task)?;
    append_history(
        conn,
        NewHistory {
            task_id: &task.id,
            agent_id,
            action,
            old_status: Some(from),
            new_status: Some(to),
            notes,
        },
        now,
    )
}

/// History entry for an event that does not change status.
fn record(
    conn: &Connection,
    task: &Task,
    action: HistoryAction,
    agent_id: Option<&str>,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    append_history(
        conn,
        NewHistory {
            task_id: &task.id,
            agent_id,
            action,
            old_status: Some(task.status),
            new_status: Some(task.status),
            notes,
        },
        now,
    )
}

fn bind(agent: &mut Agent, task_id: &TaskId, now: DateTime<Utc>) {
    agent.status = AgentStatus::Active;
    agent.current_task_id = Some(task_id.clone());
    agent.last_heartbeat = Some(now);
    agent.updated_at = now;
}

fn release(agent: &mut Agent, now: DateTime<Utc>) {
    agent.status = AgentStatus::Idle;
    agent.current_task_id = None;
    agent.updated_at = now;
}

/// Release every agent bound to `task_id`; returns their ids.
fn release_agents_bound_to(conn: &Connection, task_id: &TaskId, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut released = Vec::new();
    for mut agent in agents_bound_to(conn, task_id)? {
        release(&mut agent, now);
        write_agent(conn, &agent)?;
        released.push(agent.id);
    }
    Ok(released)
}

fn touch_working_memory(
    conn: &Connection,
    agent_id: &str,
    task_id: &TaskId,
    notes: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let mut memory = load_working_memory(conn, agent_id)?.unwrap_or_else(|| WorkingMemory {
        agent_id: agent_id.to_string(),
        current_task_id: None,
        working_notes: String::new(),
        blockers: String::new(),
        next_steps: String::new(),
        last_updated: now,
    });
    memory.current_task_id = Some(task_id.clone());
    memory.working_notes = notes.to_string();
    memory.last_updated = now;
    write_working_memory(conn, &memory)
}

/// Describes why a prerequisites field fails the gate, if it does.
fn prerequisite_gap(text: &str) -> Option<String> {
    match checklist::evaluate(text) {
        ChecklistState::Complete => None,
        ChecklistState::Unchecked(labels) => Some(labels.join("; ")),
        ChecklistState::Malformed => Some("prerequisites field has no checklist items".into()),
        ChecklistState::Empty => Some("prerequisites field is empty".into()),
    }
}

/// Divert a task that failed the start/complete gate into `blocked`.
fn divert_to_blocked(
    conn: &Connection,
    task: &mut Task,
    gap: &str,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let reason = format!("Prerequisites not checked -> {gap}");
    let agent = task.assignee.take();
    release_agents_bound_to(conn, &task.id, now)?;
    if let Some(agent_id) = &agent {
        if let Some(mut agent) = crate::store::load_agent(conn, agent_id)? {
            if agent.status == AgentStatus::Active && agent.current_task_id.is_none() {
                release(&mut agent, now);
                write_agent(conn, &agent)?;
            }
        }
    }
    task.blocked_reason = Some(reason.clone());
    move_to(conn, task, TaskStatus::Blocked, HistoryAction::Blocked, agent.as_deref(), Some(reason.as_str()), now)?;
    Ok(TransitionOutcome::Gated {
        task: task.clone(),
        reason,
    })
}

// ---------------------------------------------------------------------------
// Operations (in-transaction)
// ---------------------------------------------------------------------------

fn validate_new_task(new: &NewTask) -> Result<()> {
    non_empty(&new.title, "title")?;
    non_empty(&new.expected_outcome, "expected_outcome")?;
    non_empty(&new.prerequisites, "prerequisites")?;
    non_empty(&new.acceptance_criteria, "acceptance_criteria")?;
    Ok(())
}

fn create_in(conn: &Connection, new: NewTask, now: DateTime<Utc>) -> Result<Task> {
    let seq = next_task_seq(conn, now.date_naive())?;
    let mut task = Task::new(TaskId::for_day(now.date_naive(), seq), new.title.trim(), now);
    task.description = new.description;
    task.project = new.project;
    task.working_dir = new.working_dir;
    task.priority = new.priority;
    task.prerequisites = new.prerequisites;
    task.acceptance_criteria = new.acceptance_criteria;
    task.expected_outcome = new.expected_outcome;
    if new.deferred {
        task.status = TaskStatus::Backlog;
        task.todo_at = None;
    }
    write_task(conn, &task)?;
    append_history(
        conn,
        NewHistory {
            task_id: &task.id,
            agent_id: None,
            action: HistoryAction::Created,
            old_status: None,
            new_status: Some(task.status),
            notes: Some(task.title.as_str()),
        },
        now,
    )?;
    Ok(task)
}

fn assign_in(conn: &Connection, task_id: &TaskId, agent_id: &str, now: DateTime<Utc>) -> Result<Task> {
    let mut task = require_task(conn, task_id)?;
    let mut agent = require_agent(conn, agent_id)?;
    task.assignee = Some(agent.id.clone());
    let notes = format!("Assigned to {}", agent.id);
    match task.status {
        TaskStatus::Backlog => {
            move_to(conn, &mut task, TaskStatus::Todo, HistoryAction::Assigned, Some(agent_id), Some(notes.as_str()), now)?
        }
        TaskStatus::Todo => {
            task.updated_at = now;
            write_task(conn, &task)?;
            record(conn, &task, HistoryAction::Assigned, Some(agent_id), Some(notes.as_str()), now)?;
        }
        _ => return Err(invalid(&task, TaskStatus::Todo)),
    }
    agent.total_tasks_assigned += 1;
    agent.updated_at = now;
    write_agent(conn, &agent)?;
    Ok(task)
}

fn start_in(
    conn: &Connection,
    task_id: &TaskId,
    agent_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let mut task = require_task(conn, task_id)?;
    if task.status != TaskStatus::Todo {
        return Err(invalid(&task, TaskStatus::InProgress));
    }
    if let Some(gap) = prerequisite_gap(&task.prerequisites) {
        return divert_to_blocked(conn, &mut task, &gap, now);
    }
    let agent_id = agent_id
        .map(str::to_string)
        .or_else(|| task.assignee.clone())
        .ok_or_else(|| FleetError::Validation(format!("{task_id} has no assignee to start it")))?;
    let mut agent = require_agent(conn, &agent_id)?;
    if let Some(other) = &agent.current_task_id {
        if other != &task.id {
            return Err(FleetError::Validation(format!("agent {agent_id} is busy with {other}")));
        }
    }
    bind(&mut agent, &task.id, now);
    write_agent(conn, &agent)?;

    task.assignee = Some(agent_id.clone());
    task.started_at.get_or_insert(now);
    move_to(conn, &mut task, TaskStatus::InProgress, HistoryAction::Started, Some(agent_id.as_str()), None, now)?;

    write_working_memory(
        conn,
        &WorkingMemory {
            agent_id: agent_id.clone(),
            current_task_id: Some(task.id.clone()),
            working_notes: format!("Started {}: {}", task.id, task.title),
            blockers: String::new(),
            next_steps: String::new(),
            last_updated: now,
        },
    )?;
    Ok(TransitionOutcome::Moved(task))
}

fn complete_in(
    conn: &Connection,
    task_id: &TaskId,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TransitionOutcome> {
    let mut task = require_task(conn, task_id)?;
    if task.status != TaskStatus::InProgress {
        return Err(invalid(&task, TaskStatus::Review));
    }
    if let Some(gap) = prerequisite_gap(&task.prerequisites) {
        return divert_to_blocked(conn, &mut task, &gap, now);
    }
    task.progress = task.progress.max(95);
    task.completed_at = Some(now);
    task.actual_duration_minutes = task.elapsed_minutes(now);
    release_agents_bound_to(conn, &task.id, now)?;
    let agent = task.assignee.clone();
    move_to(conn, &mut task, TaskStatus::Review, HistoryAction::Completed, agent.as_deref(), notes, now)?;
    if let (Some(agent), Some(notes)) = (&agent, notes) {
        touch_working_memory(conn, agent, &task.id, notes, now)?;
    }
    Ok(TransitionOutcome::Moved(task))
}

fn claim_review_in(conn: &Connection, task: &mut Task, reviewer: &str, now: DateTime<Utc>) -> Result<()> {
    if task.status != TaskStatus::Review {
        return Err(invalid(task, TaskStatus::Reviewing));
    }
    if let Some(other) = agents_bound_to(conn, &task.id)?.into_iter().find(|a| a.id != reviewer) {
        return Err(FleetError::Validation(format!("{} is already bound to {}", other.id, task.id)));
    }
    let mut agent = require_agent(conn, reviewer)?;
    if !(agent.is_free() || agent.is_bound_to(&task.id)) {
        return Err(FleetError::Validation(format!("reviewer {reviewer} is not idle")));
    }
    bind(&mut agent, &task.id, now);
    write_agent(conn, &agent)?;
    let notes = format!("Review claimed by {reviewer}");
    move_to(conn, task, TaskStatus::Reviewing, HistoryAction::ReviewClaimed, Some(reviewer), Some(notes.as_str()), now)
}

fn return_to_review_in(conn: &Connection, task: &mut Task, reason: &str, now: DateTime<Utc>) -> Result<()> {
    if task.status != TaskStatus::Reviewing {
        return Err(invalid(task, TaskStatus::Review));
    }
    let released = release_agents_bound_to(conn, &task.id, now)?;
    let agent = released.first().map(String::as_str);
    move_to(conn, task, TaskStatus::Review, HistoryAction::ReviewReturned, agent, Some(reason), now)
}

fn info_needed_in(conn: &Connection, task: &mut Task, details: &str, now: DateTime<Utc>) -> Result<()> {
    if !matches!(task.status, TaskStatus::Review | TaskStatus::Reviewing) {
        return Err(invalid(task, TaskStatus::InfoNeeded));
    }
    release_agents_bound_to(conn, &task.id, now)?;
    task.blocked_reason = Some(details.to_string());
    move_to(conn, task, TaskStatus::InfoNeeded, HistoryAction::InfoNeeded, None, Some(details), now)
}

/// Return to `todo` without touching the fix-loop counter.
fn soft_return_in(conn: &Connection, task: &mut Task, reason: &str, now: DateTime<Utc>) -> Result<()> {
    if !matches!(task.status, TaskStatus::Review | TaskStatus::Reviewing) {
        return Err(invalid(task, TaskStatus::Todo));
    }
    release_agents_bound_to(conn, &task.id, now)?;
    task.review_feedback = Some(reason.to_string());
    task.progress = task.progress.min(95);
    task.completed_at = None;
    move_to(conn, task, TaskStatus::Todo, HistoryAction::Returned, None, Some(reason), now)
}

fn approve_in(
    conn: &Connection,
    policy: &LifecyclePolicy,
    task_id: &TaskId,
    reviewer: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Task> {
    let mut task = require_task(conn, task_id)?;
    if !matches!(task.status, TaskStatus::Review | TaskStatus::Reviewing) {
        return Err(invalid(&task, TaskStatus::Done));
    }
    let refuse = |reason: String| FleetError::ApprovalRefused {
        task: task_id.clone(),
        reason,
    };
    if let Some(gap) = prerequisite_gap(&task.prerequisites) {
        return Err(refuse(format!("prerequisites incomplete: {gap}")));
    }
    match checklist::evaluate(&task.acceptance_criteria) {
        ChecklistState::Complete => {}
        ChecklistState::Unchecked(labels) => {
            return Err(refuse(format!("acceptance criteria unchecked: {}", labels.join("; "))))
        }
        ChecklistState::Malformed | ChecklistState::Empty => {
            return Err(refuse("acceptance criteria have no checked items".into()))
        }
    }
    let assignee = task
        .assignee
        .clone()
        .ok_or_else(|| refuse("task has no original assignee".into()))?;
    let memory = load_working_memory(conn, &assignee)?
        .ok_or_else(|| refuse(format!("{assignee} has no working memory record")))?;
    let age = now.signed_duration_since(memory.last_updated);
    if age > policy.working_memory_max_age {
        return Err(refuse(format!(
            "{assignee} working memory is {} minutes old (limit {})",
            age.num_minutes(),
            policy.working_memory_max_age.num_minutes()
        )));
    }

    if task.status == TaskStatus::Review {
        let notes = match reviewer {
            Some(r) => format!("Review claimed by {r}"),
            None => "Review claimed for approval".to_string(),
        };
        move_to(conn, &mut task, TaskStatus::Reviewing, HistoryAction::ReviewClaimed, reviewer, Some(notes.as_str()), now)?;
    }

    task.progress = 100;
    task.completed_at.get_or_insert(now);
    task.actual_duration_minutes = task.elapsed_minutes(now).or(task.actual_duration_minutes);
    task.review_feedback = None;
    release_agents_bound_to(conn, &task.id, now)?;
    move_to(conn, &mut task, TaskStatus::Done, HistoryAction::Approved, reviewer, Some("Approved"), now)?;

    let mut worker = require_agent(conn, &assignee)?;
    worker.total_tasks_completed += 1;
    worker.updated_at = now;
    write_agent(conn, &worker)?;
    Ok(task)
}

fn reject_in(
    conn: &Connection,
    policy: &LifecyclePolicy,
    task: &mut Task,
    actor: Option<&str>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    if !matches!(task.status, TaskStatus::Review | TaskStatus::Reviewing) {
        return Err(invalid(task, TaskStatus::Todo));
    }
    release_agents_bound_to(conn, &task.id, now)?;
    task.fix_loop_count += 1;
    task.review_feedback = Some(reason.to_string());
    let count = task.fix_loop_count;

    if count >= policy.fix_loop_limit {
        let before = serde_json::to_value(&*task).ok();
        let blocked = format!(
            "{AUTO_STOP_MARKER}: Rejected {count} times ({count} fix loops). Last feedback: {reason}"
        );
        task.blocked_reason = Some(blocked.clone());
        move_to(conn, task, TaskStatus::Blocked, HistoryAction::AutoStopped, actor, Some(blocked.as_str()), now)?;
        record_audit(
            conn,
            AuditEvent::TaskAutoStopped,
            actor,
            Some(&task.id),
            &blocked,
            before,
            serde_json::to_value(&*task).ok(),
            now,
        )?;
        return Ok(());
    }

    task.progress = 0;
    task.completed_at = None;
    task.priority = Priority::High;
    let notes = format!("Rejected (fix loop {count}): {reason}");
    move_to(conn, task, TaskStatus::Todo, HistoryAction::Rejected, actor, Some(notes.as_str()), now)
}

fn auto_stop_in(conn: &Connection, task: &mut Task, now: DateTime<Utc>) -> Result<()> {
    let before = serde_json::to_value(&*task).ok();
    let reason = format!(
        "{AUTO_STOP_MARKER}: stopped after {} fix loops; manual unblock required",
        task.fix_loop_count
    );
    release_agents_bound_to(conn, &task.id, now)?;
    task.blocked_reason = Some(reason.clone());
    move_to(conn, task, TaskStatus::Blocked, HistoryAction::AutoStopped, None, Some(reason.as_str()), now)?;
    record_audit(
        conn,
        AuditEvent::TaskAutoStopped,
        None,
        Some(&task.id),
        &reason,
        before,
        serde_json::to_value(&*task).ok(),
        now,
    )
}

fn reset_agent_in(conn: &Connection, agent: &mut Agent, now: DateTime<Utc>) -> Result<Option<Task>> {
    let before = serde_json::to_value(&*agent).ok();
    let held = agent.current_task_id.take();
    release(agent, now);
    write_agent(conn, agent)?;

    let mut blocked = None;
    if let Some(task_id) = &held {
        if let Some(mut task) = crate::store::load_task(conn, task_id)? {
            if !task.status.is_terminal() && task.status != TaskStatus::Blocked {
                let reason = format!("Agent timeout: {} stopped sending heartbeats", agent.id);
                release_agents_bound_to(conn, &task.id, now)?;
                task.blocked_reason = Some(reason.clone());
                move_to(conn, &mut task, TaskStatus::Blocked, HistoryAction::Blocked, Some(agent.id.as_str()), Some(reason.as_str()), now)?;
                blocked = Some(task);
            }
        }
    }

    let details = match &held {
        Some(task_id) => format!("agent timeout; released {task_id}"),
        None => "agent timeout; no task held".to_string(),
    };
    record_audit(
        conn,
        AuditEvent::AgentReset,
        Some(agent.id.as_str()),
        held.as_ref(),
        &details,
        before,
        serde_json::to_value(&*agent).ok(),
        now,
    )?;
    Ok(blocked)
}

fn auto_block_stuck_in(conn: &Connection, task: &mut Task, minutes: i64, now: DateTime<Utc>) -> Result<()> {
    let before = serde_json::to_value(&*task).ok();
    let reason = format!("Auto-blocked: Stuck for {minutes} minutes without an update");
    let released = release_agents_bound_to(conn, &task.id, now)?;
    task.blocked_reason = Some(reason.clone());
    let agent = released.first().map(String::as_str);
    move_to(conn, task, TaskStatus::Blocked, HistoryAction::Blocked, agent, Some(reason.as_str()), now)?;
    record_audit(
        conn,
        AuditEvent::TaskAutoBlocked,
        agent,
        Some(&task.id),
        &reason,
        before,
        serde_json::to_value(&*task).ok(),
        now,
    )
}

fn promote_to_review_in(conn: &Connection, task: &mut Task, now: DateTime<Utc>) -> Result<()> {
    task.progress = 100;
    task.completed_at.get_or_insert(now);
    task.actual_duration_minutes = task.elapsed_minutes(now);
    let released = release_agents_bound_to(conn, &task.id, now)?;
    let agent = released.first().cloned().or_else(|| task.assignee.clone());
    move_to(
        conn,
        task,
        TaskStatus::Review,
        HistoryAction::Completed,
        agent.as_deref(),
        Some("Worker reported completion; moved to review"),
        now,
    )
}

fn bind_reviewer_in(conn: &Connection, task: &Task, reviewer: &mut Agent, now: DateTime<Utc>) -> Result<()> {
    bind(reviewer, &task.id, now);
    write_agent(conn, reviewer)?;
    let notes = format!("Reviewer {} bound", reviewer.id);
    record(conn, task, HistoryAction::Assigned, Some(reviewer.id.as_str()), Some(notes.as_str()), now)
}

fn applied(task: Task) -> Result<ApplyOutcome> {
    Ok(ApplyOutcome::Applied { task: Some(task) })
}

fn skipped(reason: impl Into<String>) -> Result<ApplyOutcome> {
    Ok(ApplyOutcome::Skipped {
        reason: reason.into(),
    })
}

fn apply_in(
    conn: &Connection,
    policy: &LifecyclePolicy,
    mutation: Mutation,
    now: DateTime<Utc>,
) -> Result<ApplyOutcome> {
    match mutation {
        Mutation::RecordHealth { agent_id, health } => {
            let mut agent = require_agent(conn, &agent_id)?;
            if agent.health_status == health {
                return skipped("health unchanged");
            }
            agent.health_status = health;
            write_agent(conn, &agent)?;
            Ok(ApplyOutcome::Applied { task: None })
        }
        Mutation::ResetAgent {
            agent_id,
            observed_heartbeat,
        } => {
            let mut agent = require_agent(conn, &agent_id)?;
            if agent.status != AgentStatus::Active {
                return skipped(format!("{agent_id} is no longer active"));
            }
            if agent.last_heartbeat != observed_heartbeat {
                return skipped(format!("{agent_id} sent a heartbeat since the snapshot"));
            }
            let task = reset_agent_in(conn, &mut agent, now)?;
            Ok(ApplyOutcome::Applied { task })
        }
        Mutation::AutoBlockStuck {
            task_id,
            stuck_minutes,
            observed_updated_at,
        } => {
            let mut task = require_task(conn, &task_id)?;
            if task.status != TaskStatus::InProgress || task.updated_at != observed_updated_at {
                return skipped(format!("{task_id} changed since the snapshot"));
            }
            auto_block_stuck_in(conn, &mut task, stuck_minutes, now)?;
            applied(task)
        }
        Mutation::AutoStop { task_id } => {
            let mut task = require_task(conn, &task_id)?;
            if task.status.is_terminal()
                || task.status == TaskStatus::Blocked
                || task.fix_loop_count < policy.fix_loop_limit
            {
                return skipped(format!("{task_id} no longer needs an auto-stop"));
            }
            auto_stop_in(conn, &mut task, now)?;
            applied(task)
        }
        Mutation::PromoteToReview { task_id } => {
            let mut task = require_task(conn, &task_id)?;
            let finished = task.completed_at.is_some() || task.progress >= 100;
            if task.status != TaskStatus::InProgress || !finished {
                return skipped(format!("{task_id} is not a finished in_progress task"));
            }
            promote_to_review_in(conn, &mut task, now)?;
            applied(task)
        }
        Mutation::SoftReturn { task_id, unchecked } => {
            let mut task = require_task(conn, &task_id)?;
            if prerequisite_gap(&task.prerequisites).is_none() {
                return skipped(format!("{task_id} prerequisites are now complete"));
            }
            if !matches!(task.status, TaskStatus::Review | TaskStatus::Reviewing) {
                return skipped(format!("{task_id} left review"));
            }
            let reason = format!(
                "Review gate failed: prerequisites unchecked -> {}",
                unchecked.join("; ")
            );
            soft_return_in(conn, &mut task, &reason, now)?;
            applied(task)
        }
        Mutation::InfoNeeded { task_id, unchecked } => {
            let mut task = require_task(conn, &task_id)?;
            if prerequisite_gap(&task.prerequisites).is_none() {
                return skipped(format!("{task_id} prerequisites are now complete"));
            }
            if !matches!(task.status, TaskStatus::Review | TaskStatus::Reviewing) {
                return skipped(format!("{task_id} left review"));
            }
            let details = format!(
                "Info needed (HUMAN-only prerequisites unchecked) -> {}",
                unchecked.join("; ")
            );
            info_needed_in(conn, &mut task, &details, now)?;
            applied(task)
        }
        Mutation::AutoReject {
            task_id,
            observed_updated_at,
        } => {
            let mut task = require_task(conn, &task_id)?;
            if task.status != TaskStatus::Review || task.updated_at != observed_updated_at {
                return skipped(format!("{task_id} changed since the snapshot"));
            }
            reject_in(conn, policy, &mut task, Some(AUTO_REVIEW_ACTOR), NO_EVIDENCE_REASON, now)?;
            applied(task)
        }
        Mutation::ClaimReview { task_id, reviewer } => {
            let mut task = require_task(conn, &task_id)?;
            if task.status != TaskStatus::Review {
                return skipped(format!("{task_id} is no longer waiting for review"));
            }
            let bound = agents_bound_to(conn, &task_id)?;
            if bound.iter().any(|a| a.id != reviewer) {
                return skipped(format!("{task_id} already has a bound agent"));
            }
            let agent = require_agent(conn, &reviewer)?;
            if !(agent.is_free() || agent.is_bound_to(&task_id)) {
                return skipped(format!("reviewer {reviewer} is busy"));
            }
            claim_review_in(conn, &mut task, &reviewer, now)?;
            applied(task)
        }
        Mutation::BindReviewer { task_id, reviewer } => {
            let task = require_task(conn, &task_id)?;
            if task.status != TaskStatus::Reviewing {
                return skipped(format!("{task_id} is no longer reviewing"));
            }
            if !agents_bound_to(conn, &task_id)?.is_empty() {
                return skipped(format!("{task_id} already has a reviewer"));
            }
            let mut agent = require_agent(conn, &reviewer)?;
            if !agent.is_free() {
                return skipped(format!("reviewer {reviewer} is busy"));
            }
            bind_reviewer_in(conn, &task, &mut agent, now)?;
            applied(task)
        }
        Mutation::ReturnToReview { task_id, reason } => {
            let mut task = require_task(conn, &task_id)?;
            if task.status != TaskStatus::Reviewing {
                return skipped(format!("{task_id} is no longer reviewing"));
            }
            return_to_review_in(conn, &mut task, &reason, now)?;
            applied(task)
        }
        Mutation::AssignTask { task_id, agent_id } => {
            let task = require_task(conn, &task_id)?;
            if task.status != TaskStatus::Todo || task.assignee.is_some() {
                return skipped(format!("{task_id} is no longer unassigned"));
            }
            let agent = require_agent(conn, &agent_id)?;
            if !agent.is_free() {
                return skipped(format!("{agent_id} is busy"));
            }
            applied(assign_in(conn, &task_id, &agent_id, now)?)
        }
    }
}
