use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Human-sortable task identifier of the form `T-YYYYMMDD-NNN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build the id for the `seq`-th task created on `date`.
    pub fn for_day(date: NaiveDate, seq: u32) -> Self {
        Self(format!("T-{}-{:03}", date.format("%Y%m%d"), seq))
    }

    /// Prefix shared by every id created on `date` (used for sequence lookup).
    pub fn day_prefix(date: NaiveDate) -> String {
        format!("T-{}-", date.format("%Y%m%d"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    Review,
    Reviewing,
    InfoNeeded,
    Blocked,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Backlog,
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Reviewing,
        TaskStatus::InfoNeeded,
        TaskStatus::Blocked,
        TaskStatus::Done,
        TaskStatus::Cancelled,
    ];

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Besides the workflow edges, every non-terminal status may be deferred
    /// to `backlog`, forced to `blocked` (gate failure, timeout, auto-stop) or
    /// cancelled.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        if self.is_terminal() || self == target {
            return false;
        }
        matches!(
            (self, target),
            (TaskStatus::Backlog, TaskStatus::Todo)
                | (TaskStatus::Todo, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Review)
                | (TaskStatus::Review, TaskStatus::Reviewing)
                | (TaskStatus::Review, TaskStatus::Todo)
                | (TaskStatus::Review, TaskStatus::InfoNeeded)
                | (TaskStatus::Reviewing, TaskStatus::Done)
                | (TaskStatus::Reviewing, TaskStatus::Todo)
                | (TaskStatus::Reviewing, TaskStatus::Review)
                | (TaskStatus::Reviewing, TaskStatus::InfoNeeded)
                | (TaskStatus::Blocked, TaskStatus::InProgress)
                | (TaskStatus::InfoNeeded, TaskStatus::Todo)
                | (_, TaskStatus::Backlog)
                | (_, TaskStatus::Blocked)
                | (_, TaskStatus::Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::InfoNeeded => "info_needed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task status `{s}`"))
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Scheduling rank; lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority `{other}`")),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Leading text of `blocked_reason` on tasks stopped by the fix-loop limit.
/// Only a manual unblock clears it.
pub const AUTO_STOP_MARKER: &str = "AUTO-STOP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: Option<String>,
    pub project: Option<String>,
    pub working_dir: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assignee: Option<String>,
    pub prerequisites: String,
    pub acceptance_criteria: String,
    pub expected_outcome: String,
    pub progress: u8,
    pub fix_loop_count: u32,
    pub blocked_reason: Option<String>,
    pub review_feedback: Option<String>,
    pub actual_duration_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub todo_at: Option<DateTime<Utc>>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub review_at: Option<DateTime<Utc>>,
    pub reviewing_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub blocked_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh `todo` task. Quality-gate fields are validated by the
    /// lifecycle engine at creation time, not here.
    pub fn new(id: TaskId, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: title.into(),
            description: None,
            project: None,
            working_dir: None,
            status: TaskStatus::Todo,
            priority: Priority::Normal,
            assignee: None,
            prerequisites: String::new(),
            acceptance_criteria: String::new(),
            expected_outcome: String::new(),
            progress: 0,
            fix_loop_count: 0,
            blocked_reason: None,
            review_feedback: None,
            actual_duration_minutes: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            todo_at: Some(now),
            in_progress_at: None,
            review_at: None,
            reviewing_at: None,
            done_at: None,
            blocked_at: None,
        }
    }

    /// Record entry into `status`, stamping the per-status timestamp.
    pub fn enter(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        match status {
            TaskStatus::Todo => self.todo_at = Some(now),
            TaskStatus::InProgress => self.in_progress_at = Some(now),
            TaskStatus::Review => self.review_at = Some(now),
            TaskStatus::Reviewing => self.reviewing_at = Some(now),
            TaskStatus::Done => self.done_at = Some(now),
            TaskStatus::Blocked => self.blocked_at = Some(now),
            TaskStatus::Backlog | TaskStatus::InfoNeeded | TaskStatus::Cancelled => {}
        }
    }

    /// Blocked by the fix-loop limit and waiting on a human.
    pub fn is_auto_stopped(&self) -> bool {
        self.status == TaskStatus::Blocked
            && self
                .blocked_reason
                .as_deref()
                .is_some_and(|r| r.starts_with(AUTO_STOP_MARKER))
    }

    /// Minutes since `started_at`, if the task was ever started.
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        self.started_at
            .map(|started| now.signed_duration_since(started).num_minutes().max(0))
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Active,
    Blocked,
}

/// Derived from heartbeat age on every health sweep; never an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Stale,
    Offline,
    Unknown,
}

impl HealthStatus {
    pub fn glyph(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "+",
            HealthStatus::Stale => "~",
            HealthStatus::Offline => "x",
            HealthStatus::Unknown => "?",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: String,
    pub status: AgentStatus,
    pub current_task_id: Option<TaskId>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub total_tasks_assigned: u32,
    pub total_tasks_completed: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            status: AgentStatus::Idle,
            current_task_id: None,
            last_heartbeat: None,
            health_status: HealthStatus::Unknown,
            total_tasks_assigned: 0,
            total_tasks_completed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Idle and not holding any task.
    pub fn is_free(&self) -> bool {
        self.status == AgentStatus::Idle && self.current_task_id.is_none()
    }

    pub fn is_bound_to(&self, task_id: &TaskId) -> bool {
        self.current_task_id.as_ref() == Some(task_id)
    }

    /// Heartbeat age in minutes; negative when the heartbeat is in the future.
    pub fn heartbeat_age_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_heartbeat
            .map(|hb| now.signed_duration_since(hb).num_minutes())
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Assigned,
    Spawned,
    Started,
    Updated,
    Completed,
    Blocked,
    Unblocked,
    Backlogged,
    Cancelled,
    ReviewClaimed,
    ReviewReturned,
    Returned,
    InfoNeeded,
    Requeued,
    Approved,
    Rejected,
    AutoStopped,
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub task_id: TaskId,
    pub agent_id: Option<String>,
    pub action: HistoryAction,
    pub old_status: Option<TaskStatus>,
    pub new_status: Option<TaskStatus>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Working memory
// ---------------------------------------------------------------------------

/// The worker's scratchpad; its freshness gates approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub agent_id: String,
    pub current_task_id: Option<TaskId>,
    pub working_notes: String,
    pub blockers: String,
    pub next_steps: String,
    pub last_updated: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Alerts and audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    AgentStale,
    AgentOffline,
    AgentTimeout,
    TaskStuck,
    TaskAutoBlocked,
    FixLoopWarning,
    AutoStop,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::AgentStale => "agent_stale",
            AlertKind::AgentOffline => "agent_offline",
            AlertKind::AgentTimeout => "agent_timeout",
            AlertKind::TaskStuck => "task_stuck",
            AlertKind::TaskAutoBlocked => "task_auto_blocked",
            AlertKind::FixLoopWarning => "fix_loop_warning",
            AlertKind::AutoStop => "auto_stop",
        }
    }
}

/// Dedup row keyed by `(kind, entity_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub kind: AlertKind,
    pub entity_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_alert: DateTime<Utc>,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    AgentReset,
    AgentSpawn,
    TaskAutoBlocked,
    TaskAutoStopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub event: AuditEvent,
    pub agent_id: Option<String>,
    pub task_id: Option<TaskId>,
    pub details: String,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_is_zero_padded() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 4).unwrap();
        assert_eq!(TaskId::for_day(date, 7).as_str(), "T-20260204-007");
        assert_eq!(TaskId::day_prefix(date), "T-20260204-");
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for target in TaskStatus::ALL {
            assert!(!TaskStatus::Done.can_transition_to(&target));
            assert!(!TaskStatus::Cancelled.can_transition_to(&target));
        }
    }

    #[test]
    fn todo_cannot_jump_to_done() {
        assert!(!TaskStatus::Todo.can_transition_to(&TaskStatus::Done));
        assert!(!TaskStatus::Review.can_transition_to(&TaskStatus::Done));
        assert!(TaskStatus::Reviewing.can_transition_to(&TaskStatus::Done));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("finished".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn auto_stop_needs_block_and_marker() {
        let now = Utc::now();
        let mut task = Task::new(TaskId::from("T-1"), "t", now);
        task.blocked_reason = Some(format!("{AUTO_STOP_MARKER}: Rejected 10 times"));
        assert!(!task.is_auto_stopped());
        task.status = TaskStatus::Blocked;
        assert!(task.is_auto_stopped());
        task.blocked_reason = Some("Stuck for 200 minutes".into());
        assert!(!task.is_auto_stopped());
    }

    #[test]
    fn enter_stamps_status_timestamp() {
        let now = Utc::now();
        let mut task = Task::new(TaskId::from("T-1"), "t", now);
        task.enter(TaskStatus::Blocked, now);
        assert_eq!(task.blocked_at, Some(now));
        assert_eq!(task.status, TaskStatus::Blocked);
    }
}
