use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rusqlite::Connection;

use crate::error::{FleetError, Result};
use crate::types::{
    Agent, AlertKind, AlertRecord, AuditEvent, AuditRecord, HistoryAction, HistoryEntry, Task,
    TaskId, TaskStatus, WorkingMemory,
};

/// Async SQLite-backed store for tasks, agents, history and alert dedup.
///
/// Cloning is cheap: clones share the same background connection.
#[derive(Clone)]
pub struct FleetStore {
    conn: Connection,
}

/// Point-in-time read of everything a sweep plans against.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Every task that is not `done` or `cancelled`.
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    /// Most recent `spawned` history entry per task.
    pub last_spawns: HashMap<TaskId, DateTime<Utc>>,
}

impl StoreSnapshot {
    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Agents whose `current_task_id` points at `task_id`.
    pub fn bound_agents<'a>(&'a self, task_id: &'a TaskId) -> impl Iterator<Item = &'a Agent> {
        self.agents.iter().filter(move |a| a.is_bound_to(task_id))
    }

    pub fn tasks_in(&self, status: TaskStatus) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.status == status)
    }
}

// ---------------------------------------------------------------------------
// helpers – enum / timestamp <-> SQLite text
// ---------------------------------------------------------------------------

fn enum_to_sql<T: Serialize>(val: &T) -> String {
    match serde_json::to_value(val) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

fn enum_from_sql<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Fixed-width UTC text so that lexical order matches time order.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn ts_from_sql(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    ts_from_sql(idx, &raw)
}

fn opt_ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| ts_from_sql(idx, &s)).transpose()
}

fn json_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

const TASK_COLUMNS: &str = "id, title, description, project, working_dir, status, priority,
    assignee_id, prerequisites, acceptance_criteria, expected_outcome, progress,
    fix_loop_count, blocked_reason, review_feedback, actual_duration_minutes,
    created_at, updated_at, started_at, completed_at, todo_at, in_progress_at,
    review_at, reviewing_at, done_at, blocked_at";

const AGENT_COLUMNS: &str = "id, name, role, status, current_task_id, last_heartbeat,
    health_status, total_tasks_assigned, total_tasks_completed, created_at, updated_at";

impl FleetStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| FleetError::Validation(format!("cannot create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA foreign_keys=ON;

                    CREATE TABLE IF NOT EXISTS tasks (
                        id                      TEXT PRIMARY KEY,
                        title                   TEXT NOT NULL,
                        description             TEXT,
                        project                 TEXT,
                        working_dir             TEXT,
                        status                  TEXT NOT NULL,
                        priority                TEXT NOT NULL DEFAULT 'normal',
                        assignee_id             TEXT,
                        prerequisites           TEXT NOT NULL,
                        acceptance_criteria     TEXT NOT NULL,
                        expected_outcome        TEXT NOT NULL,
                        progress                INTEGER NOT NULL DEFAULT 0,
                        fix_loop_count          INTEGER NOT NULL DEFAULT 0,
                        blocked_reason          TEXT,
                        review_feedback         TEXT,
                        actual_duration_minutes INTEGER,
                        created_at              TEXT NOT NULL,
                        updated_at              TEXT NOT NULL,
                        started_at              TEXT,
                        completed_at            TEXT,
                        todo_at                 TEXT,
                        in_progress_at          TEXT,
                        review_at               TEXT,
                        reviewing_at            TEXT,
                        done_at                 TEXT,
                        blocked_at              TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_status   ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee_id);

                    CREATE TABLE IF NOT EXISTS agents (
                        id                    TEXT PRIMARY KEY,
                        name                  TEXT NOT NULL,
                        role                  TEXT NOT NULL,
                        status                TEXT NOT NULL,
                        current_task_id       TEXT,
                        last_heartbeat        TEXT,
                        health_status         TEXT NOT NULL DEFAULT 'unknown',
                        total_tasks_assigned  INTEGER NOT NULL DEFAULT 0,
                        total_tasks_completed INTEGER NOT NULL DEFAULT 0,
                        created_at            TEXT NOT NULL,
                        updated_at            TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_current_task ON agents(current_task_id);

                    CREATE TABLE IF NOT EXISTS task_history (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id    TEXT NOT NULL,
                        agent_id   TEXT,
                        action     TEXT NOT NULL,
                        old_status TEXT,
                        new_status TEXT,
                        notes      TEXT,
                        created_at TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_history_task   ON task_history(task_id);
                    CREATE INDEX IF NOT EXISTS idx_history_action ON task_history(action);

                    CREATE TABLE IF NOT EXISTS agent_working_memory (
                        agent_id        TEXT PRIMARY KEY,
                        current_task_id TEXT,
                        working_notes   TEXT NOT NULL DEFAULT '',
                        blockers        TEXT NOT NULL DEFAULT '',
                        next_steps      TEXT NOT NULL DEFAULT '',
                        last_updated    TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS alert_history (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        alert_type TEXT NOT NULL,
                        entity_id  TEXT NOT NULL,
                        first_seen TEXT NOT NULL,
                        last_seen  TEXT NOT NULL,
                        last_alert TEXT NOT NULL,
                        resolved   INTEGER NOT NULL DEFAULT 0,
                        UNIQUE(alert_type, entity_id)
                    );

                    CREATE TABLE IF NOT EXISTS audit_log (
                        id           INTEGER PRIMARY KEY AUTOINCREMENT,
                        event_type   TEXT NOT NULL,
                        agent_id     TEXT,
                        task_id      TEXT,
                        details      TEXT NOT NULL DEFAULT '',
                        before_state TEXT,
                        after_state  TEXT,
                        created_at   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS notification_log (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        event      TEXT NOT NULL,
                        entity_ids TEXT NOT NULL,
                        message    TEXT NOT NULL,
                        level      TEXT NOT NULL,
                        success    INTEGER NOT NULL,
                        created_at TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; any error rolls
    /// back every write made inside it.
    pub async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
    {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                match f(&tx) {
                    Ok(value) => {
                        tx.commit()?;
                        Ok(Ok(value))
                    }
                    Err(e) => Ok(Err(e)),
                }
            })
            .await?
    }

    // -----------------------------------------------------------------------
    // Task CRUD
    // -----------------------------------------------------------------------

    pub async fn upsert_task(&self, task: &Task) -> Result<()> {
        let task = task.clone();
        self.transact(move |tx| write_task(tx, &task)).await
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        let id = id.clone();
        self.transact(move |tx| load_task(tx, &id)).await
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.transact(move |tx| {
            let mut out = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id"
                    ))?;
                    let mut rows = stmt.query(rusqlite::params![enum_to_sql(&status)])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_task(row)?);
                    }
                }
                None => {
                    let mut stmt =
                        tx.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        out.push(row_to_task(row)?);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    pub async fn status_counts(&self) -> Result<Vec<(TaskStatus, u64)>> {
        self.transact(|tx| {
            let mut out = Vec::new();
            for status in TaskStatus::ALL {
                let count: u64 = tx.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                    rusqlite::params![enum_to_sql(&status)],
                    |r| r.get(0),
                )?;
                out.push((status, count));
            }
            Ok(out)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Agent CRUD
    // -----------------------------------------------------------------------

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let agent = agent.clone();
        self.transact(move |tx| write_agent(tx, &agent)).await
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let id = id.to_string();
        self.transact(move |tx| load_agent(tx, &id)).await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.transact(|tx| load_agents(tx)).await
    }

    // -----------------------------------------------------------------------
    // History, working memory, audit
    // -----------------------------------------------------------------------

    pub async fn history(&self, task_id: &TaskId) -> Result<Vec<HistoryEntry>> {
        let task_id = task_id.clone();
        self.transact(move |tx| {
            let mut stmt = tx.prepare(
                "SELECT id, task_id, agent_id, action, old_status, new_status, notes, created_at
                 FROM task_history WHERE task_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query(rusqlite::params![task_id.as_str()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_history(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn working_memory(&self, agent_id: &str) -> Result<Option<WorkingMemory>> {
        let agent_id = agent_id.to_string();
        self.transact(move |tx| load_working_memory(tx, &agent_id)).await
    }

    pub async fn audit_events(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        self.transact(move |tx| {
            let mut stmt = tx.prepare(
                "SELECT id, event_type, agent_id, task_id, details, before_state, after_state, created_at
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )?;
            let mut rows = stmt.query(rusqlite::params![limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_audit(row)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn record_notification(
        &self,
        event: &str,
        entity_ids: &[String],
        message: &str,
        level: &str,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let event = event.to_string();
        let entities = entity_ids.join(",");
        let message = message.to_string();
        let level = level.to_string();
        self.transact(move |tx| {
            tx.execute(
                "INSERT INTO notification_log (event, entity_ids, message, level, success, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![event, entities, message, level, success, ts_to_sql(&now)],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn notification_count(&self, success: bool) -> Result<u64> {
        self.transact(move |tx| {
            let count = tx.query_row(
                "SELECT COUNT(*) FROM notification_log WHERE success = ?1",
                rusqlite::params![success],
                |r| r.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<StoreSnapshot> {
        self.transact(move |tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status NOT IN ('done', 'cancelled') ORDER BY id"
            ))?;
            let mut rows = stmt.query([])?;
            let mut tasks = Vec::new();
            while let Some(row) = rows.next()? {
                tasks.push(row_to_task(row)?);
            }
            drop(rows);
            drop(stmt);

            let agents = load_agents(tx)?;

            let mut stmt = tx.prepare(
                "SELECT task_id, MAX(created_at) FROM task_history
                 WHERE action = 'spawned' GROUP BY task_id",
            )?;
            let mut rows = stmt.query([])?;
            let mut last_spawns = HashMap::new();
            while let Some(row) = rows.next()? {
                let task_id: String = row.get(0)?;
                last_spawns.insert(TaskId::new(task_id), ts_col(row, 1)?);
            }

            Ok(StoreSnapshot {
                taken_at: now,
                tasks,
                agents,
                last_spawns,
            })
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Alert dedup
    // -----------------------------------------------------------------------

    /// Returns `true` when an alert for `(kind, entity_id)` should go out.
    ///
    /// First occurrence inserts an open row and alerts. Repeats while the row
    /// is open only refresh `last_seen`. A resolved row reopens and alerts
    /// again unless the previous alert was sent within `cooldown`.
    pub async fn should_alert(
        &self,
        kind: AlertKind,
        entity_id: &str,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<bool> {
        let entity_id = entity_id.to_string();
        self.transact(move |tx| should_alert_in(tx, kind, &entity_id, now, cooldown))
            .await
    }

    /// Mark the open alert for `(kind, entity_id)` resolved.
    pub async fn resolve_alert(&self, kind: AlertKind, entity_id: &str) -> Result<bool> {
        let entity_id = entity_id.to_string();
        self.transact(move |tx| {
            let changed = tx.execute(
                "UPDATE alert_history SET resolved = 1
                 WHERE alert_type = ?1 AND entity_id = ?2 AND resolved = 0",
                rusqlite::params![kind.as_str(), entity_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Delete resolved alerts not seen since `now - retention`.
    pub async fn cleanup_alerts(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let cutoff = ts_to_sql(&(now - retention));
        self.transact(move |tx| {
            let removed = tx.execute(
                "DELETE FROM alert_history WHERE resolved = 1 AND last_seen < ?1",
                rusqlite::params![cutoff],
            )?;
            Ok(removed)
        })
        .await
    }

    pub async fn open_alerts(&self) -> Result<Vec<AlertRecord>> {
        self.transact(|tx| {
            let mut stmt = tx.prepare(
                "SELECT alert_type, entity_id, first_seen, last_seen, last_alert, resolved
                 FROM alert_history WHERE resolved = 0 ORDER BY first_seen",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_alert(row)?);
            }
            Ok(out)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-transaction operations
// ---------------------------------------------------------------------------

pub(crate) fn load_task(conn: &rusqlite::Connection, id: &TaskId) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            rusqlite::params![id.as_str()],
            row_to_task,
        )
        .optional()?;
    Ok(task)
}

pub(crate) fn require_task(conn: &rusqlite::Connection, id: &TaskId) -> Result<Task> {
    load_task(conn, id)?.ok_or_else(|| FleetError::TaskNotFound(id.clone()))
}

pub(crate) fn write_task(conn: &rusqlite::Connection, task: &Task) -> Result<()> {
    let opt = |ts: &Option<DateTime<Utc>>| ts.as_ref().map(ts_to_sql);
    conn.execute(
        "INSERT INTO tasks (id, title, description, project, working_dir, status, priority,
            assignee_id, prerequisites, acceptance_criteria, expected_outcome, progress,
            fix_loop_count, blocked_reason, review_feedback, actual_duration_minutes,
            created_at, updated_at, started_at, completed_at, todo_at, in_progress_at,
            review_at, reviewing_at, done_at, blocked_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,
                 ?21,?22,?23,?24,?25,?26)
         ON CONFLICT(id) DO UPDATE SET
            title=excluded.title, description=excluded.description,
            project=excluded.project, working_dir=excluded.working_dir,
            status=excluded.status, priority=excluded.priority,
            assignee_id=excluded.assignee_id, prerequisites=excluded.prerequisites,
            acceptance_criteria=excluded.acceptance_criteria,
            expected_outcome=excluded.expected_outcome, progress=excluded.progress,
            fix_loop_count=excluded.fix_loop_count, blocked_reason=excluded.blocked_reason,
            review_feedback=excluded.review_feedback,
            actual_duration_minutes=excluded.actual_duration_minutes,
            updated_at=excluded.updated_at, started_at=excluded.started_at,
            completed_at=excluded.completed_at, todo_at=excluded.todo_at,
            in_progress_at=excluded.in_progress_at, review_at=excluded.review_at,
            reviewing_at=excluded.reviewing_at, done_at=excluded.done_at,
            blocked_at=excluded.blocked_at",
        rusqlite::params![
            task.id.as_str(),
            task.title,
            task.description,
            task.project,
            task.working_dir,
            enum_to_sql(&task.status),
            enum_to_sql(&task.priority),
            task.assignee,
            task.prerequisites,
            task.acceptance_criteria,
            task.expected_outcome,
            task.progress,
            task.fix_loop_count,
            task.blocked_reason,
            task.review_feedback,
            task.actual_duration_minutes,
            ts_to_sql(&task.created_at),
            ts_to_sql(&task.updated_at),
            opt(&task.started_at),
            opt(&task.completed_at),
            opt(&task.todo_at),
            opt(&task.in_progress_at),
            opt(&task.review_at),
            opt(&task.reviewing_at),
            opt(&task.done_at),
            opt(&task.blocked_at),
        ],
    )?;
    Ok(())
}

/// Next per-day sequence number for task ids created on `date`.
pub(crate) fn next_task_seq(conn: &rusqlite::Connection, date: NaiveDate) -> Result<u32> {
    let prefix = TaskId::day_prefix(date);
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(CAST(SUBSTR(id, ?1) AS INTEGER)) FROM tasks WHERE id LIKE ?2",
        rusqlite::params![prefix.len() as i64 + 1, format!("{prefix}%")],
        |r| r.get(0),
    )?;
    Ok(max.unwrap_or(0) as u32 + 1)
}

pub(crate) fn load_agent(conn: &rusqlite::Connection, id: &str) -> Result<Option<Agent>> {
    let agent = conn
        .query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
            rusqlite::params![id],
            row_to_agent,
        )
        .optional()?;
    Ok(agent)
}

pub(crate) fn require_agent(conn: &rusqlite::Connection, id: &str) -> Result<Agent> {
    load_agent(conn, id)?.ok_or_else(|| FleetError::AgentNotFound(id.to_string()))
}

pub(crate) fn load_agents(conn: &rusqlite::Connection) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY id"))?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_agent(row)?);
    }
    Ok(out)
}

pub(crate) fn agents_bound_to(conn: &rusqlite::Connection, task_id: &TaskId) -> Result<Vec<Agent>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE current_task_id = ?1 ORDER BY id"
    ))?;
    let mut rows = stmt.query(rusqlite::params![task_id.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_agent(row)?);
    }
    Ok(out)
}

pub(crate) fn write_agent(conn: &rusqlite::Connection, agent: &Agent) -> Result<()> {
    conn.execute(
        "INSERT INTO agents (id, name, role, status, current_task_id, last_heartbeat,
            health_status, total_tasks_assigned, total_tasks_completed, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
         ON CONFLICT(id) DO UPDATE SET
            name=excluded.name, role=excluded.role, status=excluded.status,
            current_task_id=excluded.current_task_id, last_heartbeat=excluded.last_heartbeat,
            health_status=excluded.health_status,
            total_tasks_assigned=excluded.total_tasks_assigned,
            total_tasks_completed=excluded.total_tasks_completed,
            updated_at=excluded.updated_at",
        rusqlite::params![
            agent.id,
            agent.name,
            agent.role,
            enum_to_sql(&agent.status),
            agent.current_task_id.as_ref().map(|t| t.as_str().to_string()),
            agent.last_heartbeat.as_ref().map(ts_to_sql),
            enum_to_sql(&agent.health_status),
            agent.total_tasks_assigned,
            agent.total_tasks_completed,
            ts_to_sql(&agent.created_at),
            ts_to_sql(&agent.updated_at),
        ],
    )?;
    Ok(())
}

/// Fields of a history row before insertion.
#[derive(Debug, Clone)]
pub(crate) struct NewHistory<'a> {
    pub task_id: &'a TaskId,
    pub agent_id: Option<&'a str>,
    pub action: HistoryAction,
    pub old_status: Option<TaskStatus>,
    pub new_status: Option<TaskStatus>,
    pub notes: Option<&'a str>,
}

pub(crate) fn append_history(
    conn: &rusqlite::Connection,
    entry: NewHistory<'_>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO task_history (task_id, agent_id, action, old_status, new_status, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            entry.task_id.as_str(),
            entry.agent_id,
            enum_to_sql(&entry.action),
            entry.old_status.as_ref().map(enum_to_sql),
            entry.new_status.as_ref().map(enum_to_sql),
            entry.notes,
            ts_to_sql(&now),
        ],
    )?;
    Ok(())
}

pub(crate) fn load_working_memory(
    conn: &rusqlite::Connection,
    agent_id: &str,
) -> Result<Option<WorkingMemory>> {
    let memory = conn
        .query_row(
            "SELECT agent_id, current_task_id, working_notes, blockers, next_steps, last_updated
             FROM agent_working_memory WHERE agent_id = ?1",
            rusqlite::params![agent_id],
            |row| {
                let current: Option<String> = row.get(1)?;
                Ok(WorkingMemory {
                    agent_id: row.get(0)?,
                    current_task_id: current.map(TaskId::new),
                    working_notes: row.get(2)?,
                    blockers: row.get(3)?,
                    next_steps: row.get(4)?,
                    last_updated: ts_col(row, 5)?,
                })
            },
        )
        .optional()?;
    Ok(memory)
}

pub(crate) fn write_working_memory(
    conn: &rusqlite::Connection,
    memory: &WorkingMemory,
) -> Result<()> {
    conn.execute(
        "INSERT INTO agent_working_memory
            (agent_id, current_task_id, working_notes, blockers, next_steps, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(agent_id) DO UPDATE SET
            current_task_id=excluded.current_task_id, working_notes=excluded.working_notes,
            blockers=excluded.blockers, next_steps=excluded.next_steps,
            last_updated=excluded.last_updated",
        rusqlite::params![
            memory.agent_id,
            memory.current_task_id.as_ref().map(|t| t.as_str().to_string()),
            memory.working_notes,
            memory.blockers,
            memory.next_steps,
            ts_to_sql(&memory.last_updated),
        ],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn record_audit(
    conn: &rusqlite::Connection,
    event: AuditEvent,
    agent_id: Option<&str>,
    task_id: Option<&TaskId>,
    details: &str,
    before: Option<serde_json::Value>,
    after: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log (event_type, agent_id, task_id, details, before_state, after_state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            enum_to_sql(&event),
            agent_id,
            task_id.map(|t| t.as_str().to_string()),
            details,
            before.map(|v| v.to_string()),
            after.map(|v| v.to_string()),
            ts_to_sql(&now),
        ],
    )?;
    Ok(())
}

pub(crate) fn should_alert_in(
    conn: &rusqlite::Connection,
    kind: AlertKind,
    entity_id: &str,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> Result<bool> {
    let existing: Option<(bool, String)> = conn
        .query_row(
            "SELECT resolved, last_alert FROM alert_history WHERE alert_type = ?1 AND entity_id = ?2",
            rusqlite::params![kind.as_str(), entity_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let now_sql = ts_to_sql(&now);

    match existing {
        None => {
            conn.execute(
                "INSERT INTO alert_history (alert_type, entity_id, first_seen, last_seen, last_alert, resolved)
                 VALUES (?1, ?2, ?3, ?3, ?3, 0)",
                rusqlite::params![kind.as_str(), entity_id, now_sql],
            )?;
            Ok(true)
        }
        Some((false, _)) => {
            conn.execute(
                "UPDATE alert_history SET last_seen = ?3 WHERE alert_type = ?1 AND entity_id = ?2",
                rusqlite::params![kind.as_str(), entity_id, now_sql],
            )?;
            Ok(false)
        }
        Some((true, last_alert)) => {
            let last_alert = ts_from_sql(1, &last_alert)?;
            let cooled = now.signed_duration_since(last_alert) >= cooldown;
            if cooled {
                conn.execute(
                    "UPDATE alert_history
                     SET resolved = 0, first_seen = ?3, last_seen = ?3, last_alert = ?3
                     WHERE alert_type = ?1 AND entity_id = ?2",
                    rusqlite::params![kind.as_str(), entity_id, now_sql],
                )?;
            } else {
                // Stays resolved so the next raise past the cooldown still fires.
                conn.execute(
                    "UPDATE alert_history SET last_seen = ?3 WHERE alert_type = ?1 AND entity_id = ?2",
                    rusqlite::params![kind.as_str(), entity_id, now_sql],
                )?;
            }
            Ok(cooled)
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let status: String = row.get(5)?;
    let priority: String = row.get(6)?;

    Ok(Task {
        id: TaskId::new(id),
        title: row.get(1)?,
        description: row.get(2)?,
        project: row.get(3)?,
        working_dir: row.get(4)?,
        status: enum_from_sql(5, &status)?,
        priority: enum_from_sql(6, &priority)?,
        assignee: row.get(7)?,
        prerequisites: row.get(8)?,
        acceptance_criteria: row.get(9)?,
        expected_outcome: row.get(10)?,
        progress: row.get(11)?,
        fix_loop_count: row.get(12)?,
        blocked_reason: row.get(13)?,
        review_feedback: row.get(14)?,
        actual_duration_minutes: row.get(15)?,
        created_at: ts_col(row, 16)?,
        updated_at: ts_col(row, 17)?,
        started_at: opt_ts_col(row, 18)?,
        completed_at: opt_ts_col(row, 19)?,
        todo_at: opt_ts_col(row, 20)?,
        in_progress_at: opt_ts_col(row, 21)?,
        review_at: opt_ts_col(row, 22)?,
        reviewing_at: opt_ts_col(row, 23)?,
        done_at: opt_ts_col(row, 24)?,
        blocked_at: opt_ts_col(row, 25)?,
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let status: String = row.get(3)?;
    let current: Option<String> = row.get(4)?;
    let health: String = row.get(6)?;

    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        status: enum_from_sql(3, &status)?,
        current_task_id: current.map(TaskId::new),
        last_heartbeat: opt_ts_col(row, 5)?,
        health_status: enum_from_sql(6, &health)?,
        total_tasks_assigned: row.get(7)?,
        total_tasks_completed: row.get(8)?,
        created_at: ts_col(row, 9)?,
        updated_at: ts_col(row, 10)?,
    })
}

fn row_to_history(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let task_id: String = row.get(1)?;
    let action: String = row.get(3)?;
    let old_status: Option<String> = row.get(4)?;
    let new_status: Option<String> = row.get(5)?;

    Ok(HistoryEntry {
        id: row.get(0)?,
        task_id: TaskId::new(task_id),
        agent_id: row.get(2)?,
        action: enum_from_sql(3, &action)?,
        old_status: old_status.map(|s| enum_from_sql(4, &s)).transpose()?,
        new_status: new_status.map(|s| enum_from_sql(5, &s)).transpose()?,
        notes: row.get(6)?,
        created_at: ts_col(row, 7)?,
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRecord> {
    let kind: String = row.get(0)?;
    Ok(AlertRecord {
        kind: enum_from_sql(0, &kind)?,
        entity_id: row.get(1)?,
        first_seen: ts_col(row, 2)?,
        last_seen: ts_col(row, 3)?,
        last_alert: ts_col(row, 4)?,
        resolved: row.get(5)?,
    })
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let event: String = row.get(1)?;
    let task_id: Option<String> = row.get(3)?;
    Ok(AuditRecord {
        id: row.get(0)?,
        event: enum_from_sql(1, &event)?,
        agent_id: row.get(2)?,
        task_id: task_id.map(TaskId::new),
        details: row.get(4)?,
        before_state: json_col(row, 5)?,
        after_state: json_col(row, 6)?,
        created_at: ts_col(row, 7)?,
    })
}
