//! Completion evidence for tasks waiting in review.
//!
//! Intrinsic evidence comes from the task row itself. External evidence comes
//! from an [`EvidenceOracle`]; [`FsEvidenceOracle`] scans worker logs for a
//! [`CompletionMarker`] and the working directory for recently modified files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::config::expand_home;
use fleet_core::types::{Task, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Bytes read from the end of each log file.
pub const LOG_TAIL_BYTES: u64 = 256 * 1024;

/// Directories never descended into when looking for file activity.
pub const SKIP_DIRS: [&str; 7] = [".git", "node_modules", "vendor", "storage", "logs", "tmp", "cache"];

/// Upper bound on directory entries visited per probe.
const MAX_WALK_ENTRIES: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMarker {
    TaskCompleted,
    TaskCheckmark,
    StatusDone,
}

impl CompletionMarker {
    pub const ALL: [CompletionMarker; 3] = [
        CompletionMarker::TaskCompleted,
        CompletionMarker::TaskCheckmark,
        CompletionMarker::StatusDone,
    ];

    pub fn text(&self) -> &'static str {
        match self {
            CompletionMarker::TaskCompleted => "Task Completed",
            CompletionMarker::TaskCheckmark => "✅ Task",
            CompletionMarker::StatusDone => "Status: Done",
        }
    }

    /// First marker (in declaration order) present in `text`.
    pub fn find_in(text: &str) -> Option<CompletionMarker> {
        Self::ALL.into_iter().find(|m| text.contains(m.text()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    ProgressComplete,
    CompletedAt,
    LogMarker { marker: CompletionMarker, log: PathBuf },
    FileActivity { path: PathBuf },
}

/// What an oracle needs to look for external signals.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceProbe {
    pub task_id: TaskId,
    pub working_dir: Option<PathBuf>,
    /// Files modified after this instant count as activity.
    pub since: DateTime<Utc>,
}

impl EvidenceProbe {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            working_dir: task
                .working_dir
                .as_deref()
                .filter(|d| !d.trim().is_empty())
                .map(expand_home),
            since: task.started_at.unwrap_or(task.updated_at),
        }
    }
}

#[async_trait]
pub trait EvidenceOracle: Send + Sync {
    async fn external_evidence(&self, probe: &EvidenceProbe) -> Option<Evidence>;
}

pub fn intrinsic_evidence(task: &Task) -> Option<Evidence> {
    if task.progress >= 100 {
        Some(Evidence::ProgressComplete)
    } else if task.completed_at.is_some() {
        Some(Evidence::CompletedAt)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Filesystem oracle
// ---------------------------------------------------------------------------

pub struct FsEvidenceOracle {
    log_dir: PathBuf,
}

impl FsEvidenceOracle {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    /// Scan the worker logs that belong to `task_id`.
    pub fn scan_logs(&self, task_id: &TaskId) -> Option<Evidence> {
        let prefixes = [format!("spawn_{task_id}_"), format!("auto_assign_{task_id}_")];
        let entries = match std::fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.log_dir.display(), error = %e, "log dir not readable");
                return None;
            }
        };
        let mut logs: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        name.ends_with(".log") && prefixes.iter().any(|p| name.starts_with(p.as_str()))
                    })
            })
            .collect();
        // newest first; the timestamp suffix sorts lexically
        logs.sort();
        logs.reverse();

        logs.into_iter().find_map(|log| {
            let tail = read_tail(&log, LOG_TAIL_BYTES).ok()?;
            CompletionMarker::find_in(&tail).map(|marker| Evidence::LogMarker { marker, log })
        })
    }

    /// First regular file under `dir` modified after `since`.
    pub fn scan_working_dir(dir: &Path, since: DateTime<Utc>) -> Option<Evidence> {
        if !dir.is_dir() {
            return None;
        }
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| SKIP_DIRS.contains(&name))
            });
        for entry in walker.take(MAX_WALK_ENTRIES).filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                continue;
            };
            if DateTime::<Utc>::from(modified) > since {
                return Some(Evidence::FileActivity {
                    path: entry.into_path(),
                });
            }
        }
        None
    }
}

fn read_tail(path: &Path, max: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len > max {
        file.seek(SeekFrom::Start(len - max))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait]
impl EvidenceOracle for FsEvidenceOracle {
    async fn external_evidence(&self, probe: &EvidenceProbe) -> Option<Evidence> {
        let log_dir = self.log_dir.clone();
        let probe = probe.clone();
        let task_id = probe.task_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            let oracle = FsEvidenceOracle::new(log_dir);
            oracle.scan_logs(&probe.task_id).or_else(|| {
                probe
                    .working_dir
                    .as_deref()
                    .and_then(|dir| FsEvidenceOracle::scan_working_dir(dir, probe.since))
            })
        })
        .await;
        match result {
            Ok(evidence) => evidence,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "evidence scan panicked");
                None
            }
        }
    }
}
