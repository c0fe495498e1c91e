use std::fs;

use chrono::{Duration, Utc};
use fleet_agents::evidence::*;
use fleet_core::types::{Task, TaskId};

fn task_in(dir: &std::path::Path) -> Task {
    let mut task = Task::new(TaskId::from("T-20260101-009"), "scan me", Utc::now());
    task.working_dir = Some(dir.display().to_string());
    task.started_at = Some(Utc::now() - Duration::hours(1));
    task
}

#[tokio::test]
async fn log_marker_counts_as_evidence() {
    let logs = tempfile::tempdir().unwrap();
    fs::write(
        logs.path().join("spawn_T-20260101-009_20260101_100000.log"),
        "working...\nStatus: Done\n",
    )
    .unwrap();
    // another task's log must not leak
    fs::write(
        logs.path().join("spawn_T-20260101-010_20260101_100000.log"),
        "Task Completed",
    )
    .unwrap();

    let oracle = FsEvidenceOracle::new(logs.path());
    let probe = EvidenceProbe {
        task_id: TaskId::from("T-20260101-009"),
        working_dir: None,
        since: Utc::now(),
    };
    match oracle.external_evidence(&probe).await {
        Some(Evidence::LogMarker { marker, .. }) => assert_eq!(marker, CompletionMarker::StatusDone),
        other => panic!("expected log marker, got {other:?}"),
    }

    let other = EvidenceProbe {
        task_id: TaskId::from("T-20260101-011"),
        ..probe
    };
    assert_eq!(oracle.external_evidence(&other).await, None);
}

#[tokio::test]
async fn only_the_log_tail_is_scanned() {
    let logs = tempfile::tempdir().unwrap();
    let mut body = String::from("Task Completed\n");
    body.push_str(&"x".repeat((LOG_TAIL_BYTES + 1024) as usize));
    fs::write(logs.path().join("spawn_T-20260101-009_20260101_100000.log"), body).unwrap();

    let oracle = FsEvidenceOracle::new(logs.path());
    assert_eq!(oracle.scan_logs(&TaskId::from("T-20260101-009")), None);
}

#[tokio::test]
async fn fresh_file_in_working_dir_is_activity() {
    let logs = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    fs::create_dir(work.path().join("src")).unwrap();
    fs::write(work.path().join("src").join("main.rs"), "fn main() {}").unwrap();

    let oracle = FsEvidenceOracle::new(logs.path());
    let task = task_in(work.path());
    match oracle.external_evidence(&EvidenceProbe::for_task(&task)).await {
        Some(Evidence::FileActivity { path }) => assert!(path.ends_with("src/main.rs")),
        other => panic!("expected file activity, got {other:?}"),
    }
}

#[tokio::test]
async fn skipped_directories_do_not_count() {
    let work = tempfile::tempdir().unwrap();
    for skip in ["node_modules", ".git", "logs"] {
        fs::create_dir(work.path().join(skip)).unwrap();
        fs::write(work.path().join(skip).join("touched.txt"), "x").unwrap();
    }
    let since = Utc::now() - Duration::hours(1);
    assert_eq!(FsEvidenceOracle::scan_working_dir(work.path(), since), None);
}

#[tokio::test]
async fn old_files_are_not_activity() {
    let work = tempfile::tempdir().unwrap();
    fs::write(work.path().join("README.md"), "hello").unwrap();
    let since = Utc::now() + Duration::minutes(5);
    assert_eq!(FsEvidenceOracle::scan_working_dir(work.path(), since), None);
}
