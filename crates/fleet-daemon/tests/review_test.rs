use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleet_agents::evidence::{Evidence, EvidenceOracle, EvidenceProbe};
use fleet_agents::launcher::{LaunchOutcome, LaunchRequest, WorkerLauncher};
use fleet_core::lifecycle::{Lifecycle, LifecyclePolicy, NewTask};
use fleet_core::store::FleetStore;
use fleet_core::types::*;
use fleet_daemon::review::{ReviewPolicy, ReviewSweep, LAUNCH_FAILED_REASON, NO_REVIEWER_REASON};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingLauncher {
    fail: bool,
    requests: Mutex<Vec<LaunchRequest>>,
}

impl RecordingLauncher {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn launched(&self) -> Vec<(String, String)> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.agent_id.clone(), r.task_id.to_string()))
            .collect()
    }
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(&self, request: &LaunchRequest) -> LaunchOutcome {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            LaunchOutcome::failed("runtime not installed")
        } else {
            LaunchOutcome::started(request.log_path.display().to_string())
        }
    }
}

struct NoEvidence;

#[async_trait]
impl EvidenceOracle for NoEvidence {
    async fn external_evidence(&self, _probe: &EvidenceProbe) -> Option<Evidence> {
        None
    }
}

struct AlwaysEvidence;

#[async_trait]
impl EvidenceOracle for AlwaysEvidence {
    async fn external_evidence(&self, probe: &EvidenceProbe) -> Option<Evidence> {
        Some(Evidence::FileActivity {
            path: probe.working_dir.clone().unwrap_or_default().join("src/lib.rs"),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn engine() -> Lifecycle {
    let store = FleetStore::new_in_memory().await.expect("in-memory store");
    Lifecycle::new(store, LifecyclePolicy::default())
}

fn sweep(lc: &Lifecycle, launcher: Arc<RecordingLauncher>, oracle: Arc<dyn EvidenceOracle>) -> ReviewSweep {
    let policy = ReviewPolicy {
        log_dir: std::env::temp_dir().join("fleet-review-test"),
        ..ReviewPolicy::default()
    };
    ReviewSweep::new(lc.clone(), launcher, oracle, policy)
}

/// A worker-completed task sitting in `review`.
async fn completed(lc: &Lifecycle, title: &str, now: DateTime<Utc>) -> Task {
    let worker = format!("dev-{title}");
    lc.register_agent(&worker, &worker, "developer", now).await.unwrap();
    let task = lc
        .create_task(
            NewTask {
                title: title.into(),
                prerequisites: "- [x] branch created".into(),
                acceptance_criteria: "- [ ] endpoint returns 200".into(),
                expected_outcome: "endpoint live".into(),
                ..NewTask::default()
            },
            now,
        )
        .await
        .unwrap();
    lc.assign(&task.id, &worker, now).await.unwrap();
    lc.start(&task.id, None, now).await.unwrap();
    lc.complete(&task.id, Some("done"), now).await.unwrap().task().clone()
}

async fn reviewer(lc: &Lifecycle, id: &str, heartbeat: DateTime<Utc>) {
    lc.register_agent(id, id, "qa", heartbeat).await.unwrap();
    lc.heartbeat(id, heartbeat).await.unwrap();
}

async fn task(lc: &Lifecycle, id: &TaskId) -> Task {
    lc.store().get_task(id).await.unwrap().unwrap()
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn longest_idle_reviewer_claims_the_task() {
    let lc = engine().await;
    let now = Utc::now();
    let t = completed(&lc, "api", now - Duration::minutes(5)).await;
    reviewer(&lc, "qa-a", now - Duration::hours(3)).await;
    reviewer(&lc, "qa-b", now - Duration::hours(1)).await;
    let launcher = Arc::new(RecordingLauncher::default());

    let report = sweep(&lc, launcher.clone(), Arc::new(NoEvidence)).run(now).await.unwrap();

    assert_eq!(report.dispatched, vec![(t.id.clone(), "qa-a".to_string())]);
    assert_eq!(launcher.launched(), vec![("qa-a".to_string(), t.id.to_string())]);
    assert_eq!(task(&lc, &t.id).await.status, TaskStatus::Reviewing);

    let qa_a = lc.store().get_agent("qa-a").await.unwrap().unwrap();
    assert_eq!(qa_a.current_task_id.as_ref(), Some(&t.id));
    let qa_b = lc.store().get_agent("qa-b").await.unwrap().unwrap();
    assert!(qa_b.is_free());
}

#[tokio::test]
async fn two_tasks_get_two_reviewers() {
    let lc = engine().await;
    let now = Utc::now();
    let first = completed(&lc, "one", now).await;
    let second = completed(&lc, "two", now).await;
    reviewer(&lc, "qa-a", now - Duration::minutes(30)).await;
    reviewer(&lc, "qa-b", now - Duration::minutes(10)).await;
    let launcher = Arc::new(RecordingLauncher::default());

    let report = sweep(&lc, launcher, Arc::new(NoEvidence)).run(now).await.unwrap();

    assert_eq!(report.dispatched.len(), 2);
    let reviewers: Vec<&str> = report.dispatched.iter().map(|(_, r)| r.as_str()).collect();
    assert!(reviewers.contains(&"qa-a") && reviewers.contains(&"qa-b"));
    assert_eq!(task(&lc, &first.id).await.status, TaskStatus::Reviewing);
    assert_eq!(task(&lc, &second.id).await.status, TaskStatus::Reviewing);
}

#[tokio::test]
async fn failed_launch_returns_task_to_review() {
    let lc = engine().await;
    let now = Utc::now();
    let t = completed(&lc, "api", now).await;
    reviewer(&lc, "qa", now - Duration::minutes(10)).await;
    let launcher = Arc::new(RecordingLauncher::failing());

    let report = sweep(&lc, launcher, Arc::new(NoEvidence)).run(now).await.unwrap();

    assert_eq!(report.launch_failures, 1);
    assert!(report.dispatched.is_empty());
    assert_eq!(task(&lc, &t.id).await.status, TaskStatus::Review);
    assert!(lc.store().get_agent("qa").await.unwrap().unwrap().is_free());
    let history = lc.store().history(&t.id).await.unwrap();
    assert_eq!(history.last().unwrap().notes.as_deref(), Some(LAUNCH_FAILED_REASON));
}

// ---------------------------------------------------------------------------
// Evidence and grace
// ---------------------------------------------------------------------------

async fn review_without_evidence(lc: &Lifecycle, entered: DateTime<Utc>) -> Task {
    let mut t = Task::new(TaskId::from("T-20260101-007"), "docs", entered);
    t.status = TaskStatus::Review;
    t.prerequisites = "- [x] outline".into();
    t.review_at = Some(entered);
    lc.store().upsert_task(&t).await.unwrap();
    t
}

#[tokio::test]
async fn no_evidence_waits_inside_grace() {
    let lc = engine().await;
    let now = Utc::now();
    let t = review_without_evidence(&lc, now - Duration::minutes(20)).await;
    reviewer(&lc, "qa", now).await;
    let launcher = Arc::new(RecordingLauncher::default());

    let report = sweep(&lc, launcher.clone(), Arc::new(NoEvidence)).run(now).await.unwrap();

    assert_eq!(report.waiting, 1);
    assert!(launcher.launched().is_empty());
    assert_eq!(task(&lc, &t.id).await.status, TaskStatus::Review);
}

#[tokio::test]
async fn no_evidence_past_grace_is_rejected() {
    let lc = engine().await;
    let now = Utc::now();
    let t = review_without_evidence(&lc, now - Duration::minutes(90)).await;

    sweep(&lc, Arc::new(RecordingLauncher::default()), Arc::new(NoEvidence))
        .run(now)
        .await
        .unwrap();

    let rejected = task(&lc, &t.id).await;
    assert_eq!(rejected.status, TaskStatus::Todo);
    assert_eq!(rejected.fix_loop_count, 1);
    assert_eq!(rejected.priority, Priority::High);
}

#[tokio::test]
async fn oracle_evidence_allows_dispatch() {
    let lc = engine().await;
    let now = Utc::now();
    let t = review_without_evidence(&lc, now - Duration::minutes(90)).await;
    reviewer(&lc, "qa", now).await;
    let launcher = Arc::new(RecordingLauncher::default());

    let report = sweep(&lc, launcher, Arc::new(AlwaysEvidence)).run(now).await.unwrap();

    assert_eq!(report.dispatched, vec![(t.id.clone(), "qa".to_string())]);
}

// ---------------------------------------------------------------------------
// Prerequisite gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unchecked_prerequisites_soft_return() {
    let lc = engine().await;
    let now = Utc::now();
    let mut t = completed(&lc, "api", now).await;
    t.prerequisites = "- [x] branch created\n- [ ] staging db seeded".into();
    lc.store().upsert_task(&t).await.unwrap();

    sweep(&lc, Arc::new(RecordingLauncher::default()), Arc::new(NoEvidence))
        .run(now)
        .await
        .unwrap();

    let back = task(&lc, &t.id).await;
    assert_eq!(back.status, TaskStatus::Todo);
    assert!(back.review_feedback.as_deref().unwrap().contains("staging db seeded"));
}

#[tokio::test]
async fn human_only_prerequisites_need_info() {
    let lc = engine().await;
    let now = Utc::now();
    let mut t = completed(&lc, "api", now).await;
    t.prerequisites = "- [ ] @human sign off on pricing".into();
    lc.store().upsert_task(&t).await.unwrap();

    sweep(&lc, Arc::new(RecordingLauncher::default()), Arc::new(NoEvidence))
        .run(now)
        .await
        .unwrap();

    let held = task(&lc, &t.id).await;
    assert_eq!(held.status, TaskStatus::InfoNeeded);
    assert!(held.blocked_reason.as_deref().unwrap().contains("HUMAN-only"));
}

// ---------------------------------------------------------------------------
// Reviewer liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_reviewer_returns_task() {
    let lc = engine().await;
    let claimed = Utc::now() - Duration::minutes(40);
    let t = completed(&lc, "api", claimed).await;
    reviewer(&lc, "qa", claimed).await;
    lc.claim_review(&t.id, "qa", claimed).await.unwrap();

    let now = Utc::now();
    let launcher = Arc::new(RecordingLauncher::default());
    sweep(&lc, launcher.clone(), Arc::new(NoEvidence)).run(now).await.unwrap();

    // returned this sweep, re-dispatched on the next
    assert_eq!(task(&lc, &t.id).await.status, TaskStatus::Review);
    assert!(launcher.launched().is_empty());
    let history = lc.store().history(&t.id).await.unwrap();
    assert!(history.last().unwrap().notes.as_deref().unwrap().contains("stale"));
}

#[tokio::test]
async fn orphaned_reviewing_task_without_reviewers_returns() {
    let lc = engine().await;
    let now = Utc::now();
    let mut t = completed(&lc, "api", now).await;
    t.status = TaskStatus::Reviewing;
    lc.store().upsert_task(&t).await.unwrap();

    sweep(&lc, Arc::new(RecordingLauncher::default()), Arc::new(NoEvidence))
        .run(now)
        .await
        .unwrap();

    assert_eq!(task(&lc, &t.id).await.status, TaskStatus::Review);
    let history = lc.store().history(&t.id).await.unwrap();
    assert_eq!(history.last().unwrap().notes.as_deref(), Some(NO_REVIEWER_REASON));
}

#[tokio::test]
async fn orphaned_reviewing_task_gets_a_new_reviewer() {
    let lc = engine().await;
    let now = Utc::now();
    let mut t = completed(&lc, "api", now).await;
    t.status = TaskStatus::Reviewing;
    lc.store().upsert_task(&t).await.unwrap();
    reviewer(&lc, "qa", now - Duration::minutes(3)).await;
    let launcher = Arc::new(RecordingLauncher::default());

    sweep(&lc, launcher.clone(), Arc::new(NoEvidence)).run(now).await.unwrap();

    assert_eq!(task(&lc, &t.id).await.status, TaskStatus::Reviewing);
    assert_eq!(launcher.launched(), vec![("qa".to_string(), t.id.to_string())]);
    let qa = lc.store().get_agent("qa").await.unwrap().unwrap();
    assert_eq!(qa.last_heartbeat, Some(now));
}

#[tokio::test]
async fn finished_in_progress_task_is_promoted_and_dispatched() {
    let lc = engine().await;
    let now = Utc::now();
    lc.register_agent("dev", "dev", "developer", now).await.unwrap();
    reviewer(&lc, "qa", now).await;
    let t = lc
        .create_task(
            NewTask {
                title: "cli flags".into(),
                prerequisites: "- [x] design agreed".into(),
                acceptance_criteria: "- [ ] --help lists flags".into(),
                expected_outcome: "flags documented".into(),
                ..NewTask::default()
            },
            now,
        )
        .await
        .unwrap();
    lc.assign(&t.id, "dev", now).await.unwrap();
    lc.start(&t.id, None, now).await.unwrap();
    let mut row = task(&lc, &t.id).await;
    row.progress = 100;
    lc.store().upsert_task(&row).await.unwrap();

    let report = sweep(&lc, Arc::new(RecordingLauncher::default()), Arc::new(NoEvidence))
        .run(now)
        .await
        .unwrap();

    assert_eq!(report.promoted, 1);
    assert_eq!(report.dispatched, vec![(t.id.clone(), "qa".to_string())]);
    assert!(lc.store().get_agent("dev").await.unwrap().unwrap().is_free());
}
