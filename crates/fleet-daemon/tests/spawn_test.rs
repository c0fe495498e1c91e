use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleet_agents::launcher::{LaunchOutcome, LaunchRequest, WorkerLauncher};
use fleet_core::lifecycle::{Lifecycle, LifecyclePolicy, NewTask};
use fleet_core::store::FleetStore;
use fleet_core::types::*;
use fleet_daemon::assign::AutoAssigner;
use fleet_daemon::spawn::{SpawnPolicy, SpawnSkip, SpawnSweep};

#[derive(Default)]
struct RecordingLauncher {
    fail: bool,
    requests: Mutex<Vec<LaunchRequest>>,
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(&self, request: &LaunchRequest) -> LaunchOutcome {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            LaunchOutcome::failed("exit status 1")
        } else {
            LaunchOutcome::started(request.log_path.display().to_string())
        }
    }
}

async fn engine() -> Lifecycle {
    let store = FleetStore::new_in_memory().await.expect("in-memory store");
    Lifecycle::new(store, LifecyclePolicy::default())
}

fn policy(log_dir: &std::path::Path) -> SpawnPolicy {
    SpawnPolicy {
        log_dir: log_dir.to_path_buf(),
        ..SpawnPolicy::default()
    }
}

async fn assigned(lc: &Lifecycle, agent: &str, working_dir: Option<&str>, at: DateTime<Utc>) -> Task {
    lc.register_agent(agent, agent, "dev", at).await.unwrap();
    let task = lc
        .create_task(
            NewTask {
                title: "add retry to uploader".into(),
                working_dir: working_dir.map(str::to_string),
                prerequisites: "- [x] bucket exists".into(),
                acceptance_criteria: "- [ ] retries on 503".into(),
                expected_outcome: "uploads survive blips".into(),
                ..NewTask::default()
            },
            at,
        )
        .await
        .unwrap();
    lc.assign(&task.id, agent, at).await.unwrap()
}

#[tokio::test]
async fn settled_task_gets_a_worker() {
    let dir = tempfile::tempdir().unwrap();
    let lc = engine().await;
    let now = Utc::now();
    let task = assigned(&lc, "dev-1", dir.path().to_str(), now - Duration::minutes(5)).await;
    let launcher = Arc::new(RecordingLauncher::default());

    let report = SpawnSweep::new(lc.clone(), launcher.clone(), policy(dir.path()))
        .run(now)
        .await
        .unwrap();

    assert_eq!(report.launched, vec![task.id.clone()]);
    let requests = launcher.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].agent_id, "dev-1");
    assert_eq!(requests[0].working_dir, dir.path());
    assert!(requests[0].prompt.contains(task.id.as_str()));

    let history = lc.store().history(&task.id).await.unwrap();
    assert_eq!(history.last().unwrap().action, HistoryAction::Spawned);
    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Active);
}

#[tokio::test]
async fn second_sweep_does_not_double_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let lc = engine().await;
    let now = Utc::now();
    let task = assigned(&lc, "dev-1", dir.path().to_str(), now - Duration::minutes(5)).await;
    let launcher = Arc::new(RecordingLauncher::default());
    let sweep = SpawnSweep::new(lc.clone(), launcher.clone(), policy(dir.path()));

    sweep.run(now).await.unwrap();
    let again = sweep.run(now + Duration::minutes(1)).await.unwrap();

    assert!(again.launched.is_empty());
    assert_eq!(launcher.requests.lock().unwrap().len(), 1);
    assert_eq!(
        again.skipped,
        vec![(task.id.clone(), SpawnSkip::AssigneeBusy { agent_id: "dev-1".into() })]
    );
}

#[tokio::test]
async fn fresh_assignment_settles_first() {
    let dir = tempfile::tempdir().unwrap();
    let lc = engine().await;
    let now = Utc::now();
    let task = assigned(&lc, "dev-1", dir.path().to_str(), now).await;
    let launcher = Arc::new(RecordingLauncher::default());

    let report = SpawnSweep::new(lc, launcher.clone(), policy(dir.path()))
        .run(now)
        .await
        .unwrap();

    assert_eq!(report.skipped, vec![(task.id, SpawnSkip::Settling)]);
    assert!(launcher.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_launch_is_audited_and_agent_stays_idle() {
    let dir = tempfile::tempdir().unwrap();
    let lc = engine().await;
    let now = Utc::now();
    let task = assigned(&lc, "dev-1", dir.path().to_str(), now - Duration::minutes(5)).await;
    let launcher = Arc::new(RecordingLauncher {
        fail: true,
        ..RecordingLauncher::default()
    });

    let report = SpawnSweep::new(lc.clone(), launcher, policy(dir.path()))
        .run(now)
        .await
        .unwrap();

    assert_eq!(report.failed, vec![task.id.clone()]);
    assert!(lc.store().get_agent("dev-1").await.unwrap().unwrap().is_free());
    let audit = lc.store().audit_events(5).await.unwrap();
    assert!(audit
        .iter()
        .any(|a| a.event == AuditEvent::AgentSpawn && a.details.contains("spawn failed")));
}

#[tokio::test]
async fn auto_assign_then_spawn() {
    let dir = tempfile::tempdir().unwrap();
    let lc = engine().await;
    let created = Utc::now() - Duration::minutes(10);
    lc.register_agent("qa", "QA", "qa", created).await.unwrap();
    let task = lc
        .create_task(
            NewTask {
                title: "write regression tests".into(),
                working_dir: dir.path().to_str().map(str::to_string),
                prerequisites: "- [x] bug reproduced".into(),
                acceptance_criteria: "- [ ] test fails before fix".into(),
                expected_outcome: "regression covered".into(),
                ..NewTask::default()
            },
            created,
        )
        .await
        .unwrap();

    let assigned_at = created + Duration::minutes(1);
    let report = AutoAssigner::new(lc.clone()).run(assigned_at).await.unwrap();
    assert_eq!(report.assigned, vec![(task.id.clone(), "qa".to_string())]);

    let launcher = Arc::new(RecordingLauncher::default());
    let spawn = SpawnSweep::new(lc.clone(), launcher, policy(dir.path()))
        .run(assigned_at + Duration::minutes(3))
        .await
        .unwrap();
    assert_eq!(spawn.launched, vec![task.id]);
}
