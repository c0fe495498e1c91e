use chrono::{DateTime, Duration, Utc};
use fleet_core::config::{HealthPolicy, NotificationConfig, NotificationLevel};
use fleet_core::lifecycle::{Lifecycle, LifecyclePolicy, NewTask};
use fleet_core::store::FleetStore;
use fleet_core::types::*;
use fleet_daemon::health::{HealthSweep, Severity};
use fleet_daemon::notify::{LogNotifier, NotificationDispatcher};

async fn engine() -> Lifecycle {
    let store = FleetStore::new_in_memory().await.expect("in-memory store");
    Lifecycle::new(store, LifecyclePolicy::default())
}

fn dispatcher(lc: &Lifecycle) -> NotificationDispatcher {
    let cfg = NotificationConfig {
        enabled: true,
        level: NotificationLevel::Verbose,
        ..NotificationConfig::default()
    };
    NotificationDispatcher::new(lc.store().clone(), Box::new(LogNotifier), &cfg)
}

async fn running_task(lc: &Lifecycle, agent: &str, started: DateTime<Utc>) -> Task {
    lc.register_agent(agent, agent, "developer", started).await.unwrap();
    let task = lc
        .create_task(
            NewTask {
                title: "migrate billing tables".into(),
                prerequisites: "- [x] schema reviewed".into(),
                acceptance_criteria: "- [ ] migration applied".into(),
                expected_outcome: "billing on new schema".into(),
                ..NewTask::default()
            },
            started,
        )
        .await
        .unwrap();
    lc.assign(&task.id, agent, started).await.unwrap();
    lc.start(&task.id, None, started).await.unwrap().task().clone()
}

#[tokio::test]
async fn empty_fleet_is_clean() {
    let lc = engine().await;
    let report = HealthSweep::new(lc, HealthPolicy::default())
        .run(Utc::now())
        .await
        .expect("sweep should succeed");

    assert_eq!(report.agents_checked, 0);
    assert_eq!(report.tasks_checked, 0);
    assert!(report.issues.is_empty());
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn stuck_task_is_auto_blocked_and_agent_released() {
    let lc = engine().await;
    let now = Utc::now();
    let task = running_task(&lc, "dev-1", now - Duration::hours(4)).await;
    // the worker is alive, the task is not moving
    lc.heartbeat("dev-1", now - Duration::minutes(2)).await.unwrap();

    let report = HealthSweep::new(lc.clone(), HealthPolicy::default())
        .run(now)
        .await
        .unwrap();

    let blocked = lc.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert!(blocked.blocked_reason.as_deref().unwrap().contains("Stuck"));

    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.current_task_id, None);

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.count(Severity::Warning), 1);
    let audit = lc.store().audit_events(10).await.unwrap();
    assert!(audit.iter().any(|a| a.event == AuditEvent::TaskAutoBlocked && a.task_id.as_ref() == Some(&task.id)));
}

#[tokio::test]
async fn silent_active_agent_is_reset_and_its_task_blocked() {
    let lc = engine().await;
    let now = Utc::now();
    let started = now - Duration::minutes(50);
    let task = running_task(&lc, "dev-2", started).await;
    lc.update_progress(&task.id, 40, Some("halfway"), now - Duration::minutes(10))
        .await
        .unwrap();

    let report = HealthSweep::new(lc.clone(), HealthPolicy::default())
        .run(now)
        .await
        .unwrap();

    let agent = lc.store().get_agent("dev-2").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.health_status, HealthStatus::Stale);

    let task = lc.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(task.blocked_reason.as_deref().unwrap().starts_with("Agent timeout"));

    let audit = lc.store().audit_events(10).await.unwrap();
    assert!(audit
        .iter()
        .any(|a| a.event == AuditEvent::AgentReset && a.agent_id.as_deref() == Some("dev-2")));
    assert!(report.mutations.applied >= 2);
}

#[tokio::test]
async fn repeated_sweeps_alert_once() {
    let lc = engine().await;
    let now = Utc::now();
    let task = running_task(&lc, "dev-3", now - Duration::minutes(150)).await;
    lc.heartbeat("dev-3", now).await.unwrap();
    let notifications = dispatcher(&lc);
    let sweep = HealthSweep::new(lc.clone(), HealthPolicy::default()).with_notifications(notifications.clone());

    let first = sweep.run(now).await.unwrap();
    assert_eq!(first.alerts_sent, 1);
    assert_eq!(notifications.pending(), 1);

    let second = sweep.run(now + Duration::minutes(5)).await.unwrap();
    assert_eq!(second.alerts_sent, 0);
    assert_eq!(second.alerts_suppressed, 1);
    assert_eq!(notifications.pending(), 1);

    let open = lc.store().open_alerts().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].kind, AlertKind::TaskStuck);
    assert_eq!(open[0].entity_id, task.id.to_string());
}

#[tokio::test]
async fn recovered_task_resolves_its_alert() {
    let lc = engine().await;
    let now = Utc::now();
    let task = running_task(&lc, "dev-4", now - Duration::minutes(150)).await;
    lc.heartbeat("dev-4", now).await.unwrap();
    let sweep = HealthSweep::new(lc.clone(), HealthPolicy::default());
    sweep.run(now).await.unwrap();

    lc.update_progress(&task.id, 70, Some("unstuck"), now + Duration::minutes(1))
        .await
        .unwrap();
    lc.heartbeat("dev-4", now + Duration::minutes(2)).await.unwrap();
    let report = sweep.run(now + Duration::minutes(2)).await.unwrap();

    assert_eq!(report.alerts_resolved, 1);
    assert!(lc.store().open_alerts().await.unwrap().is_empty());
}

#[tokio::test]
async fn fix_loop_limit_auto_stops_outside_review() {
    let lc = engine().await;
    let now = Utc::now();
    let mut task = Task::new(TaskId::from("T-20260101-001"), "flaky fix", now);
    task.prerequisites = "- [x] repro".into();
    task.fix_loop_count = 10;
    lc.store().upsert_task(&task).await.unwrap();

    let report = HealthSweep::new(lc.clone(), HealthPolicy::default())
        .run(now)
        .await
        .unwrap();

    let stopped = lc.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, TaskStatus::Blocked);
    assert!(stopped.blocked_reason.as_deref().unwrap().starts_with("AUTO-STOP"));
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn rejection_at_fix_loop_limit_raises_one_alert() {
    let lc = engine().await;
    let now = Utc::now();
    let task = running_task(&lc, "dev-5", now - Duration::minutes(20)).await;
    lc.heartbeat("dev-5", now).await.unwrap();
    let mut at_edge = lc.store().get_task(&task.id).await.unwrap().unwrap();
    at_edge.status = TaskStatus::Review;
    at_edge.progress = 100;
    at_edge.fix_loop_count = 9;
    lc.store().upsert_task(&at_edge).await.unwrap();

    let rejected = lc.reject(&task.id, Some("reviewer"), "still failing", now).await.unwrap();
    assert!(rejected.is_auto_stopped());
    assert_eq!(rejected.fix_loop_count, 10);

    let notifications = dispatcher(&lc);
    let sweep = HealthSweep::new(lc.clone(), HealthPolicy::default()).with_notifications(notifications.clone());
    let first = sweep.run(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(first.exit_code(), 2);
    assert_eq!(first.alerts_sent, 1);
    assert_eq!(notifications.pending(), 1);
    let open = lc.store().open_alerts().await.unwrap();
    assert!(open.iter().any(|a| a.kind == AlertKind::AutoStop && a.entity_id == task.id.to_string()));

    let second = sweep.run(now + Duration::minutes(6)).await.unwrap();
    assert_eq!(second.exit_code(), 2);
    assert_eq!(second.alerts_sent, 0);
    assert_eq!(notifications.pending(), 1);
}
