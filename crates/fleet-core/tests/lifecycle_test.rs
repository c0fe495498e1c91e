use chrono::{DateTime, Duration, Utc};
use fleet_core::error::FleetError;
use fleet_core::lifecycle::{
    ApplyOutcome, ChecklistField, Lifecycle, LifecyclePolicy, Mutation, NewTask, TransitionOutcome,
};
use fleet_core::store::FleetStore;
use fleet_core::types::*;

async fn engine() -> Lifecycle {
    let store = FleetStore::new_in_memory().await.expect("in-memory store");
    Lifecycle::new(store, LifecyclePolicy::default())
}

fn new_task(title: &str, prerequisites: &str) -> NewTask {
    NewTask {
        title: title.into(),
        prerequisites: prerequisites.into(),
        acceptance_criteria: "- [x] tests pass\n- [x] docs updated".into(),
        expected_outcome: "feature merged".into(),
        ..NewTask::default()
    }
}

/// Create, assign and start a task with checked prerequisites.
async fn started(lc: &Lifecycle, agent: &str, now: DateTime<Utc>) -> Task {
    lc.register_agent(agent, agent, "developer", now).await.unwrap();
    let task = lc
        .create_task(new_task("build it", "- [x] repo cloned"), now)
        .await
        .unwrap();
    lc.assign(&task.id, agent, now).await.unwrap();
    lc.start(&task.id, None, now).await.unwrap().task().clone()
}

/// A task sitting in `review` after its worker completed it.
async fn in_review(lc: &Lifecycle, agent: &str, now: DateTime<Utc>) -> Task {
    let task = started(lc, agent, now).await;
    lc.complete(&task.id, Some("done"), now).await.unwrap().task().clone()
}

#[tokio::test]
async fn create_requires_quality_fields() {
    let lc = engine().await;
    let now = Utc::now();
    let mut missing = new_task("no outcome", "- [ ] a");
    missing.expected_outcome = "   ".into();

    let err = lc.create_task(missing, now).await.unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));
    assert!(lc.store().list_tasks(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn create_assigns_daily_sequence_ids() {
    let lc = engine().await;
    let now = Utc::now();
    let first = lc.create_task(new_task("one", "- [ ] a"), now).await.unwrap();
    let second = lc.create_task(new_task("two", "- [ ] a"), now).await.unwrap();

    let prefix = TaskId::day_prefix(now.date_naive());
    assert_eq!(first.id.as_str(), format!("{prefix}001"));
    assert_eq!(second.id.as_str(), format!("{prefix}002"));

    let history = lc.store().history(&first.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HistoryAction::Created);
}

#[tokio::test]
async fn deferred_task_starts_in_backlog_and_assign_promotes_it() {
    let lc = engine().await;
    let now = Utc::now();
    lc.register_agent("dev-1", "Dev", "developer", now).await.unwrap();
    let mut input = new_task("later", "- [x] a");
    input.deferred = true;
    let task = lc.create_task(input, now).await.unwrap();
    assert_eq!(task.status, TaskStatus::Backlog);

    let task = lc.assign(&task.id, "dev-1", now).await.unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
    assert_eq!(task.assignee.as_deref(), Some("dev-1"));

    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert_eq!(agent.total_tasks_assigned, 1);
    assert!(agent.current_task_id.is_none());
}

#[tokio::test]
async fn start_with_unchecked_prerequisites_blocks_task() {
    let lc = engine().await;
    let now = Utc::now();
    lc.register_agent("dev-1", "Dev", "developer", now).await.unwrap();
    let task = lc
        .create_task(new_task("T1", "- [ ] database provisioned\n- [ ] api key issued"), now)
        .await
        .unwrap();
    lc.assign(&task.id, "dev-1", now).await.unwrap();

    let outcome = lc.start(&task.id, None, now).await.unwrap();
    let TransitionOutcome::Gated { task, reason } = outcome else {
        panic!("start should have been gated");
    };
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(reason.contains("database provisioned"));
    assert!(reason.contains("api key issued"));
    assert!(task.assignee.is_none());

    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert!(agent.current_task_id.is_none());
    assert_eq!(agent.status, AgentStatus::Idle);
}

#[tokio::test]
async fn malformed_prerequisites_block_completion() {
    let lc = engine().await;
    let now = Utc::now();
    let task = started(&lc, "dev-1", now).await;

    let mut row = lc.store().get_task(&task.id).await.unwrap().unwrap();
    row.prerequisites = "someone said it is fine".into();
    lc.store().upsert_task(&row).await.unwrap();

    let outcome = lc.complete(&task.id, None, now).await.unwrap();
    assert!(outcome.is_gated());
    assert_eq!(outcome.task().status, TaskStatus::Blocked);
    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert!(agent.current_task_id.is_none());
}

#[tokio::test]
async fn start_binds_agent_and_bootstraps_working_memory() {
    let lc = engine().await;
    let now = Utc::now();
    let task = started(&lc, "dev-1", now).await;

    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.started_at, Some(now));
    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Active);
    assert_eq!(agent.current_task_id.as_ref(), Some(&task.id));

    let memory = lc.store().working_memory("dev-1").await.unwrap().unwrap();
    assert_eq!(memory.current_task_id.as_ref(), Some(&task.id));
}

#[tokio::test]
async fn complete_moves_to_review_and_releases_agent() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;

    assert_eq!(task.status, TaskStatus::Review);
    assert!(task.progress >= 95);
    assert!(task.completed_at.is_some());
    assert_eq!(task.assignee.as_deref(), Some("dev-1"));
    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert!(agent.is_free());
}

#[tokio::test]
async fn progress_of_100_completes_the_task() {
    let lc = engine().await;
    let now = Utc::now();
    let task = started(&lc, "dev-1", now).await;

    let partial = lc.update_progress(&task.id, 40, Some("halfway"), now).await.unwrap();
    assert_eq!(partial.task().progress, 40);
    assert_eq!(partial.task().status, TaskStatus::InProgress);

    let finished = lc.update_progress(&task.id, 100, None, now).await.unwrap();
    assert_eq!(finished.task().status, TaskStatus::Review);
}

#[tokio::test]
async fn every_transition_appends_one_history_entry() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;

    let history = lc.store().history(&task.id).await.unwrap();
    let actions: Vec<HistoryAction> = history.iter().map(|h| h.action).collect();
    assert_eq!(
        actions,
        vec![
            HistoryAction::Created,
            HistoryAction::Assigned,
            HistoryAction::Started,
            HistoryAction::Completed,
        ]
    );
    for entry in history.iter().skip(1) {
        let (Some(old), Some(new)) = (entry.old_status, entry.new_status) else {
            panic!("history entries carry both statuses");
        };
        assert!(old == new || old.can_transition_to(&new), "{old} -> {new}");
    }
}

#[tokio::test]
async fn rejection_at_nine_loops_auto_stops() {
    let lc = engine().await;
    let now = Utc::now();
    lc.register_agent("qa", "QA", "qa", now).await.unwrap();
    let task = in_review(&lc, "dev-1", now).await;

    let mut row = lc.store().get_task(&task.id).await.unwrap().unwrap();
    row.fix_loop_count = 9;
    lc.store().upsert_task(&row).await.unwrap();
    lc.claim_review(&task.id, "qa", now).await.unwrap();

    let task = lc.reject(&task.id, Some("qa"), "missing tests", now).await.unwrap();
    assert_eq!(task.fix_loop_count, 10);
    assert_eq!(task.status, TaskStatus::Blocked);
    assert!(task.blocked_reason.as_deref().unwrap().contains("10 fix loops"));
    assert_eq!(task.review_feedback.as_deref(), Some("missing tests"));

    let reviewer = lc.store().get_agent("qa").await.unwrap().unwrap();
    assert!(reviewer.is_free());
    let audit = lc.store().audit_events(10).await.unwrap();
    assert!(audit.iter().any(|a| a.event == AuditEvent::TaskAutoStopped));
}

#[tokio::test]
async fn ordinary_rejection_returns_to_todo_with_high_priority() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;

    let task = lc.reject(&task.id, None, "flaky test", now).await.unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
    assert_eq!(task.fix_loop_count, 1);
    assert_eq!(task.progress, 0);
    assert_eq!(task.priority, Priority::High);
    assert!(task.completed_at.is_none());
}

#[tokio::test]
async fn rejection_requires_a_reason() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;

    let err = lc.reject(&task.id, None, "  ", now).await.unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));
    let row = lc.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.fix_loop_count, 0);
}

#[tokio::test]
async fn unblock_resets_fix_loop_counter() {
    let lc = engine().await;
    let now = Utc::now();
    let task = started(&lc, "dev-1", now).await;
    let mut row = lc.store().get_task(&task.id).await.unwrap().unwrap();
    row.fix_loop_count = 7;
    lc.store().upsert_task(&row).await.unwrap();
    lc.block(&task.id, "waiting on infra", now).await.unwrap();

    let task = lc.unblock(&task.id, None, now).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.fix_loop_count, 0);
    assert!(task.blocked_reason.is_none());
    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert_eq!(agent.current_task_id.as_ref(), Some(&task.id));
}

#[tokio::test]
async fn approval_refused_when_working_memory_is_stale() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now - Duration::hours(4)).await;

    let err = lc.approve(&task.id, Some("qa"), now).await.unwrap_err();
    assert!(matches!(err, FleetError::ApprovalRefused { .. }));
    let row = lc.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Review);

    lc.update_working_memory("dev-1", Some(&task.id), "wrapped up", "", "", now)
        .await
        .unwrap();
    let done = lc.approve(&task.id, Some("qa"), now).await.unwrap();
    assert_eq!(done.status, TaskStatus::Done);
}

#[tokio::test]
async fn approval_from_review_records_claim_then_done() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;

    let task = lc.approve(&task.id, Some("qa"), now).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert_eq!(task.progress, 100);

    let history = lc.store().history(&task.id).await.unwrap();
    let tail: Vec<HistoryAction> = history.iter().rev().take(2).map(|h| h.action).collect();
    assert_eq!(tail, vec![HistoryAction::Approved, HistoryAction::ReviewClaimed]);

    let worker = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert_eq!(worker.total_tasks_completed, 1);
}

#[tokio::test]
async fn approval_requires_acceptance_criteria() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;
    lc.check_item(&task.id, ChecklistField::AcceptanceCriteria, 2, false, "qa", now)
        .await
        .unwrap();

    let err = lc.approve(&task.id, None, now).await.unwrap_err();
    let FleetError::ApprovalRefused { reason, .. } = err else {
        panic!("expected refusal");
    };
    assert!(reason.contains("docs updated"));
}

#[tokio::test]
async fn done_is_terminal() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;
    lc.approve(&task.id, None, now).await.unwrap();

    let err = lc.backlog(&task.id, None, now).await.unwrap_err();
    assert!(matches!(err, FleetError::InvalidTransition { .. }));
    let err = lc.cancel(&task.id, None, now).await.unwrap_err();
    assert!(matches!(err, FleetError::InvalidTransition { .. }));
}

#[tokio::test]
async fn human_only_items_need_a_human() {
    let lc = engine().await;
    let now = Utc::now();
    let task = lc
        .create_task(new_task("deploy", "- [ ] staging green\n- [ ] @human approve budget"), now)
        .await
        .unwrap();

    let err = lc
        .check_item(&task.id, ChecklistField::Prerequisites, 2, true, "dev-1", now)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::HumanOnly { index: 2, .. }));

    lc.check_item(&task.id, ChecklistField::Prerequisites, 1, true, "dev-1", now)
        .await
        .unwrap();
    let task = lc
        .check_item(&task.id, ChecklistField::Prerequisites, 2, true, "human", now)
        .await
        .unwrap();
    assert_eq!(task.prerequisites, "- [x] staging green\n- [x] @human approve budget");
}

#[tokio::test]
async fn requeue_only_from_info_needed() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;

    assert!(lc.requeue(&task.id, None, now).await.is_err());
    lc.info_needed(&task.id, "which region?", now).await.unwrap();
    let task = lc.requeue(&task.id, Some("eu-west"), now).await.unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
    assert_eq!(task.fix_loop_count, 0);
}

#[tokio::test]
async fn soft_return_never_touches_fix_loop() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;
    let mut row = lc.store().get_task(&task.id).await.unwrap().unwrap();
    row.prerequisites = "- [ ] migrations applied".into();
    row.fix_loop_count = 3;
    lc.store().upsert_task(&row).await.unwrap();

    let outcome = lc
        .apply(
            Mutation::SoftReturn {
                task_id: task.id.clone(),
                unchecked: vec!["migrations applied".into()],
            },
            now,
        )
        .await
        .unwrap();
    let ApplyOutcome::Applied { task: Some(task) } = outcome else {
        panic!("soft return should apply");
    };
    assert_eq!(task.status, TaskStatus::Todo);
    assert_eq!(task.fix_loop_count, 3);
    assert!(task.review_feedback.unwrap().contains("migrations applied"));
}

#[tokio::test]
async fn stale_mutation_is_skipped() {
    let lc = engine().await;
    let now = Utc::now();
    let task = in_review(&lc, "dev-1", now).await;

    let outcome = lc
        .apply(
            Mutation::AutoReject {
                task_id: task.id.clone(),
                observed_updated_at: task.updated_at - Duration::minutes(1),
            },
            now,
        )
        .await
        .unwrap();
    assert!(!outcome.is_applied());
    let row = lc.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Review);
    assert_eq!(row.fix_loop_count, 0);

    let outcome = lc
        .apply(
            Mutation::AutoReject {
                task_id: task.id.clone(),
                observed_updated_at: task.updated_at,
            },
            now,
        )
        .await
        .unwrap();
    assert!(outcome.is_applied());
    let row = lc.store().get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Todo);
    assert_eq!(row.fix_loop_count, 1);
}

#[tokio::test]
async fn claim_review_refuses_second_reviewer() {
    let lc = engine().await;
    let now = Utc::now();
    lc.register_agent("qa-a", "QA A", "qa", now).await.unwrap();
    lc.register_agent("qa-b", "QA B", "qa", now).await.unwrap();
    let task = in_review(&lc, "dev-1", now).await;

    lc.claim_review(&task.id, "qa-a", now).await.unwrap();
    let outcome = lc
        .apply(
            Mutation::ClaimReview {
                task_id: task.id.clone(),
                reviewer: "qa-b".into(),
            },
            now,
        )
        .await
        .unwrap();
    assert!(!outcome.is_applied());

    let agents = lc.store().list_agents().await.unwrap();
    let bound = agents.iter().filter(|a| a.is_bound_to(&task.id)).count();
    assert_eq!(bound, 1);
}

#[tokio::test]
async fn reset_agent_blocks_held_task_and_audits() {
    let lc = engine().await;
    let then = Utc::now() - Duration::hours(2);
    let task = started(&lc, "dev-1", then).await;
    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();

    let outcome = lc
        .apply(
            Mutation::ResetAgent {
                agent_id: "dev-1".into(),
                observed_heartbeat: agent.last_heartbeat,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    let ApplyOutcome::Applied { task: Some(blocked) } = outcome else {
        panic!("reset should block the held task");
    };
    assert_eq!(blocked.id, task.id);
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert!(blocked.blocked_reason.unwrap().contains("Agent timeout"));

    let agent = lc.store().get_agent("dev-1").await.unwrap().unwrap();
    assert!(agent.is_free());
    let audit = lc.store().audit_events(5).await.unwrap();
    assert_eq!(audit[0].event, AuditEvent::AgentReset);
    assert!(audit[0].before_state.is_some());
    assert!(audit[0].after_state.is_some());
}

mod random_walk {
    use super::*;
    use proptest::prelude::*;

    async fn step(lc: &Lifecycle, id: &TaskId, op: u8, now: DateTime<Utc>) -> bool {
        match op {
            0 => lc.complete(id, Some("step"), now).await.is_ok(),
            1 => lc.reject(id, Some("qa"), "not yet", now).await.is_ok(),
            2 => lc.approve(id, Some("qa"), now).await.is_ok(),
            3 => lc.block(id, "paused", now).await.is_ok(),
            4 => lc.unblock(id, None, now).await.is_ok(),
            5 => lc.backlog(id, None, now).await.is_ok(),
            6 => lc.assign(id, "dev-1", now).await.is_ok(),
            7 => lc.start(id, None, now).await.is_ok(),
            _ => lc.claim_review(id, "qa", now).await.is_ok(),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn random_operations_follow_legal_edges(ops in proptest::collection::vec(0u8..9, 1..24)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let lc = engine().await;
                let now = Utc::now();
                lc.register_agent("qa", "QA", "qa", now).await.unwrap();
                let task = started(&lc, "dev-1", now).await;
                let mut loops = 0;

                for op in ops {
                    let ok = step(&lc, &task.id, op, now).await;
                    let row = lc.store().get_task(&task.id).await.unwrap().unwrap();
                    if op == 4 && ok {
                        assert_eq!(row.fix_loop_count, 0);
                    } else {
                        assert!(row.fix_loop_count >= loops);
                    }
                    loops = row.fix_loop_count;

                    let agents = lc.store().list_agents().await.unwrap();
                    assert!(agents.iter().filter(|a| a.is_bound_to(&task.id)).count() <= 1);
                }

                for entry in lc.store().history(&task.id).await.unwrap() {
                    if let (Some(old), Some(new)) = (entry.old_status, entry.new_status) {
                        assert!(old == new || old.can_transition_to(&new), "{old} -> {new}");
                    }
                }
            });
        }
    }
}
