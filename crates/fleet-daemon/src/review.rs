//! The review gate.
//!
//! Per sweep: finished `in_progress` tasks are promoted to `review`; every
//! task in `review` or `reviewing` then passes the prerequisite gate, `review`
//! tasks need completion evidence before a reviewer is dispatched, and
//! `reviewing` tasks must keep a live reviewer bound or go back to `review`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleet_agents::evidence::{intrinsic_evidence, Evidence, EvidenceOracle, EvidenceProbe};
use fleet_agents::launcher::{review_log_path, LaunchRequest, WorkerLauncher};
use fleet_agents::prompts::review_prompt;
use fleet_core::checklist::{self, ChecklistState, HumanOnlyMatcher};
use fleet_core::config::{expand_home, Config};
use fleet_core::error::Result;
use fleet_core::lifecycle::{ApplyOutcome, Lifecycle, Mutation};
use fleet_core::store::StoreSnapshot;
use fleet_core::types::{Agent, Task, TaskId, TaskStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cycle::{apply_planned, ApplyTally};
use crate::notify::{NotificationDispatcher, NotificationEvent};

pub const NO_REVIEWER_REASON: &str = "No active reviewer; returned to waiting review";
pub const LAUNCH_FAILED_REASON: &str = "Reviewer spawn failed; returned to waiting review";

// ---------------------------------------------------------------------------
// Policy and reviewer pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewPolicy {
    pub grace: Duration,
    pub reviewer_stale: Duration,
    pub clock_skew_tolerance: Duration,
    /// Explicit pool; empty means discover by id prefix or role keyword.
    pub reviewers: Vec<String>,
    pub default_reviewer: String,
    pub id_prefixes: Vec<String>,
    pub role_keywords: Vec<String>,
    pub human_only: HumanOnlyMatcher,
    pub timeout_secs: u64,
    pub log_dir: PathBuf,
}

impl ReviewPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        let review = &cfg.review;
        Self {
            grace: Duration::minutes(review.grace_minutes),
            reviewer_stale: Duration::minutes(review.reviewer_stale_minutes),
            clock_skew_tolerance: Duration::minutes(review.clock_skew_tolerance_minutes),
            reviewers: review.reviewers.clone(),
            default_reviewer: review.default_reviewer.clone(),
            id_prefixes: review.reviewer_id_prefixes.clone(),
            role_keywords: review.reviewer_role_keywords.clone(),
            human_only: review.human_only(),
            timeout_secs: cfg.spawn.timeout_secs,
            log_dir: expand_home(&cfg.launcher.log_dir),
        }
    }

    fn matches_pattern(&self, agent: &Agent) -> bool {
        let id = agent.id.to_lowercase();
        let role = agent.role.to_lowercase();
        self.id_prefixes.iter().any(|p| id.starts_with(&p.to_lowercase()))
            || self.role_keywords.iter().any(|k| role.contains(&k.to_lowercase()))
    }
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Agents eligible to review: the configured list, else pattern matches,
/// else the default reviewer if it exists.
pub fn reviewer_pool<'a>(snapshot: &'a StoreSnapshot, policy: &ReviewPolicy) -> Vec<&'a Agent> {
    if !policy.reviewers.is_empty() {
        return snapshot
            .agents
            .iter()
            .filter(|a| policy.reviewers.iter().any(|r| *r == a.id))
            .collect();
    }
    let matched: Vec<&Agent> = snapshot.agents.iter().filter(|a| policy.matches_pattern(a)).collect();
    if !matched.is_empty() {
        return matched;
    }
    snapshot.agent(&policy.default_reviewer).into_iter().collect()
}

/// Idle reviewer with the oldest heartbeat (never-seen first), skipping
/// those already taken this sweep.
pub fn pick_idle<'a>(pool: &[&'a Agent], taken: &HashSet<String>) -> Option<&'a Agent> {
    pool.iter()
        .copied()
        .filter(|a| a.is_free() && !taken.contains(&a.id))
        .min_by(|a, b| (a.last_heartbeat, &a.id).cmp(&(b.last_heartbeat, &b.id)))
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewAction {
    Apply(Mutation),
    /// Bind `reviewer` through `claim`, then launch a review run.
    Dispatch {
        task: Task,
        reviewer: String,
        claim: Mutation,
    },
    Waiting {
        task_id: TaskId,
        reason: String,
    },
}

/// Finished `in_progress` tasks that should move to `review`.
pub fn plan_reconcile(snapshot: &StoreSnapshot) -> Vec<Mutation> {
    snapshot
        .tasks_in(TaskStatus::InProgress)
        .filter(|t| t.completed_at.is_some() || t.progress >= 100)
        .map(|t| Mutation::PromoteToReview { task_id: t.id.clone() })
        .collect()
}

fn gate(task: &Task, policy: &ReviewPolicy) -> Option<Mutation> {
    let unchecked = match checklist::evaluate(&task.prerequisites) {
        ChecklistState::Complete => return None,
        ChecklistState::Unchecked(labels) => labels,
        ChecklistState::Malformed | ChecklistState::Empty => {
            vec!["prerequisites field has no checklist items".to_string()]
        }
    };
    let task_id = task.id.clone();
    Some(if policy.human_only.any_human_only(&unchecked) {
        Mutation::InfoNeeded { task_id, unchecked }
    } else {
        Mutation::SoftReturn { task_id, unchecked }
    })
}

fn liveness_problem(agent: &Agent, now: DateTime<Utc>, policy: &ReviewPolicy) -> Option<String> {
    let Some(heartbeat) = agent.last_heartbeat else {
        return Some(format!("Reviewer {} has no heartbeat; returned to waiting review", agent.id));
    };
    let age = now.signed_duration_since(heartbeat);
    if age < -policy.clock_skew_tolerance {
        return Some(format!(
            "Reviewer {} heartbeat is {} minutes in the future (clock skew); returned to waiting review",
            agent.id,
            -age.num_minutes()
        ));
    }
    if age >= policy.reviewer_stale {
        return Some(format!(
            "Reviewer {} stale ({} minutes); returned to waiting review",
            agent.id,
            age.num_minutes()
        ));
    }
    None
}

/// Plan the review sweep. `external` holds oracle evidence for `review`
/// tasks that had none on the row.
pub fn plan(
    snapshot: &StoreSnapshot,
    now: DateTime<Utc>,
    policy: &ReviewPolicy,
    external: &HashMap<TaskId, Evidence>,
) -> Vec<ReviewAction> {
    let pool = reviewer_pool(snapshot, policy);
    let mut taken: HashSet<String> = HashSet::new();
    let mut actions = Vec::new();

    for task in &snapshot.tasks {
        if !matches!(task.status, TaskStatus::Review | TaskStatus::Reviewing) {
            continue;
        }
        if let Some(mutation) = gate(task, policy) {
            actions.push(ReviewAction::Apply(mutation));
            continue;
        }

        if task.status == TaskStatus::Review {
            let evidence = intrinsic_evidence(task).or_else(|| external.get(&task.id).cloned());
            if evidence.is_none() {
                let anchor = task.completed_at.or(task.review_at).unwrap_or(task.updated_at);
                let waited = now.signed_duration_since(anchor);
                if waited >= policy.grace {
                    actions.push(ReviewAction::Apply(Mutation::AutoReject {
                        task_id: task.id.clone(),
                        observed_updated_at: task.updated_at,
                    }));
                } else {
                    actions.push(ReviewAction::Waiting {
                        task_id: task.id.clone(),
                        reason: format!(
                            "no evidence yet; grace ends in {} minutes",
                            (policy.grace - waited).num_minutes()
                        ),
                    });
                }
                continue;
            }

            let bound = snapshot
                .bound_agents(&task.id)
                .find(|a| pool.iter().any(|p| p.id == a.id));
            match bound.or_else(|| pick_idle(&pool, &taken)) {
                Some(reviewer) => {
                    taken.insert(reviewer.id.clone());
                    actions.push(ReviewAction::Dispatch {
                        task: task.clone(),
                        reviewer: reviewer.id.clone(),
                        claim: Mutation::ClaimReview {
                            task_id: task.id.clone(),
                            reviewer: reviewer.id.clone(),
                        },
                    });
                }
                None => actions.push(ReviewAction::Waiting {
                    task_id: task.id.clone(),
                    reason: "no idle reviewer".into(),
                }),
            }
            continue;
        }

        // reviewing
        match snapshot.bound_agents(&task.id).next() {
            Some(reviewer) => {
                taken.insert(reviewer.id.clone());
                if let Some(reason) = liveness_problem(reviewer, now, policy) {
                    actions.push(ReviewAction::Apply(Mutation::ReturnToReview {
                        task_id: task.id.clone(),
                        reason,
                    }));
                }
            }
            None => match pick_idle(&pool, &taken) {
                Some(reviewer) => {
                    taken.insert(reviewer.id.clone());
                    actions.push(ReviewAction::Dispatch {
                        task: task.clone(),
                        reviewer: reviewer.id.clone(),
                        claim: Mutation::BindReviewer {
                            task_id: task.id.clone(),
                            reviewer: reviewer.id.clone(),
                        },
                    });
                }
                None => actions.push(ReviewAction::Apply(Mutation::ReturnToReview {
                    task_id: task.id.clone(),
                    reason: NO_REVIEWER_REASON.into(),
                })),
            },
        }
    }
    actions
}

// ---------------------------------------------------------------------------
// Sweep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReviewReport {
    pub promoted: usize,
    pub dispatched: Vec<(TaskId, String)>,
    pub launch_failures: usize,
    pub waiting: usize,
    pub mutations: ApplyTally,
}

pub struct ReviewSweep {
    lifecycle: Lifecycle,
    launcher: Arc<dyn WorkerLauncher>,
    oracle: Arc<dyn EvidenceOracle>,
    policy: ReviewPolicy,
    notifications: Option<NotificationDispatcher>,
}

impl ReviewSweep {
    pub fn new(
        lifecycle: Lifecycle,
        launcher: Arc<dyn WorkerLauncher>,
        oracle: Arc<dyn EvidenceOracle>,
        policy: ReviewPolicy,
    ) -> Self {
        Self {
            lifecycle,
            launcher,
            oracle,
            policy,
            notifications: None,
        }
    }

    pub fn with_notifications(mut self, dispatcher: NotificationDispatcher) -> Self {
        self.notifications = Some(dispatcher);
        self
    }

    fn notify(&self, event: NotificationEvent, task_id: &TaskId, message: String) {
        if let Some(dispatcher) = &self.notifications {
            dispatcher.enqueue(event, vec![task_id.to_string()], message);
        }
    }

    /// External evidence for `review` tasks that pass the gate but carry no
    /// evidence themselves.
    async fn collect_evidence(&self, snapshot: &StoreSnapshot) -> HashMap<TaskId, Evidence> {
        let mut found = HashMap::new();
        for task in snapshot.tasks_in(TaskStatus::Review) {
            if intrinsic_evidence(task).is_some() || gate(task, &self.policy).is_some() {
                continue;
            }
            if let Some(evidence) = self.oracle.external_evidence(&EvidenceProbe::for_task(task)).await {
                debug!(task_id = %task.id, ?evidence, "external evidence found");
                found.insert(task.id.clone(), evidence);
            }
        }
        found
    }

    async fn dispatch(&self, task: &Task, reviewer: &str, now: DateTime<Utc>, report: &mut ReviewReport) {
        let working_dir = task
            .working_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| PathBuf::from("."));
        let request = LaunchRequest {
            agent_id: reviewer.to_string(),
            task_id: task.id.clone(),
            working_dir,
            prompt: review_prompt(task, reviewer),
            log_path: review_log_path(&self.policy.log_dir, &task.id, reviewer, now),
            timeout_secs: self.policy.timeout_secs,
            label: format!("review-{}-{}", reviewer, task.id),
        };
        let outcome = self.launcher.launch(&request).await;
        if outcome.ok {
            info!(task_id = %task.id, reviewer, log = %outcome.detail, "reviewer dispatched");
            self.notify(
                NotificationEvent::Review,
                &task.id,
                format!("{} is reviewing {}: {}", reviewer, task.id, task.title),
            );
            report.dispatched.push((task.id.clone(), reviewer.to_string()));
            return;
        }

        warn!(task_id = %task.id, reviewer, detail = %outcome.detail, "reviewer launch failed");
        report.launch_failures += 1;
        let back = Mutation::ReturnToReview {
            task_id: task.id.clone(),
            reason: LAUNCH_FAILED_REASON.into(),
        };
        apply_planned(&self.lifecycle, back, now, &mut report.mutations).await;
    }

    async fn apply_and_notify(&self, mutation: Mutation, now: DateTime<Utc>, report: &mut ReviewReport) {
        let task_id = match &mutation {
            Mutation::AutoReject { task_id, .. }
            | Mutation::SoftReturn { task_id, .. }
            | Mutation::InfoNeeded { task_id, .. }
            | Mutation::ReturnToReview { task_id, .. } => Some(task_id.clone()),
            _ => None,
        };
        let label = mutation.label();
        let outcome = match self.lifecycle.apply(mutation, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(mutation = label, error = %e, "review mutation failed");
                report.mutations.failed += 1;
                return;
            }
        };
        let ApplyOutcome::Applied { task: Some(task) } = outcome else {
            report.mutations.skipped += 1;
            return;
        };
        report.mutations.applied += 1;
        let Some(task_id) = task_id else {
            return;
        };
        match task.status {
            TaskStatus::Blocked => self.notify(
                NotificationEvent::AutoStop,
                &task_id,
                task.blocked_reason.clone().unwrap_or_default(),
            ),
            TaskStatus::InfoNeeded => self.notify(
                NotificationEvent::Alert,
                &task_id,
                task.blocked_reason.clone().unwrap_or_default(),
            ),
            TaskStatus::Todo => self.notify(
                NotificationEvent::Review,
                &task_id,
                format!(
                    "{task_id} returned to todo: {}",
                    task.review_feedback.as_deref().unwrap_or_default()
                ),
            ),
            _ => {}
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReviewReport> {
        let store = self.lifecycle.store();
        let mut report = ReviewReport::default();

        let before = store.snapshot(now).await?;
        for mutation in plan_reconcile(&before) {
            if apply_planned(&self.lifecycle, mutation, now, &mut report.mutations).await {
                report.promoted += 1;
            }
        }

        let snapshot = store.snapshot(now).await?;
        let external = self.collect_evidence(&snapshot).await;
        for action in plan(&snapshot, now, &self.policy, &external) {
            match action {
                ReviewAction::Apply(mutation) => self.apply_and_notify(mutation, now, &mut report).await,
                ReviewAction::Dispatch { task, reviewer, claim } => {
                    if apply_planned(&self.lifecycle, claim, now, &mut report.mutations).await {
                        self.dispatch(&task, &reviewer, now, &mut report).await;
                    }
                }
                ReviewAction::Waiting { task_id, reason } => {
                    debug!(%task_id, %reason, "review waiting");
                    report.waiting += 1;
                }
            }
        }

        info!(
            promoted = report.promoted,
            dispatched = report.dispatched.len(),
            launch_failures = report.launch_failures,
            waiting = report.waiting,
            applied = report.mutations.applied,
            "review sweep completed"
        );
        Ok(report)
    }
}
