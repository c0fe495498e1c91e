//! One full pass over the fleet: health, assignment, spawn, review, then the
//! notification flush.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_agents::evidence::{EvidenceOracle, FsEvidenceOracle};
use fleet_agents::launcher::{ProcessLauncher, WorkerLauncher};
use fleet_core::config::{expand_home, Config};
use fleet_core::error::Result;
use fleet_core::lifecycle::{ApplyOutcome, Lifecycle, LifecyclePolicy, Mutation};
use fleet_core::store::FleetStore;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assign::{AssignReport, AutoAssigner};
use crate::health::{HealthReport, HealthSweep};
use crate::notify::{FlushReport, NotificationDispatcher};
use crate::review::{ReviewPolicy, ReviewReport, ReviewSweep};
use crate::spawn::{SpawnPolicy, SpawnReport, SpawnSweep};

/// What happened to the mutations a sweep planned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyTally {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Apply one planned mutation, counting the outcome. A failure is logged and
/// counted, never propagated, so one bad row does not stop the sweep.
pub(crate) async fn apply_planned(
    lifecycle: &Lifecycle,
    mutation: Mutation,
    now: DateTime<Utc>,
    tally: &mut ApplyTally,
) -> bool {
    let label = mutation.label();
    match lifecycle.apply(mutation, now).await {
        Ok(ApplyOutcome::Applied { .. }) => {
            tally.applied += 1;
            true
        }
        Ok(ApplyOutcome::Skipped { reason }) => {
            debug!(mutation = label, %reason, "planned mutation skipped");
            tally.skipped += 1;
            false
        }
        Err(e) => {
            warn!(mutation = label, error = %e, "planned mutation failed");
            tally.failed += 1;
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStage {
    Health,
    Assign,
    Spawn,
    Review,
    Cycle,
}

impl SweepStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepStage::Health => "health",
            SweepStage::Assign => "assign",
            SweepStage::Spawn => "spawn",
            SweepStage::Review => "review",
            SweepStage::Cycle => "cycle",
        }
    }
}

impl fmt::Display for SweepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweepStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "health" => Ok(SweepStage::Health),
            "assign" | "auto-assign" => Ok(SweepStage::Assign),
            "spawn" => Ok(SweepStage::Spawn),
            "review" => Ok(SweepStage::Review),
            "cycle" | "all" => Ok(SweepStage::Cycle),
            other => Err(format!("unknown sweep stage: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub health: Option<HealthReport>,
    pub assign: Option<AssignReport>,
    pub spawn: Option<SpawnReport>,
    pub review: Option<ReviewReport>,
    pub notifications: FlushReport,
}

impl CycleReport {
    /// Health severity drives the exit code; other stages never fail it.
    pub fn exit_code(&self) -> i32 {
        self.health.as_ref().map_or(0, HealthReport::exit_code)
    }
}

// ---------------------------------------------------------------------------
// SweepCycle
// ---------------------------------------------------------------------------

pub struct SweepCycle {
    health: HealthSweep,
    assign: AutoAssigner,
    spawn: SpawnSweep,
    review: ReviewSweep,
    dispatcher: NotificationDispatcher,
}

impl SweepCycle {
    pub fn new(
        lifecycle: Lifecycle,
        cfg: &Config,
        launcher: Arc<dyn WorkerLauncher>,
        oracle: Arc<dyn EvidenceOracle>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        let health = HealthSweep::new(lifecycle.clone(), cfg.health.policy()).with_notifications(dispatcher.clone());
        let assign = AutoAssigner::new(lifecycle.clone()).with_notifications(dispatcher.clone());
        let spawn = SpawnSweep::new(lifecycle.clone(), Arc::clone(&launcher), SpawnPolicy::from_config(cfg))
            .with_notifications(dispatcher.clone());
        let review = ReviewSweep::new(lifecycle, launcher, oracle, ReviewPolicy::from_config(cfg))
            .with_notifications(dispatcher.clone());
        Self {
            health,
            assign,
            spawn,
            review,
            dispatcher,
        }
    }

    /// Process launcher, filesystem evidence and the configured notifier.
    pub fn from_config(cfg: &Config, store: FleetStore) -> Self {
        let lifecycle = Lifecycle::new(store.clone(), LifecyclePolicy::from_config(cfg));
        let launcher: Arc<dyn WorkerLauncher> = Arc::new(ProcessLauncher::from_config(&cfg.launcher));
        let oracle: Arc<dyn EvidenceOracle> = Arc::new(FsEvidenceOracle::new(expand_home(&cfg.launcher.log_dir)));
        let dispatcher = NotificationDispatcher::from_config(store, &cfg.notifications);
        Self::new(lifecycle, cfg, launcher, oracle, dispatcher)
    }

    /// Run one stage (or the whole cycle) and flush notifications.
    pub async fn run_stage(&self, stage: SweepStage, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let all = stage == SweepStage::Cycle;
        if all || stage == SweepStage::Health {
            report.health = Some(self.health.run(now).await?);
        }
        if all || stage == SweepStage::Assign {
            report.assign = Some(self.assign.run(now).await?);
        }
        if all || stage == SweepStage::Spawn {
            report.spawn = Some(self.spawn.run(now).await?);
        }
        if all || stage == SweepStage::Review {
            report.review = Some(self.review.run(now).await?);
        }
        report.notifications = self.dispatcher.flush().await;
        info!(stage = %stage, exit_code = report.exit_code(), "sweep finished");
        Ok(report)
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        self.run_stage(SweepStage::Cycle, now).await
    }

    /// Wait out pending notification retries. One-shot callers run this
    /// before exiting so backed-off sends are not dropped.
    pub async fn settle(&self, report: &mut CycleReport) {
        report.notifications.absorb(self.dispatcher.flush_settled().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_round_trip() {
        for stage in [
            SweepStage::Health,
            SweepStage::Assign,
            SweepStage::Spawn,
            SweepStage::Review,
            SweepStage::Cycle,
        ] {
            assert_eq!(stage.as_str().parse::<SweepStage>(), Ok(stage));
        }
        assert_eq!("auto-assign".parse::<SweepStage>(), Ok(SweepStage::Assign));
        assert!("patrol".parse::<SweepStage>().is_err());
    }

    #[test]
    fn empty_report_exits_zero() {
        assert_eq!(CycleReport::default().exit_code(), 0);
    }
}
