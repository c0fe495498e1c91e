use fleet_daemon::cycle::{SweepCycle, SweepStage};

use super::Context;

/// Run `stage` against the store and return the health exit code.
pub async fn run(ctx: &Context, stage: SweepStage) -> anyhow::Result<i32> {
    let cycle = SweepCycle::from_config(&ctx.config, ctx.store().clone());
    let mut report = cycle.run_stage(stage, ctx.now()).await?;
    cycle.settle(&mut report).await;

    ctx.emit(&report, || {
        let mut lines = vec![format!("sweep {stage}")];
        if let Some(health) = &report.health {
            lines.push(format!(
                "health: {} agents, {} tasks, {} mutations, {} alerts sent ({} suppressed)",
                health.agents_checked,
                health.tasks_checked,
                health.mutations.applied,
                health.alerts_sent,
                health.alerts_suppressed
            ));
            for issue in &health.issues {
                lines.push(format!("  {:?}: {}", issue.severity, issue.message));
            }
        }
        if let Some(assign) = &report.assign {
            lines.push(format!("assign: {} assigned", assign.assigned.len()));
            for (task, agent) in &assign.assigned {
                lines.push(format!("  {task} -> {agent}"));
            }
        }
        if let Some(spawn) = &report.spawn {
            lines.push(format!(
                "spawn: {} launched, {} failed, {} skipped",
                spawn.launched.len(),
                spawn.failed.len(),
                spawn.skipped.len()
            ));
        }
        if let Some(review) = &report.review {
            lines.push(format!(
                "review: {} promoted, {} dispatched, {} waiting, {} launch failures",
                review.promoted,
                review.dispatched.len(),
                review.waiting,
                review.launch_failures
            ));
            for (task, reviewer) in &review.dispatched {
                lines.push(format!("  {task} -> {reviewer}"));
            }
        }
        lines.push(format!(
            "notifications: {} sent, {} failed",
            report.notifications.sent, report.notifications.failed
        ));
        lines.join("\n")
    })?;
    Ok(report.exit_code())
}
