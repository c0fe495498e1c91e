use serde::Serialize;

use super::agent::agent_line;
use super::alerts::alert_line;
use super::Context;

#[derive(Serialize)]
struct StatusView {
    tasks: Vec<(String, u64)>,
    agents: Vec<fleet_core::types::Agent>,
    alerts: Vec<fleet_core::types::AlertRecord>,
}

/// Task counts per status, agents with derived health, open alerts.
pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let store = ctx.store();
    let now = ctx.now();
    let view = StatusView {
        tasks: store
            .status_counts()
            .await?
            .into_iter()
            .map(|(status, n)| (status.to_string(), n))
            .collect(),
        agents: store.list_agents().await?,
        alerts: store.open_alerts().await?,
    };

    ctx.emit(&view, || {
        let total: u64 = view.tasks.iter().map(|(_, n)| n).sum();
        let mut out = vec![format!("fleet status  (v{})", env!("CARGO_PKG_VERSION"))];
        out.push("-".repeat(40));
        out.push(format!("Tasks:          {total}"));
        for (status, n) in &view.tasks {
            out.push(format!("  {:<14}{n}", format!("{status}:")));
        }
        out.push(format!("Agents:         {}", view.agents.len()));
        for agent in &view.agents {
            out.push(format!("  {}", agent_line(agent, now)));
        }
        out.push(format!("Open alerts:    {}", view.alerts.len()));
        for alert in &view.alerts {
            out.push(format!("  {}", alert_line(alert)));
        }
        out.join("\n")
    })
}
