use fleet_core::types::AlertRecord;

use super::Context;

pub(crate) fn alert_line(alert: &AlertRecord) -> String {
    format!(
        "{:<18} {:<20} first {}  last alert {}",
        alert.kind.as_str(),
        alert.entity_id,
        alert.first_seen.format("%Y-%m-%d %H:%M"),
        alert.last_alert.format("%Y-%m-%d %H:%M"),
    )
}

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let alerts = ctx.store().open_alerts().await?;
    ctx.emit(&alerts, || {
        if alerts.is_empty() {
            return "no open alerts".to_string();
        }
        alerts.iter().map(alert_line).collect::<Vec<_>>().join("\n")
    })
}
