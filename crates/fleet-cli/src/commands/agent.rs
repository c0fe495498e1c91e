use clap::Subcommand;
use fleet_core::types::{Agent, TaskId};

use super::Context;

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Create an agent or update its name and role.
    Register {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "dev")]
        role: String,
    },
    Heartbeat { id: String },
    /// Replace the agent's working-memory record.
    Memory {
        id: String,
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value = "")]
        notes: String,
        #[arg(long, default_value = "")]
        blockers: String,
        #[arg(long, default_value = "")]
        next: String,
    },
    List,
}

pub(crate) fn agent_line(agent: &Agent, now: chrono::DateTime<chrono::Utc>) -> String {
    let heartbeat = match agent.heartbeat_age_minutes(now) {
        Some(minutes) => format!("{minutes}m ago"),
        None => "never".to_string(),
    };
    format!(
        "[{}] {:<16} {:<14} {:?}  task: {}  heartbeat: {}  done: {}",
        agent.health_status.glyph(),
        agent.id,
        agent.role,
        agent.status,
        agent.current_task_id.as_ref().map(TaskId::as_str).unwrap_or("-"),
        heartbeat,
        agent.total_tasks_completed
    )
}

pub async fn run(ctx: &Context, cmd: AgentCommand) -> anyhow::Result<()> {
    let lc = &ctx.lifecycle;
    let now = ctx.now();
    match cmd {
        AgentCommand::Register { id, name, role } => {
            let name = name.unwrap_or_else(|| id.clone());
            let agent = lc.register_agent(&id, &name, &role, now).await?;
            ctx.emit(&agent, || format!("registered: {}", agent_line(&agent, now)))
        }
        AgentCommand::Heartbeat { id } => {
            let agent = lc.heartbeat(&id, now).await?;
            ctx.emit(&agent, || format!("heartbeat: {} at {}", agent.id, now.format("%H:%M:%S")))
        }
        AgentCommand::Memory {
            id,
            task,
            notes,
            blockers,
            next,
        } => {
            let task = task.as_deref().map(TaskId::from);
            let memory = lc
                .update_working_memory(&id, task.as_ref(), &notes, &blockers, &next, now)
                .await?;
            ctx.emit(&memory, || format!("working memory updated for {}", memory.agent_id))
        }
        AgentCommand::List => {
            let agents = ctx.store().list_agents().await?;
            ctx.emit(&agents, || {
                if agents.is_empty() {
                    return "no agents".to_string();
                }
                agents.iter().map(|a| agent_line(a, now)).collect::<Vec<_>>().join("\n")
            })
        }
    }
}
