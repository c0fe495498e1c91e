mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleet_daemon::cycle::SweepStage;

use commands::agent::AgentCommand;
use commands::task::TaskCommand;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// fleet -- coordinate agent workers against the shared task board.
#[derive(Parser)]
#[command(name = "fleet", version, about)]
struct Cli {
    /// Config file (default: ~/.fleet/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Task counts, agent health and open alerts (default).
    Status,

    /// Create and move tasks.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Register agents, heartbeats and working memory.
    #[command(subcommand)]
    Agent(AgentCommand),

    /// Run one sweep stage now; exits 0/1/2 by health severity.
    Sweep {
        /// health, assign, spawn, review or cycle.
        #[arg(default_value = "cycle")]
        stage: SweepStage,
    },

    /// List open alerts.
    Alerts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let ctx = commands::Context::open(cli.config.as_deref(), cli.json).await?;

    let result = match cli.command {
        None | Some(Commands::Status) => commands::status::run(&ctx).await.map(|()| 0),
        Some(Commands::Task(cmd)) => commands::task::run(&ctx, cmd).await.map(|()| 0),
        Some(Commands::Agent(cmd)) => commands::agent::run(&ctx, cmd).await.map(|()| 0),
        Some(Commands::Sweep { stage }) => commands::sweep::run(&ctx, stage).await,
        Some(Commands::Alerts) => commands::alerts::run(&ctx).await.map(|()| 0),
    };
    // a gated or failed command may still have queued a notification
    ctx.finish().await;

    let code = result?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
