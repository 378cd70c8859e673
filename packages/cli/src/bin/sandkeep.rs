use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod cli;

use cli::analytics::AnalyticsCommands;
use cli::workspace::WorkspaceCommands;
use sandkeep_cli::tables::sweep_table;
use sandkeep_cli::{init_tracing, ControlPlane};
use sandkeep_config::ControlPlaneConfig;

#[derive(Parser)]
#[command(name = "sandkeep")]
#[command(about = "Sandkeep - control plane for agent sandbox runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    Migrate,
    /// Reclaim idle and stuck sandboxes periodically until interrupted
    Reaper,
    /// Run a single reaper sweep and print the report
    Sweep,
    /// Cost, trend and error analytics for a workspace
    #[command(subcommand)]
    Analytics(AnalyticsCommands),
    /// Manage workspaces and their members
    #[command(subcommand)]
    Workspace(WorkspaceCommands),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = ControlPlaneConfig::from_env()?;
    let plane = ControlPlane::connect(config).await?;

    match command {
        Commands::Migrate => {
            println!("{}", "Database schema is up to date".green());
        }
        Commands::Reaper => {
            let reaper = plane.reaper()?;
            let handle = reaper.start().await;

            println!(
                "{} every {}s (Ctrl-C to stop)",
                "Reaper running".green().bold(),
                plane.config.reaper_interval.as_secs()
            );

            tokio::signal::ctrl_c().await?;
            reaper.stop().await;
            if let Some(handle) = handle {
                handle.abort();
            }
            println!("{}", "Reaper stopped".yellow());
        }
        Commands::Sweep => {
            let report = plane.reaper()?.sweep().await?;
            println!("{}", sweep_table(&report));
        }
        Commands::Analytics(command) => command.execute(&plane).await?,
        Commands::Workspace(command) => command.execute(&plane).await?,
    }

    Ok(())
}
