// ABOUTME: CLI commands for workspace analytics (cost, trends, errors)
// ABOUTME: Queries the aggregator as a given user and prints comfy tables

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use colored::*;
use std::time::Duration;

use sandkeep_cli::tables::{cost_table, errors_table, trends_table};
use sandkeep_cli::ControlPlane;
use sandkeep_runs::TimeRange;

#[derive(Args)]
pub struct Scope {
    /// Workspace to report on
    #[arg(long)]
    workspace: String,

    /// User the query runs as; must be a workspace member
    #[arg(long)]
    user: String,

    /// Size of the window, ending now
    #[arg(long, default_value = "7")]
    days: i64,
}

#[derive(Subcommand)]
pub enum AnalyticsCommands {
    /// Run counts, cost and token totals
    Cost(Scope),
    /// Per-bucket run counts and cost
    Trends {
        #[command(flatten)]
        scope: Scope,

        /// Bucket width in hours
        #[arg(long, default_value = "24")]
        bucket_hours: u64,
    },
    /// Failed runs grouped by error code
    Errors(Scope),
}

impl AnalyticsCommands {
    pub async fn execute(&self, plane: &ControlPlane) -> Result<()> {
        let analytics = plane.analytics();

        match self {
            AnalyticsCommands::Cost(scope) => {
                match analytics
                    .get_cost_analytics(&scope.user, &scope.workspace, range(scope)?)
                    .await?
                {
                    Some(summary) => println!("{}", cost_table(&summary)),
                    None => bail!(
                        "{} has no access to workspace {}",
                        scope.user,
                        scope.workspace
                    ),
                }
            }
            AnalyticsCommands::Trends {
                scope,
                bucket_hours,
            } => {
                let bucket = Duration::from_secs((*bucket_hours).max(1).saturating_mul(3600));
                let buckets = analytics
                    .get_execution_trends(&scope.user, &scope.workspace, range(scope)?, Some(bucket))
                    .await?;
                print_or_empty(buckets.is_empty(), || trends_table(&buckets).to_string());
            }
            AnalyticsCommands::Errors(scope) => {
                let groups = analytics
                    .get_error_analytics(&scope.user, &scope.workspace, range(scope)?)
                    .await?;
                print_or_empty(groups.is_empty(), || errors_table(&groups).to_string());
            }
        }

        Ok(())
    }
}

fn range(scope: &Scope) -> Result<TimeRange> {
    if scope.days <= 0 {
        bail!("--days must be positive");
    }
    Ok(TimeRange::last_days(scope.days))
}

fn print_or_empty(empty: bool, render: impl FnOnce() -> String) {
    if empty {
        println!("{}", "No runs in range (or no access)".yellow());
    } else {
        println!("{}", render());
    }
}
