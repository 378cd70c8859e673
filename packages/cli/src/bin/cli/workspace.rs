// ABOUTME: CLI commands for seeding workspaces and memberships
// ABOUTME: Adds tenants, grants roles and lists members

use anyhow::{anyhow, Result};
use clap::Subcommand;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};

use sandkeep_cli::ControlPlane;
use sandkeep_storage::WorkspaceRole;

#[derive(Subcommand)]
pub enum WorkspaceCommands {
    /// Create a workspace
    Add {
        /// Workspace id
        id: String,

        /// Display name
        #[arg(long)]
        name: Option<String>,
    },
    /// Give a user a role in a workspace (viewer, member, admin, owner)
    Grant {
        workspace: String,
        user: String,
        #[arg(long, default_value = "member")]
        role: String,
    },
    /// List the members of a workspace
    Members { workspace: String },
}

impl WorkspaceCommands {
    pub async fn execute(&self, plane: &ControlPlane) -> Result<()> {
        let workspaces = plane.workspaces();

        match self {
            WorkspaceCommands::Add { id, name } => {
                let workspace = workspaces
                    .create_workspace(id, name.as_deref().unwrap_or(id.as_str()))
                    .await?;
                println!(
                    "{} {} ({})",
                    "Created workspace".green(),
                    workspace.id.bold(),
                    workspace.name
                );
            }
            WorkspaceCommands::Grant {
                workspace,
                user,
                role,
            } => {
                let role = WorkspaceRole::from_str(role)
                    .map_err(|_| anyhow!("Unknown role '{}'", role))?;
                workspaces.get_workspace(workspace).await?;
                let member = workspaces.upsert_member(workspace, user, role).await?;
                println!(
                    "{} {} is now {} of {}",
                    "Granted:".green(),
                    member.user_id.bold(),
                    member.role.as_str(),
                    member.workspace_id
                );
            }
            WorkspaceCommands::Members { workspace } => {
                let members = workspaces.list_members(workspace).await?;
                if members.is_empty() {
                    println!("{}", "No members".yellow());
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .apply_modifier(UTF8_ROUND_CORNERS)
                    .set_content_arrangement(ContentArrangement::Dynamic);
                table.set_header(vec!["User", "Role", "Since"]);
                for member in &members {
                    table.add_row(vec![
                        member.user_id.clone(),
                        member.role.as_str().to_string(),
                        member.created_at.format("%Y-%m-%d").to_string(),
                    ]);
                }
                println!("{}", table);
            }
        }

        Ok(())
    }
}
