//! Project command handlers
//!
//! Creating projects, adding members and issuing trigger tokens.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use conduit_client::ConduitClient;
use conduit_core::domain::project::NewProject;
use conduit_core::dto::project::{AddMember, CreateTrigger};

use crate::display::parse_enum;

/// Project subcommands
#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a project owned by the current user
    Create {
        /// Project path, e.g. "acme/web"
        path: String,

        #[arg(long, default_value = "private", value_parser = ["private", "internal", "public"])]
        visibility: String,

        /// Stored Lua pipeline definition
        #[arg(short, long)]
        file: Option<String>,

        /// Protected branch (repeatable)
        #[arg(long = "protect")]
        protected_branches: Vec<String>,

        /// Do not let instance runners pick this project's jobs
        #[arg(long)]
        no_shared_runners: bool,
    },
    /// Add a member to a project
    Member {
        /// Project ID
        project: i64,

        /// User ID
        user: i64,

        #[arg(long, default_value = "developer", value_parser = ["guest", "reporter", "developer", "maintainer", "owner"])]
        role: String,
    },
    /// Create a pipeline trigger token
    Trigger {
        /// Project ID
        project: i64,

        #[arg(short, long)]
        description: Option<String>,
    },
}

/// Handle project commands
pub async fn handle_project_command(command: ProjectCommands, client: &ConduitClient) -> Result<()> {
    match command {
        ProjectCommands::Create {
            path,
            visibility,
            file,
            protected_branches,
            no_shared_runners,
        } => {
            let ci_config = file
                .map(|file| {
                    std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read pipeline definition: {}", file))
                })
                .transpose()?;

            let req = NewProject {
                path,
                group_id: None,
                visibility: parse_enum(&visibility)?,
                shared_runners_enabled: !no_shared_runners,
                protected_branches,
                ci_config,
                keep_latest_artifact: true,
            };
            let created = client.create_project(&req).await?;

            println!("{}", "✓ Project created successfully!".green().bold());
            println!("  ID:            {}", created.project.id.to_string().cyan());
            println!("  Path:          {}", created.project.path.bold());
            println!("  Runners token: {}", created.runners_token.yellow());
        }
        ProjectCommands::Member {
            project,
            user,
            role,
        } => {
            let req = AddMember {
                user_id: user,
                role: parse_enum(&role)?,
            };
            client.add_member(project, &req).await?;
            println!(
                "{}",
                format!("✓ User {} is now {} of project {}", user, role, project)
                    .green()
                    .bold()
            );
        }
        ProjectCommands::Trigger {
            project,
            description,
        } => {
            let created = client
                .create_trigger(project, &CreateTrigger { description })
                .await?;
            println!("{}", "✓ Trigger created".green().bold());
            println!("  ID:    {}", created.trigger.id.to_string().cyan());
            println!("  Token: {}", created.token.yellow());
            println!("{}", "  The token is only shown once.".dimmed());
        }
    }

    Ok(())
}
