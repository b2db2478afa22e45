//! User command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use conduit_client::ConduitClient;
use conduit_core::dto::project::CreateUser;

/// User subcommands
#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a user
    Create {
        username: String,

        /// Grant instance administration
        #[arg(long)]
        admin: bool,
    },
}

/// Handle user commands
pub async fn handle_user_command(command: UserCommands, client: &ConduitClient) -> Result<()> {
    match command {
        UserCommands::Create { username, admin } => {
            let user = client.create_user(&CreateUser { username, admin }).await?;
            println!("{}", "✓ User created".green().bold());
            println!("  ID:       {}", user.id.to_string().cyan());
            println!("  Username: {}", user.username.bold());
            println!(
                "{}",
                format!("  Use --user {} to act as this user.", user.username).dimmed()
            );
        }
    }

    Ok(())
}
