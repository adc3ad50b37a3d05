//! Command-line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "crossgate", version, about = "Multi-tenant gateway for AWS-style LLM event streams")]
pub struct Cli {
    /// Address to bind (overrides config)
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Database path (overrides config)
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Include internal error details in client responses
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway server (default)
    Serve,
    /// Register an upstream credential
    AddCredential {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        refresh_token: String,
        #[arg(long, default_value = "social")]
        auth_type: String,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        client_id: Option<String>,
        #[arg(long)]
        client_secret: Option<String>,
        #[arg(long, default_value = "private")]
        visibility: String,
        /// Credential can serve Pro+ models
        #[arg(long)]
        opus: bool,
    },
    /// Register an external API account
    AddAccount {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        api_base: String,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "openai")]
        format: String,
        #[arg(long, default_value = "")]
        provider: String,
        /// Comma-separated model whitelist
        #[arg(long, default_value = "")]
        models: String,
    },
    /// Register a client API key for a user
    AddKey {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        key: String,
    },
}

impl Cli {
    /// Apply CLI overrides on top of the loaded config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(database) = &self.database {
            config.database_path = database.clone();
        }
        if self.debug {
            config.debug_mode = true;
        }
    }
}

/// Execute an admin subcommand against the store. Returns true when a
/// subcommand ran (the process should exit instead of serving).
pub fn run_admin_command(command: &Command, store: &crate::store::Store, config: &Config) -> anyhow::Result<bool> {
    match command {
        Command::Serve => Ok(false),
        Command::AddCredential {
            user,
            refresh_token,
            auth_type,
            region,
            client_id,
            client_secret,
            visibility,
            opus,
        } => {
            let region = region.clone().unwrap_or_else(|| config.region.clone());
            let id = store.insert_credential(
                *user,
                refresh_token,
                auth_type,
                &region,
                client_id.as_deref(),
                client_secret.as_deref(),
                visibility,
                *opus,
            )?;
            println!("Added credential {} for user {} ({})", id, user, region);
            Ok(true)
        }
        Command::AddAccount {
            user,
            name,
            api_base,
            api_key,
            format,
            provider,
            models,
        } => {
            let id = store.insert_external_account(
                *user, name, api_base, api_key, format, provider, models,
            )?;
            println!("Added external account {} ({}) for user {}", id, name, user);
            Ok(true)
        }
        Command::AddKey { user, key } => {
            store.insert_api_key(*user, key)?;
            println!("Added API key for user {}", user);
            Ok(true)
        }
    }
}
