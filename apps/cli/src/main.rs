//! Keyward CLI - operator commands for the API key lifecycle manager

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use keyward_credential::config::LifecycleConfig;
use keyward_credential::secrets::{DEFAULT_SECRET_LENGTH, SecretManager};
use keyward_credential::{LifecycleManager, logging};

#[derive(Parser)]
#[command(name = "keyward")]
#[command(author, version, about = "API key lifecycle manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file, layered over defaults and under KEYWARD_* env vars
    #[arg(long, global = true, env = "KEYWARD_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a random secret suitable for API_KEYS_ENCRYPTION_KEY or JWT_SECRET
    GenerateSecret {
        /// Length in characters
        #[arg(short, long, default_value_t = DEFAULT_SECRET_LENGTH)]
        length: usize,
    },

    /// Check presence and strength of the required secrets
    Audit,

    /// Load every configured service and print the lifecycle report as JSON
    Report,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config =
        LifecycleConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init(&config.log)?;

    match cli.command {
        Commands::GenerateSecret { length } => cmd_generate_secret(length),
        Commands::Audit => cmd_audit(&config),
        Commands::Report => cmd_report(config).await,
    }
}

fn cmd_generate_secret(length: usize) -> anyhow::Result<()> {
    let secret = SecretManager::generate_strong_secret(length)?;
    secret.expose_secret(|s| println!("{s}"));
    Ok(())
}

fn cmd_audit(config: &LifecycleConfig) -> anyhow::Result<()> {
    let entries = SecretManager::from_env(config.secrets.clone()).audit();
    println!("{}", serde_json::to_string_pretty(&entries)?);

    let missing: Vec<&str> = entries
        .iter()
        .filter(|entry| !entry.present)
        .map(|entry| entry.name.as_str())
        .collect();
    if !missing.is_empty() {
        bail!("missing required secrets: {}", missing.join(", "));
    }
    for entry in entries.iter().filter(|e| e.strength.as_ref().is_some_and(|s| !s.valid)) {
        tracing::warn!(secret = %entry.name, "secret does not meet the strength policy");
    }
    Ok(())
}

async fn cmd_report(config: LifecycleConfig) -> anyhow::Result<()> {
    let manager = LifecycleManager::builder()
        .config(config)
        .spawn_background_tasks(false)
        .initialize()
        .await
        .context("failed to initialize lifecycle manager")?;

    let report = manager.generate_report().await;
    manager.stop().await?;

    println!("{}", serde_json::to_string_pretty(&report?)?);
    Ok(())
}
