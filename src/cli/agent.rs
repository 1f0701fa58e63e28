use anyhow::Context;
use std::{path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::{agent::Agent, config::agent::Config, defaults};

#[derive(Debug, StructOpt)]
pub struct Cli {
    /// Path to the agent configuration file.
    #[structopt(long)]
    pub config: Option<PathBuf>,
    #[structopt(subcommand)]
    pub agent: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Spool and ship log records until interrupted.
    Run(Run),
}

#[derive(Debug, StructOpt)]
pub struct Run {}

pub async fn main_with_cli(cli: Cli) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => defaults::agent::config_path()?,
    };
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("Could not load configuration from {:?}", config_path))?;

    match cli.agent {
        Command::Run(_) => run(config).await,
    }
}

async fn run(config: Config) -> Result<(), anyhow::Error> {
    let agent = Arc::new(Agent::new(config));

    let (errors, mut error_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(error) = error_rx.recv().await {
            error!("{}", error);
        }
    });

    agent.start(&errors).await?;

    let supervisor = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.run(errors).await })
    };

    tokio::signal::ctrl_c().await?;
    agent.close().await;
    supervisor.await.ok();
    Ok(())
}
