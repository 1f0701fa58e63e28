use anyhow::Context;
use std::{path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::{
    certificate,
    config::host::Config,
    database::host::{LogRepository, ServiceRepository},
    defaults,
    host::Host,
};

#[derive(Debug, StructOpt)]
pub struct Cli {
    /// Path to the host configuration file.
    #[structopt(long)]
    pub config: Option<PathBuf>,
    #[structopt(subcommand)]
    pub host: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Listen for agents until interrupted.
    Run(Run),
    /// Create the server keypair at the configured paths if it is missing
    /// or expired.
    GenerateCertificate(GenerateCertificate),
}

#[derive(Debug, StructOpt)]
pub struct Run {}

#[derive(Debug, StructOpt)]
pub struct GenerateCertificate {}

pub async fn main_with_cli(cli: Cli) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => defaults::host::config_path()?,
    };
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("Could not load configuration from {:?}", config_path))?;

    match cli.host {
        Command::Run(_) => run(config).await,
        Command::GenerateCertificate(_) => generate_certificate(config).await,
    }
}

async fn generate_certificate(config: Config) -> Result<(), anyhow::Error> {
    let identity = certificate::ensure(
        &config.certificate,
        &config.private_key,
        defaults::host::certificate_validity(),
    )
    .await?;

    info!("Certificate:     {}", config.certificate.display());
    info!("Private Key:     {}", config.private_key.display());
    info!("Expires:         {}", identity.expires_at());
    Ok(())
}

async fn run(config: Config) -> Result<(), anyhow::Error> {
    let database = match &config.database {
        Some(location) => location.clone(),
        None => defaults::host::database_location()?,
    };
    let pool = database.connect().await?;
    ServiceRepository::migrate(&pool).await?;

    info!("Starting log server...");
    info!("Port:            {}", config.port);
    info!("Certificate:     {}", config.certificate.display());
    info!("Private Key:     {}", config.private_key.display());

    let host = Arc::new(Host::new(
        config,
        Arc::new(pool.clone()) as Arc<dyn ServiceRepository>,
        Arc::new(pool) as Arc<dyn LogRepository>,
    ));

    let (errors, mut error_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(error) = error_rx.recv().await {
            error!("{}", error);
        }
    });

    let (listener, acceptor) = host.listen().await?;
    host.serve(listener, acceptor, errors, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await;

    Ok(())
}
