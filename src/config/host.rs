use {
    serde::{Deserialize, Serialize},
    std::{
        net::IpAddr,
        path::{Path, PathBuf},
        time::Duration,
    },
};

pub use super::DatabaseLocation;

use crate::defaults::host as defaults;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Config {
    #[serde(default = "defaults::address")]
    pub address: IpAddr,
    #[serde(default = "defaults::port")]
    pub port: u16,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    /// Shared secret agents must present when registering.
    pub password: String,
    #[serde(default)]
    pub database: Option<DatabaseLocation>,
    /// Deadline for reading the next message from a connection; unset means
    /// connections may idle indefinitely.
    #[serde(with = "humantime_serde", default = "defaults::read_timeout")]
    pub read_timeout: Option<Duration>,
}

impl Config {
    pub async fn load(config_path: impl AsRef<Path>) -> Result<Config, anyhow::Error> {
        let mut config: Config = toml::from_str(&tokio::fs::read_to_string(&config_path).await?)?;

        // Directory containing the configuration path
        let config_dir = config_path
            .as_ref()
            .parent()
            .expect("Host configuration path must exist in some parent directory");

        // Adjust contained paths to be relative to the config path
        config.certificate = config_dir.join(config.certificate);
        config.private_key = config_dir.join(config.private_key);
        config.database = config.database.map(|database| database.relative_to(config_dir));

        Ok(config)
    }
}
