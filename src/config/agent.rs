use {
    serde::{Deserialize, Serialize},
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
};

pub use super::DatabaseLocation;

use crate::defaults::agent as defaults;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub struct Config {
    /// `host:port` of the host server.
    pub endpoint: String,
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub machine: String,
    pub service: String,
    pub password: String,
    #[serde(with = "humantime_serde", default = "defaults::wait_duration")]
    pub wait_duration: Duration,
    #[serde(with = "humantime_serde", default = "defaults::heartbeat_duration")]
    pub heartbeat_duration: Duration,
    #[serde(default)]
    pub spool: Option<DatabaseLocation>,
}

impl Config {
    pub async fn load(config_path: impl AsRef<Path>) -> Result<Config, anyhow::Error> {
        let mut config: Config = toml::from_str(&tokio::fs::read_to_string(&config_path).await?)?;

        // Directory containing the configuration path
        let config_dir = config_path
            .as_ref()
            .parent()
            .expect("Agent configuration path must exist in some parent directory");

        // Adjust contained paths to be relative to the config path
        config.certificate = join_if_set(config_dir, config.certificate);
        config.private_key = join_if_set(config_dir, config.private_key);
        config.spool = config.spool.map(|spool| spool.relative_to(config_dir));

        Ok(config)
    }
}

fn join_if_set(config_dir: &Path, path: PathBuf) -> PathBuf {
    if path.as_os_str().is_empty() {
        path
    } else {
        config_dir.join(path)
    }
}
