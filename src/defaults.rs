use directories::ProjectDirs;
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    time::Duration,
};

use crate::database::DatabaseLocation;

fn project_dirs() -> Result<ProjectDirs, anyhow::Error> {
    ProjectDirs::from("", shared::ORGANIZATION, shared::APPLICATION)
        .ok_or_else(|| anyhow::anyhow!("Could not open user's home directory"))
}

pub(crate) mod shared {
    use super::*;

    pub const ORGANIZATION: &str = "Monstercat";

    pub const APPLICATION: &str = "fleetlog";

    pub const fn port() -> u16 {
        9090
    }

    pub const fn backoff_initial_delay() -> Duration {
        Duration::from_millis(5)
    }

    pub const fn backoff_maximum_delay() -> Duration {
        Duration::from_secs(1)
    }

    /// A connection that stays up at least this long counts as healthy and
    /// resets the reconnect backoff.
    pub const fn backoff_reset_after() -> Duration {
        Duration::from_secs(10)
    }

    pub const fn certificate_validity() -> Duration {
        // One year.
        Duration::from_secs(365 * 24 * 60 * 60)
    }
}

pub mod agent {
    use super::*;

    pub use super::shared::*;

    pub const CONFIG_FILE: &str = "Agent.toml";

    pub const SPOOL_FILE: &str = "spool.db";

    pub fn config_path() -> Result<PathBuf, anyhow::Error> {
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
    }

    /// How often the sender drains the spool.
    pub const fn wait_duration() -> Duration {
        Duration::from_secs(5)
    }

    pub const fn heartbeat_duration() -> Duration {
        Duration::from_secs(10)
    }

    pub fn spool_location() -> Result<DatabaseLocation, anyhow::Error> {
        Ok(DatabaseLocation::Sqlite(
            project_dirs()?.data_dir().join(SPOOL_FILE),
        ))
    }
}

pub mod host {
    use super::*;

    pub use super::shared::*;

    pub const CONFIG_FILE: &str = "Host.toml";

    pub const DATABASE_FILE: &str = "host.db";

    pub const fn address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub fn config_path() -> Result<PathBuf, anyhow::Error> {
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
    }

    pub fn database_location() -> Result<DatabaseLocation, anyhow::Error> {
        Ok(DatabaseLocation::Sqlite(
            project_dirs()?.data_dir().join(DATABASE_FILE),
        ))
    }

    /// No read deadline by default; the heartbeat interval is the liveness
    /// signal.
    pub const fn read_timeout() -> Option<Duration> {
        None
    }
}
