//! Server configuration
//!
//! Loaded from TOML. Every field has a default, so an empty or missing
//! file yields a working local setup.

use std::path::{Path, PathBuf};

use chrono::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// File name looked up in the platform config directory
pub const CONFIG_FILE_NAME: &str = "server.toml";

/// Longest accepted session lifetime (ten years)
pub const MAX_SESSION_TTL_HOURS: i64 = 24 * 365 * 10;

/// Platform directories for Platewise
pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("dev", "platewise", "platewise").ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine data directory",
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TCP listener binds to
    pub listen_addr: String,
    /// SQLite file; defaults to the platform data directory
    pub database_path: Option<PathBuf>,
    /// Lifetime of a new session
    pub session_ttl_hours: i64,
    /// Interval of the expired-session sweep; 0 disables it
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7440".to_string(),
            database_path: None,
            session_ttl_hours: 24 * 30,
            sweep_interval_secs: 15 * 60,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path, which must exist
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from the platform config directory, or defaults if absent
    pub fn load_default() -> Result<Self> {
        let path = project_dirs()?.config_dir().join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.session_ttl()?;
        if self.listen_addr.trim().is_empty() {
            return Err(Error::Config("listen_addr must not be empty".into()));
        }
        Ok(())
    }

    /// Session lifetime, rejected unless within `1..=MAX_SESSION_TTL_HOURS`
    pub fn session_ttl(&self) -> Result<Duration> {
        if !(1..=MAX_SESSION_TTL_HOURS).contains(&self.session_ttl_hours) {
            return Err(Error::Config(format!(
                "session_ttl_hours must be between 1 and {MAX_SESSION_TTL_HOURS}"
            )));
        }
        Duration::try_hours(self.session_ttl_hours)
            .ok_or_else(|| Error::Config("session_ttl_hours out of range".into()))
    }

    /// Sweep interval, `None` when disabled
    pub fn sweep_interval(&self) -> Option<std::time::Duration> {
        (self.sweep_interval_secs > 0)
            .then(|| std::time::Duration::from_secs(self.sweep_interval_secs))
    }

    /// Resolved database path
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("platewise.db")),
        }
    }
}
