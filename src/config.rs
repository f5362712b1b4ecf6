use crate::filters::FilterRule;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_ENV: &str = "MAILHOLD_CONFIG";
const MAIL_ROOT_ENV: &str = "MAILHOLD_MAIL_ROOT";
const DATABASE_ENV: &str = "MAILHOLD_DATABASE";
const DEFAULT_CONFIG_FILE: &str = "mailhold.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Mailbox account as configured on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub address: String,
    pub username: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    pub server: String,
    #[serde(default = "default_pop3s_port")]
    pub pop3s_port: u16,
    #[serde(default = "default_pop3_port")]
    pub pop3_port: u16,
    /// Delete persisted messages from the server when the session closes.
    #[serde(default)]
    pub auto_remove: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub mail_root: PathBuf,
    pub database_path: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_fallback_timeout")]
    pub fallback_timeout_secs: u64,
    #[serde(default = "default_lease_wait")]
    pub lease_wait_millis: u64,
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::new)
}

fn default_pop3s_port() -> u16 {
    995
}

fn default_pop3_port() -> u16 {
    110
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_fallback_timeout() -> u64 {
    3
}

fn default_lease_wait() -> u64 {
    1000
}

fn default_lease_ttl() -> u64 {
    900
}

fn default_poll_interval() -> u64 {
    300
}

fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

impl Settings {
    /// Resolution order: explicit path, `MAILHOLD_CONFIG`, then `./mailhold.json`.
    /// Path overrides from the environment win over the file.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = config_path(explicit);
        let data = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut settings = Self::from_json(&data)?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(data)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var(MAIL_ROOT_ENV) {
            if !root.trim().is_empty() {
                self.mail_root = PathBuf::from(root);
            }
        }
        if let Ok(db) = std::env::var(DATABASE_ENV) {
            if !db.trim().is_empty() {
                self.database_path = PathBuf::from(db);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.address.trim().is_empty() {
                return Err(ConfigError::Invalid("account with empty address".into()));
            }
            if account.server.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "account {} has no server",
                    account.address
                )));
            }
            if !seen.insert(account.address.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account {}",
                    account.address
                )));
            }
        }
        for rule in &self.filters {
            if rule.tag.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "filter {} has no tag",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    pub fn account(&self, address: &str) -> Option<&AccountConfig> {
        self.accounts
            .iter()
            .find(|account| account.address.eq_ignore_ascii_case(address))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_millis)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
