//! Service configuration
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. TOML config file
//! 3. Environment variables (`KEYSTORE_*`, e.g. `KEYSTORE_REQUEST_TIMEOUT_SECS`)

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{KeyMaterialError, Result};

const ENV_PREFIX: &str = "KEYSTORE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Processing application id; also prefixes the changelog topic
    pub application_id: String,
    pub commands_topic: String,
    /// Partition count used when the service creates an in-memory log
    pub partitions: u32,
    /// Commands partitions aggregated by this node; all when unset
    pub owned_partitions: Option<Vec<u32>>,
    pub request_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub poll_batch_size: usize,
    pub retry_backoff_ms: u64,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            application_id: "subject-key-material".to_string(),
            commands_topic: "subject-key-commands".to_string(),
            partitions: 6,
            owned_partitions: None,
            request_timeout_secs: 60,
            startup_timeout_secs: 60,
            poll_batch_size: 256,
            retry_backoff_ms: 200,
        }
    }
}

impl KeyStoreConfig {
    /// Load defaults, then `path` if given (a missing file is skipped), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(KeyStoreConfig::default()));
        if let Some(path) = path {
            tracing::info!(path = %path.display(), "loading configuration file");
            figment = figment.merge(Toml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Extract and validate a configuration from an assembled figment
    pub fn extract(figment: Figment) -> Result<Self> {
        let config: KeyStoreConfig = figment.extract()?;
        config.validate()?;
        tracing::debug!(
            application_id = %config.application_id,
            commands_topic = %config.commands_topic,
            partitions = config.partitions,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.application_id.trim().is_empty() {
            return Err(KeyMaterialError::Config("application_id must not be blank".into()));
        }
        if self.commands_topic.trim().is_empty() {
            return Err(KeyMaterialError::Config("commands_topic must not be blank".into()));
        }
        if self.partitions == 0 {
            return Err(KeyMaterialError::Config("partitions must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 || self.startup_timeout_secs == 0 {
            return Err(KeyMaterialError::Config("timeouts must be at least 1 second".into()));
        }
        if self.poll_batch_size == 0 {
            return Err(KeyMaterialError::Config("poll_batch_size must be at least 1".into()));
        }
        if let Some(owned) = &self.owned_partitions {
            if let Some(p) = owned.iter().find(|p| **p >= self.partitions) {
                return Err(KeyMaterialError::Config(format!(
                    "owned partition {} out of range (partitions = {})",
                    p, self.partitions
                )));
            }
        }
        Ok(())
    }

    /// Topic carrying aggregate updates to every node's view
    pub fn changelog_topic(&self) -> String {
        format!("{}-aggregates-changelog", self.application_id)
    }

    /// Commands partitions this node aggregates, given the log's partition count
    pub fn assigned_partitions(&self, total: u32) -> Vec<u32> {
        match &self.owned_partitions {
            Some(owned) => {
                let mut owned: Vec<u32> = owned.iter().copied().filter(|p| *p < total).collect();
                owned.sort_unstable();
                owned.dedup();
                owned
            }
            None => (0..total).collect(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
