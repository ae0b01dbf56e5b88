//! Daemon settings
//!
//! An optional TOML file supplies everything the flags can; flags win.
//! Every section and field has a default, so an absent file and an empty
//! file mean the same thing.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::protocol::Dialect;
use crate::retry::RetryPolicy;
use crate::store::StoreOptions;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub storage: StorageSection,
    pub server: ServerSection,
    pub sync: SyncSection,
    pub retry: RetrySection,
    pub breaker: BreakerSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub root: PathBuf,
    pub chunk_size: u64,
    pub chunk_threshold: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        let defaults = StoreOptions::default();
        Self {
            root: PathBuf::from("filestorage"),
            chunk_size: defaults.chunk_size,
            chunk_threshold: defaults.chunk_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: String,
    pub dialect: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9041".to_string(),
            dialect: Dialect::Http.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub mirror: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub reset_after_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_after_ms: 30_000,
        }
    }
}

impl Settings {
    /// Reads the file when given, otherwise the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("read config {}", p.display()))?;
                toml::from_str(&raw).with_context(|| format!("parse config {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            chunk_size: self.storage.chunk_size,
            chunk_threshold: self.storage.chunk_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
        }
    }

    pub fn breaker_reset_after(&self) -> Duration {
        Duration::from_millis(self.breaker.reset_after_ms)
    }

    pub fn dialect(&self) -> Result<Dialect> {
        self.server.dialect.parse().map_err(anyhow::Error::msg)
    }
}
