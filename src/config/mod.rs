//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::services::account_pool::AccountPoolConfig;
use crate::services::orchestrator::OrchestratorConfig;

/// Acquisition engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for segment-transfer and local-client output
    pub downloads_path: PathBuf,

    /// How long a `TryDownload` record is presumed to belong to a live attempt
    pub try_download_grace: Duration,

    /// Local client stall window, measured from submission
    pub local_stall_timeout: Duration,

    /// Progress fraction under which a zero-speed local job counts as stalled
    pub local_stall_min_progress: f64,

    /// Poll cadence for local client jobs
    pub local_poll_interval: Duration,

    /// Category applied to local client jobs
    pub local_category: String,

    /// Poll cadence for segment-transfer jobs
    pub segment_poll_interval: Duration,

    /// Maximum time to wait for a relay task to finish
    pub relay_wait_timeout: Duration,

    /// Poll cadence for relay tasks
    pub relay_poll_interval: Duration,

    /// Free bytes required before a storage-exhausted account is released
    pub relay_min_free_bytes: u64,

    /// Cron expression for the account health recovery job
    pub account_recovery_cron: String,
}

impl Config {
    /// Load configuration from the process environment (and `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs = |key: &str, default: u64| -> Result<Duration> {
            Ok(Duration::from_secs(parse_or(&lookup, key, default)?))
        };

        let local_stall_min_progress: f64 = parse_or(&lookup, "LOCAL_STALL_MIN_PROGRESS", 0.5)?;
        if !(0.0..=1.0).contains(&local_stall_min_progress) {
            anyhow::bail!(
                "LOCAL_STALL_MIN_PROGRESS must be between 0 and 1, got {}",
                local_stall_min_progress
            );
        }

        Ok(Self {
            downloads_path: lookup("DOWNLOADS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/downloads")),

            try_download_grace: secs("TRY_DOWNLOAD_GRACE_SECS", 300)?,

            local_stall_timeout: secs("LOCAL_STALL_TIMEOUT_SECS", 3600)?,

            local_stall_min_progress,

            local_poll_interval: secs("LOCAL_POLL_INTERVAL_SECS", 10)?,

            local_category: lookup("LOCAL_CATEGORY").unwrap_or_else(|| "librarian".to_string()),

            segment_poll_interval: secs("SEGMENT_POLL_INTERVAL_SECS", 5)?,

            relay_wait_timeout: secs("RELAY_WAIT_TIMEOUT_SECS", 3600)?,

            relay_poll_interval: secs("RELAY_POLL_INTERVAL_SECS", 10)?,

            relay_min_free_bytes: parse_or(&lookup, "RELAY_MIN_FREE_BYTES", 500 * 1024 * 1024)?,

            account_recovery_cron: lookup("ACCOUNT_RECOVERY_CRON")
                .unwrap_or_else(|| "0 */10 * * * *".to_string()),
        })
    }

    /// Settings consumed by the download orchestrator
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            downloads_path: self.downloads_path.clone(),
            try_download_grace: self.try_download_grace,
            local_stall_timeout: self.local_stall_timeout,
            local_stall_min_progress: self.local_stall_min_progress,
            local_poll_interval: self.local_poll_interval,
            local_category: self.local_category.clone(),
            segment_poll_interval: self.segment_poll_interval,
            relay_wait_timeout: self.relay_wait_timeout,
        }
    }

    /// Settings consumed by the relay account pool
    pub fn account_pool(&self) -> AccountPoolConfig {
        AccountPoolConfig {
            poll_interval: self.relay_poll_interval,
            min_free_bytes: self.relay_min_free_bytes,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
