//! Configuration management for the runtime.

use harbor_engine::ElectionTimings;
use std::env;
use std::time::Duration;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Leader election timings
    pub election: ElectionTimings,
    /// Replication behaviour
    pub replication: ReplicationOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://harbor.db".to_string(),
            election: ElectionTimings::default(),
            replication: ReplicationOptions::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url =
            env::var("HARBOR_DATABASE_URL").unwrap_or_else(|_| defaults.database_url.clone());

        let election = ElectionTimings {
            heartbeat_interval: millis("HARBOR_HEARTBEAT_MS", defaults.election.heartbeat_interval)?,
            leader_timeout: millis("HARBOR_LEADER_TIMEOUT_MS", defaults.election.leader_timeout)?,
            settle: millis("HARBOR_ELECTION_SETTLE_MS", defaults.election.settle)?,
            jitter: millis("HARBOR_ELECTION_JITTER_MS", defaults.election.jitter)?,
        };

        let sync_interval = millis(
            "HARBOR_SYNC_INTERVAL_MS",
            defaults.replication.sync_interval.as_millis() as u64,
        )?;
        let repush_on_local_win = match env::var("HARBOR_REPUSH_ON_LOCAL_WIN") {
            Ok(value) => parse_bool(&value).ok_or(ConfigError::Invalid {
                key: "HARBOR_REPUSH_ON_LOCAL_WIN",
                value,
            })?,
            Err(_) => defaults.replication.repush_on_local_win,
        };

        Ok(Self {
            database_url,
            election,
            replication: ReplicationOptions {
                sync_interval: Duration::from_millis(sync_interval),
                repush_on_local_win,
                ..defaults.replication
            },
        })
    }
}

/// Replication engine options.
#[derive(Debug, Clone)]
pub struct ReplicationOptions {
    /// Period of the background pull + push loop
    pub sync_interval: Duration,
    /// Re-queue a local item whose newer state beat a pulled change
    pub repush_on_local_win: bool,
    /// Maximum number of queue entries sent in one push call
    pub push_batch_size: usize,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_millis(5_000),
            repush_on_local_win: false,
            push_batch_size: 50,
        }
    }
}

impl ReplicationOptions {
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_repush_on_local_win(mut self, enabled: bool) -> Self {
        self.repush_on_local_win = enabled;
        self
    }

    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }
}

fn millis(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
