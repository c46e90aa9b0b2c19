//! Runtime configuration.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,

    /// The logical scheduler role this process contends for, e.g. `member-scheduler`.
    ///
    /// Exactly one process per role holds the timer registry and runs recovery at a time.
    pub role: String,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The tolerance in seconds for classifying an inbound event as real-time.
    ///
    /// Events within `[-gap_seconds, +gap_seconds]` of now fire immediately; older events are
    /// treated as anomalies; newer events are registered as future triggers.
    #[serde(default = "Config::default_gap_seconds")]
    pub gap_seconds: i64,
    /// The lower bound in minutes of the recovery scan window.
    ///
    /// Triggers expiring sooner than this are left to the real-time path of whichever event
    /// re-surfaces them, avoiding races with fires the previous leader may have committed.
    #[serde(default = "Config::default_short_lead_minutes")]
    pub short_lead_minutes: i64,
    /// The maximum scheduling horizon in days.
    ///
    /// Fire times further out than this are not scheduled as in-process timers, and are instead
    /// picked up by a later recovery pass.
    #[serde(default = "Config::default_max_horizon_days")]
    pub max_horizon_days: i64,

    /// The interval in seconds between leader election ticks.
    #[serde(default = "Config::default_election_interval_seconds")]
    pub election_interval_seconds: u64,
    /// The duration in seconds for which an acquired leadership lease remains valid.
    ///
    /// Must be greater than `election_interval_seconds`, else a healthy leader would be unable
    /// to renew its own lease before followers contest it.
    #[serde(default = "Config::default_lease_duration_seconds")]
    pub lease_duration_seconds: i64,

    /// The TTL in seconds for entries in the trigger store's ignore-deletes set.
    #[serde(default = "Config::default_ignore_delete_ttl_seconds")]
    pub ignore_delete_ttl_seconds: i64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(
            self.lease_duration_seconds > self.election_interval_seconds as i64,
            "lease_duration_seconds must be greater than election_interval_seconds"
        );
        ensure!(self.gap_seconds >= 0, "gap_seconds must not be negative");
        ensure!(self.max_horizon_days >= 1, "max_horizon_days must be at least 1");
        Ok(())
    }

    /// The recovery scan window lower bound as seconds.
    pub fn short_lead(&self) -> i64 {
        self.short_lead_minutes * 60
    }

    /// The maximum scheduling horizon as seconds.
    pub fn max_horizon(&self) -> i64 {
        self.max_horizon_days * 24 * 60 * 60
    }

    fn default_gap_seconds() -> i64 {
        30
    }

    fn default_short_lead_minutes() -> i64 {
        1
    }

    fn default_max_horizon_days() -> i64 {
        60
    }

    fn default_election_interval_seconds() -> u64 {
        60
    }

    fn default_lease_duration_seconds() -> i64 {
        180
    }

    fn default_ignore_delete_ttl_seconds() -> i64 {
        300
    }
}

#[cfg(test)]
impl Config {
    /// Create a new config instance for testing, backed by a scratch storage dir.
    pub fn new_test() -> Result<(std::sync::Arc<Config>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tmp dir for test config")?;
        let config = Config {
            rust_log: "".into(),
            role: "test-scheduler".into(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            gap_seconds: Config::default_gap_seconds(),
            short_lead_minutes: Config::default_short_lead_minutes(),
            max_horizon_days: Config::default_max_horizon_days(),
            election_interval_seconds: Config::default_election_interval_seconds(),
            lease_duration_seconds: Config::default_lease_duration_seconds(),
            ignore_delete_ttl_seconds: Config::default_ignore_delete_ttl_seconds(),
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
