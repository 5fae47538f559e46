//! Engine configuration derived from environment variables.
//!
//! Configuration is loaded once at startup and validated before the
//! engine starts processing sessions.
//!
//! ## Environment Variables
//!
//! - `WITNESS_DB_PATH`: Path to the ReDB database file
//! - `WITNESS_BACKPRESSURE_SOFT_LIMIT`: Max unacknowledged chunks before a session's `accept_chunk` blocks
//! - `WITNESS_UPLOAD_MAX_ATTEMPTS`: Max retries per segment before it is marked failed
//! - `WITNESS_UPLOAD_BASE_BACKOFF_MS`: Base delay for upload retry backoff
//! - `WITNESS_UPLOAD_MAX_BACKOFF_MS`: Ceiling for upload retry backoff
//! - `WITNESS_LEDGER_SEGMENT_INTERVAL`: Segments between unconditional ledger updates
//! - `WITNESS_LEDGER_TIME_INTERVAL_SECS`: Seconds between time-triggered ledger updates
//! - `WITNESS_LEDGER_MAX_RETRIES`: Max retries for a single ledger update
//! - `RUST_LOG`: Log level filter

use std::env;
use std::path::PathBuf;
use std::time::Duration;

// Defaults
const DEFAULT_BACKPRESSURE_SOFT_LIMIT: usize = 32;
const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_UPLOAD_BASE_BACKOFF_MS: u64 = 1_000;
const DEFAULT_UPLOAD_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_LEDGER_SEGMENT_INTERVAL: u32 = 10;
const DEFAULT_LEDGER_TIME_INTERVAL_SECS: u64 = 30;
const DEFAULT_LEDGER_MAX_RETRIES: u32 = 3;

/// Helper to get trimmed env var or empty string.
fn env_trim(name: &str) -> String {
    env::var(name).unwrap_or_default().trim().to_string()
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    db_path: PathBuf,
    backpressure_soft_limit: usize,
    upload_max_attempts: u32,
    upload_base_backoff_ms: u64,
    upload_max_backoff_ms: u64,
    ledger_segment_interval: u32,
    ledger_time_interval_secs: u64,
    ledger_max_retries: u32,
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let db_path = env_trim("WITNESS_DB_PATH")
            .parse::<PathBuf>()
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("./.data/witness-core.redb"));

        let backpressure_soft_limit = env_trim("WITNESS_BACKPRESSURE_SOFT_LIMIT")
            .parse::<usize>()
            .unwrap_or(DEFAULT_BACKPRESSURE_SOFT_LIMIT);

        let upload_max_attempts = env_trim("WITNESS_UPLOAD_MAX_ATTEMPTS")
            .parse::<u32>()
            .unwrap_or(DEFAULT_UPLOAD_MAX_ATTEMPTS);

        let upload_base_backoff_ms = env_trim("WITNESS_UPLOAD_BASE_BACKOFF_MS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_UPLOAD_BASE_BACKOFF_MS);

        let upload_max_backoff_ms = env_trim("WITNESS_UPLOAD_MAX_BACKOFF_MS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_UPLOAD_MAX_BACKOFF_MS);

        let ledger_segment_interval = env_trim("WITNESS_LEDGER_SEGMENT_INTERVAL")
            .parse::<u32>()
            .unwrap_or(DEFAULT_LEDGER_SEGMENT_INTERVAL);

        let ledger_time_interval_secs = env_trim("WITNESS_LEDGER_TIME_INTERVAL_SECS")
            .parse::<u64>()
            .unwrap_or(DEFAULT_LEDGER_TIME_INTERVAL_SECS);

        let ledger_max_retries = env_trim("WITNESS_LEDGER_MAX_RETRIES")
            .parse::<u32>()
            .unwrap_or(DEFAULT_LEDGER_MAX_RETRIES);

        Self {
            db_path,
            backpressure_soft_limit,
            upload_max_attempts,
            upload_base_backoff_ms,
            upload_max_backoff_ms,
            ledger_segment_interval,
            ledger_time_interval_secs,
            ledger_max_retries,
        }
    }

    /// Configuration for tests: an isolated database path and tight
    /// timers so retry/backoff tests don't run slowly.
    pub fn for_tests(db_path: PathBuf) -> Self {
        Self {
            db_path,
            backpressure_soft_limit: DEFAULT_BACKPRESSURE_SOFT_LIMIT,
            upload_max_attempts: DEFAULT_UPLOAD_MAX_ATTEMPTS,
            upload_base_backoff_ms: 10,
            upload_max_backoff_ms: 100,
            ledger_segment_interval: DEFAULT_LEDGER_SEGMENT_INTERVAL,
            ledger_time_interval_secs: DEFAULT_LEDGER_TIME_INTERVAL_SECS,
            ledger_max_retries: DEFAULT_LEDGER_MAX_RETRIES,
        }
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.backpressure_soft_limit == 0 {
            return Err("WITNESS_BACKPRESSURE_SOFT_LIMIT must be greater than zero".to_string());
        }
        if self.upload_max_attempts == 0 {
            return Err("WITNESS_UPLOAD_MAX_ATTEMPTS must be greater than zero".to_string());
        }
        if self.upload_base_backoff_ms > self.upload_max_backoff_ms {
            return Err(
                "WITNESS_UPLOAD_BASE_BACKOFF_MS must not exceed WITNESS_UPLOAD_MAX_BACKOFF_MS"
                    .to_string(),
            );
        }
        if self.ledger_segment_interval == 0 {
            return Err("WITNESS_LEDGER_SEGMENT_INTERVAL must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn backpressure_soft_limit(&self) -> usize {
        self.backpressure_soft_limit
    }

    pub fn upload_max_attempts(&self) -> u32 {
        self.upload_max_attempts
    }

    pub fn upload_base_backoff(&self) -> Duration {
        Duration::from_millis(self.upload_base_backoff_ms)
    }

    pub fn upload_max_backoff(&self) -> Duration {
        Duration::from_millis(self.upload_max_backoff_ms)
    }

    pub fn ledger_segment_interval(&self) -> u32 {
        self.ledger_segment_interval
    }

    pub fn ledger_time_interval(&self) -> Duration {
        Duration::from_secs(self.ledger_time_interval_secs)
    }

    pub fn ledger_max_retries(&self) -> u32 {
        self.ledger_max_retries
    }

    /// Override the max upload attempts, e.g. to make a test exhaust
    /// retries quickly.
    pub fn with_upload_max_attempts(mut self, attempts: u32) -> Self {
        self.upload_max_attempts = attempts;
        self
    }
}
