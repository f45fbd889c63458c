//! Session policy: size limits, capacity, timeouts, retry bounds.

use std::time::Duration;

use serde::Deserialize;

/// Session manager configuration. Every field has a default, so a partial TOML table is enough.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Largest file a session may declare, in bytes (default 100 MiB).
    pub max_file_size: u64,
    /// Cap on live (non-terminal) sessions (default 256).
    pub max_sessions: usize,
    /// Random draws before code allocation gives up (default 20).
    pub code_attempts: u32,
    /// Time a pending session waits for a receiver (default 10 min).
    #[serde(rename = "join_timeout_secs", with = "secs")]
    pub join_timeout: Duration,
    /// Inactivity window before a session expires (default 60 s).
    #[serde(rename = "idle_timeout_secs", with = "secs")]
    pub idle_timeout: Duration,
    /// How long a terminal session stays queryable before its code is released (default 30 s).
    #[serde(rename = "grace_period_secs", with = "secs")]
    pub grace_period: Duration,
    /// Resend attempts after a transient transport error (default 3).
    pub max_send_retries: u32,
    /// First resend delay; doubles per attempt (default 100 ms).
    #[serde(rename = "retry_backoff_ms", with = "millis")]
    pub retry_backoff: Duration,
    /// Reaper scan period (default 1 s).
    #[serde(rename = "reaper_interval_ms", with = "millis")]
    pub reaper_interval: Duration,
    /// Chunks buffered per session in the in-process transport (default 8).
    pub lane_capacity: usize,
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

impl Default for Config {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_sessions: 256,
            code_attempts: 20,
            join_timeout: Duration::from_secs(10 * 60),
            idle_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            max_send_retries: 3,
            retry_backoff: Duration::from_millis(100),
            reaper_interval: Duration::from_secs(1),
            lane_capacity: 8,
        }
    }
}
