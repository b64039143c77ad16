use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::clock::from_unix_millis;

/// Top-level configuration (loaded from tlfmd.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlfmdConfig {
    pub server: ServerConfig,
    pub ops: OpsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// State snapshot for the local-disk store
    pub state_path: PathBuf,
    /// Lease length for folder locks (default: 60)
    pub lock_timeout_secs: u64,
    /// Upper bound on a single wait for a contended lock
    pub lock_retry_poll_ms: u64,
    /// Lock waits before GetRange/Lock give up (0 = only the request context bounds them)
    pub max_lock_wait_retries: u32,
    /// Refuse to mint classic folder IDs for unknown handles
    pub implicit_teams_enabled: bool,
}

impl ServerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_retry_poll(&self) -> Duration {
        Duration::from_millis(self.lock_retry_poll_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("~/.local/share/tlfmd/mdserver.json"),
            lock_timeout_secs: 60,
            lock_retry_poll_ms: 250,
            max_lock_wait_retries: 240,
            implicit_teams_enabled: false,
        }
    }
}

/// Verification and publication engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    /// Concurrent decrypt/verify workers and forward-walk batch size
    pub max_mds_at_a_time: usize,
    /// Largest tolerated gap between an event and a Merkle publication
    pub max_allowed_merkle_gap_secs: u64,
    /// Largest tolerated skew between local and server clocks
    pub max_server_clock_offset_secs: u64,
    /// Revocations before this instant skip the publication-gap check
    pub merkle_gap_enforcement_start_unix: i64,
    /// Block changes larger than this must be stored out-of-band
    pub max_embedded_changes_bytes: usize,
}

impl OpsConfig {
    pub fn max_allowed_merkle_gap(&self) -> Duration {
        Duration::from_secs(self.max_allowed_merkle_gap_secs)
    }

    pub fn max_server_clock_offset(&self) -> Duration {
        Duration::from_secs(self.max_server_clock_offset_secs)
    }

    pub fn merkle_gap_enforcement_start(&self) -> SystemTime {
        from_unix_millis(self.merkle_gap_enforcement_start_unix * 1000)
    }
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            max_mds_at_a_time: 10,
            // 8h15m
            max_allowed_merkle_gap_secs: 8 * 3600 + 15 * 60,
            max_server_clock_offset_secs: 3600,
            // 2018-06-14T16:21:30-07:00
            merkle_gap_enforcement_start_unix: 1_529_018_490,
            max_embedded_changes_bytes: 128 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
