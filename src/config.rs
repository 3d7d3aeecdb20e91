use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionString;
use crate::domains::queue::{MAX_LOCK_DURATION, MAX_MESSAGE_TTL};
use crate::error::{ProbeError, Result};
use crate::interfaces::broker::MAX_WAIT;

pub const DEFAULT_QUEUE: &str = "session_lock_failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStrategyKind {
    #[default]
    Fixed,
    RoundRobin,
    OnePerMessage,
}

/// Probe settings as read from a JSON file and overridden on the command line.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub connection_string: Option<String>,
    pub queue: String,
    pub message_count: u32,
    pub prefetch_count: u32,
    pub lock_duration_secs: u64,
    pub grace_secs: u64,
    pub receive_timeout_ms: u64,
    pub accept_timeout_ms: u64,
    pub max_size_mb: u64,
    pub ttl_secs: u64,
    pub session_strategy: SessionStrategyKind,
    pub sessions: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            connection_string: None,
            queue: DEFAULT_QUEUE.to_string(),
            message_count: 1,
            prefetch_count: 2,
            lock_duration_secs: 15,
            grace_secs: 30,
            receive_timeout_ms: 1_000,
            accept_timeout_ms: 5_000,
            max_size_mb: 1024,
            ttl_secs: 24 * 60 * 60,
            session_strategy: SessionStrategyKind::Fixed,
            sessions: 1,
        }
    }
}

impl ProbeSettings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ProbeError::Config(format!("{}: {e}", path.as_ref().display())))?;
        let settings: ProbeSettings =
            serde_json::from_str(&content).map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(settings)
    }

    /// Reject anything that would make the run meaningless, before touching the network.
    pub fn validate(&self) -> Result<ConnectionString> {
        let connection = self
            .connection_string
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProbeError::Config("a connection string is required".to_string()))?
            .parse::<ConnectionString>()?;

        validate_queue_name(&self.queue)?;
        for (name, value) in [
            ("message count", u64::from(self.message_count)),
            ("prefetch count", u64::from(self.prefetch_count)),
            ("lock duration", self.lock_duration_secs),
            ("receive timeout", self.receive_timeout_ms),
            ("accept timeout", self.accept_timeout_ms),
            ("max size", self.max_size_mb),
            ("time to live", self.ttl_secs),
            ("session count", u64::from(self.sessions)),
        ] {
            if value == 0 {
                return Err(ProbeError::Config(format!("{name} must be positive")));
            }
        }
        for (name, value, limit) in [
            ("lock duration", self.lock_duration(), MAX_LOCK_DURATION),
            ("time to live", self.time_to_live(), MAX_MESSAGE_TTL),
            ("accept timeout", self.accept_timeout(), MAX_WAIT),
            ("receive timeout", self.receive_timeout(), MAX_WAIT),
        ] {
            if value > limit {
                return Err(ProbeError::Config(format!(
                    "{name} of {value:?} exceeds the limit of {limit:?}"
                )));
            }
        }
        Ok(connection)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn time_to_live(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 260 {
        return Err(ProbeError::Config(format!(
            "queue name '{name}' must be between 1 and 260 characters"
        )));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid || name.starts_with(['.', '-', '_']) || name.ends_with(['.', '-', '_']) {
        return Err(ProbeError::Config(format!(
            "queue name '{name}' may only contain letters, digits, '.', '-' and '_' \
             and must start and end with a letter or digit"
        )));
    }
    Ok(())
}
