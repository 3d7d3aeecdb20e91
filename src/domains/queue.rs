use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};

pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_SIZE_MB: u64 = 1024;
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_LOCK_DURATION: Duration = Duration::from_secs(5 * 60);
pub const MAX_MESSAGE_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescription {
    pub name: String,
    pub requires_session: bool,
    #[serde(rename = "lock_duration_ms", with = "millis")]
    pub lock_duration: Duration,
    pub max_size_in_megabytes: u64,
    #[serde(rename = "default_message_time_to_live_ms", with = "millis")]
    pub default_message_time_to_live: Duration,
    #[serde(default)]
    pub message_count: u64,
}

impl QueueDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires_session: false,
            lock_duration: DEFAULT_LOCK_DURATION,
            max_size_in_megabytes: DEFAULT_MAX_SIZE_MB,
            default_message_time_to_live: DEFAULT_MESSAGE_TTL,
            message_count: 0,
        }
    }

    pub fn requiring_session(mut self) -> Self {
        self.requires_session = true;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_max_size_mb(mut self, max_size_in_megabytes: u64) -> Self {
        self.max_size_in_megabytes = max_size_in_megabytes;
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.default_message_time_to_live = ttl;
        self
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_in_megabytes.saturating_mul(1024 * 1024)
    }

    /// Positive durations within [`MAX_LOCK_DURATION`] and [`MAX_MESSAGE_TTL`], and a positive size.
    pub fn check_limits(&self) -> Result<()> {
        if self.lock_duration.is_zero() || self.lock_duration > MAX_LOCK_DURATION {
            return Err(ProbeError::Broker(format!(
                "queue '{}' lock duration {:?} must be positive and at most {MAX_LOCK_DURATION:?}",
                self.name, self.lock_duration
            )));
        }
        if self.default_message_time_to_live.is_zero()
            || self.default_message_time_to_live > MAX_MESSAGE_TTL
        {
            return Err(ProbeError::Broker(format!(
                "queue '{}' time to live {:?} must be positive and at most {MAX_MESSAGE_TTL:?}",
                self.name, self.default_message_time_to_live
            )));
        }
        if self.max_size_in_megabytes == 0 {
            return Err(ProbeError::Broker(format!(
                "queue '{}' needs a positive size",
                self.name
            )));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_travel_as_milliseconds() {
        let description = QueueDescription::new("q")
            .requiring_session()
            .with_lock_duration(Duration::from_millis(1500));
        let value = serde_json::to_value(&description).unwrap();
        assert_eq!(value["lock_duration_ms"], 1500);
        assert_eq!(value["requires_session"], true);

        let back: QueueDescription = serde_json::from_value(value).unwrap();
        assert_eq!(back, description);
    }

    #[test]
    fn max_size_is_reported_in_bytes() {
        let description = QueueDescription::new("q").with_max_size_mb(2);
        assert_eq!(description.max_size_bytes(), 2 * 1024 * 1024);
    }

    #[test]
    fn limits_reject_unrepresentable_durations() {
        let ok = QueueDescription::new("q").with_lock_duration(MAX_LOCK_DURATION);
        assert!(ok.check_limits().is_ok());

        for description in [
            QueueDescription::new("q").with_lock_duration(Duration::ZERO),
            QueueDescription::new("q").with_lock_duration(MAX_LOCK_DURATION + Duration::from_secs(1)),
            QueueDescription::new("q").with_lock_duration(Duration::from_millis(u64::MAX)),
            QueueDescription::new("q").with_time_to_live(Duration::from_millis(u64::MAX)),
            QueueDescription::new("q").with_max_size_mb(0),
        ] {
            assert!(matches!(description.check_limits(), Err(ProbeError::Broker(_))));
        }
    }
}
