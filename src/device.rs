// SPDX-License-Identifier: MIT OR Apache-2.0

//! Device identity records.
//!
//! Every user account owns one or more devices, each announcing an X25519 identity key (the
//! "device key") and optionally a fallback key used as an alternative wrap target for session-key
//! delivery. Records expire: announcements carry an absolute expiration timestamp and expired
//! devices are excluded from key distribution, while the records themselves are kept around for
//! attributing old messages.
use serde::{Deserialize, Serialize};

/// Default device lifetime from announcement, in milliseconds (30 days).
pub const DEFAULT_DEVICE_LIFETIME_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Announcement of one device belonging to a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub user_id: String,
    /// Hex-encoded X25519 public identity key of the device.
    pub device_key: String,
    /// Optional hex-encoded X25519 public fallback key, preferred for session-key wrapping when
    /// present.
    pub fallback_key: Option<String>,
    /// Absolute expiry in unix milliseconds.
    pub expiration_timestamp: u64,
}

impl DeviceRecord {
    pub fn new(
        user_id: impl Into<String>,
        device_key: impl Into<String>,
        fallback_key: Option<String>,
        expiration_timestamp: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_key: device_key.into(),
            fallback_key,
            expiration_timestamp,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_timestamp <= now_ms
    }

    /// Key to wrap session material towards: the fallback key when announced, the identity key
    /// otherwise.
    pub fn wrap_key(&self) -> &str {
        self.fallback_key.as_deref().unwrap_or(&self.device_key)
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceRecord;

    #[test]
    fn expiry() {
        let device = DeviceRecord::new("alice", "aa00", None, 1_000);
        assert!(!device.is_expired(999));
        assert!(device.is_expired(1_000));
        assert!(device.is_expired(1_001));
    }

    #[test]
    fn wrap_key_prefers_fallback() {
        let device = DeviceRecord::new("alice", "aa00", Some("bb11".to_string()), 1_000);
        assert_eq!(device.wrap_key(), "bb11");

        let device = DeviceRecord::new("alice", "aa00", None, 1_000);
        assert_eq!(device.wrap_key(), "aa00");
    }
}
