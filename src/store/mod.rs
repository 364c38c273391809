// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence interfaces and records for accounts, group sessions and device identities.
mod memory;
mod traits;

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

pub use memory::MemoryCryptoStore;
pub use traits::{DeviceStore, SessionStore};

/// Sender-side session state for one stream. At most one outbound session exists per stream,
/// rotation replaces the record wholesale.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundSessionRecord {
    pub stream_id: String,
    pub session_id: String,
    /// Encrypted serialization of the outbound ratchet.
    #[serde(with = "serde_bytes")]
    pub pickle: Vec<u8>,
    pub created_at_ms: u64,
    /// Device keys the session key has been delivered to, consulted for membership-change
    /// rotation.
    pub shared_with: BTreeSet<String>,
}

/// Receiver-side session state, keyed by stream and session id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundSessionRecord {
    pub stream_id: String,
    pub session_id: String,
    /// Encrypted serialization of the inbound ratchet.
    #[serde(with = "serde_bytes")]
    pub pickle: Vec<u8>,
    /// Sender key claims carried by the share this session arrived with. Claims are not verified
    /// by the store.
    pub keys_claimed: HashMap<String, String>,
    /// Set when the session arrived through a forwarded (not directly received) share.
    pub untrusted: bool,
}

/// Hybrid session state: a long-lived symmetric key bound to a stream and key epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HybridSessionRecord {
    pub stream_id: String,
    pub session_id: String,
    /// Serialized symmetric session key.
    #[serde(with = "serde_bytes")]
    pub session_key: Vec<u8>,
    pub epoch: u64,
}
