// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encryption and decryption façade over the session engine.
//!
//! A conversation is encrypted under one of two algorithms, selected when the conversation is
//! created and carried in every envelope:
//!
//! - [`AlgorithmId::GroupEncryption`]: a per-stream ratchet session, forward-secure within the
//!   session and rotated on membership change.
//! - [`AlgorithmId::HybridGroupEncryption`]: a long-lived symmetric key per stream and key epoch,
//!   cheaper for streams with many readers and no forward-secrecy requirement.
//!
//! Session keys travel to other devices sealed towards their announced keys, see
//! [`WrappedSessionKey`]. Fan-out is best-effort per device: one unreachable device never fails
//! the whole share, failures are reported back to the caller.
mod decrypt;
mod error;
mod group;
mod hybrid;
mod traits;


use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::Rng;
use crate::crypto::seal::{SealedBox, seal};
use crate::crypto::x25519::PublicKey;
use crate::device::DeviceRecord;
use crate::engine::EncryptionEngine;
use crate::store::SessionStore;

pub use decrypt::{DecryptedContent, GroupDecryption};
pub use error::{DecryptionError, EncryptionError};
pub use group::GroupEncryption;
pub use hybrid::{HybridGroupEncryption, HybridMessage};
pub use traits::{Decryptor, Encryptor, EntitlementCheck, StreamClient};

pub const GROUP_ENCRYPTION_ALGORITHM: &str = "estuary/group/v1";

pub const HYBRID_GROUP_ENCRYPTION_ALGORITHM: &str = "estuary/hybrid-group/v1";

/// Encryption algorithm of a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlgorithmId {
    GroupEncryption,
    HybridGroupEncryption,
}

impl fmt::Display for AlgorithmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            AlgorithmId::GroupEncryption => GROUP_ENCRYPTION_ALGORITHM,
            AlgorithmId::HybridGroupEncryption => HYBRID_GROUP_ENCRYPTION_ALGORITHM,
        };
        write!(f, "{value}")
    }
}

impl FromStr for AlgorithmId {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            GROUP_ENCRYPTION_ALGORITHM => Ok(AlgorithmId::GroupEncryption),
            HYBRID_GROUP_ENCRYPTION_ALGORITHM => Ok(AlgorithmId::HybridGroupEncryption),
            _ => Err(()),
        }
    }
}

/// Wire envelope of one encrypted message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub algorithm: String,
    /// Hex-encoded device key of the sender.
    pub sender_key: String,
    pub session_id: String,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Rejects envelopes with missing fields before any session lookup.
    pub fn validate(&self) -> Result<(), DecryptionError> {
        if self.sender_key.is_empty() {
            return Err(DecryptionError::MalformedCiphertext("missing sender key"));
        }
        if self.session_id.is_empty() {
            return Err(DecryptionError::MalformedCiphertext("missing session id"));
        }
        if self.ciphertext.is_empty() {
            return Err(DecryptionError::MalformedCiphertext("missing ciphertext"));
        }
        Ok(())
    }
}

/// Session key material sealed towards one receiving device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WrappedSessionKey {
    pub algorithm: String,
    pub stream_id: String,
    pub session_id: String,
    /// Hex-encoded device key of the sharing device.
    pub sender_key: String,
    pub sealed: SealedBox,
}

/// Session-rotation thresholds.
#[derive(Clone, Copy, Debug)]
pub struct EncryptionConfig {
    /// Rotate the outbound session after this many messages.
    pub rotation_period_msgs: u32,
    /// Rotate the outbound session after this age in milliseconds.
    pub rotation_period_ms: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            rotation_period_msgs: 100,
            rotation_period_ms: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

/// One device that could not be reached during fan-out.
#[derive(Debug)]
pub struct ShareFailure {
    pub user_id: String,
    pub device_key: String,
    pub reason: String,
}

/// Result of a session-key fan-out.
#[derive(Debug, Default)]
pub struct ShareOutcome {
    /// Device keys the session key was delivered to.
    pub shared_with: Vec<String>,
    pub failures: Vec<ShareFailure>,
    /// Set when the fan-out stopped early because the caller cancelled it. Keys delivered before
    /// the cancellation are still listed in `shared_with` and must be recorded as shared.
    pub cancelled: bool,
}

/// Resolves the devices in a stream that are eligible to receive session keys right now: not our
/// own device, not expired at `now_ms` and belonging to a user passing the entitlement check.
pub(crate) async fn eligible_devices<S, C, E>(
    engine: &EncryptionEngine<S>,
    client: &C,
    entitlement: &E,
    stream_id: &str,
    now_ms: u64,
) -> Result<Vec<DeviceRecord>, EncryptionError>
where
    S: SessionStore,
    C: StreamClient,
    E: EntitlementCheck,
{
    let devices = client
        .devices_in_stream(stream_id)
        .await
        .map_err(|err| EncryptionError::client(stream_id, err))?;
    let own_device_key = engine.device_key().to_hex();

    let mut eligible = Vec::with_capacity(devices.len());
    for device in devices {
        if device.device_key == own_device_key || device.is_expired(now_ms) {
            continue;
        }
        if !entitlement.may_participate(&device.user_id, stream_id).await {
            continue;
        }
        eligible.push(device);
    }

    Ok(eligible)
}

/// Delivers session key material to the given devices, skipping everything in `exclude`.
///
/// Per-device failures are collected, not propagated: one unreachable device never fails the
/// whole share. Cancellation is checked before each wrap and stops the loop, already-delivered
/// keys stay in the outcome so the caller can record them before surfacing the cancellation.
pub(crate) async fn fan_out_session_key<C>(
    client: &C,
    stream_id: &str,
    wrapped: impl Fn(&DeviceRecord, SealedBox) -> WrappedSessionKey,
    payload: &[u8],
    devices: &[DeviceRecord],
    exclude: &BTreeSet<String>,
    rng: &Rng,
    is_cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<ShareOutcome, EncryptionError>
where
    C: StreamClient,
{
    let mut outcome = ShareOutcome::default();
    for device in devices {
        if exclude.contains(&device.device_key) {
            continue;
        }
        if is_cancelled() {
            outcome.cancelled = true;
            break;
        }

        let recipient_key = match PublicKey::from_hex(device.wrap_key()) {
            Ok(key) => key,
            Err(_) => {
                outcome.failures.push(ShareFailure {
                    user_id: device.user_id.clone(),
                    device_key: device.device_key.clone(),
                    reason: "invalid recipient key".to_string(),
                });
                continue;
            }
        };

        let sealed = match seal(payload, &recipient_key, rng) {
            Ok(sealed) => sealed,
            Err(err) => {
                outcome.failures.push(ShareFailure {
                    user_id: device.user_id.clone(),
                    device_key: device.device_key.clone(),
                    reason: err.to_string(),
                });
                continue;
            }
        };

        match client
            .deliver_session_key(device, wrapped(device, sealed))
            .await
        {
            Ok(()) => outcome.shared_with.push(device.device_key.clone()),
            Err(err) => {
                warn!(
                    stream_id,
                    device_key = %device.device_key,
                    "session key delivery failed: {err}"
                );
                outcome.failures.push(ShareFailure {
                    user_id: device.user_id.clone(),
                    device_key: device.device_key.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(outcome)
}
