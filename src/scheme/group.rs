// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ratchet-based group encryption.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::crypto::Rng;
use crate::device::DeviceRecord;
use crate::engine::{EncryptionEngine, OutboundSessionInfo};
use crate::scheme::{
    AlgorithmId, EncryptedEnvelope, EncryptionConfig, EncryptionError, Encryptor, EntitlementCheck,
    ShareOutcome, StreamClient, WrappedSessionKey, eligible_devices, fan_out_session_key,
};
use crate::store::SessionStore;

/// [`Encryptor`] for [`AlgorithmId::GroupEncryption`] conversations.
///
/// Session setup, rotation and encryption for one stream are serialized through a per-stream
/// lock, streams never contend with each other. The outbound session is rotated when a device it
/// was shared with left the eligible set, or when the message-count or age threshold of the
/// [`EncryptionConfig`] is reached.
pub struct GroupEncryption<S, C, E> {
    engine: Arc<EncryptionEngine<S>>,
    client: C,
    entitlement: E,
    config: EncryptionConfig,
    stream_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S, C, E> GroupEncryption<S, C, E>
where
    S: SessionStore,
    S::Error: Send + Sync + 'static,
    C: StreamClient,
    E: EntitlementCheck,
{
    pub fn new(
        engine: Arc<EncryptionEngine<S>>,
        client: C,
        entitlement: E,
        config: EncryptionConfig,
    ) -> Self {
        Self {
            engine,
            client,
            entitlement,
            config,
            stream_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn stream_lock(&self, stream_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .stream_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn needs_rotation(
        &self,
        info: &OutboundSessionInfo,
        eligible: &BTreeSet<String>,
        now_ms: u64,
    ) -> bool {
        // A previously-shared device that dropped out of the eligible set must not receive
        // further messages.
        if info.shared_with.iter().any(|key| !eligible.contains(key)) {
            return true;
        }
        if info.generation >= self.config.rotation_period_msgs {
            return true;
        }
        now_ms.saturating_sub(info.created_at_ms) >= self.config.rotation_period_ms
    }

    /// Same as [`Encryptor::ensure_outbound_session`] but checks `is_cancelled` before each
    /// per-device wrap, aborting the remaining fan-out when it returns `true`. Keys already
    /// delivered are not rolled back and are recorded as shared before the cancellation is
    /// surfaced.
    pub async fn ensure_outbound_session_cancellable(
        &self,
        stream_id: &str,
        now_ms: u64,
        rng: &Rng,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<ShareOutcome, EncryptionError> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let devices = eligible_devices(
            &self.engine,
            &self.client,
            &self.entitlement,
            stream_id,
            now_ms,
        )
        .await?;
        let eligible_keys: BTreeSet<String> = devices
            .iter()
            .map(|device| device.device_key.clone())
            .collect();

        let info = self
            .engine
            .outbound_session_info(stream_id)
            .await
            .map_err(|err| EncryptionError::engine(stream_id, err))?;

        let exclude = match info {
            Some(info) if !self.needs_rotation(&info, &eligible_keys, now_ms) => info.shared_with,
            Some(info) => {
                debug!(
                    stream_id,
                    session_id = %info.session_id,
                    "rotating outbound group session"
                );
                self.engine
                    .create_outbound_group_session(stream_id, now_ms, rng)
                    .await
                    .map_err(|err| EncryptionError::engine(stream_id, err))?;
                BTreeSet::new()
            }
            None => {
                self.engine
                    .create_outbound_group_session(stream_id, now_ms, rng)
                    .await
                    .map_err(|err| EncryptionError::engine(stream_id, err))?;
                BTreeSet::new()
            }
        };

        self.share_session_key(stream_id, &devices, &exclude, rng, is_cancelled)
            .await
    }

    async fn share_session_key(
        &self,
        stream_id: &str,
        devices: &[DeviceRecord],
        exclude: &BTreeSet<String>,
        rng: &Rng,
        is_cancelled: &(dyn Fn() -> bool + Sync),
    ) -> Result<ShareOutcome, EncryptionError> {
        let session_key = self
            .engine
            .outbound_session_key(stream_id)
            .await
            .map_err(|err| EncryptionError::engine(stream_id, err))?;
        let payload = session_key
            .to_bytes()
            .map_err(|err| EncryptionError::engine(stream_id, err))?;

        let sender_key = self.engine.device_key().to_hex();
        let session_id = session_key.session_id().to_string();
        let outcome = fan_out_session_key(
            &self.client,
            stream_id,
            |_, sealed| WrappedSessionKey {
                algorithm: AlgorithmId::GroupEncryption.to_string(),
                stream_id: stream_id.to_string(),
                session_id: session_id.clone(),
                sender_key: sender_key.clone(),
                sealed,
            },
            &payload,
            devices,
            exclude,
            rng,
            is_cancelled,
        )
        .await?;

        // Record deliveries before surfacing a cancellation: keys handed out during an aborted
        // fan-out are out there and must not be re-sent on the next share.
        if !outcome.shared_with.is_empty() {
            self.engine
                .mark_shared_with(stream_id, outcome.shared_with.iter().cloned())
                .await
                .map_err(|err| EncryptionError::engine(stream_id, err))?;
        }
        if outcome.cancelled {
            return Err(EncryptionError::Cancelled);
        }

        Ok(outcome)
    }
}

impl<S, C, E> Encryptor for GroupEncryption<S, C, E>
where
    S: SessionStore,
    S::Error: Send + Sync + 'static,
    C: StreamClient,
    E: EntitlementCheck,
{
    async fn ensure_outbound_session(
        &self,
        stream_id: &str,
        now_ms: u64,
        rng: &Rng,
    ) -> Result<ShareOutcome, EncryptionError> {
        self.ensure_outbound_session_cancellable(stream_id, now_ms, rng, &|| false)
            .await
    }

    async fn encrypt(
        &self,
        stream_id: &str,
        plaintext: &[u8],
        now_ms: u64,
        rng: &Rng,
    ) -> Result<EncryptedEnvelope, EncryptionError> {
        let outcome = self.ensure_outbound_session(stream_id, now_ms, rng).await?;
        for failure in &outcome.failures {
            warn!(
                stream_id,
                device_key = %failure.device_key,
                "encrypting without device: {}",
                failure.reason
            );
        }

        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let (session_id, message) = self
            .engine
            .encrypt_group_message(stream_id, plaintext, rng)
            .await
            .map_err(|err| EncryptionError::engine(stream_id, err))?;
        let ciphertext = message
            .to_bytes()
            .map_err(|err| EncryptionError::engine(stream_id, err))?;

        Ok(EncryptedEnvelope {
            algorithm: AlgorithmId::GroupEncryption.to_string(),
            sender_key: self.engine.device_key().to_hex(),
            session_id,
            ciphertext,
        })
    }

    async fn rotate_session(
        &self,
        stream_id: &str,
        now_ms: u64,
        rng: &Rng,
    ) -> Result<ShareOutcome, EncryptionError> {
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let devices = eligible_devices(
            &self.engine,
            &self.client,
            &self.entitlement,
            stream_id,
            now_ms,
        )
        .await?;

        self.engine
            .create_outbound_group_session(stream_id, now_ms, rng)
            .await
            .map_err(|err| EncryptionError::engine(stream_id, err))?;

        self.share_session_key(stream_id, &devices, &BTreeSet::new(), rng, &|| false)
            .await
    }
}
