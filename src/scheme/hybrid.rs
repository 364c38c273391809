// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hybrid group encryption: one long-lived symmetric key per stream and key epoch.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cbor::encode_cbor;
use crate::crypto::Rng;
use crate::crypto::aes_gcm;
use crate::engine::EncryptionEngine;
use crate::scheme::{
    AlgorithmId, EncryptedEnvelope, EncryptionError, Encryptor, EntitlementCheck, ShareOutcome,
    StreamClient, WrappedSessionKey, eligible_devices, fan_out_session_key,
};
use crate::store::{HybridSessionRecord, SessionStore};

/// Per-message payload of a hybrid envelope: the session key is reused, only the nonce is fresh.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HybridMessage {
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// [`Encryptor`] for [`AlgorithmId::HybridGroupEncryption`] conversations.
///
/// Rotation does not advance a ratchet, it installs a fresh key at a higher epoch. Readers keep
/// older epochs around, so backlog stays readable after rotation.
pub struct HybridGroupEncryption<S, C, E> {
    engine: Arc<EncryptionEngine<S>>,
    client: C,
    entitlement: E,
    stream_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S, C, E> HybridGroupEncryption<S, C, E>
where
    S: SessionStore,
    S::Error: Send + Sync + 'static,
    C: StreamClient,
    E: EntitlementCheck,
{
    pub fn new(engine: Arc<EncryptionEngine<S>>, client: C, entitlement: E) -> Self {
        Self {
            engine,
            client,
            entitlement,
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

    /// Creates a session at the given epoch and fans its key out to every eligible device.
    async fn create_and_share(
        &self,
        stream_id: &str,
        epoch: u64,
        now_ms: u64,
        rng: &Rng,
    ) -> Result<ShareOutcome, EncryptionError> {
        let record = self
            .engine
            .create_hybrid_group_session(stream_id, epoch, rng)
            .await
            .map_err(|err| EncryptionError::engine(stream_id, err))?;

        let devices = eligible_devices(
            &self.engine,
            &self.client,
            &self.entitlement,
            stream_id,
            now_ms,
        )
        .await?;

        let payload =
            encode_cbor(&record).map_err(|err| EncryptionError::engine(stream_id, err))?;
        let sender_key = self.engine.device_key().to_hex();

        fan_out_session_key(
            &self.client,
            stream_id,
            |_, sealed| WrappedSessionKey {
                algorithm: AlgorithmId::HybridGroupEncryption.to_string(),
                stream_id: stream_id.to_string(),
                session_id: record.session_id.clone(),
                sender_key: sender_key.clone(),
                sealed,
            },
            &payload,
            &devices,
            &BTreeSet::new(),
            rng,
            &|| false,
        )
        .await
    }

    async fn current_session(
        &self,
        stream_id: &str,
    ) -> Result<Option<HybridSessionRecord>, EncryptionError> {
        self.engine
            .hybrid_session_key(stream_id)
            .await
            .map_err(|err| EncryptionError::engine(stream_id, err))
    }
}

impl<S, C, E> Encryptor for HybridGroupEncryption<S, C, E>
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
        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        if self.current_session(stream_id).await?.is_some() {
            return Ok(ShareOutcome::default());
        }

        let epoch = self
            .client
            .current_epoch(stream_id)
            .await
            .map_err(|err| EncryptionError::client(stream_id, err))?;

        debug!(stream_id, epoch, "creating hybrid group session");
        self.create_and_share(stream_id, epoch, now_ms, rng).await
    }

    async fn encrypt(
        &self,
        stream_id: &str,
        plaintext: &[u8],
        now_ms: u64,
        rng: &Rng,
    ) -> Result<EncryptedEnvelope, EncryptionError> {
        self.ensure_outbound_session(stream_id, now_ms, rng).await?;

        let lock = self.stream_lock(stream_id);
        let _guard = lock.lock().await;

        let record = self
            .current_session(stream_id)
            .await?
            .ok_or_else(|| EncryptionError::engine(stream_id, MissingHybridSession))?;

        let sealed = aes_gcm::encrypt(plaintext, Some(&record.session_key), None, rng)
            .map_err(|err| EncryptionError::engine(stream_id, err))?;
        let message = HybridMessage {
            nonce: sealed.nonce.to_vec(),
            ciphertext: sealed.ciphertext,
        };
        let ciphertext =
            encode_cbor(&message).map_err(|err| EncryptionError::engine(stream_id, err))?;

        Ok(EncryptedEnvelope {
            algorithm: AlgorithmId::HybridGroupEncryption.to_string(),
            sender_key: self.engine.device_key().to_hex(),
            session_id: record.session_id,
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

        let stream_epoch = self
            .client
            .current_epoch(stream_id)
            .await
            .map_err(|err| EncryptionError::client(stream_id, err))?;
        // A rotation within the same stream epoch still gets a strictly higher session epoch, so
        // the new key wins the latest-session lookup.
        let epoch = match self.current_session(stream_id).await? {
            Some(record) => stream_epoch.max(record.epoch + 1),
            None => stream_epoch,
        };

        debug!(stream_id, epoch, "rotating hybrid group session");
        self.create_and_share(stream_id, epoch, now_ms, rng).await
    }
}

#[derive(Debug, thiserror::Error)]
#[error("hybrid session disappeared between ensure and encrypt")]
struct MissingHybridSession;
