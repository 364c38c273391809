// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session lifecycle engine.
//!
//! Owns the device account and drives all group-session state through a [`SessionStore`]:
//! creating and advancing outbound sessions, importing inbound session keys with the
//! reconciliation rules below, and managing hybrid sessions.
//!
//! Import reconciliation: an incoming session key never replaces a stored session that can
//! already decrypt at least as far back, and the trust of a stored session is only ever upgraded,
//! never downgraded. An upgrade requires the incoming trusted key material to re-derive to the
//! stored chain, a claimed session id alone proves nothing.
use std::collections::{BTreeSet, HashMap};
use std::error::Error as StdError;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::account::{Account, AccountError};
use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::crypto::aes_gcm::{self, AesGcmError, DERIVED_AES_GCM_ALGORITHM};
use crate::crypto::sha2::sha2_256;
use crate::crypto::x25519::PublicKey;
use crate::crypto::{Rng, RngError};
use crate::ratchet::{
    Generation, GroupSessionKey, InboundGroupSession, OutboundGroupSession, RatchetError,
    RatchetMessage,
};
use crate::store::{
    HybridSessionRecord, InboundSessionRecord, OutboundSessionRecord, SessionStore,
};

const HYBRID_SESSION_ID_TAG: &[u8] = b"estuary_hybrid_session_id";

pub const HYBRID_KEY_SIZE: usize = 32;

/// Outcome of importing an inbound session key.
#[derive(Debug, PartialEq, Eq)]
pub enum ImportOutcome {
    /// Session was stored, either as new or replacing one that decrypted less.
    Imported,
    /// An equal-or-better session already existed, nothing changed.
    KeptExisting,
    /// The stored session was kept, its trust flag cleared.
    TrustUpgraded,
}

/// Snapshot of the outbound session for rotation decisions.
#[derive(Clone, Debug)]
pub struct OutboundSessionInfo {
    pub session_id: String,
    /// Next message index.
    pub generation: Generation,
    pub created_at_ms: u64,
    pub shared_with: BTreeSet<String>,
}

/// Result of decrypting a group message.
#[derive(Debug)]
pub struct DecryptedGroupMessage {
    pub plaintext: Vec<u8>,
    pub keys_claimed: HashMap<String, String>,
    /// Set when the session the message was decrypted with arrived through a forwarded share.
    pub untrusted: bool,
}

/// Complete device state for migration to another device.
#[derive(Serialize, Deserialize)]
pub struct DeviceExport {
    #[serde(with = "serde_bytes")]
    account_pickle: Vec<u8>,
    inbound_sessions: Vec<InboundSessionRecord>,
    hybrid_sessions: Vec<HybridSessionRecord>,
}

pub struct EncryptionEngine<S> {
    store: S,
    pickle_passphrase: Vec<u8>,
    account: Account,
    device_key: PublicKey,
    fallback_key: PublicKey,
}

impl<S> EncryptionEngine<S>
where
    S: SessionStore,
{
    /// Loads the account from the store or creates and persists a fresh one.
    pub async fn init(
        store: S,
        pickle_passphrase: &[u8],
        now_ms: u64,
        rng: &Rng,
    ) -> Result<Self, EngineError<S::Error>> {
        let account = match store.account().await.map_err(EngineError::Store)? {
            Some(pickle) => Account::from_pickle(pickle_passphrase, &pickle)?,
            None => {
                let account = Account::new(now_ms, rng)?;
                store
                    .set_account(account.pickle(pickle_passphrase)?)
                    .await
                    .map_err(EngineError::Store)?;
                debug!("created new device account");
                account
            }
        };

        let device_key = account.device_key()?;
        let fallback_key = account.fallback_key()?;

        Ok(Self {
            store,
            pickle_passphrase: pickle_passphrase.to_vec(),
            account,
            device_key,
            fallback_key,
        })
    }

    /// Hex-encoded public identity key of this device.
    pub fn device_key(&self) -> &PublicKey {
        &self.device_key
    }

    pub fn fallback_key(&self) -> &PublicKey {
        &self.fallback_key
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn pickle<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EngineError<S::Error>> {
        let bytes = encode_cbor(value)?;
        Ok(aes_gcm::encrypt_derived(&self.pickle_passphrase, &bytes)?)
    }

    fn unpickle<T: for<'a> Deserialize<'a>>(
        &self,
        pickle: &[u8],
    ) -> Result<T, EngineError<S::Error>> {
        let bytes = aes_gcm::decrypt_derived(
            &self.pickle_passphrase,
            DERIVED_AES_GCM_ALGORITHM,
            pickle,
        )?;
        Ok(decode_cbor(&bytes[..])?)
    }

    /// Creates a new outbound session for a stream, replacing any previous one.
    ///
    /// An inbound counterpart is installed in the same call so the session is known at message
    /// index zero and our own envelopes decrypt locally.
    pub async fn create_outbound_group_session(
        &self,
        stream_id: &str,
        now_ms: u64,
        rng: &Rng,
    ) -> Result<String, EngineError<S::Error>> {
        let outbound = OutboundGroupSession::new(rng)?;
        let session_id = outbound.session_id().to_string();

        let inbound = InboundGroupSession::from_session_key(outbound.session_key());
        let keys_claimed =
            HashMap::from([("curve25519".to_string(), self.device_key.to_hex())]);

        self.store
            .set_inbound_session(InboundSessionRecord {
                stream_id: stream_id.to_string(),
                session_id: session_id.clone(),
                pickle: self.pickle(&inbound)?,
                keys_claimed,
                untrusted: false,
            })
            .await
            .map_err(EngineError::Store)?;
        self.store
            .set_outbound_session(OutboundSessionRecord {
                stream_id: stream_id.to_string(),
                session_id: session_id.clone(),
                pickle: self.pickle(&outbound)?,
                created_at_ms: now_ms,
                shared_with: BTreeSet::new(),
            })
            .await
            .map_err(EngineError::Store)?;

        debug!(stream_id, %session_id, "created outbound group session");

        Ok(session_id)
    }

    /// Returns a snapshot of the current outbound session, if one exists.
    pub async fn outbound_session_info(
        &self,
        stream_id: &str,
    ) -> Result<Option<OutboundSessionInfo>, EngineError<S::Error>> {
        let Some(record) = self
            .store
            .outbound_session(stream_id)
            .await
            .map_err(EngineError::Store)?
        else {
            return Ok(None);
        };
        let outbound: OutboundGroupSession = self.unpickle(&record.pickle)?;

        Ok(Some(OutboundSessionInfo {
            session_id: record.session_id,
            generation: outbound.generation(),
            created_at_ms: record.created_at_ms,
            shared_with: record.shared_with,
        }))
    }

    /// Exports the outbound session key at the current index, for sharing with other devices.
    pub async fn outbound_session_key(
        &self,
        stream_id: &str,
    ) -> Result<GroupSessionKey, EngineError<S::Error>> {
        let record = self
            .store
            .outbound_session(stream_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::NoOutboundSession(stream_id.to_string()))?;
        let outbound: OutboundGroupSession = self.unpickle(&record.pickle)?;
        Ok(outbound.session_key())
    }

    /// Records devices the current outbound session key was delivered to.
    pub async fn mark_shared_with(
        &self,
        stream_id: &str,
        device_keys: impl IntoIterator<Item = String>,
    ) -> Result<(), EngineError<S::Error>> {
        let mut record = self
            .store
            .outbound_session(stream_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::NoOutboundSession(stream_id.to_string()))?;
        record.shared_with.extend(device_keys);
        self.store
            .set_outbound_session(record)
            .await
            .map_err(EngineError::Store)
    }

    /// Encrypts a message with the stream's outbound session and persists the advanced chain.
    pub async fn encrypt_group_message(
        &self,
        stream_id: &str,
        plaintext: &[u8],
        rng: &Rng,
    ) -> Result<(String, RatchetMessage), EngineError<S::Error>> {
        let mut record = self
            .store
            .outbound_session(stream_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::NoOutboundSession(stream_id.to_string()))?;

        let mut outbound: OutboundGroupSession = self.unpickle(&record.pickle)?;
        let message = outbound.encrypt(plaintext, rng)?;
        record.pickle = self.pickle(&outbound)?;

        let session_id = record.session_id.clone();
        self.store
            .set_outbound_session(record)
            .await
            .map_err(EngineError::Store)?;

        Ok((session_id, message))
    }

    /// Decrypts a message with a known inbound session.
    pub async fn decrypt_group_message(
        &self,
        stream_id: &str,
        session_id: &str,
        message: &RatchetMessage,
    ) -> Result<DecryptedGroupMessage, EngineError<S::Error>> {
        let record = self
            .store
            .inbound_session(stream_id, session_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::UnknownInboundSession {
                stream_id: stream_id.to_string(),
                session_id: session_id.to_string(),
            })?;

        let inbound: InboundGroupSession = self.unpickle(&record.pickle)?;
        let plaintext = inbound.decrypt(message)?;

        Ok(DecryptedGroupMessage {
            plaintext,
            keys_claimed: record.keys_claimed,
            untrusted: record.untrusted,
        })
    }

    pub async fn has_inbound_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> Result<bool, EngineError<S::Error>> {
        Ok(self
            .store
            .inbound_session(stream_id, session_id)
            .await
            .map_err(EngineError::Store)?
            .is_some())
    }

    /// Imports an inbound session key received from another device.
    ///
    /// Idempotent: importing the same key twice is a no-op. See the module docs for the
    /// reconciliation rules applied when a session under this id already exists.
    pub async fn add_inbound_group_session(
        &self,
        stream_id: &str,
        session_id: &str,
        session_key: GroupSessionKey,
        keys_claimed: HashMap<String, String>,
        untrusted: bool,
    ) -> Result<ImportOutcome, EngineError<S::Error>> {
        if session_key.session_id() != session_id {
            return Err(EngineError::SessionIdMismatch {
                expected: session_id.to_string(),
                actual: session_key.session_id().to_string(),
            });
        }

        let existing = self
            .store
            .inbound_session(stream_id, session_id)
            .await
            .map_err(EngineError::Store)?;

        let Some(existing) = existing else {
            let inbound = InboundGroupSession::from_session_key(session_key);
            self.store
                .set_inbound_session(InboundSessionRecord {
                    stream_id: stream_id.to_string(),
                    session_id: session_id.to_string(),
                    pickle: self.pickle(&inbound)?,
                    keys_claimed,
                    untrusted,
                })
                .await
                .map_err(EngineError::Store)?;
            debug!(stream_id, session_id, untrusted, "imported group session");
            return Ok(ImportOutcome::Imported);
        };

        let existing_session: InboundGroupSession = self.unpickle(&existing.pickle)?;

        if existing_session.first_known_index() <= session_key.generation() {
            // The stored session decrypts at least as far back. Upgrade its trust when a trusted
            // import proves it holds the same chain.
            if existing.untrusted
                && !untrusted
                && existing_session.export().connects_to(&session_key)?
            {
                let mut upgraded = existing;
                upgraded.untrusted = false;
                self.store
                    .set_inbound_session(upgraded)
                    .await
                    .map_err(EngineError::Store)?;
                debug!(stream_id, session_id, "upgraded group session trust");
                return Ok(ImportOutcome::TrustUpgraded);
            }
            return Ok(ImportOutcome::KeptExisting);
        }

        // The incoming key decrypts strictly more. Carry trust over from the stored session when
        // the chains connect.
        let untrusted = untrusted
            && !(!existing.untrusted
                && existing_session.export().connects_to(&session_key)?);

        let inbound = InboundGroupSession::from_session_key(session_key);
        self.store
            .set_inbound_session(InboundSessionRecord {
                stream_id: stream_id.to_string(),
                session_id: session_id.to_string(),
                pickle: self.pickle(&inbound)?,
                keys_claimed,
                untrusted,
            })
            .await
            .map_err(EngineError::Store)?;
        debug!(
            stream_id,
            session_id, untrusted, "replaced group session with earlier export"
        );

        Ok(ImportOutcome::Imported)
    }

    /// Exports an inbound session at its first known index.
    pub async fn export_inbound_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> Result<GroupSessionKey, EngineError<S::Error>> {
        let record = self
            .store
            .inbound_session(stream_id, session_id)
            .await
            .map_err(EngineError::Store)?
            .ok_or_else(|| EngineError::UnknownInboundSession {
                stream_id: stream_id.to_string(),
                session_id: session_id.to_string(),
            })?;
        let inbound: InboundGroupSession = self.unpickle(&record.pickle)?;
        Ok(inbound.export())
    }

    /// Creates a hybrid session for a stream at the given key epoch.
    pub async fn create_hybrid_group_session(
        &self,
        stream_id: &str,
        epoch: u64,
        rng: &Rng,
    ) -> Result<HybridSessionRecord, EngineError<S::Error>> {
        let key: [u8; HYBRID_KEY_SIZE] = rng.random_array()?;
        let session_id = hybrid_session_id(stream_id, &key, epoch);

        let record = HybridSessionRecord {
            stream_id: stream_id.to_string(),
            session_id: session_id.clone(),
            session_key: key.to_vec(),
            epoch,
        };
        self.store
            .set_hybrid_session(record.clone())
            .await
            .map_err(EngineError::Store)?;

        debug!(stream_id, %session_id, epoch, "created hybrid group session");

        Ok(record)
    }

    /// Imports a hybrid session received from another device.
    ///
    /// The session id is recomputed from stream, key material and epoch, a record whose id does
    /// not match is rejected.
    pub async fn add_hybrid_group_session(
        &self,
        record: HybridSessionRecord,
    ) -> Result<(), EngineError<S::Error>> {
        let expected =
            hybrid_session_id(&record.stream_id, &record.session_key, record.epoch);
        if record.session_id != expected {
            return Err(EngineError::HybridSessionIdMismatch {
                expected,
                actual: record.session_id,
            });
        }

        self.store
            .set_hybrid_session(record)
            .await
            .map_err(EngineError::Store)
    }

    /// Returns the stream's hybrid session at the highest epoch.
    pub async fn hybrid_session_key(
        &self,
        stream_id: &str,
    ) -> Result<Option<HybridSessionRecord>, EngineError<S::Error>> {
        let sessions = self
            .store
            .hybrid_sessions_for_stream(stream_id)
            .await
            .map_err(EngineError::Store)?;
        Ok(sessions.into_iter().max_by_key(|record| record.epoch))
    }

    pub async fn hybrid_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> Result<Option<HybridSessionRecord>, EngineError<S::Error>> {
        self.store
            .hybrid_session(stream_id, session_id)
            .await
            .map_err(EngineError::Store)
    }

    /// Dumps the account and all receivable session state for migration to another device.
    pub async fn export_device(&self) -> Result<DeviceExport, EngineError<S::Error>> {
        Ok(DeviceExport {
            account_pickle: self.account.pickle(&self.pickle_passphrase)?,
            inbound_sessions: self
                .store
                .inbound_sessions()
                .await
                .map_err(EngineError::Store)?,
            hybrid_sessions: self
                .store
                .hybrid_sessions()
                .await
                .map_err(EngineError::Store)?,
        })
    }

    /// Restores an exported device into a (typically fresh) store.
    pub async fn import_device(
        store: S,
        export: DeviceExport,
        pickle_passphrase: &[u8],
        now_ms: u64,
        rng: &Rng,
    ) -> Result<Self, EngineError<S::Error>> {
        store
            .set_account(export.account_pickle)
            .await
            .map_err(EngineError::Store)?;
        for record in export.inbound_sessions {
            store
                .set_inbound_session(record)
                .await
                .map_err(EngineError::Store)?;
        }
        for record in export.hybrid_sessions {
            store
                .set_hybrid_session(record)
                .await
                .map_err(EngineError::Store)?;
        }

        Self::init(store, pickle_passphrase, now_ms, rng).await
    }
}

/// Hybrid session ids are the hash over stream, key material and epoch, making the id of an
/// imported record verifiable.
pub fn hybrid_session_id(stream_id: &str, key: &[u8], epoch: u64) -> String {
    hex::encode(sha2_256(&[
        HYBRID_SESSION_ID_TAG,
        stream_id.as_bytes(),
        key,
        &epoch.to_be_bytes(),
    ]))
}

#[derive(Debug, Error)]
pub enum EngineError<E: StdError> {
    #[error("store error: {0}")]
    Store(#[source] E),

    #[error("no outbound session for stream {0}")]
    NoOutboundSession(String),

    #[error("no inbound session {session_id} for stream {stream_id}")]
    UnknownInboundSession {
        stream_id: String,
        session_id: String,
    },

    #[error("imported session key carries id {actual}, expected {expected}")]
    SessionIdMismatch { expected: String, actual: String },

    #[error("hybrid session id {actual} does not match key material, expected {expected}")]
    HybridSessionIdMismatch { expected: String, actual: String },

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Ratchet(#[from] RatchetError),

    #[error(transparent)]
    AesGcm(#[from] AesGcmError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::crypto::Rng;
    use crate::store::MemoryCryptoStore;

    use super::{EncryptionEngine, EngineError, ImportOutcome, hybrid_session_id};

    async fn engine(seed: u8) -> EncryptionEngine<MemoryCryptoStore> {
        let rng = Rng::from_seed([seed; 32]);
        EncryptionEngine::init(MemoryCryptoStore::new(), b"pickle", 1_000, &rng)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn account_is_persisted_across_init() {
        let rng = Rng::from_seed([1; 32]);
        let store = MemoryCryptoStore::new();

        let first = EncryptionEngine::init(store.clone(), b"pickle", 1_000, &rng)
            .await
            .unwrap();
        let second = EncryptionEngine::init(store, b"pickle", 2_000, &rng)
            .await
            .unwrap();

        assert_eq!(first.device_key(), second.device_key());
        assert_eq!(first.fallback_key(), second.fallback_key());
    }

    #[tokio::test]
    async fn outbound_session_encrypts_and_decrypts_locally() {
        let rng = Rng::from_seed([2; 32]);
        let engine = engine(2).await;

        let session_id = engine
            .create_outbound_group_session("stream-1", 1_000, &rng)
            .await
            .unwrap();

        let (message_session_id, message) = engine
            .encrypt_group_message("stream-1", b"hello", &rng)
            .await
            .unwrap();
        assert_eq!(message_session_id, session_id);
        assert_eq!(message.generation, 0);

        // The inbound counterpart was installed at index zero.
        let decrypted = engine
            .decrypt_group_message("stream-1", &session_id, &message)
            .await
            .unwrap();
        assert_eq!(decrypted.plaintext, b"hello");
        assert!(!decrypted.untrusted);
    }

    #[tokio::test]
    async fn encrypting_without_session_fails() {
        let rng = Rng::from_seed([3; 32]);
        let engine = engine(3).await;

        assert!(matches!(
            engine
                .encrypt_group_message("stream-1", b"hello", &rng)
                .await,
            Err(EngineError::NoOutboundSession(_))
        ));
    }

    #[tokio::test]
    async fn share_and_import_between_devices() {
        let rng = Rng::from_seed([4; 32]);
        let alice = engine(4).await;
        let bob = engine(5).await;

        let session_id = alice
            .create_outbound_group_session("stream-1", 1_000, &rng)
            .await
            .unwrap();
        let session_key = alice.outbound_session_key("stream-1").await.unwrap();

        let outcome = bob
            .add_inbound_group_session(
                "stream-1",
                &session_id,
                session_key,
                HashMap::new(),
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ImportOutcome::Imported);

        let (_, message) = alice
            .encrypt_group_message("stream-1", b"hello bob", &rng)
            .await
            .unwrap();
        let decrypted = bob
            .decrypt_group_message("stream-1", &session_id, &message)
            .await
            .unwrap();
        assert_eq!(decrypted.plaintext, b"hello bob");
    }

    #[tokio::test]
    async fn import_is_idempotent() {
        let rng = Rng::from_seed([6; 32]);
        let alice = engine(6).await;
        let bob = engine(7).await;

        let session_id = alice
            .create_outbound_group_session("stream-1", 1_000, &rng)
            .await
            .unwrap();
        let session_key = alice.outbound_session_key("stream-1").await.unwrap();

        let first = bob
            .add_inbound_group_session(
                "stream-1",
                &session_id,
                session_key.clone(),
                HashMap::new(),
                false,
            )
            .await
            .unwrap();
        let second = bob
            .add_inbound_group_session(
                "stream-1",
                &session_id,
                session_key,
                HashMap::new(),
                false,
            )
            .await
            .unwrap();

        assert_eq!(first, ImportOutcome::Imported);
        assert_eq!(second, ImportOutcome::KeptExisting);
    }

    #[tokio::test]
    async fn import_rejects_mismatched_session_id() {
        let rng = Rng::from_seed([8; 32]);
        let alice = engine(8).await;
        let bob = engine(9).await;

        alice
            .create_outbound_group_session("stream-1", 1_000, &rng)
            .await
            .unwrap();
        let session_key = alice.outbound_session_key("stream-1").await.unwrap();

        assert!(matches!(
            bob.add_inbound_group_session(
                "stream-1",
                "some-other-session",
                session_key,
                HashMap::new(),
                false,
            )
            .await,
            Err(EngineError::SessionIdMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn earlier_export_replaces_later_one() {
        let rng = Rng::from_seed([10; 32]);
        let alice = engine(10).await;
        let bob = engine(11).await;

        let session_id = alice
            .create_outbound_group_session("stream-1", 1_000, &rng)
            .await
            .unwrap();
        let at_zero = alice.outbound_session_key("stream-1").await.unwrap();

        let (_, early_message) = alice
            .encrypt_group_message("stream-1", b"early", &rng)
            .await
            .unwrap();
        let at_one = alice.outbound_session_key("stream-1").await.unwrap();

        // Bob first learns the session mid-stream and cannot read the backlog.
        bob.add_inbound_group_session("stream-1", &session_id, at_one, HashMap::new(), false)
            .await
            .unwrap();
        assert!(
            bob.decrypt_group_message("stream-1", &session_id, &early_message)
                .await
                .is_err()
        );

        // A later share of the index-zero export restores the backlog.
        let outcome = bob
            .add_inbound_group_session("stream-1", &session_id, at_zero, HashMap::new(), false)
            .await
            .unwrap();
        assert_eq!(outcome, ImportOutcome::Imported);

        let decrypted = bob
            .decrypt_group_message("stream-1", &session_id, &early_message)
            .await
            .unwrap();
        assert_eq!(decrypted.plaintext, b"early");
    }

    #[tokio::test]
    async fn trusted_import_upgrades_untrusted_session() {
        let rng = Rng::from_seed([12; 32]);
        let alice = engine(12).await;
        let bob = engine(13).await;

        let session_id = alice
            .create_outbound_group_session("stream-1", 1_000, &rng)
            .await
            .unwrap();
        let session_key = alice.outbound_session_key("stream-1").await.unwrap();

        // First arrival through a forwarded share.
        bob.add_inbound_group_session(
            "stream-1",
            &session_id,
            session_key.clone(),
            HashMap::new(),
            true,
        )
        .await
        .unwrap();

        let (_, message) = alice
            .encrypt_group_message("stream-1", b"hello", &rng)
            .await
            .unwrap();
        let decrypted = bob
            .decrypt_group_message("stream-1", &session_id, &message)
            .await
            .unwrap();
        assert!(decrypted.untrusted);

        // Direct share of the same key material upgrades trust.
        let outcome = bob
            .add_inbound_group_session(
                "stream-1",
                &session_id,
                session_key,
                HashMap::new(),
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ImportOutcome::TrustUpgraded);

        let decrypted = bob
            .decrypt_group_message("stream-1", &session_id, &message)
            .await
            .unwrap();
        assert!(!decrypted.untrusted);
    }

    #[tokio::test]
    async fn untrusted_import_never_downgrades() {
        let rng = Rng::from_seed([14; 32]);
        let alice = engine(14).await;
        let bob = engine(15).await;

        let session_id = alice
            .create_outbound_group_session("stream-1", 1_000, &rng)
            .await
            .unwrap();
        let session_key = alice.outbound_session_key("stream-1").await.unwrap();

        bob.add_inbound_group_session(
            "stream-1",
            &session_id,
            session_key.clone(),
            HashMap::new(),
            false,
        )
        .await
        .unwrap();
        let outcome = bob
            .add_inbound_group_session(
                "stream-1",
                &session_id,
                session_key,
                HashMap::new(),
                true,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ImportOutcome::KeptExisting);

        let (_, message) = alice
            .encrypt_group_message("stream-1", b"hello", &rng)
            .await
            .unwrap();
        let decrypted = bob
            .decrypt_group_message("stream-1", &session_id, &message)
            .await
            .unwrap();
        assert!(!decrypted.untrusted);
    }

    #[tokio::test]
    async fn hybrid_session_lifecycle() {
        let rng = Rng::from_seed([16; 32]);
        let engine = engine(16).await;

        let first = engine
            .create_hybrid_group_session("stream-1", 1, &rng)
            .await
            .unwrap();
        let second = engine
            .create_hybrid_group_session("stream-1", 3, &rng)
            .await
            .unwrap();

        // Highest epoch wins.
        let latest = engine
            .hybrid_session_key("stream-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.session_id, second.session_id);

        assert_eq!(
            first.session_id,
            hybrid_session_id("stream-1", &first.session_key, first.epoch)
        );
    }

    #[tokio::test]
    async fn hybrid_import_validates_session_id() {
        let rng = Rng::from_seed([17; 32]);
        let alice = engine(17).await;
        let bob = engine(18).await;

        let mut record = alice
            .create_hybrid_group_session("stream-1", 1, &rng)
            .await
            .unwrap();

        bob.add_hybrid_group_session(record.clone()).await.unwrap();

        record.session_id = "forged".to_string();
        assert!(matches!(
            bob.add_hybrid_group_session(record).await,
            Err(EngineError::HybridSessionIdMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn device_export_round_trip() {
        let rng = Rng::from_seed([19; 32]);
        let alice = engine(19).await;
        let bob = engine(20).await;

        let session_id = alice
            .create_outbound_group_session("stream-1", 1_000, &rng)
            .await
            .unwrap();
        let session_key = alice.outbound_session_key("stream-1").await.unwrap();
        bob.add_inbound_group_session("stream-1", &session_id, session_key, HashMap::new(), false)
            .await
            .unwrap();

        let export = bob.export_device().await.unwrap();
        let migrated = EncryptionEngine::import_device(
            MemoryCryptoStore::new(),
            export,
            b"pickle",
            2_000,
            &rng,
        )
        .await
        .unwrap();

        assert_eq!(migrated.device_key(), bob.device_key());

        let (_, message) = alice
            .encrypt_group_message("stream-1", b"hello", &rng)
            .await
            .unwrap();
        let decrypted = migrated
            .decrypt_group_message("stream-1", &session_id, &message)
            .await
            .unwrap();
        assert_eq!(decrypted.plaintext, b"hello");
    }
}
