// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decryption across both conversation algorithms.
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::cbor::decode_cbor;
use crate::crypto::aes_gcm;
use crate::engine::{EncryptionEngine, EngineError};
use crate::ratchet::{GroupSessionKey, RatchetMessage};
use crate::scheme::hybrid::HybridMessage;
use crate::scheme::{
    AlgorithmId, DecryptionError, Decryptor, EncryptedEnvelope, WrappedSessionKey,
};
use crate::store::{HybridSessionRecord, SessionStore};

/// Result of decrypting an envelope.
#[derive(Debug)]
pub struct DecryptedContent {
    pub plaintext: Vec<u8>,
    /// `false` when the session the message decrypted with arrived through a forwarded share.
    pub trusted: bool,
    /// Unverified sender key claims attached to the session.
    pub keys_claimed: HashMap<String, String>,
}

/// [`Decryptor`] over the session engine, dispatching on the envelope's algorithm.
///
/// A decryption failure is always reported as a typed [`DecryptionError`] and never panics
/// across this boundary, a single undecryptable event must not take the caller down.
pub struct GroupDecryption<S> {
    engine: Arc<EncryptionEngine<S>>,
}

impl<S> GroupDecryption<S>
where
    S: SessionStore,
    S::Error: Send + Sync + 'static,
{
    pub fn new(engine: Arc<EncryptionEngine<S>>) -> Self {
        Self { engine }
    }

    async fn decrypt_ratchet(
        &self,
        stream_id: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<DecryptedContent, DecryptionError> {
        // Session lookup comes first: an unknown session is recoverable (the caller re-requests
        // the key), a parse failure is not.
        let known = self
            .engine
            .has_inbound_session(stream_id, &envelope.session_id)
            .await
            .map_err(|err| DecryptionError::Store {
                stream_id: stream_id.to_string(),
                source: Box::new(err),
            })?;
        if !known {
            return Err(DecryptionError::SessionNotFound {
                stream_id: stream_id.to_string(),
                session_id: envelope.session_id.clone(),
            });
        }

        let message = RatchetMessage::from_bytes(&envelope.ciphertext).map_err(|err| {
            DecryptionError::DecryptFailed {
                stream_id: stream_id.to_string(),
                reason: err.to_string(),
            }
        })?;

        let decrypted = self
            .engine
            .decrypt_group_message(stream_id, &envelope.session_id, &message)
            .await
            .map_err(|err| match err {
                EngineError::UnknownInboundSession {
                    stream_id,
                    session_id,
                } => DecryptionError::SessionNotFound {
                    stream_id,
                    session_id,
                },
                EngineError::Store(err) => DecryptionError::Store {
                    stream_id: stream_id.to_string(),
                    source: Box::new(err),
                },
                err => DecryptionError::DecryptFailed {
                    stream_id: stream_id.to_string(),
                    reason: err.to_string(),
                },
            })?;

        Ok(DecryptedContent {
            plaintext: decrypted.plaintext,
            trusted: !decrypted.untrusted,
            keys_claimed: decrypted.keys_claimed,
        })
    }

    async fn decrypt_hybrid(
        &self,
        stream_id: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<DecryptedContent, DecryptionError> {
        let record = self
            .engine
            .hybrid_session(stream_id, &envelope.session_id)
            .await
            .map_err(|err| DecryptionError::Store {
                stream_id: stream_id.to_string(),
                source: Box::new(err),
            })?
            .ok_or_else(|| DecryptionError::SessionNotFound {
                stream_id: stream_id.to_string(),
                session_id: envelope.session_id.clone(),
            })?;

        let message: HybridMessage =
            decode_cbor(&envelope.ciphertext[..]).map_err(|err| {
                DecryptionError::DecryptFailed {
                    stream_id: stream_id.to_string(),
                    reason: err.to_string(),
                }
            })?;
        let plaintext = aes_gcm::decrypt(&message.ciphertext, &record.session_key, &message.nonce)
            .map_err(|err| DecryptionError::DecryptFailed {
                stream_id: stream_id.to_string(),
                reason: err.to_string(),
            })?;

        Ok(DecryptedContent {
            plaintext,
            // Hybrid session ids are recomputed from the key material on import, a session that
            // made it into the store is bound to its id.
            trusted: true,
            keys_claimed: HashMap::new(),
        })
    }

    async fn import_ratchet_key(
        &self,
        wrapped: &WrappedSessionKey,
        payload: &[u8],
    ) -> Result<(), DecryptionError> {
        let session_key =
            GroupSessionKey::from_bytes(payload).map_err(|err| DecryptionError::ImportFailed {
                stream_id: wrapped.stream_id.clone(),
                reason: err.to_string(),
            })?;
        let keys_claimed =
            HashMap::from([("curve25519".to_string(), wrapped.sender_key.clone())]);

        self.engine
            .add_inbound_group_session(
                &wrapped.stream_id,
                &wrapped.session_id,
                session_key,
                keys_claimed,
                false,
            )
            .await
            .map_err(|err| match err {
                EngineError::Store(err) => DecryptionError::Store {
                    stream_id: wrapped.stream_id.clone(),
                    source: Box::new(err),
                },
                err => DecryptionError::ImportFailed {
                    stream_id: wrapped.stream_id.clone(),
                    reason: err.to_string(),
                },
            })?;

        Ok(())
    }

    async fn import_hybrid_key(
        &self,
        wrapped: &WrappedSessionKey,
        payload: &[u8],
    ) -> Result<(), DecryptionError> {
        let record: HybridSessionRecord =
            decode_cbor(payload).map_err(|err| DecryptionError::ImportFailed {
                stream_id: wrapped.stream_id.clone(),
                reason: err.to_string(),
            })?;
        if record.stream_id != wrapped.stream_id {
            return Err(DecryptionError::ImportFailed {
                stream_id: wrapped.stream_id.clone(),
                reason: format!("session belongs to stream {}", record.stream_id),
            });
        }

        self.engine
            .add_hybrid_group_session(record)
            .await
            .map_err(|err| match err {
                EngineError::Store(err) => DecryptionError::Store {
                    stream_id: wrapped.stream_id.clone(),
                    source: Box::new(err),
                },
                err => DecryptionError::ImportFailed {
                    stream_id: wrapped.stream_id.clone(),
                    reason: err.to_string(),
                },
            })?;

        Ok(())
    }
}

impl<S> Decryptor for GroupDecryption<S>
where
    S: SessionStore,
    S::Error: Send + Sync + 'static,
{
    async fn decrypt(
        &self,
        stream_id: &str,
        envelope: &EncryptedEnvelope,
    ) -> Result<DecryptedContent, DecryptionError> {
        envelope.validate()?;

        match AlgorithmId::from_str(&envelope.algorithm) {
            Ok(AlgorithmId::GroupEncryption) => self.decrypt_ratchet(stream_id, envelope).await,
            Ok(AlgorithmId::HybridGroupEncryption) => {
                self.decrypt_hybrid(stream_id, envelope).await
            }
            Err(()) => Err(DecryptionError::UnsupportedAlgorithm(
                envelope.algorithm.clone(),
            )),
        }
    }

    async fn import_session_key(
        &self,
        wrapped: &WrappedSessionKey,
    ) -> Result<(), DecryptionError> {
        let payload = self
            .engine
            .account()
            .unseal(&wrapped.sealed)
            .map_err(|err| DecryptionError::ImportFailed {
                stream_id: wrapped.stream_id.clone(),
                reason: err.to_string(),
            })?;

        let result = match AlgorithmId::from_str(&wrapped.algorithm) {
            Ok(AlgorithmId::GroupEncryption) => self.import_ratchet_key(wrapped, &payload).await,
            Ok(AlgorithmId::HybridGroupEncryption) => {
                self.import_hybrid_key(wrapped, &payload).await
            }
            Err(()) => Err(DecryptionError::UnsupportedAlgorithm(
                wrapped.algorithm.clone(),
            )),
        };

        if let Err(err) = &result {
            // Isolated per session: the caller keeps processing other shares.
            warn!(
                stream_id = %wrapped.stream_id,
                session_id = %wrapped.session_id,
                "session key import failed: {err}"
            );
        }

        result
    }

    async fn has_session_key(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> Result<bool, DecryptionError> {
        let inbound = self
            .engine
            .has_inbound_session(stream_id, session_id)
            .await
            .map_err(|err| DecryptionError::Store {
                stream_id: stream_id.to_string(),
                source: Box::new(err),
            })?;
        if inbound {
            return Ok(true);
        }

        let hybrid = self
            .engine
            .hybrid_session(stream_id, session_id)
            .await
            .map_err(|err| DecryptionError::Store {
                stream_id: stream_id.to_string(),
                source: Box::new(err),
            })?;

        Ok(hybrid.is_some())
    }
}
