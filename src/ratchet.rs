// SPDX-License-Identifier: MIT OR Apache-2.0

//! Symmetric group message ratchet.
//!
//! An outbound session holds a chain key which is advanced by one HKDF step per encrypted
//! message, giving forward secrecy within the session: revealing the chain at generation `n`
//! exposes nothing about messages before `n`.
//!
//! An inbound session stores the chain at the first generation it learned about and never
//! mutates. Decryption re-derives the chain forward to the message's generation, so messages
//! arriving out-of-order or with gaps are handled without any session state writes, as long as
//! their generation is not before the first known one and no further than [`MAX_FORWARD_SKIP`]
//! ahead of it.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::crypto::aes_gcm::{self, AesGcmError, KEY_SIZE, NONCE_SIZE};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::secret::Secret;
use crate::crypto::sha2::sha2_256;
use crate::crypto::{Rng, RngError};

/// Message index within a session, starting at zero.
pub type Generation = u32;

pub const CHAIN_KEY_SIZE: usize = 32;

const SESSION_ID_TAG: &[u8] = b"estuary_session_id";

const CHAIN_INFO: &[u8] = b"estuary_chain";

const MESSAGE_INFO: &[u8] = b"estuary_message";

/// Upper bound on how many generations a single decryption or chain comparison may re-derive.
/// Advancing the chain costs one HKDF step per generation, so the claimed generation in a
/// received message must not dictate unbounded work. With the default rotation period of 100
/// messages this leaves ample headroom for long-lived sessions.
pub const MAX_FORWARD_SKIP: Generation = 2_000;

/// Exportable session key material: the chain at some generation, together with the session id
/// it belongs to.
///
/// For an outbound session the generation is the next message index; for an inbound session it
/// is the first index the holder can decrypt. The session id feeds every key derivation, so key
/// material carried under a foreign id produces no usable message keys.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(test, derive(Debug))]
pub struct GroupSessionKey {
    session_id: String,
    chain_key: Secret<CHAIN_KEY_SIZE>,
    generation: Generation,
}

impl GroupSessionKey {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RatchetError> {
        Ok(encode_cbor(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        Ok(decode_cbor(bytes)?)
    }

    /// Advances the chain by one generation.
    fn advance(&mut self) -> Result<(), RatchetError> {
        let info = [CHAIN_INFO, self.session_id.as_bytes()].concat();
        let next: [u8; CHAIN_KEY_SIZE] =
            hkdf(None, self.chain_key.as_bytes(), Some(&info))?;
        self.chain_key = Secret::from_bytes(next);
        self.generation += 1;
        Ok(())
    }

    /// Derives the AEAD key and nonce for the message at the current generation.
    fn message_key(&self) -> Result<([u8; KEY_SIZE], [u8; NONCE_SIZE]), RatchetError> {
        let info = [
            MESSAGE_INFO,
            self.session_id.as_bytes(),
            &self.generation.to_be_bytes(),
        ]
        .concat();
        let okm: [u8; KEY_SIZE + NONCE_SIZE] =
            hkdf(None, self.chain_key.as_bytes(), Some(&info))?;

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&okm[..KEY_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&okm[KEY_SIZE..]);

        Ok((key, nonce))
    }

    /// Returns a copy of this key material advanced to the given later generation.
    fn at_generation(&self, generation: Generation) -> Result<Self, RatchetError> {
        debug_assert!(generation >= self.generation);
        let mut key = self.clone();
        while key.generation < generation {
            key.advance()?;
        }
        Ok(key)
    }

    /// Returns `true` when both keys belong to the same chain: the earlier one, advanced to the
    /// later one's generation, yields the same chain key.
    pub fn connects_to(&self, other: &Self) -> Result<bool, RatchetError> {
        if self.session_id != other.session_id {
            return Ok(false);
        }
        let (earlier, later) = if self.generation <= other.generation {
            (self, other)
        } else {
            (other, self)
        };
        // A key claiming to sit absurdly far down the chain cannot be verified without doing the
        // work it claims, so it is treated as not connected.
        if later.generation - earlier.generation > MAX_FORWARD_SKIP {
            return Ok(false);
        }
        let advanced = earlier.at_generation(later.generation)?;
        // Constant-time comparison through `Secret`.
        Ok(advanced.chain_key == later.chain_key)
    }
}

/// Single encrypted group message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RatchetMessage {
    pub generation: Generation,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RatchetError> {
        Ok(encode_cbor(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        Ok(decode_cbor(bytes)?)
    }
}

/// Sender side of a group session.
#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(test, derive(Debug))]
pub struct OutboundGroupSession {
    session_key: GroupSessionKey,
}

impl OutboundGroupSession {
    /// Creates a new session with a random initial chain key. The session id is the hash of the
    /// initial chain, making it stable for the lifetime of the session.
    pub fn new(rng: &Rng) -> Result<Self, RatchetError> {
        let chain_key: [u8; CHAIN_KEY_SIZE] = rng.random_array()?;
        let session_id = hex::encode(sha2_256(&[SESSION_ID_TAG, &chain_key]));

        Ok(Self {
            session_key: GroupSessionKey {
                session_id,
                chain_key: Secret::from_bytes(chain_key),
                generation: 0,
            },
        })
    }

    pub fn session_id(&self) -> &str {
        self.session_key.session_id()
    }

    /// Next message index.
    pub fn generation(&self) -> Generation {
        self.session_key.generation()
    }

    /// Encrypts a message at the current generation and advances the chain.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        rng: &Rng,
    ) -> Result<RatchetMessage, RatchetError> {
        let generation = self.session_key.generation;
        let (key, nonce) = self.session_key.message_key()?;
        let sealed = aes_gcm::encrypt(plaintext, Some(&key), Some(&nonce), rng)?;
        self.session_key.advance()?;

        Ok(RatchetMessage {
            generation,
            ciphertext: sealed.ciphertext,
        })
    }

    /// Exports the chain at the current generation, for sharing with devices that should read
    /// from here on.
    pub fn session_key(&self) -> GroupSessionKey {
        self.session_key.clone()
    }
}

/// Receiver side of a group session.
#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(test, derive(Debug))]
pub struct InboundGroupSession {
    session_key: GroupSessionKey,
}

impl InboundGroupSession {
    pub fn from_session_key(session_key: GroupSessionKey) -> Self {
        Self { session_key }
    }

    pub fn session_id(&self) -> &str {
        self.session_key.session_id()
    }

    /// Earliest message index this session can decrypt.
    pub fn first_known_index(&self) -> Generation {
        self.session_key.generation()
    }

    /// Decrypts a message by re-deriving the chain forward to the message's generation. The
    /// session state is never mutated, repeated and out-of-order decryption is safe.
    pub fn decrypt(&self, message: &RatchetMessage) -> Result<Vec<u8>, RatchetError> {
        if message.generation < self.session_key.generation {
            return Err(RatchetError::UnknownMessageIndex {
                generation: message.generation,
                first_known_index: self.session_key.generation,
            });
        }
        // The generation is attacker-controlled and each skipped generation costs an HKDF step.
        if message.generation - self.session_key.generation > MAX_FORWARD_SKIP {
            return Err(RatchetError::MessageIndexTooFarAhead {
                generation: message.generation,
                first_known_index: self.session_key.generation,
            });
        }

        let (key, nonce) = self
            .session_key
            .at_generation(message.generation)?
            .message_key()?;
        let plaintext = aes_gcm::decrypt(&message.ciphertext, &key, &nonce)?;

        Ok(plaintext)
    }

    /// Exports the session at its first known index.
    pub fn export(&self) -> GroupSessionKey {
        self.session_key.clone()
    }
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error(
        "message at index {generation} is before first known index {first_known_index}"
    )]
    UnknownMessageIndex {
        generation: Generation,
        first_known_index: Generation,
    },

    #[error(
        "message at index {generation} is more than {MAX_FORWARD_SKIP} ahead of first known index {first_known_index}"
    )]
    MessageIndexTooFarAhead {
        generation: Generation,
        first_known_index: Generation,
    },

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    AesGcm(#[from] AesGcmError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::{
        InboundGroupSession, MAX_FORWARD_SKIP, OutboundGroupSession, RatchetError, RatchetMessage,
    };

    #[test]
    fn encrypt_decrypt_in_order() {
        let rng = Rng::from_seed([1; 32]);

        let mut outbound = OutboundGroupSession::new(&rng).unwrap();
        let inbound = InboundGroupSession::from_session_key(outbound.session_key());

        for index in 0..5u32 {
            let plaintext = format!("message {index}");
            let message = outbound.encrypt(plaintext.as_bytes(), &rng).unwrap();
            assert_eq!(message.generation, index);
            assert_eq!(inbound.decrypt(&message).unwrap(), plaintext.as_bytes());
        }
    }

    #[test]
    fn out_of_order_and_repeated() {
        let rng = Rng::from_seed([2; 32]);

        let mut outbound = OutboundGroupSession::new(&rng).unwrap();
        let inbound = InboundGroupSession::from_session_key(outbound.session_key());

        let first = outbound.encrypt(b"first", &rng).unwrap();
        let second = outbound.encrypt(b"second", &rng).unwrap();
        let third = outbound.encrypt(b"third", &rng).unwrap();

        assert_eq!(inbound.decrypt(&third).unwrap(), b"third");
        assert_eq!(inbound.decrypt(&first).unwrap(), b"first");
        assert_eq!(inbound.decrypt(&second).unwrap(), b"second");
        // Repeats are fine, decryption does not mutate state.
        assert_eq!(inbound.decrypt(&second).unwrap(), b"second");
    }

    #[test]
    fn mid_stream_export_cannot_read_backlog() {
        let rng = Rng::from_seed([3; 32]);

        let mut outbound = OutboundGroupSession::new(&rng).unwrap();
        let early = outbound.encrypt(b"early", &rng).unwrap();

        // Export after the first message: the chain is already advanced past index 0.
        let late_joiner = InboundGroupSession::from_session_key(outbound.session_key());
        assert_eq!(late_joiner.first_known_index(), 1);

        let late = outbound.encrypt(b"late", &rng).unwrap();
        assert_eq!(late_joiner.decrypt(&late).unwrap(), b"late");

        assert!(matches!(
            late_joiner.decrypt(&early),
            Err(RatchetError::UnknownMessageIndex {
                generation: 0,
                first_known_index: 1,
            })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let rng = Rng::from_seed([4; 32]);

        let mut outbound = OutboundGroupSession::new(&rng).unwrap();
        let inbound = InboundGroupSession::from_session_key(outbound.session_key());

        let mut message = outbound.encrypt(b"hello", &rng).unwrap();
        message.ciphertext[0] ^= 1;

        assert!(inbound.decrypt(&message).is_err());
    }

    #[test]
    fn foreign_session_cannot_decrypt() {
        let rng = Rng::from_seed([5; 32]);

        let mut outbound = OutboundGroupSession::new(&rng).unwrap();
        let mut other = OutboundGroupSession::new(&rng).unwrap();
        let inbound = InboundGroupSession::from_session_key(outbound.session_key());

        let _ = outbound.encrypt(b"hello", &rng).unwrap();
        let foreign = other.encrypt(b"hello", &rng).unwrap();

        assert!(inbound.decrypt(&foreign).is_err());
    }

    #[test]
    fn session_keys_connect_along_the_chain() {
        let rng = Rng::from_seed([6; 32]);

        let mut outbound = OutboundGroupSession::new(&rng).unwrap();
        let at_zero = outbound.session_key();

        let _ = outbound.encrypt(b"one", &rng).unwrap();
        let _ = outbound.encrypt(b"two", &rng).unwrap();
        let at_two = outbound.session_key();

        assert!(at_zero.connects_to(&at_two).unwrap());
        assert!(at_two.connects_to(&at_zero).unwrap());

        let other = OutboundGroupSession::new(&rng).unwrap();
        assert!(!at_zero.connects_to(&other.session_key()).unwrap());
    }

    #[test]
    fn forged_generation_is_rejected_without_deriving() {
        let rng = Rng::from_seed([8; 32]);

        let mut outbound = OutboundGroupSession::new(&rng).unwrap();
        let inbound = InboundGroupSession::from_session_key(outbound.session_key());
        let genuine = outbound.encrypt(b"hello", &rng).unwrap();

        // A forged index would otherwise cost one key derivation per skipped generation.
        let forged = RatchetMessage {
            generation: u32::MAX,
            ciphertext: genuine.ciphertext,
        };

        assert!(matches!(
            inbound.decrypt(&forged),
            Err(RatchetError::MessageIndexTooFarAhead {
                generation: u32::MAX,
                first_known_index: 0,
            })
        ));
    }

    #[test]
    fn distant_session_keys_do_not_connect() {
        let rng = Rng::from_seed([9; 32]);

        let mut outbound = OutboundGroupSession::new(&rng).unwrap();
        let at_zero = outbound.session_key();

        for _ in 0..=MAX_FORWARD_SKIP {
            let _ = outbound.encrypt(b"msg", &rng).unwrap();
        }
        let far_along = outbound.session_key();

        // Same chain, but verifying the claim would exceed the re-derivation bound.
        assert!(!at_zero.connects_to(&far_along).unwrap());
    }

    #[test]
    fn session_key_serialization_round_trip() {
        let rng = Rng::from_seed([7; 32]);

        let outbound = OutboundGroupSession::new(&rng).unwrap();
        let key = outbound.session_key();

        let bytes = key.to_bytes().unwrap();
        let key_again = super::GroupSessionKey::from_bytes(&bytes).unwrap();
        assert_eq!(key, key_again);
        assert_eq!(key.session_id(), key_again.session_id());
    }
}
