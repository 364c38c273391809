// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-device account holding the X25519 identity and fallback secrets.
//!
//! The account is persisted as a "pickle": CBOR-serialized state sealed with AES-256-GCM under a
//! key derived from a caller-supplied passphrase. Loading an account with the wrong passphrase
//! fails authentication instead of yielding garbage state.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::crypto::aes_gcm::{self, AesGcmError, DERIVED_AES_GCM_ALGORITHM};
use crate::crypto::seal::{SealError, SealedBox, open};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError};

/// Secret key material of this device.
#[derive(Clone, Serialize, Deserialize)]
#[cfg_attr(test, derive(Debug))]
pub struct Account {
    identity_secret: SecretKey,
    fallback_secret: SecretKey,
    created_at_ms: u64,
}

impl Account {
    pub fn new(now_ms: u64, rng: &Rng) -> Result<Self, AccountError> {
        Ok(Self {
            identity_secret: SecretKey::from_bytes(rng.random_array()?),
            fallback_secret: SecretKey::from_bytes(rng.random_array()?),
            created_at_ms: now_ms,
        })
    }

    /// Public identity key, announced as the device key.
    pub fn device_key(&self) -> Result<PublicKey, AccountError> {
        Ok(self.identity_secret.public_key()?)
    }

    /// Public fallback key, announced as an alternative wrap target.
    pub fn fallback_key(&self) -> Result<PublicKey, AccountError> {
        Ok(self.fallback_secret.public_key()?)
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Unseals a payload wrapped towards this device, whichever of the two announced keys the
    /// sender picked.
    pub fn unseal(&self, sealed: &SealedBox) -> Result<Vec<u8>, AccountError> {
        match open(sealed, &self.fallback_secret) {
            Ok(plaintext) => Ok(plaintext),
            Err(_) => Ok(open(sealed, &self.identity_secret)?),
        }
    }

    /// Serializes and seals the account under a passphrase-derived key.
    pub fn pickle(&self, passphrase: &[u8]) -> Result<Vec<u8>, AccountError> {
        let bytes = encode_cbor(self)?;
        Ok(aes_gcm::encrypt_derived(passphrase, &bytes)?)
    }

    /// Restores an account from its pickled form.
    pub fn from_pickle(passphrase: &[u8], pickle: &[u8]) -> Result<Self, AccountError> {
        let bytes = aes_gcm::decrypt_derived(passphrase, DERIVED_AES_GCM_ALGORITHM, pickle)?;
        Ok(decode_cbor(&bytes[..])?)
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Seal(#[from] SealError),

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
    use crate::crypto::Rng;
    use crate::crypto::seal::seal;

    use super::Account;

    #[test]
    fn pickle_round_trip() {
        let rng = Rng::from_seed([1; 32]);

        let account = Account::new(1_000, &rng).unwrap();
        let pickle = account.pickle(b"passphrase").unwrap();

        let account_again = Account::from_pickle(b"passphrase", &pickle).unwrap();
        assert_eq!(
            account.device_key().unwrap(),
            account_again.device_key().unwrap()
        );
        assert_eq!(
            account.fallback_key().unwrap(),
            account_again.fallback_key().unwrap()
        );
        assert_eq!(account_again.created_at_ms(), 1_000);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let rng = Rng::from_seed([2; 32]);

        let account = Account::new(1_000, &rng).unwrap();
        let pickle = account.pickle(b"passphrase").unwrap();

        assert!(Account::from_pickle(b"wrong", &pickle).is_err());
    }

    #[test]
    fn unseal_with_either_key() {
        let rng = Rng::from_seed([3; 32]);

        let account = Account::new(1_000, &rng).unwrap();

        let towards_identity = seal(b"one", &account.device_key().unwrap(), &rng).unwrap();
        let towards_fallback = seal(b"two", &account.fallback_key().unwrap(), &rng).unwrap();

        assert_eq!(account.unseal(&towards_identity).unwrap(), b"one");
        assert_eq!(account.unseal(&towards_fallback).unwrap(), b"two");
    }
}
