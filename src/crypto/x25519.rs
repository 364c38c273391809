// SPDX-License-Identifier: MIT OR Apache-2.0

//! X25519 key-pairs for device identities and Diffie-Hellman key agreement.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::secret::Secret;

pub const SECRET_KEY_SIZE: usize = 32;

pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key for Diffie-Hellman key agreement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(Secret<SECRET_KEY_SIZE>);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn public_key(&self) -> Result<PublicKey, X25519Error> {
        let secret = x25519_dalek::StaticSecret::from(*self.0.as_bytes());
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok(PublicKey(public.to_bytes()))
    }

    /// Computes the shared secret between our secret key and the given public key.
    pub fn calculate_agreement(
        &self,
        their_public_key: &PublicKey,
    ) -> Result<[u8; 32], X25519Error> {
        let secret = x25519_dalek::StaticSecret::from(*self.0.as_bytes());
        let public = x25519_dalek::PublicKey::from(their_public_key.0);
        let shared = secret.diffie_hellman(&public);
        // All-zero output means a low-order public key was used.
        if !shared.was_contributory() {
            return Err(X25519Error::NonContributory);
        }
        Ok(shared.to_bytes())
    }
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "serde_bytes")] [u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, X25519Error> {
        let bytes = hex::decode(value).map_err(|_| X25519Error::InvalidPublicKey)?;
        let bytes: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| X25519Error::InvalidPublicKey)?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("invalid x25519 public key encoding")]
    InvalidPublicKey,

    #[error("non-contributory x25519 key agreement")]
    NonContributory,
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::SecretKey;

    #[test]
    fn key_agreement() {
        let rng = Rng::from_seed([1; 32]);

        let alice = SecretKey::from_bytes(rng.random_array().unwrap());
        let bob = SecretKey::from_bytes(rng.random_array().unwrap());

        let shared_alice = alice
            .calculate_agreement(&bob.public_key().unwrap())
            .unwrap();
        let shared_bob = bob
            .calculate_agreement(&alice.public_key().unwrap())
            .unwrap();

        assert_eq!(shared_alice, shared_bob);
    }

    #[test]
    fn hex_round_trip() {
        let rng = Rng::from_seed([2; 32]);
        let secret = SecretKey::from_bytes(rng.random_array().unwrap());
        let public = secret.public_key().unwrap();
        let hex = public.to_hex();
        assert_eq!(
            super::PublicKey::from_hex(&hex).unwrap().as_bytes(),
            public.as_bytes()
        );
    }
}
