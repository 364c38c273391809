// SPDX-License-Identifier: MIT OR Apache-2.0

//! Asymmetric sealing of small payloads towards a recipient's X25519 public key.
//!
//! Used to wrap exported group-session keys for each receiving device: an ephemeral X25519
//! key-pair performs Diffie-Hellman with the recipient's identity (or fallback) key, the shared
//! secret is expanded with HKDF into an AES-256-GCM key and nonce and the payload is sealed under
//! it. Only the holder of the matching secret key can unseal.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::aes_gcm::{self, AesGcmError, KEY_SIZE, NONCE_SIZE};
use crate::crypto::hkdf::{HkdfError, hkdf};
use crate::crypto::x25519::{PublicKey, SecretKey, X25519Error};
use crate::crypto::{Rng, RngError};

const SEAL_CONTEXT: &[u8] = b"estuary_seal_v1";

/// Payload sealed towards one recipient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedBox {
    pub ephemeral_key: PublicKey,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Seals a payload towards the given recipient public key.
pub fn seal(
    plaintext: &[u8],
    recipient_key: &PublicKey,
    rng: &Rng,
) -> Result<SealedBox, SealError> {
    let ephemeral_secret = SecretKey::from_bytes(rng.random_array()?);
    let ephemeral_key = ephemeral_secret.public_key()?;
    let shared_secret = ephemeral_secret.calculate_agreement(recipient_key)?;

    let (key, nonce) = expand(&shared_secret, &ephemeral_key, recipient_key)?;
    let sealed = aes_gcm::encrypt(plaintext, Some(&key), Some(&nonce), rng)?;

    Ok(SealedBox {
        ephemeral_key,
        ciphertext: sealed.ciphertext,
    })
}

/// Unseals a payload with the recipient's secret key.
pub fn open(sealed: &SealedBox, recipient_secret: &SecretKey) -> Result<Vec<u8>, SealError> {
    let recipient_key = recipient_secret.public_key()?;
    let shared_secret = recipient_secret.calculate_agreement(&sealed.ephemeral_key)?;

    let (key, nonce) = expand(&shared_secret, &sealed.ephemeral_key, &recipient_key)?;
    let plaintext = aes_gcm::decrypt(&sealed.ciphertext, &key, &nonce)?;

    Ok(plaintext)
}

/// Expands the Diffie-Hellman output into AEAD key material, binding both public keys into the
/// derivation context.
fn expand(
    shared_secret: &[u8; 32],
    ephemeral_key: &PublicKey,
    recipient_key: &PublicKey,
) -> Result<([u8; KEY_SIZE], [u8; NONCE_SIZE]), SealError> {
    let info = [
        SEAL_CONTEXT,
        ephemeral_key.as_bytes(),
        recipient_key.as_bytes(),
    ]
    .concat();
    let okm: [u8; KEY_SIZE + NONCE_SIZE] = hkdf(None, shared_secret, Some(&info))?;

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&okm[..KEY_SIZE]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&okm[KEY_SIZE..]);

    Ok((key, nonce))
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error(transparent)]
    X25519(#[from] X25519Error),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    AesGcm(#[from] AesGcmError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;
    use crate::crypto::x25519::SecretKey;

    use super::{open, seal};

    #[test]
    fn seal_and_open() {
        let rng = Rng::from_seed([1; 32]);

        let recipient = SecretKey::from_bytes(rng.random_array().unwrap());
        let sealed = seal(b"session key", &recipient.public_key().unwrap(), &rng).unwrap();

        assert_eq!(open(&sealed, &recipient).unwrap(), b"session key");
    }

    #[test]
    fn wrong_recipient_fails() {
        let rng = Rng::from_seed([2; 32]);

        let recipient = SecretKey::from_bytes(rng.random_array().unwrap());
        let other = SecretKey::from_bytes(rng.random_array().unwrap());
        let sealed = seal(b"session key", &recipient.public_key().unwrap(), &rng).unwrap();

        assert!(open(&sealed, &other).is_err());
    }
}
