// SPDX-License-Identifier: MIT OR Apache-2.0

//! AES-256-GCM authenticated encryption with passphrase-derived or random key material.
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::crypto::secret::Secret;
use crate::crypto::sha2::sha2_256;
use crate::crypto::{Rng, RngError};

pub const KEY_SIZE: usize = 32;

pub const NONCE_SIZE: usize = 12;

/// Upper bound on plaintext size, rejected before any cipher work.
pub const MAX_PLAINTEXT_SIZE: usize = 48 * 1024;

/// Identifier for payloads encrypted under a passphrase-derived key.
pub const DERIVED_AES_GCM_ALGORITHM: &str = "estuary/aes-gcm-derived/v1";

/// Result of an AES-256-GCM encryption, carrying the (possibly generated) key material along with
/// the sealed bytes.
#[derive(Debug)]
pub struct AesGcmCiphertext {
    pub ciphertext: Vec<u8>,
    pub key: Secret<KEY_SIZE>,
    pub nonce: [u8; NONCE_SIZE],
}

/// Derives a fixed AES key and nonce from a passphrase by iterated SHA256 hashing.
///
/// The first digest is taken over the passphrase itself, every further digest over the previous
/// digest concatenated with itself, until 44 bytes are collected: 32 for the key, 12 for the
/// nonce. The derivation is deterministic, the same passphrase always yields the same key
/// material.
pub fn derive_key_and_nonce(passphrase: &[u8]) -> (Secret<KEY_SIZE>, [u8; NONCE_SIZE]) {
    let mut material = Vec::with_capacity(64);
    let mut digest = sha2_256(&[passphrase]);
    material.extend_from_slice(&digest);
    while material.len() < KEY_SIZE + NONCE_SIZE {
        digest = sha2_256(&[&digest, &digest]);
        material.extend_from_slice(&digest);
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&material[..KEY_SIZE]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&material[KEY_SIZE..KEY_SIZE + NONCE_SIZE]);

    (Secret::from_bytes(key), nonce)
}

/// Encrypts a payload with AES-256-GCM. Key and nonce are randomly generated when not supplied.
pub fn encrypt(
    plaintext: &[u8],
    key: Option<&[u8]>,
    nonce: Option<&[u8]>,
    rng: &Rng,
) -> Result<AesGcmCiphertext, AesGcmError> {
    if plaintext.is_empty() {
        return Err(AesGcmError::EmptyPayload);
    }
    if plaintext.len() > MAX_PLAINTEXT_SIZE {
        return Err(AesGcmError::PayloadTooLarge(plaintext.len()));
    }

    let key: [u8; KEY_SIZE] = match key {
        Some(bytes) => bytes
            .try_into()
            .map_err(|_| AesGcmError::InvalidKeyLength(bytes.len()))?,
        None => rng.random_array()?,
    };
    let nonce: [u8; NONCE_SIZE] = match nonce {
        Some(bytes) => bytes
            .try_into()
            .map_err(|_| AesGcmError::InvalidNonceLength(bytes.len()))?,
        None => rng.random_array()?,
    };

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| AesGcmError::EncryptFailed)?;

    Ok(AesGcmCiphertext {
        ciphertext,
        key: Secret::from_bytes(key),
        nonce,
    })
}

/// Decrypts an AES-256-GCM payload.
///
/// Authentication failure is reported as [`AesGcmError::DecryptFailed`], distinct from
/// length-validation errors on key or nonce. A failed decryption never yields partial plaintext.
pub fn decrypt(ciphertext: &[u8], key: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AesGcmError> {
    if ciphertext.is_empty() {
        return Err(AesGcmError::EmptyPayload);
    }
    if key.len() != KEY_SIZE {
        return Err(AesGcmError::InvalidKeyLength(key.len()));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(AesGcmError::InvalidNonceLength(nonce.len()));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AesGcmError::DecryptFailed)
}

/// Decrypts a base64-encoded AES-256-GCM payload. Whitespace in the encoding is tolerated.
pub fn decrypt_base64(ciphertext: &str, key: &[u8], nonce: &[u8]) -> Result<Vec<u8>, AesGcmError> {
    let stripped: String = ciphertext.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(stripped)
        .map_err(|_| AesGcmError::InvalidBase64)?;
    decrypt(&bytes, key, nonce)
}

/// Encrypts a payload under a passphrase-derived key, for example for persisting pickled account
/// or session state.
pub fn encrypt_derived(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, AesGcmError> {
    if plaintext.is_empty() {
        return Err(AesGcmError::EmptyPayload);
    }
    if plaintext.len() > MAX_PLAINTEXT_SIZE {
        return Err(AesGcmError::PayloadTooLarge(plaintext.len()));
    }

    let (key, nonce) = derive_key_and_nonce(passphrase);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| AesGcmError::EncryptFailed)
}

/// Decrypts a payload encrypted under a passphrase-derived key.
///
/// Only [`DERIVED_AES_GCM_ALGORITHM`] is supported, every other algorithm identifier is rejected
/// before any derivation work takes place.
pub fn decrypt_derived(
    passphrase: &[u8],
    algorithm: &str,
    ciphertext: &[u8],
) -> Result<Vec<u8>, AesGcmError> {
    if algorithm != DERIVED_AES_GCM_ALGORITHM {
        return Err(AesGcmError::UnimplementedAlgorithm(algorithm.to_string()));
    }
    let (key, nonce) = derive_key_and_nonce(passphrase);
    decrypt(ciphertext, key.as_bytes(), &nonce)
}

#[derive(Debug, Error)]
pub enum AesGcmError {
    #[error("invalid aes key length: {0}, expected {KEY_SIZE} bytes")]
    InvalidKeyLength(usize),

    #[error("invalid aes nonce length: {0}, expected {NONCE_SIZE} bytes")]
    InvalidNonceLength(usize),

    #[error("payload is empty")]
    EmptyPayload,

    #[error("payload of {0} bytes exceeds maximum of {MAX_PLAINTEXT_SIZE}")]
    PayloadTooLarge(usize),

    #[error("payload is not valid base64")]
    InvalidBase64,

    #[error("aes-gcm encryption failed")]
    EncryptFailed,

    #[error("aes-gcm decryption failed")]
    DecryptFailed,

    #[error("unimplemented encryption algorithm \"{0}\"")]
    UnimplementedAlgorithm(String),

    #[error(transparent)]
    Rng(#[from] RngError),
}
