// SPDX-License-Identifier: MIT OR Apache-2.0

//! HKDF key-derivation (HMAC-based extract-and-expand, using SHA256).
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Derives `N` bytes of new key material from the given input key material.
pub fn hkdf<const N: usize>(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: Option<&[u8]>,
) -> Result<[u8; N], HkdfError> {
    let mut out = [0u8; N];
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    hkdf.expand(info.unwrap_or_default(), &mut out)
        .map_err(|_| HkdfError::InvalidOutputLength)?;
    Ok(out)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("requested hkdf output length is invalid")]
    InvalidOutputLength,
}
