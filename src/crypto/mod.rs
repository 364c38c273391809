// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives: CSPRNG, secret containers, hashing, key derivation, AEAD and
//! key-wrapping.
pub mod aes_gcm;
pub mod hkdf;
pub mod rng;
pub mod seal;
pub mod secret;
pub mod sha2;
pub mod x25519;

pub use rng::{Rng, RngError};
pub use secret::Secret;
