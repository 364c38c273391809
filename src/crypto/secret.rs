// SPDX-License-Identifier: MIT OR Apache-2.0

#[cfg(not(test))]
use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

/// Fixed-size wrapper for key material that must not leak: chain keys, device secrets, pickle
/// keys.
///
/// The wrapped bytes are zeroised on drop, only reachable through crate-private accessors,
/// redacted from `Debug` output outside of tests and compared in constant time. Serde support
/// exists because chain keys travel inside pickled sessions and exported session keys; callers
/// are responsible for only serializing into encrypted containers.
///
/// None of this defends against side-channels below the software layer, it keeps honest code
/// from leaking secrets through logs, assertions and early-exit comparisons.
#[derive(Clone, Eq, Serialize, Deserialize, ZeroizeOnDrop)]
#[cfg_attr(test, derive(Debug))]
pub struct Secret<const N: usize>(#[serde(with = "serde_bytes")] [u8; N]);

impl<const N: usize> Secret<N> {
    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> PartialEq for Secret<N> {
    fn eq(&self, other: &Self) -> bool {
        // Chain-key comparison during session import must not branch on content.
        bool::from(self.0.ct_eq(&other.0))
    }
}

#[cfg(not(test))]
impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret<{N}>(<redacted>)")
    }
}
