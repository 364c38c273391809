// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delegate authorization for device keys.
//!
//! A root wallet key authorizes a device key to act on its behalf by signing a delegate
//! expiry-bound hash with its secp256k1 key (Ethereum personal-message signing). Verification
//! recovers the signer's wallet address from the signature and checks it against the expected
//! delegator.
use std::fmt;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Domain-separation tag prepended to every delegate hash source.
pub const DELEGATE_TAG: &[u8; 8] = b"ESTDELEG";

/// Length of a recoverable secp256k1 signature: `r || s || v`.
pub const SIGNATURE_SIZE: usize = 65;

pub const ADDRESS_SIZE: usize = 20;

/// 20-byte Ethereum-style account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    pub fn from_bytes(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(value: &str) -> Result<Self, DelegateError> {
        let stripped = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(stripped).map_err(|_| DelegateError::InvalidAddress)?;
        let bytes: [u8; ADDRESS_SIZE] =
            bytes.try_into().map_err(|_| DelegateError::InvalidAddress)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Constructs the bytes a delegator signs to authorize a device key.
///
/// Layout: 8-byte tag, the device's uncompressed secp256k1 public key (64 bytes, or 65 with the
/// `0x04` prefix) and the expiry timestamp in unix milliseconds as a little-endian u64. An expiry
/// of `0` means the delegation never expires.
pub fn delegate_hash_src(
    device_public_key: &[u8],
    expiry_epoch_ms: i64,
) -> Result<Vec<u8>, DelegateError> {
    if device_public_key.len() != 64 && device_public_key.len() != 65 {
        return Err(DelegateError::InvalidPublicKey(device_public_key.len()));
    }
    if expiry_epoch_ms < 0 {
        return Err(DelegateError::InvalidExpiry(expiry_epoch_ms));
    }

    let mut src = Vec::with_capacity(DELEGATE_TAG.len() + device_public_key.len() + 8);
    src.extend_from_slice(DELEGATE_TAG);
    src.extend_from_slice(device_public_key);
    src.extend_from_slice(&(expiry_epoch_ms as u64).to_le_bytes());

    Ok(src)
}

/// Keccak256 hash of a message wrapped in the Ethereum personal-message envelope
/// (`"\x19Ethereum Signed Message:\n" + len(message) + message`).
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n");
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Derives the account address from an uncompressed secp256k1 public key: the last 20 bytes of
/// the Keccak256 hash over the raw point (without the `0x04` prefix).
pub fn public_key_to_address(public_key: &[u8]) -> Result<Address, DelegateError> {
    let point = match public_key.len() {
        64 => public_key,
        65 => &public_key[1..],
        len => return Err(DelegateError::InvalidPublicKey(len)),
    };

    let digest: [u8; 32] = Keccak256::digest(point).into();
    let mut address = [0u8; ADDRESS_SIZE];
    address.copy_from_slice(&digest[12..]);

    Ok(Address(address))
}

/// Recovers the delegator's wallet address from a delegate signature.
///
/// The signature is expected as 65 bytes `r || s || v`, with `v` either 0/1 or the legacy 27/28
/// encoding.
pub fn recover_delegator_address(
    device_public_key: &[u8],
    signature: &[u8],
    expiry_epoch_ms: i64,
) -> Result<Address, DelegateError> {
    if signature.len() != SIGNATURE_SIZE {
        return Err(DelegateError::InvalidSignatureLength(signature.len()));
    }

    let hash_src = delegate_hash_src(device_public_key, expiry_epoch_ms)?;
    let prehash = personal_message_hash(&hash_src);

    let mut v = signature[64];
    if v >= 27 {
        v -= 27;
    }
    let recovery_id =
        RecoveryId::from_byte(v).ok_or(DelegateError::InvalidRecoveryId(signature[64]))?;
    let signature = Signature::from_slice(&signature[..64])
        .map_err(|_| DelegateError::InvalidSignature)?;

    let verifying_key = VerifyingKey::recover_from_prehash(&prehash, &signature, recovery_id)
        .map_err(|_| DelegateError::RecoveryFailed)?;
    let point = verifying_key.to_encoded_point(false);

    public_key_to_address(point.as_bytes())
}

/// Verifies a delegate signature against the expected delegator address and checks that the
/// delegation has not expired. An expiry of `0` never expires.
pub fn check_delegate_sig(
    device_public_key: &[u8],
    signature: &[u8],
    expected_address: &Address,
    expiry_epoch_ms: i64,
    now_epoch_ms: i64,
) -> Result<(), DelegateError> {
    let recovered = recover_delegator_address(device_public_key, signature, expiry_epoch_ms)?;
    if &recovered != expected_address {
        return Err(DelegateError::DelegatorMismatch {
            expected: *expected_address,
            recovered,
        });
    }
    if expiry_epoch_ms != 0 && now_epoch_ms >= expiry_epoch_ms {
        return Err(DelegateError::DelegateExpired {
            expiry_epoch_ms,
            now_epoch_ms,
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("invalid device public key length: {0}, expected 64 or 65 bytes")]
    InvalidPublicKey(usize),

    #[error("invalid delegate expiry: {0}")]
    InvalidExpiry(i64),

    #[error("invalid address encoding")]
    InvalidAddress,

    #[error("invalid signature length: {0}, expected {SIGNATURE_SIZE} bytes")]
    InvalidSignatureLength(usize),

    #[error("invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    #[error("malformed secp256k1 signature")]
    InvalidSignature,

    #[error("public key recovery failed")]
    RecoveryFailed,

    #[error("delegate signed by {recovered}, expected {expected}")]
    DelegatorMismatch { expected: Address, recovered: Address },

    #[error("delegation expired at {expiry_epoch_ms}, now {now_epoch_ms}")]
    DelegateExpired {
        expiry_epoch_ms: i64,
        now_epoch_ms: i64,
    },
}

#[cfg(test)]
mod tests {
    use k256::ecdsa::SigningKey;

    use super::{
        Address, DelegateError, check_delegate_sig, delegate_hash_src, personal_message_hash,
        public_key_to_address, recover_delegator_address,
    };

    fn wallet() -> (SigningKey, Address) {
        let signing_key = SigningKey::from_bytes(&[7u8; 32].into()).unwrap();
        let point = signing_key.verifying_key().to_encoded_point(false);
        let address = public_key_to_address(point.as_bytes()).unwrap();
        (signing_key, address)
    }

    fn sign_delegate(
        signing_key: &SigningKey,
        device_public_key: &[u8],
        expiry_epoch_ms: i64,
    ) -> Vec<u8> {
        let hash_src = delegate_hash_src(device_public_key, expiry_epoch_ms).unwrap();
        let prehash = personal_message_hash(&hash_src);
        let (signature, recovery_id) = signing_key.sign_prehash_recoverable(&prehash).unwrap();

        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte());
        bytes
    }

    #[test]
    fn recover_and_check() {
        let (signing_key, address) = wallet();
        let device_key = [2u8; 64];
        let expiry = 2_000_000_000_000;

        let signature = sign_delegate(&signing_key, &device_key, expiry);

        let recovered = recover_delegator_address(&device_key, &signature, expiry).unwrap();
        assert_eq!(recovered, address);

        check_delegate_sig(&device_key, &signature, &address, expiry, 1_000_000_000_000)
            .unwrap();
    }

    #[test]
    fn legacy_recovery_byte() {
        let (signing_key, address) = wallet();
        let device_key = [2u8; 64];

        let mut signature = sign_delegate(&signing_key, &device_key, 0);
        signature[64] += 27;

        let recovered = recover_delegator_address(&device_key, &signature, 0).unwrap();
        assert_eq!(recovered, address);
    }

    #[test]
    fn zero_expiry_never_expires() {
        let (signing_key, address) = wallet();
        let device_key = [2u8; 64];

        let signature = sign_delegate(&signing_key, &device_key, 0);
        check_delegate_sig(&device_key, &signature, &address, 0, i64::MAX - 1).unwrap();
    }

    #[test]
    fn expired_delegation_rejected() {
        let (signing_key, address) = wallet();
        let device_key = [2u8; 64];
        let expiry = 1_000;

        let signature = sign_delegate(&signing_key, &device_key, expiry);
        assert!(matches!(
            check_delegate_sig(&device_key, &signature, &address, expiry, 2_000),
            Err(DelegateError::DelegateExpired { .. })
        ));
    }

    #[test]
    fn wrong_delegator_rejected() {
        let (signing_key, _) = wallet();
        let other = Address::from_bytes([9u8; 20]);
        let device_key = [2u8; 64];

        let signature = sign_delegate(&signing_key, &device_key, 0);
        assert!(matches!(
            check_delegate_sig(&device_key, &signature, &other, 0, 0),
            Err(DelegateError::DelegatorMismatch { .. })
        ));
    }

    #[test]
    fn tampered_expiry_changes_signer() {
        let (signing_key, address) = wallet();
        let device_key = [2u8; 64];

        let signature = sign_delegate(&signing_key, &device_key, 5_000);

        // Recovery over a different expiry either fails or yields another address.
        match recover_delegator_address(&device_key, &signature, 6_000) {
            Ok(recovered) => assert_ne!(recovered, address),
            Err(_) => {}
        }
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(matches!(
            delegate_hash_src(&[0u8; 33], 0),
            Err(DelegateError::InvalidPublicKey(33))
        ));
        assert!(matches!(
            delegate_hash_src(&[0u8; 64], -1),
            Err(DelegateError::InvalidExpiry(-1))
        ));
        assert!(matches!(
            recover_delegator_address(&[0u8; 64], &[0u8; 64], 0),
            Err(DelegateError::InvalidSignatureLength(64))
        ));
    }

    #[test]
    fn address_hex_round_trip() {
        let address = Address::from_bytes([0xab; 20]);
        let hex = address.to_string();
        assert!(hex.starts_with("0x"));
        assert_eq!(Address::from_hex(&hex).unwrap(), address);
        assert_eq!(Address::from_hex(&hex[2..]).unwrap(), address);
    }
}
