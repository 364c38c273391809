// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use crate::crypto::Rng;
use crate::device::DeviceRecord;
use crate::scheme::{
    DecryptionError, EncryptedEnvelope, EncryptionError, ShareOutcome, WrappedSessionKey,
};
use crate::scheme::decrypt::DecryptedContent;

/// Encryption side of a conversation algorithm.
pub trait Encryptor {
    /// Makes sure an outbound session exists, is current and has been offered to every eligible
    /// device. Returns the outcome of any key fan-out that took place.
    fn ensure_outbound_session(
        &self,
        stream_id: &str,
        now_ms: u64,
        rng: &Rng,
    ) -> impl Future<Output = Result<ShareOutcome, EncryptionError>>;

    /// Encrypts a message for the stream, creating or rotating the session first when necessary.
    fn encrypt(
        &self,
        stream_id: &str,
        plaintext: &[u8],
        now_ms: u64,
        rng: &Rng,
    ) -> impl Future<Output = Result<EncryptedEnvelope, EncryptionError>>;

    /// Discards the current outbound session and establishes a fresh one.
    fn rotate_session(
        &self,
        stream_id: &str,
        now_ms: u64,
        rng: &Rng,
    ) -> impl Future<Output = Result<ShareOutcome, EncryptionError>>;
}

/// Decryption side, shared by all conversation algorithms.
pub trait Decryptor {
    /// Decrypts an envelope received for a stream.
    fn decrypt(
        &self,
        stream_id: &str,
        envelope: &EncryptedEnvelope,
    ) -> impl Future<Output = Result<DecryptedContent, DecryptionError>>;

    /// Imports session key material shared by another device.
    ///
    /// A failed import is isolated: the error is reported for this session only and no other
    /// session state is touched.
    fn import_session_key(
        &self,
        wrapped: &WrappedSessionKey,
    ) -> impl Future<Output = Result<(), DecryptionError>>;

    /// Returns `true` when key material for the session is available, under either algorithm.
    fn has_session_key(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<bool, DecryptionError>>;
}

/// Access to stream membership and key delivery, implemented by the surrounding client.
pub trait StreamClient {
    type Error: Error + Send + Sync + 'static;

    /// All devices announced by members of the stream.
    fn devices_in_stream(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<Vec<DeviceRecord>, Self::Error>>;

    /// Delivers wrapped session key material to one device.
    fn deliver_session_key(
        &self,
        device: &DeviceRecord,
        wrapped: WrappedSessionKey,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Current key epoch of the stream, versioning hybrid sessions.
    fn current_epoch(&self, stream_id: &str) -> impl Future<Output = Result<u64, Self::Error>>;
}

/// Membership gate consulted per user during fan-out. Evaluation happens elsewhere, this crate
/// only consumes the verdict.
pub trait EntitlementCheck {
    fn may_participate(
        &self,
        user_id: &str,
        stream_id: &str,
    ) -> impl Future<Output = bool>;
}
