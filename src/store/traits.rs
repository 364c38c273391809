// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use crate::device::DeviceRecord;
use crate::store::{HybridSessionRecord, InboundSessionRecord, OutboundSessionRecord};

/// Interface for persisting the pickled account and all group-session state.
///
/// Every method is one atomic operation against the backing store: a write either lands
/// completely or not at all, and reads never observe a partially-written record.
pub trait SessionStore {
    type Error: Error;

    /// Returns the pickled account blob, or `None` when no account has been created yet.
    fn account(&self) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>>;

    /// Stores the pickled account blob, replacing any previous one.
    fn set_account(&self, pickle: Vec<u8>) -> impl Future<Output = Result<(), Self::Error>>;

    /// Returns the outbound session for a stream, if one exists.
    fn outbound_session(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<Option<OutboundSessionRecord>, Self::Error>>;

    /// Stores an outbound session, replacing the stream's previous one.
    fn set_outbound_session(
        &self,
        record: OutboundSessionRecord,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Returns an inbound session by stream and session id.
    fn inbound_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<Option<InboundSessionRecord>, Self::Error>>;

    /// Stores an inbound session, replacing any record under the same `(stream_id, session_id)`
    /// key.
    fn set_inbound_session(
        &self,
        record: InboundSessionRecord,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Returns the ids of all inbound sessions known for a stream.
    fn inbound_session_ids(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<Vec<String>, Self::Error>>;

    /// Returns all inbound sessions across all streams, used for device export.
    fn inbound_sessions(
        &self,
    ) -> impl Future<Output = Result<Vec<InboundSessionRecord>, Self::Error>>;

    /// Returns a hybrid session by stream and session id.
    fn hybrid_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> impl Future<Output = Result<Option<HybridSessionRecord>, Self::Error>>;

    /// Stores a hybrid session, replacing any record under the same key.
    fn set_hybrid_session(
        &self,
        record: HybridSessionRecord,
    ) -> impl Future<Output = Result<(), Self::Error>>;

    /// Returns all hybrid sessions for a stream.
    fn hybrid_sessions_for_stream(
        &self,
        stream_id: &str,
    ) -> impl Future<Output = Result<Vec<HybridSessionRecord>, Self::Error>>;

    /// Returns all hybrid sessions across all streams, used for device export.
    fn hybrid_sessions(
        &self,
    ) -> impl Future<Output = Result<Vec<HybridSessionRecord>, Self::Error>>;
}

/// Interface for storing and querying announced device identities.
pub trait DeviceStore {
    type Error: Error;

    /// Inserts or refreshes a device announcement, keyed by `(user_id, device_key)`.
    ///
    /// Returns `true` if a new entry got inserted, `false` if an existing one was updated.
    /// Re-announcing the same device is idempotent.
    fn upsert_device(
        &self,
        record: DeviceRecord,
    ) -> impl Future<Output = Result<bool, Self::Error>>;

    /// Returns all known devices of a user, including expired ones.
    ///
    /// Expired records remain queryable so old messages can still be attributed to the device
    /// that sent them.
    fn devices(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<DeviceRecord>, Self::Error>>;

    /// Returns the devices of a user that are valid targets for session-key delivery, excluding
    /// everything expired at `now_ms`.
    fn sharing_targets(
        &self,
        user_id: &str,
        now_ms: u64,
    ) -> impl Future<Output = Result<Vec<DeviceRecord>, Self::Error>>;

    /// Removes all device records expired at `now_ms`. Returns the number of removed entries.
    ///
    /// Implementations keep a secondary index on the expiration timestamp so the cost is bounded
    /// by the number of expired rows, not the table size.
    fn remove_expired(&self, now_ms: u64) -> impl Future<Output = Result<usize, Self::Error>>;
}
