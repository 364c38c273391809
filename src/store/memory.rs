// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::device::DeviceRecord;
use crate::store::{
    DeviceStore, HybridSessionRecord, InboundSessionRecord, OutboundSessionRecord, SessionStore,
};

/// In-memory implementation of [`SessionStore`] and [`DeviceStore`].
///
/// All state lives behind one read-write lock, each store operation takes the lock exactly once,
/// which gives the per-record atomicity the traits ask for. Cloning is cheap and clones share the
/// same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryCryptoStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    account: Option<Vec<u8>>,
    outbound_sessions: BTreeMap<String, OutboundSessionRecord>,
    inbound_sessions: BTreeMap<(String, String), InboundSessionRecord>,
    hybrid_sessions: BTreeMap<(String, String), HybridSessionRecord>,
    devices: BTreeMap<(String, String), DeviceRecord>,
    // Secondary index for expiry-bounded clean-up.
    device_expirations: BTreeSet<(u64, String, String)>,
}

impl MemoryCryptoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryCryptoStore {
    type Error = Infallible;

    async fn account(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.account.clone())
    }

    async fn set_account(&self, pickle: Vec<u8>) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.account = Some(pickle);
        Ok(())
    }

    async fn outbound_session(
        &self,
        stream_id: &str,
    ) -> Result<Option<OutboundSessionRecord>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.outbound_sessions.get(stream_id).cloned())
    }

    async fn set_outbound_session(
        &self,
        record: OutboundSessionRecord,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner
            .outbound_sessions
            .insert(record.stream_id.clone(), record);
        Ok(())
    }

    async fn inbound_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> Result<Option<InboundSessionRecord>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .inbound_sessions
            .get(&(stream_id.to_string(), session_id.to_string()))
            .cloned())
    }

    async fn set_inbound_session(
        &self,
        record: InboundSessionRecord,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.inbound_sessions.insert(
            (record.stream_id.clone(), record.session_id.clone()),
            record,
        );
        Ok(())
    }

    async fn inbound_session_ids(&self, stream_id: &str) -> Result<Vec<String>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .inbound_sessions
            .range(
                (stream_id.to_string(), String::new())
                    ..(format!("{stream_id}\u{0}"), String::new()),
            )
            .map(|((_, session_id), _)| session_id.clone())
            .collect())
    }

    async fn inbound_sessions(&self) -> Result<Vec<InboundSessionRecord>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.inbound_sessions.values().cloned().collect())
    }

    async fn hybrid_session(
        &self,
        stream_id: &str,
        session_id: &str,
    ) -> Result<Option<HybridSessionRecord>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .hybrid_sessions
            .get(&(stream_id.to_string(), session_id.to_string()))
            .cloned())
    }

    async fn set_hybrid_session(&self, record: HybridSessionRecord) -> Result<(), Self::Error> {
        let mut inner = self.inner.write().await;
        inner.hybrid_sessions.insert(
            (record.stream_id.clone(), record.session_id.clone()),
            record,
        );
        Ok(())
    }

    async fn hybrid_sessions_for_stream(
        &self,
        stream_id: &str,
    ) -> Result<Vec<HybridSessionRecord>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .hybrid_sessions
            .range(
                (stream_id.to_string(), String::new())
                    ..(format!("{stream_id}\u{0}"), String::new()),
            )
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn hybrid_sessions(&self) -> Result<Vec<HybridSessionRecord>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.hybrid_sessions.values().cloned().collect())
    }
}

impl DeviceStore for MemoryCryptoStore {
    type Error = Infallible;

    async fn upsert_device(&self, record: DeviceRecord) -> Result<bool, Self::Error> {
        let mut inner = self.inner.write().await;
        let key = (record.user_id.clone(), record.device_key.clone());
        let previous = inner.devices.insert(key.clone(), record.clone());
        if let Some(previous) = &previous {
            inner.device_expirations.remove(&(
                previous.expiration_timestamp,
                key.0.clone(),
                key.1.clone(),
            ));
        }
        inner
            .device_expirations
            .insert((record.expiration_timestamp, key.0, key.1));
        Ok(previous.is_none())
    }

    async fn devices(&self, user_id: &str) -> Result<Vec<DeviceRecord>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .devices
            .range(
                (user_id.to_string(), String::new())
                    ..(format!("{user_id}\u{0}"), String::new()),
            )
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn sharing_targets(
        &self,
        user_id: &str,
        now_ms: u64,
    ) -> Result<Vec<DeviceRecord>, Self::Error> {
        let devices = self.devices(user_id).await?;
        Ok(devices
            .into_iter()
            .filter(|device| !device.is_expired(now_ms))
            .collect())
    }

    async fn remove_expired(&self, now_ms: u64) -> Result<usize, Self::Error> {
        let mut inner = self.inner.write().await;

        // Everything with an expiration timestamp at or before `now_ms` is expired. The empty
        // strings order before any real entry at the next timestamp.
        let expired: Vec<(u64, String, String)> = inner
            .device_expirations
            .range(..(now_ms.saturating_add(1), String::new(), String::new()))
            .cloned()
            .collect();

        for entry in &expired {
            inner
                .devices
                .remove(&(entry.1.clone(), entry.2.clone()));
            inner.device_expirations.remove(entry);
        }

        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::device::DeviceRecord;
    use crate::store::{
        DeviceStore, HybridSessionRecord, InboundSessionRecord, OutboundSessionRecord,
        SessionStore,
    };

    use super::MemoryCryptoStore;

    #[tokio::test]
    async fn account_round_trip() {
        let store = MemoryCryptoStore::new();
        assert!(store.account().await.unwrap().is_none());

        store.set_account(vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.account().await.unwrap(), Some(vec![1, 2, 3]));

        // Replaced wholesale.
        store.set_account(vec![4, 5]).await.unwrap();
        assert_eq!(store.account().await.unwrap(), Some(vec![4, 5]));
    }

    #[tokio::test]
    async fn one_outbound_session_per_stream() {
        let store = MemoryCryptoStore::new();

        let record = OutboundSessionRecord {
            stream_id: "stream-1".to_string(),
            session_id: "session-a".to_string(),
            pickle: vec![1],
            created_at_ms: 10,
            shared_with: BTreeSet::new(),
        };
        store.set_outbound_session(record.clone()).await.unwrap();

        let rotated = OutboundSessionRecord {
            session_id: "session-b".to_string(),
            ..record
        };
        store.set_outbound_session(rotated).await.unwrap();

        let current = store.outbound_session("stream-1").await.unwrap().unwrap();
        assert_eq!(current.session_id, "session-b");
        assert!(store.outbound_session("stream-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inbound_sessions_keyed_by_stream_and_session() {
        let store = MemoryCryptoStore::new();

        for (stream_id, session_id) in [
            ("stream-1", "session-a"),
            ("stream-1", "session-b"),
            ("stream-2", "session-c"),
        ] {
            store
                .set_inbound_session(InboundSessionRecord {
                    stream_id: stream_id.to_string(),
                    session_id: session_id.to_string(),
                    pickle: vec![1],
                    keys_claimed: Default::default(),
                    untrusted: false,
                })
                .await
                .unwrap();
        }

        assert!(
            store
                .inbound_session("stream-1", "session-a")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            store
                .inbound_session("stream-2", "session-a")
                .await
                .unwrap()
                .is_none()
        );

        let ids = store.inbound_session_ids("stream-1").await.unwrap();
        assert_eq!(ids, vec!["session-a".to_string(), "session-b".to_string()]);
    }

    #[tokio::test]
    async fn hybrid_sessions_scan_by_stream() {
        let store = MemoryCryptoStore::new();

        for (session_id, epoch) in [("session-a", 1), ("session-b", 3)] {
            store
                .set_hybrid_session(HybridSessionRecord {
                    stream_id: "stream-1".to_string(),
                    session_id: session_id.to_string(),
                    session_key: vec![0; 32],
                    epoch,
                })
                .await
                .unwrap();
        }

        let sessions = store.hybrid_sessions_for_stream("stream-1").await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(
            store
                .hybrid_sessions_for_stream("stream-2")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn device_upsert_is_idempotent() {
        let store = MemoryCryptoStore::new();

        let device = DeviceRecord::new("alice", "aa00", None, 1_000);
        assert!(store.upsert_device(device.clone()).await.unwrap());
        assert!(!store.upsert_device(device).await.unwrap());

        assert_eq!(store.devices("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sharing_targets_exclude_expired() {
        let store = MemoryCryptoStore::new();

        store
            .upsert_device(DeviceRecord::new("alice", "aa00", None, 1_000))
            .await
            .unwrap();
        store
            .upsert_device(DeviceRecord::new("alice", "bb11", None, 5_000))
            .await
            .unwrap();

        // Expired devices stay queryable for attribution.
        assert_eq!(store.devices("alice").await.unwrap().len(), 2);

        let targets = store.sharing_targets("alice", 2_000).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].device_key, "bb11");
    }

    #[tokio::test]
    async fn remove_expired_counts_and_respects_reannouncement() {
        let store = MemoryCryptoStore::new();

        store
            .upsert_device(DeviceRecord::new("alice", "aa00", None, 1_000))
            .await
            .unwrap();
        store
            .upsert_device(DeviceRecord::new("bob", "cc22", None, 3_000))
            .await
            .unwrap();

        // Re-announcing extends the lifetime, the old index entry must not linger.
        store
            .upsert_device(DeviceRecord::new("alice", "aa00", None, 9_000))
            .await
            .unwrap();

        assert_eq!(store.remove_expired(5_000).await.unwrap(), 1);
        assert_eq!(store.devices("alice").await.unwrap().len(), 1);
        assert!(store.devices("bob").await.unwrap().is_empty());

        assert_eq!(store.remove_expired(5_000).await.unwrap(), 0);
    }
}
