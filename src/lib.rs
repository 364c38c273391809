// SPDX-License-Identifier: MIT OR Apache-2.0

//! `estuary-encryption` provides the group-session encryption and device-identity core for
//! decentralised, end-to-end encrypted streams.
//!
//! Every conversation ("stream") is encrypted towards the devices of its members. A device is an
//! X25519 key-pair announced together with an expiry; a root wallet key authorizes the device by
//! signing a [delegate hash](crate::delegate) with its secp256k1 key, so stream nodes can verify
//! that an event signed by a device really acts on behalf of a user account.
//!
//! ## Two encryption schemes
//!
//! **Group encryption** ([`scheme::GroupEncryption`]) gives each stream a symmetric message
//! [ratchet], where the sender advances a chain key per message, receivers import the chain at the
//! index it was shared with them and can decrypt any later message, but nothing before it. The
//! session is rotated when a member leaves or when the configured message-count or age threshold
//! is reached, which bounds what any one session key can reveal.
//!
//! **Hybrid group encryption** ([`scheme::HybridGroupEncryption`]) keeps one long-lived
//! AES-256-GCM key per stream and key epoch. It trades the ratchet's forward secrecy for cheap
//! reads in streams with large memberships, late joiners receive the current epoch keys and can
//! read the backlog of that epoch.
//!
//! Both schemes deliver session keys by [sealing](crate::crypto::seal) them towards each
//! receiving device's announced key and produce the same wire envelope, so receivers dispatch on
//! the envelope's algorithm alone (see [`scheme::GroupDecryption`]).
//!
//! ## State and persistence
//!
//! All session state lives behind the [`store::SessionStore`] and [`store::DeviceStore`] traits.
//! Secret-bearing state (the device [account](crate::account::Account) and ratchet sessions) is
//! persisted "pickled": CBOR-encoded and sealed under a passphrase-derived AES key, so a stolen
//! database alone reveals no key material. [`store::MemoryCryptoStore`] is the bundled in-memory
//! implementation.
//!
//! ## Robustness
//!
//! The crate is built for unreliable delivery: messages decrypt out of order and with gaps,
//! importing the same session key twice is a no-op, an import can only ever improve what a
//! device can decrypt, and decryption failures are typed
//! ([`scheme::DecryptionError`]) so callers can tell a recoverable missing session from a
//! terminal failure.
//!
//! [ratchet]: crate::ratchet
pub mod account;
mod cbor;
pub mod crypto;
pub mod delegate;
pub mod device;
pub mod engine;
pub mod ratchet;
pub mod scheme;
pub mod store;

pub use account::Account;
pub use crypto::{Rng, RngError};
pub use delegate::{Address, DelegateError, check_delegate_sig, recover_delegator_address};
pub use device::DeviceRecord;
pub use engine::{EncryptionEngine, EngineError, ImportOutcome};
pub use ratchet::{GroupSessionKey, InboundGroupSession, OutboundGroupSession, RatchetMessage};
pub use scheme::{
    AlgorithmId, DecryptionError, Decryptor, EncryptedEnvelope, EncryptionConfig, EncryptionError,
    Encryptor, GroupDecryption, GroupEncryption, HybridGroupEncryption, WrappedSessionKey,
};
pub use store::{MemoryCryptoStore, SessionStore};
