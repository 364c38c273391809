// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error as StdError;

use thiserror::Error;

/// Errors on the decryption path.
///
/// The variants are the machine-readable taxonomy callers drive recovery with:
/// [`DecryptionError::SessionNotFound`] triggers a key re-request and leaves the event pending,
/// everything else is terminal for the event. [`DecryptionError::code`] exposes the stable
/// string codes.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// A required envelope field is missing, detected before any session lookup.
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(&'static str),

    /// The envelope names an algorithm this implementation does not handle.
    #[error("unsupported encryption algorithm \"{0}\"")]
    UnsupportedAlgorithm(String),

    /// No session under this id is known for the stream. Recoverable by requesting the key.
    #[error("no session {session_id} known for stream {stream_id}")]
    SessionNotFound {
        stream_id: String,
        session_id: String,
    },

    /// A session was found but the ciphertext did not decrypt under it.
    #[error("decryption failed for stream {stream_id}: {reason}")]
    DecryptFailed { stream_id: String, reason: String },

    /// Importing shared session key material failed. Isolated per session, other sessions are
    /// unaffected.
    #[error("session import failed for stream {stream_id}: {reason}")]
    ImportFailed { stream_id: String, reason: String },

    /// The backing store failed.
    #[error("store error for stream {stream_id}: {source}")]
    Store {
        stream_id: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl DecryptionError {
    pub fn code(&self) -> &'static str {
        match self {
            DecryptionError::MalformedCiphertext(_) => "MALFORMED_CIPHERTEXT",
            DecryptionError::UnsupportedAlgorithm(_) => "UNSUPPORTED_ALGORITHM",
            DecryptionError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            DecryptionError::DecryptFailed { .. } => "DECRYPT_FAILED",
            DecryptionError::ImportFailed { .. } => "IMPORT_FAILED",
            DecryptionError::Store { .. } => "STORE_ERROR",
        }
    }
}

/// Errors on the encryption path.
#[derive(Debug, Error)]
pub enum EncryptionError {
    /// The caller cancelled the operation during fan-out.
    #[error("encryption cancelled")]
    Cancelled,

    /// The session engine or its store failed.
    #[error("engine error for stream {stream_id}: {source}")]
    Engine {
        stream_id: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The stream client collaborator failed.
    #[error("client error for stream {stream_id}: {source}")]
    Client {
        stream_id: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl EncryptionError {
    pub(crate) fn engine(
        stream_id: &str,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        EncryptionError::Engine {
            stream_id: stream_id.to_string(),
            source: Box::new(source),
        }
    }

    pub(crate) fn client(
        stream_id: &str,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        EncryptionError::Client {
            stream_id: stream_id.to_string(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DecryptionError;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            DecryptionError::MalformedCiphertext("missing sender key").code(),
            "MALFORMED_CIPHERTEXT"
        );
        assert_eq!(
            DecryptionError::SessionNotFound {
                stream_id: "stream-1".to_string(),
                session_id: "session-a".to_string(),
            }
            .code(),
            "SESSION_NOT_FOUND"
        );
        assert_eq!(
            DecryptionError::DecryptFailed {
                stream_id: "stream-1".to_string(),
                reason: "bad mac".to_string(),
            }
            .code(),
            "DECRYPT_FAILED"
        );
        assert_eq!(
            DecryptionError::ImportFailed {
                stream_id: "stream-1".to_string(),
                reason: "bad key".to_string(),
            }
            .code(),
            "IMPORT_FAILED"
        );
    }
}
