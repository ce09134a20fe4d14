//! Error types for the encryption coordinator.

use crate::types::AttachmentId;
use thiserror::Error;

/// Result type for coordinator operations.
pub type CryptResult<T> = Result<T, CryptError>;

/// Broad class of a [`CryptError`].
///
/// Page I/O callers only need to tell storage failures from cryptographic
/// ones; administrative callers also care about the synchronous classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested transition is not allowed in the current state.
    Precondition,
    /// A named plugin or key could not be found.
    Configuration,
    /// Persisted encryption metadata failed validation.
    Validation,
    /// The underlying page store failed.
    Io,
    /// The encryption provider or its key failed.
    Crypt,
    /// Locking, shutdown or misuse of the API.
    Internal,
}

/// Errors that can occur in coordinator operations.
#[derive(Debug, Error)]
pub enum CryptError {
    /// Page store error.
    #[error("storage error: {0}")]
    Storage(#[from] pagecrypt_storage::StorageError),

    /// The database is already in (or heading to) the requested state.
    #[error("database is already in the requested state (encrypted: {encrypted})")]
    AlreadyInState {
        /// The current target state.
        encrypted: bool,
    },

    /// A sweep from an earlier transition has not finished.
    #[error("encryption state change already in progress")]
    TransitionInProgress,

    /// Physical backup is not in the normal state.
    #[error("physical backup state is {state}, expected normal")]
    BackupActive {
        /// Name of the current backup state.
        state: String,
    },

    /// Plugin name does not fit the header field.
    #[error("plugin name is {len} bytes, maximum is {max}")]
    PluginNameTooLong {
        /// Actual length.
        len: usize,
        /// Maximum length.
        max: usize,
    },

    /// Key name does not fit a header entry.
    #[error("key name is {len} bytes, maximum is {max}")]
    KeyNameTooLong {
        /// Actual length.
        len: usize,
        /// Maximum length.
        max: usize,
    },

    /// No encryption provider is registered under the name.
    #[error("encryption provider not found: {name}")]
    ProviderNotFound {
        /// Requested provider name.
        name: String,
    },

    /// No key-holder plugin is registered under the name.
    #[error("key holder not found: {name}")]
    KeyHolderNotFound {
        /// Requested key-holder name.
        name: String,
    },

    /// One or more attachments cannot supply the key.
    #[error("key {key} is missing for {} attachment(s)", .attachments.len())]
    MissingKey {
        /// Key name being validated.
        key: String,
        /// Attachments that failed validation.
        attachments: Vec<AttachmentId>,
    },

    /// The loaded key does not reproduce the stored validation hash.
    #[error("key mismatch for plugin {plugin}, key {key}")]
    KeyMismatch {
        /// Plugin named in the header.
        plugin: String,
        /// Key named in the header.
        key: String,
    },

    /// The header signature does not match its contents.
    #[error("encryption header is corrupted or was tampered with")]
    HeaderTampered,

    /// The header page could not be decoded.
    #[error("invalid encryption header: {message}")]
    InvalidHeader {
        /// Description of the problem.
        message: String,
    },

    /// The provider failed to transform data.
    #[error("crypt failure: {message}")]
    Crypt {
        /// Description of the failure.
        message: String,
    },

    /// Pages need a key but no provider is loaded.
    #[error("no encryption key available for {plugin}")]
    KeyUnavailable {
        /// Plugin required by the header.
        plugin: String,
    },

    /// A lock could not be granted in time.
    #[error("lock wait timed out on {resource}")]
    LockTimeout {
        /// The lock resource.
        resource: String,
    },

    /// The attachment is unknown.
    #[error("attachment not found: {0}")]
    AttachmentNotFound(AttachmentId),

    /// The attachment was force-disconnected because it lost its key.
    #[error("attachment {0} was disconnected: it cannot supply the database key")]
    AttachmentDisconnected(AttachmentId),

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The coordinator is shutting down.
    #[error("encryption coordinator is shut down")]
    Shutdown,
}

impl CryptError {
    /// Returns the broad class of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyInState { .. }
            | Self::TransitionInProgress
            | Self::BackupActive { .. }
            | Self::PluginNameTooLong { .. }
            | Self::KeyNameTooLong { .. } => ErrorKind::Precondition,
            Self::ProviderNotFound { .. }
            | Self::KeyHolderNotFound { .. }
            | Self::MissingKey { .. } => ErrorKind::Configuration,
            Self::KeyMismatch { .. } | Self::HeaderTampered | Self::InvalidHeader { .. } => {
                ErrorKind::Validation
            }
            Self::Storage(_) => ErrorKind::Io,
            Self::Crypt { .. } | Self::KeyUnavailable { .. } => ErrorKind::Crypt,
            Self::LockTimeout { .. }
            | Self::AttachmentNotFound(_)
            | Self::AttachmentDisconnected(_)
            | Self::InvalidOperation { .. }
            | Self::Shutdown => ErrorKind::Internal,
        }
    }

    /// Returns whether this is a cryptographic failure.
    #[must_use]
    pub fn is_crypt(&self) -> bool {
        self.kind() == ErrorKind::Crypt
    }

    /// Creates a crypt failure.
    pub fn crypt(message: impl Into<String>) -> Self {
        Self::Crypt {
            message: message.into(),
        }
    }

    /// Creates an invalid header error.
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a provider-not-found error.
    pub fn provider_not_found(name: impl Into<String>) -> Self {
        Self::ProviderNotFound { name: name.into() }
    }

    /// Creates a key-holder-not-found error.
    pub fn key_holder_not_found(name: impl Into<String>) -> Self {
        Self::KeyHolderNotFound { name: name.into() }
    }

    /// Creates a lock timeout error.
    pub fn lock_timeout(resource: impl Into<String>) -> Self {
        Self::LockTimeout {
            resource: resource.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagecrypt_storage::StorageError;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            CryptError::AlreadyInState { encrypted: true }.kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            CryptError::provider_not_found("X").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(CryptError::HeaderTampered.kind(), ErrorKind::Validation);
        assert_eq!(
            CryptError::from(StorageError::Closed).kind(),
            ErrorKind::Io
        );
        assert!(CryptError::crypt("bad block").is_crypt());
        assert_eq!(CryptError::Shutdown.kind(), ErrorKind::Internal);
    }

    #[test]
    fn messages_are_readable() {
        let err = CryptError::AlreadyInState { encrypted: false };
        assert_eq!(
            err.to_string(),
            "database is already in the requested state (encrypted: false)"
        );

        let err = CryptError::PluginNameTooLong { len: 40, max: 31 };
        assert_eq!(err.to_string(), "plugin name is 40 bytes, maximum is 31");
    }
}
