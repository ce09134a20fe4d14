//! Core type definitions for pagecrypt.

use pagecrypt_storage::PageNumber;
use std::fmt;
use uuid::Uuid;

/// Identity of one attachment (session) to the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentId(Uuid);

impl AttachmentId {
    /// Creates a fresh random attachment ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AttachmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "att:{}", self.0)
    }
}

/// Identity of a lock owner.
///
/// Each coordinator (one per process sharing the database) owns locks
/// under its own ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockOwnerId(pub u64);

impl LockOwnerId {
    /// Creates a new owner ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockOwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner:{}", self.0)
    }
}

/// Encryption state of a database, derived from the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionState {
    /// All pages are plaintext.
    Plain,
    /// All eligible pages are encrypted.
    Encrypted,
    /// A sweep is converting pages towards `target_encrypted`.
    ///
    /// Every page below `checkpoint` already matches the target.
    Transitioning {
        /// Whether the sweep is encrypting.
        target_encrypted: bool,
        /// First page not yet known to match the target.
        checkpoint: PageNumber,
    },
}

impl EncryptionState {
    /// Builds the state from the three persisted values.
    #[must_use]
    pub const fn from_parts(
        target_encrypted: bool,
        sweep_active: bool,
        checkpoint: PageNumber,
    ) -> Self {
        match (sweep_active, target_encrypted) {
            (true, _) => Self::Transitioning {
                target_encrypted,
                checkpoint,
            },
            (false, true) => Self::Encrypted,
            (false, false) => Self::Plain,
        }
    }

    /// Returns whether a sweep is pending or running.
    #[must_use]
    pub const fn is_transitioning(&self) -> bool {
        matches!(self, Self::Transitioning { .. })
    }
}

impl fmt::Display for EncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Encrypted => write!(f, "encrypted"),
            Self::Transitioning {
                target_encrypted: true,
                checkpoint,
            } => write!(f, "encrypting from {checkpoint}"),
            Self::Transitioning {
                target_encrypted: false,
                checkpoint,
            } => write!(f, "decrypting from {checkpoint}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_ids_are_unique() {
        assert_ne!(AttachmentId::new(), AttachmentId::new());
    }

    #[test]
    fn state_from_parts() {
        assert_eq!(
            EncryptionState::from_parts(false, false, PageNumber::new(7)),
            EncryptionState::Plain
        );
        assert_eq!(
            EncryptionState::from_parts(true, false, PageNumber::new(7)),
            EncryptionState::Encrypted
        );
        let state = EncryptionState::from_parts(true, true, PageNumber::new(3));
        assert!(state.is_transitioning());
        assert_eq!(state.to_string(), "encrypting from page:3");
    }
}
