//! Physical backup state, as seen by the encryption coordinator.
//!
//! Encryption changes and physical page-copy backups exclude each other:
//! a transition cannot be prepared and the sweep pauses while a backup is
//! running.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of the physical backup subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    /// No backup is running.
    Normal,
    /// A backup is copying pages; writes go to a delta.
    Stalled,
    /// The delta is being merged back.
    Merge,
}

impl BackupState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Stalled => 1,
            Self::Merge => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Stalled,
            2 => Self::Merge,
            _ => Self::Normal,
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Stalled => write!(f, "stalled"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Read access to the backup state.
pub trait BackupStateReader: Send + Sync {
    /// Returns the current state.
    fn state(&self) -> BackupState;
}

/// A backup state held in memory and switched by the backup subsystem.
#[derive(Debug)]
pub struct SharedBackupState(AtomicU8);

impl Default for SharedBackupState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedBackupState {
    /// Creates a reader in the normal state.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU8::new(BackupState::Normal.as_u8()))
    }

    /// Switches the state.
    pub fn set(&self, state: BackupState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

impl BackupStateReader for SharedBackupState {
    fn state(&self) -> BackupState {
        BackupState::from_u8(self.0.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switches_state() {
        let backup = SharedBackupState::new();
        assert_eq!(backup.state(), BackupState::Normal);
        backup.set(BackupState::Stalled);
        assert_eq!(backup.state(), BackupState::Stalled);
        assert_eq!(backup.state().to_string(), "stalled");
        backup.set(BackupState::Normal);
        assert_eq!(backup.state(), BackupState::Normal);
    }
}
