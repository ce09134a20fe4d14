//! # pagecrypt Core
//!
//! Online encryption and decryption of a live, shared page database.
//!
//! This crate provides:
//! - The [`EncryptionCoordinator`], one per process, which owns the encryption
//!   state, intercepts every page read and write, and keeps processes in step
//! - A [`Barrier`] that lets page I/O run concurrently but drains it before a
//!   state change, with remote notifications settled at the next I/O
//! - A [`KeyHolderRegistry`] that checks every attachment can supply the key
//! - A background [`SweepWorker`] that rewrites pages until every page matches
//!   the target, with checkpoints so it resumes after a crash
//! - The signed encryption header ([`HeaderRecord`])
//!
//! ## Design Principles
//!
//! - Pages are converted lazily: the intercept decrypts by the page's own
//!   encrypted bit and encrypts by the current target, so a half-swept
//!   database is always readable
//! - Cross-process coordination goes through an injected [`LockClient`];
//!   blocking ASTs arrive as channel messages
//! - Providers and key holders are plugins looked up by name in a
//!   [`PluginRegistry`]
//!
//! ## Example
//!
//! ```rust
//! use pagecrypt_core::{
//!     AttachmentConfig, CryptConfig, CryptDatabase, EncryptionState, KeyMaterial,
//! };
//! use pagecrypt_storage::PageType;
//!
//! let db = CryptDatabase::open_in_memory(CryptConfig::new().page_size(1024)).unwrap();
//! let session = db
//!     .attach(
//!         &AttachmentConfig::new()
//!             .key_holder("StaticKeys")
//!             .key("red", KeyMaterial::generate()),
//!     )
//!     .unwrap();
//!
//! let page = db.allocate(session, PageType::Data).unwrap();
//! db.encrypt(session, "Sample", "red").unwrap();
//! db.wait_for_sweep().unwrap();
//!
//! assert_eq!(db.coordinator().state(), EncryptionState::Encrypted);
//! assert!(db.read_page(session, page).unwrap().is_encrypted());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod barrier;
mod cache;
mod config;
mod coordinator;
mod database;
mod error;
mod header;
mod keyholder;
mod lock;
pub mod provider;
mod stats;
mod sweep;
mod types;

pub use backup::{BackupState, BackupStateReader, SharedBackupState};
pub use barrier::{Barrier, BarrierSync, ExclusiveGuard, IoGuard, OwnerToken, BARRIER_SPAN};
pub use cache::{BufferCache, FetchMode, PageCache};
pub use config::{AttachmentConfig, CryptConfig};
pub use coordinator::{EncryptionCoordinator, PreparedTransition, TransitionRequest};
pub use database::CryptDatabase;
pub use error::{CryptError, CryptResult, ErrorKind};
pub use header::{
    validation_hash, EntryTag, HeaderRecord, UnknownEntry, HEADER_MAGIC, HEADER_VERSION,
    MAX_KEY_NAME, MAX_PLUGIN_NAME, VALIDATION_PROBE,
};
pub use keyholder::{AttachmentStatus, KeyHolderRegistry, ValidationReport};
pub use lock::{
    BlockingAst, LocalLockClient, LocalLockManager, LockClient, LockLevel, LockResource, LockWait,
};
pub use provider::{EncryptionProvider, KeyHolder, KeyMaterial, PluginRegistry};
pub use stats::{CryptStats, StatsSnapshot};
pub use sweep::{SweepOutcome, SweepWorker};
pub use types::{AttachmentId, EncryptionState, LockOwnerId};
