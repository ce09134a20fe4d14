//! # pagecrypt Storage
//!
//! Page-addressed storage for pagecrypt.
//!
//! This crate provides the lowest-level storage abstraction. Page stores are
//! **opaque page arrays** - they read and write fixed-size page images and
//! leave all interpretation, including encryption, to the layers above.
//!
//! ## Design Principles
//!
//! - Stores are simple page arrays (read, write, grow by one, sync)
//! - The 16-byte page header (type, flags, generation) is never encrypted
//! - Must be `Send + Sync`; one store is shared by every attachment
//!
//! ## Available Stores
//!
//! - [`InMemoryPageStore`] - For testing and ephemeral databases
//! - [`FilePageStore`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use pagecrypt_storage::{InMemoryPageStore, Page, PageNumber, PageStore, PageType};
//!
//! let store = InMemoryPageStore::new(4096).unwrap();
//! let page = Page::new(PageType::Data, 4096).unwrap();
//! store.write_page(PageNumber::new(0), page.as_bytes()).unwrap();
//! assert_eq!(store.page_count().unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod page;

pub use backend::PageStore;
pub use error::{StorageError, StorageResult};
pub use file::FilePageStore;
pub use memory::InMemoryPageStore;
pub use page::{
    Page, PageFlags, PageNumber, PageType, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HEADER_SIZE,
};
