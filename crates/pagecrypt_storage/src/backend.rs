//! Page store trait definition.

use crate::error::StorageResult;
use crate::page::PageNumber;

/// A low-level, page-addressed store.
///
/// Page stores are **opaque**: they read and write fixed-size page images
/// and do not interpret the page header. The encryption coordinator sits
/// above the store and decides what bytes reach it.
///
/// # Invariants
///
/// - Every buffer passed to or returned from a store is exactly
///   [`page_size`](Self::page_size) bytes
/// - `read_page` returns exactly the bytes last written to that page
/// - Writing page `page_count()` grows the store by one page
/// - Stores are shared between attachments and must be `Send + Sync`
///
/// # Implementors
///
/// - [`super::InMemoryPageStore`] - For testing
/// - [`super::FilePageStore`] - For persistent storage
pub trait PageStore: Send + Sync {
    /// Returns the fixed page size in bytes.
    fn page_size(&self) -> usize;

    /// Reads one page image.
    ///
    /// # Errors
    ///
    /// Returns an error if the page does not exist or an I/O error occurs.
    fn read_page(&self, page: PageNumber) -> StorageResult<Vec<u8>>;

    /// Writes one page image.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The buffer is not exactly one page
    /// - The page lies beyond the end of the store by more than one page
    /// - An I/O error occurs
    fn write_page(&self, page: PageNumber, data: &[u8]) -> StorageResult<()>;

    /// Returns the number of pages currently in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn page_count(&self) -> StorageResult<u32>;

    /// Makes all written pages durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;
}
