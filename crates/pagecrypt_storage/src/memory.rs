//! In-memory page store for testing.

use crate::backend::PageStore;
use crate::error::{StorageError, StorageResult};
use crate::page::{PageNumber, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
use parking_lot::RwLock;

/// An in-memory page store.
///
/// This store keeps all pages in memory and is suitable for:
/// - Unit tests
/// - Integration tests that share one store between several coordinators
/// - Ephemeral databases that don't need persistence
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use pagecrypt_storage::{InMemoryPageStore, PageNumber, PageStore};
///
/// let store = InMemoryPageStore::new(4096).unwrap();
/// store.write_page(PageNumber::new(0), &vec![7u8; 4096]).unwrap();
/// assert_eq!(store.page_count().unwrap(), 1);
/// assert_eq!(store.read_page(PageNumber::new(0)).unwrap()[0], 7);
/// ```
#[derive(Debug)]
pub struct InMemoryPageStore {
    page_size: usize,
    pages: RwLock<Vec<Vec<u8>>>,
}

impl Default for InMemoryPageStore {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pages: RwLock::new(Vec::new()),
        }
    }
}

impl InMemoryPageStore {
    /// Creates a new empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if `page_size` is below [`MIN_PAGE_SIZE`].
    pub fn new(page_size: usize) -> StorageResult<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(StorageError::InvalidPageSize {
                expected: MIN_PAGE_SIZE,
                actual: page_size,
            });
        }
        Ok(Self {
            page_size,
            pages: RwLock::new(Vec::new()),
        })
    }

    /// Returns a copy of every page.
    ///
    /// Useful for asserting byte-identical state in tests.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.pages.read().clone()
    }

    /// Overwrites a page without any checks.
    ///
    /// Test hook for simulating corruption or torn writes.
    pub fn poke(&self, page: PageNumber, data: Vec<u8>) {
        let mut pages = self.pages.write();
        let index = page.as_u32() as usize;
        if index < pages.len() {
            pages[index] = data;
        }
    }
}

impl PageStore for InMemoryPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page: PageNumber) -> StorageResult<Vec<u8>> {
        let pages = self.pages.read();
        pages
            .get(page.as_u32() as usize)
            .cloned()
            .ok_or(StorageError::PageOutOfRange {
                page: page.as_u32(),
                count: u32::try_from(pages.len()).unwrap_or(u32::MAX),
            })
    }

    fn write_page(&self, page: PageNumber, data: &[u8]) -> StorageResult<()> {
        if data.len() != self.page_size {
            return Err(StorageError::InvalidPageSize {
                expected: self.page_size,
                actual: data.len(),
            });
        }

        let mut pages = self.pages.write();
        let index = page.as_u32() as usize;
        match index.cmp(&pages.len()) {
            std::cmp::Ordering::Less => pages[index].copy_from_slice(data),
            std::cmp::Ordering::Equal => pages.push(data.to_vec()),
            std::cmp::Ordering::Greater => {
                return Err(StorageError::PageOutOfRange {
                    page: page.as_u32(),
                    count: u32::try_from(pages.len()).unwrap_or(u32::MAX),
                })
            }
        }
        Ok(())
    }

    fn page_count(&self) -> StorageResult<u32> {
        Ok(u32::try_from(self.pages.read().len()).unwrap_or(u32::MAX))
    }

    fn sync(&self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }
}
