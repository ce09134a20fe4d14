//! File-based page store for persistent storage.

use crate::backend::PageStore;
use crate::error::{StorageError, StorageResult};
use crate::page::{PageNumber, MIN_PAGE_SIZE};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based page store.
///
/// Pages are laid out back to back: page `n` lives at byte offset
/// `n * page_size`. Data survives process restarts.
///
/// # Durability
///
/// - `write_page()` hands the page to the OS
/// - `sync()` calls `File::sync_all()` to ensure data is on disk
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
/// Internal locking serializes seeks on the shared file handle.
///
/// # Example
///
/// ```no_run
/// use pagecrypt_storage::{FilePageStore, PageNumber, PageStore};
/// use std::path::Path;
///
/// let store = FilePageStore::open(Path::new("db.pages"), 4096).unwrap();
/// store.write_page(PageNumber::new(0), &vec![0u8; 4096]).unwrap();
/// store.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FilePageStore {
    path: PathBuf,
    page_size: usize,
    file: RwLock<File>,
    pages: RwLock<u32>,
}

impl FilePageStore {
    /// Opens or creates a page file at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be opened or created
    /// - `page_size` is below the minimum
    /// - The existing file length is not a whole number of pages
    pub fn open(path: &Path, page_size: usize) -> StorageResult<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(StorageError::InvalidPageSize {
                expected: MIN_PAGE_SIZE,
                actual: page_size,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len % page_size as u64 != 0 {
            return Err(StorageError::Corrupted(format!(
                "file length {len} is not a multiple of page size {page_size}"
            )));
        }
        let pages = u32::try_from(len / page_size as u64)
            .map_err(|_| StorageError::Corrupted(format!("file too large: {len} bytes")))?;

        Ok(Self {
            path: path.to_path_buf(),
            page_size,
            file: RwLock::new(file),
            pages: RwLock::new(pages),
        })
    }

    /// Opens or creates a page file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path, page_size: usize) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path, page_size)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page: PageNumber) -> StorageResult<Vec<u8>> {
        let count = *self.pages.read();
        if page.as_u32() >= count {
            return Err(StorageError::PageOutOfRange {
                page: page.as_u32(),
                count,
            });
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(page.offset(self.page_size)))?;

        let mut buffer = vec![0u8; self.page_size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    fn write_page(&self, page: PageNumber, data: &[u8]) -> StorageResult<()> {
        if data.len() != self.page_size {
            return Err(StorageError::InvalidPageSize {
                expected: self.page_size,
                actual: data.len(),
            });
        }

        let mut file = self.file.write();
        let mut count = self.pages.write();

        if page.as_u32() > *count {
            return Err(StorageError::PageOutOfRange {
                page: page.as_u32(),
                count: *count,
            });
        }

        file.seek(SeekFrom::Start(page.offset(self.page_size)))?;
        file.write_all(data)?;
        if page.as_u32() == *count {
            *count += 1;
        }

        Ok(())
    }

    fn page_count(&self) -> StorageResult<u32> {
        Ok(*self.pages.read())
    }

    fn sync(&self) -> StorageResult<()> {
        let mut file = self.file.write();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SIZE: usize = MIN_PAGE_SIZE;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pages");

        let store = FilePageStore::open(&path, SIZE).unwrap();
        assert_eq!(store.page_count().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pages");

        let store = FilePageStore::open(&path, SIZE).unwrap();
        store.write_page(PageNumber::new(0), &vec![1u8; SIZE]).unwrap();
        store.write_page(PageNumber::new(1), &vec![2u8; SIZE]).unwrap();

        assert_eq!(store.page_count().unwrap(), 2);
        assert_eq!(store.read_page(PageNumber::new(0)).unwrap(), vec![1u8; SIZE]);
        assert_eq!(store.read_page(PageNumber::new(1)).unwrap(), vec![2u8; SIZE]);
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pages");

        let store = FilePageStore::open(&path, SIZE).unwrap();
        store.write_page(PageNumber::new(0), &vec![1u8; SIZE]).unwrap();

        let result = store.read_page(PageNumber::new(4));
        assert!(matches!(result, Err(StorageError::PageOutOfRange { page: 4, count: 1 })));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pages");

        {
            let store = FilePageStore::open(&path, SIZE).unwrap();
            store.write_page(PageNumber::new(0), &vec![0xAB; SIZE]).unwrap();
            store.sync().unwrap();
        }

        {
            let store = FilePageStore::open(&path, SIZE).unwrap();
            assert_eq!(store.page_count().unwrap(), 1);
            assert_eq!(store.read_page(PageNumber::new(0)).unwrap()[SIZE - 1], 0xAB);
        }
    }

    #[test]
    fn file_partial_page_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.pages");
        std::fs::write(&path, vec![0u8; SIZE + 3]).unwrap();

        let result = FilePageStore::open(&path, SIZE);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("db.pages");

        let store = FilePageStore::open_with_create_dirs(&path, SIZE).unwrap();
        assert_eq!(store.path(), path);
        assert!(path.exists());
    }
}
