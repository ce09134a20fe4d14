//! Page numbering and the fixed page header.
//!
//! Every page starts with a 16-byte header that is never transformed:
//!
//! ```text
//! | type (1) | flags (1) | reserved (2) | generation (4) | reserved (8) | payload... |
//! ```
//!
//! Only the payload is handed to an encryption provider, so the page type
//! and the encrypted bit stay readable no matter what state the page is in.

use crate::error::{StorageError, StorageResult};
use std::fmt;

/// Size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Smallest page size a store accepts.
pub const MIN_PAGE_SIZE: usize = 512;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

const TYPE_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const GENERATION_OFFSET: usize = 4;

/// Number of a page within a database.
///
/// Page 0 is always the header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageNumber(pub u32);

impl PageNumber {
    /// The database header page.
    pub const HEADER: Self = Self(0);

    /// The first page a sweep visits.
    pub const FIRST: Self = Self(1);

    /// Creates a new page number.
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Returns the raw page number.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the following page number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns the byte offset of this page in a store with `page_size` pages.
    #[must_use]
    pub const fn offset(self, page_size: usize) -> u64 {
        self.0 as u64 * page_size as u64
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

/// Class of a page, stored in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    /// Never written, or unknown type byte.
    Undefined = 0,
    /// Database header page.
    Header = 1,
    /// Page allocation inventory.
    PageInventory = 2,
    /// Transaction state inventory.
    TransactionInventory = 3,
    /// Relation pointer page.
    Pointer = 4,
    /// Record data page.
    Data = 5,
    /// Index root page.
    IndexRoot = 6,
    /// B-tree index page.
    Index = 7,
    /// Blob page.
    Blob = 8,
    /// Generator (sequence) page.
    Generator = 9,
}

impl PageType {
    /// Decodes a type byte. Unknown values map to [`PageType::Undefined`].
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Header,
            2 => Self::PageInventory,
            3 => Self::TransactionInventory,
            4 => Self::Pointer,
            5 => Self::Data,
            6 => Self::IndexRoot,
            7 => Self::Index,
            8 => Self::Blob,
            9 => Self::Generator,
            _ => Self::Undefined,
        }
    }

    /// Returns the type byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether pages of this class carry user data and are ever encrypted.
    ///
    /// Structural pages stay readable so the engine can walk the database
    /// without a key.
    #[must_use]
    pub const fn is_crypt_eligible(self) -> bool {
        matches!(self, Self::Data | Self::Index | Self::Blob)
    }
}

/// Bits of the page flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(pub u8);

impl PageFlags {
    /// Payload is stored encrypted.
    pub const ENCRYPTED: u8 = 0x01;

    /// Returns whether the encrypted bit is set.
    #[must_use]
    pub const fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }
}

/// An owned page image.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    bytes: Vec<u8>,
}

impl Page {
    /// Creates a zeroed page of the given type.
    ///
    /// # Errors
    ///
    /// Returns an error if `page_size` is smaller than [`MIN_PAGE_SIZE`].
    pub fn new(page_type: PageType, page_size: usize) -> StorageResult<Self> {
        check_page_size(page_size)?;
        let mut bytes = vec![0u8; page_size];
        bytes[TYPE_OFFSET] = page_type.as_u8();
        Ok(Self { bytes })
    }

    /// Wraps raw page bytes read from a store.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is shorter than a page header.
    pub fn from_bytes(bytes: Vec<u8>) -> StorageResult<Self> {
        check_page_size(bytes.len())?;
        Ok(Self { bytes })
    }

    /// Returns the page class.
    #[must_use]
    pub fn page_type(&self) -> PageType {
        PageType::from_u8(self.bytes[TYPE_OFFSET])
    }

    /// Returns the flags byte.
    #[must_use]
    pub fn flags(&self) -> PageFlags {
        PageFlags(self.bytes[FLAGS_OFFSET])
    }

    /// Returns whether the payload is stored encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.flags().is_encrypted()
    }

    /// Sets or clears the encrypted bit.
    pub fn set_encrypted(&mut self, encrypted: bool) {
        if encrypted {
            self.bytes[FLAGS_OFFSET] |= PageFlags::ENCRYPTED;
        } else {
            self.bytes[FLAGS_OFFSET] &= !PageFlags::ENCRYPTED;
        }
    }

    /// Returns the write generation counter.
    #[must_use]
    pub fn generation(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[GENERATION_OFFSET..GENERATION_OFFSET + 4]);
        u32::from_le_bytes(raw)
    }

    /// Increments the write generation counter.
    pub fn bump_generation(&mut self) {
        let next = self.generation().wrapping_add(1);
        self.bytes[GENERATION_OFFSET..GENERATION_OFFSET + 4].copy_from_slice(&next.to_le_bytes());
    }

    /// Returns the bytes after the page header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[PAGE_HEADER_SIZE..]
    }

    /// Returns the bytes after the page header, mutably.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[PAGE_HEADER_SIZE..]
    }

    /// Returns the full page image.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the page, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Returns the page size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; pages are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("type", &self.page_type())
            .field("encrypted", &self.is_encrypted())
            .field("generation", &self.generation())
            .field("len", &self.bytes.len())
            .finish()
    }
}

fn check_page_size(size: usize) -> StorageResult<()> {
    if size < MIN_PAGE_SIZE {
        return Err(StorageError::InvalidPageSize {
            expected: MIN_PAGE_SIZE,
            actual: size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_has_type_and_clear_flags() {
        let page = Page::new(PageType::Data, DEFAULT_PAGE_SIZE).unwrap();
        assert_eq!(page.page_type(), PageType::Data);
        assert!(!page.is_encrypted());
        assert_eq!(page.len(), DEFAULT_PAGE_SIZE);
        assert_eq!(page.payload().len(), DEFAULT_PAGE_SIZE - PAGE_HEADER_SIZE);
    }

    #[test]
    fn encrypted_bit_toggles_without_touching_type() {
        let mut page = Page::new(PageType::Blob, MIN_PAGE_SIZE).unwrap();
        page.set_encrypted(true);
        assert!(page.is_encrypted());
        assert_eq!(page.page_type(), PageType::Blob);

        page.set_encrypted(false);
        assert!(!page.is_encrypted());
        assert_eq!(page.flags(), PageFlags(0));
    }

    #[test]
    fn crypt_eligible_classes() {
        assert!(PageType::Data.is_crypt_eligible());
        assert!(PageType::Index.is_crypt_eligible());
        assert!(PageType::Blob.is_crypt_eligible());
        assert!(!PageType::Header.is_crypt_eligible());
        assert!(!PageType::Pointer.is_crypt_eligible());
        assert!(!PageType::Undefined.is_crypt_eligible());
    }

    #[test]
    fn unknown_type_byte_is_undefined() {
        assert_eq!(PageType::from_u8(200), PageType::Undefined);
        assert_eq!(PageType::from_u8(7), PageType::Index);
    }

    #[test]
    fn generation_wraps() {
        let mut page = Page::new(PageType::Data, MIN_PAGE_SIZE).unwrap();
        page.bytes[GENERATION_OFFSET..GENERATION_OFFSET + 4]
            .copy_from_slice(&u32::MAX.to_le_bytes());
        page.bump_generation();
        assert_eq!(page.generation(), 0);
    }

    #[test]
    fn tiny_buffers_rejected() {
        assert!(matches!(
            Page::from_bytes(vec![0u8; 8]),
            Err(StorageError::InvalidPageSize { .. })
        ));
    }

    #[test]
    fn page_number_offsets() {
        assert_eq!(PageNumber::new(3).offset(4096), 3 * 4096);
        assert_eq!(PageNumber::HEADER.next(), PageNumber::FIRST);
        assert_eq!(PageNumber::new(9).to_string(), "page:9");
    }
}
