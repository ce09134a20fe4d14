//! Page cache between page users and the encryption coordinator.
//!
//! The cache holds plaintext page images. Misses are read through
//! [`EncryptionCoordinator::read_page`] and dirty pages are written back
//! through [`EncryptionCoordinator::write_page`], so the coordinator decides
//! how each page lands on disk. The sweep relies on this: it only marks pages
//! dirty and lets the flush re-encrypt them.

use crate::coordinator::EncryptionCoordinator;
use crate::error::{CryptError, CryptResult};
use pagecrypt_storage::{Page, PageNumber, PageType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// How a page is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// The caller only reads the page.
    Read,
    /// The caller may change the page or mark it dirty.
    Write,
}

/// A cache of plaintext pages.
pub trait PageCache: Send + Sync {
    /// Returns a copy of the page and pins it until [`PageCache::release`].
    ///
    /// # Errors
    ///
    /// Returns the coordinator error on a miss that cannot be read.
    fn fetch(&self, page: PageNumber, mode: FetchMode) -> CryptResult<Page>;

    /// Replaces the cached image of a page fetched for writing and marks it
    /// dirty.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` unless the page is pinned for writing.
    fn update(&self, page: PageNumber, contents: Page) -> CryptResult<()>;

    /// Marks a page fetched for writing as dirty.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` unless the page is pinned for writing.
    fn mark_dirty(&self, page: PageNumber) -> CryptResult<()>;

    /// Unpins a page fetched with `mode`.
    fn release(&self, page: PageNumber, mode: FetchMode);

    /// Appends a zeroed page of the given type and writes it through.
    ///
    /// # Errors
    ///
    /// Returns the coordinator error if the page cannot be written.
    fn allocate(&self, page_type: PageType) -> CryptResult<PageNumber>;

    /// Returns the highest allocated page number.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    fn last_page(&self) -> CryptResult<PageNumber>;

    /// Writes every dirty page back, in ascending page order.
    ///
    /// # Errors
    ///
    /// Returns the first write error. Pages not yet written stay dirty.
    fn flush(&self) -> CryptResult<()>;
}

struct Frame {
    page: Page,
    dirty: bool,
    pins: u32,
    write_pins: u32,
    last_used: u64,
}

impl Frame {
    fn new(page: Page, tick: u64) -> Self {
        Self {
            page,
            dirty: false,
            pins: 0,
            write_pins: 0,
            last_used: tick,
        }
    }

    fn is_pinned(&self) -> bool {
        self.pins > 0
    }
}

#[derive(Default)]
struct Frames {
    frames: HashMap<PageNumber, Frame>,
    clock: u64,
}

impl Frames {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Write-back page cache with least-recently-used eviction.
///
/// Pinned frames are never evicted. If every frame is pinned the cache grows
/// past its capacity until pins are released.
pub struct BufferCache {
    coordinator: Arc<EncryptionCoordinator>,
    capacity: usize,
    inner: Mutex<Frames>,
}

impl BufferCache {
    /// Creates a cache of `capacity` pages in front of the coordinator.
    #[must_use]
    pub fn new(coordinator: Arc<EncryptionCoordinator>, capacity: usize) -> Self {
        Self {
            coordinator,
            capacity: capacity.max(1),
            inner: Mutex::new(Frames::default()),
        }
    }

    /// Returns the coordinator the cache reads and writes through.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<EncryptionCoordinator> {
        &self.coordinator
    }

    /// Returns the number of cached pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Returns whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Returns the number of dirty pages.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.inner
            .lock()
            .frames
            .values()
            .filter(|frame| frame.dirty)
            .count()
    }

    /// Drops every clean, unpinned page.
    pub fn discard_clean(&self) {
        self.inner
            .lock()
            .frames
            .retain(|_, frame| frame.dirty || frame.is_pinned());
    }

    fn make_room(&self, frames: &mut Frames) -> CryptResult<()> {
        while frames.frames.len() >= self.capacity {
            let victim = frames
                .frames
                .iter()
                .filter(|(_, frame)| !frame.is_pinned())
                .min_by_key(|(_, frame)| frame.last_used)
                .map(|(number, _)| *number);
            let Some(victim) = victim else {
                debug!(cached = frames.frames.len(), "all frames pinned, cache over capacity");
                return Ok(());
            };

            if let Some(frame) = frames.frames.get_mut(&victim) {
                if frame.dirty {
                    self.coordinator.write_page(victim, &mut frame.page)?;
                    frame.dirty = false;
                }
            }
            frames.frames.remove(&victim);
            trace!(page = victim.as_u32(), "page evicted");
        }
        Ok(())
    }

    fn writable_frame<'a>(
        frames: &'a mut Frames,
        page: PageNumber,
    ) -> CryptResult<&'a mut Frame> {
        match frames.frames.get_mut(&page) {
            Some(frame) if frame.write_pins > 0 => Ok(frame),
            _ => Err(CryptError::invalid_operation(format!(
                "{page} is not fetched for writing"
            ))),
        }
    }
}

impl PageCache for BufferCache {
    fn fetch(&self, page: PageNumber, mode: FetchMode) -> CryptResult<Page> {
        if page == PageNumber::HEADER {
            return Err(CryptError::invalid_operation(
                "the header page is not cached",
            ));
        }

        let mut frames = self.inner.lock();
        let tick = frames.tick();
        if !frames.frames.contains_key(&page) {
            self.make_room(&mut frames)?;
            let image = self.coordinator.read_page(page)?;
            frames.frames.insert(page, Frame::new(image, tick));
        }

        match frames.frames.get_mut(&page) {
            Some(frame) => {
                frame.pins += 1;
                if mode == FetchMode::Write {
                    frame.write_pins += 1;
                }
                frame.last_used = tick;
                Ok(frame.page.clone())
            }
            None => Err(CryptError::invalid_operation(format!(
                "{page} vanished from the cache"
            ))),
        }
    }

    fn update(&self, page: PageNumber, contents: Page) -> CryptResult<()> {
        let mut frames = self.inner.lock();
        let frame = Self::writable_frame(&mut frames, page)?;
        frame.page = contents;
        frame.dirty = true;
        Ok(())
    }

    fn mark_dirty(&self, page: PageNumber) -> CryptResult<()> {
        let mut frames = self.inner.lock();
        Self::writable_frame(&mut frames, page)?.dirty = true;
        Ok(())
    }

    fn release(&self, page: PageNumber, mode: FetchMode) {
        let mut frames = self.inner.lock();
        if let Some(frame) = frames.frames.get_mut(&page) {
            frame.pins = frame.pins.saturating_sub(1);
            if mode == FetchMode::Write {
                frame.write_pins = frame.write_pins.saturating_sub(1);
            }
        }
    }

    fn allocate(&self, page_type: PageType) -> CryptResult<PageNumber> {
        let mut frames = self.inner.lock();
        self.make_room(&mut frames)?;

        let number = PageNumber::new(self.coordinator.page_count()?.max(1));
        let mut page = Page::new(page_type, self.coordinator.config().page_size)?;
        self.coordinator.write_page(number, &mut page)?;

        let tick = frames.tick();
        frames.frames.insert(number, Frame::new(page, tick));
        trace!(page = number.as_u32(), ?page_type, "page allocated");
        Ok(number)
    }

    fn last_page(&self) -> CryptResult<PageNumber> {
        let count = self.coordinator.page_count()?;
        Ok(PageNumber::new(count.saturating_sub(1)))
    }

    fn flush(&self) -> CryptResult<()> {
        let mut frames = self.inner.lock();
        let mut dirty: Vec<PageNumber> = frames
            .frames
            .iter()
            .filter(|(_, frame)| frame.dirty)
            .map(|(number, _)| *number)
            .collect();
        dirty.sort_unstable();

        for number in &dirty {
            if let Some(frame) = frames.frames.get_mut(number) {
                self.coordinator.write_page(*number, &mut frame.page)?;
                frame.dirty = false;
            }
        }
        if !dirty.is_empty() {
            debug!(pages = dirty.len(), "cache flushed");
        }
        Ok(())
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("capacity", &self.capacity)
            .field("cached", &self.len())
            .finish_non_exhaustive()
    }
}
