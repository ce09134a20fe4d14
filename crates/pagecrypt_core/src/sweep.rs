//! Background sweep that brings every page to the target state.
//!
//! The sweep never transforms bytes. It walks the pages from the last
//! checkpoint, marks each crypt-eligible page whose stored state disagrees
//! with the target as dirty, and lets the cache flush write it back through
//! the coordinator. Progress is persisted in the header every
//! `checkpoint_interval` pages so an interrupted sweep resumes where it left
//! off.

use crate::backup::BackupState;
use crate::cache::{FetchMode, PageCache};
use crate::coordinator::EncryptionCoordinator;
use crate::error::CryptResult;
use crate::lock::{LockLevel, LockResource, LockWait};
use crate::types::EncryptionState;
use pagecrypt_storage::PageNumber;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, trace, warn};

/// How a sweep run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Every page matches the target and the header says so.
    Completed {
        /// Pages visited in this run.
        pages: u32,
    },
    /// Another sweep holds the sweep lock.
    AlreadyRunning,
    /// Stopped early; the next run resumes at `checkpoint`.
    Interrupted {
        /// Last persisted checkpoint.
        checkpoint: PageNumber,
    },
    /// No sweep was pending.
    NothingToDo,
}

/// Walks the database pages for one sweep run.
pub struct SweepWorker {
    coordinator: Arc<EncryptionCoordinator>,
    cache: Arc<dyn PageCache>,
}

impl SweepWorker {
    /// Creates a worker that sweeps through `cache`.
    #[must_use]
    pub fn new(coordinator: Arc<EncryptionCoordinator>, cache: Arc<dyn PageCache>) -> Self {
        Self { coordinator, cache }
    }

    /// Runs the sweep to completion or interruption.
    ///
    /// # Errors
    ///
    /// Returns page, lock or header errors. The sweep flag stays set, so a
    /// later run resumes from the last checkpoint.
    pub fn run(&self) -> CryptResult<SweepOutcome> {
        let locks = self.coordinator.lock_client();
        if !locks.lock(LockResource::CryptSweep, LockLevel::Init, LockWait::NoWait)? {
            debug!("sweep already running elsewhere");
            return Ok(SweepOutcome::AlreadyRunning);
        }

        let result = self.sweep();
        locks.release(LockResource::CryptSweep);

        match &result {
            Ok(outcome) => debug!(?outcome, "sweep run ended"),
            Err(err) => warn!(error = %err, "sweep failed"),
        }
        result
    }

    fn sweep(&self) -> CryptResult<SweepOutcome> {
        // The header may have moved on while we waited for the sweep lock.
        self.coordinator.refresh()?;
        let (target_encrypted, start) = match self.coordinator.state() {
            EncryptionState::Transitioning {
                target_encrypted,
                checkpoint,
            } => (target_encrypted, checkpoint.max(PageNumber::FIRST)),
            EncryptionState::Plain | EncryptionState::Encrypted => {
                return Ok(SweepOutcome::NothingToDo);
            }
        };

        let config = self.coordinator.config();
        let checkpoint_interval = config.checkpoint_interval.max(1);
        let yield_interval = config.yield_interval.max(1);

        info!(target_encrypted, from = start.as_u32(), "sweep started");

        let mut persisted = start;
        let mut next = start;
        let mut visited = 0u32;
        let mut since_checkpoint = 0u32;

        loop {
            let last = self.cache.last_page()?;
            if next > last {
                // Pages may have been added while we swept; stop only once
                // the end stays put.
                if self.cache.last_page()? == last {
                    break;
                }
                continue;
            }

            while next <= last {
                if !self.wait_for_backup() {
                    return Ok(SweepOutcome::Interrupted {
                        checkpoint: persisted,
                    });
                }

                self.visit(next, target_encrypted)?;
                next = next.next();
                visited += 1;
                since_checkpoint += 1;

                if visited % yield_interval == 0 {
                    thread::yield_now();
                }
                if since_checkpoint >= checkpoint_interval {
                    self.cache.flush()?;
                    self.coordinator.write_checkpoint(next)?;
                    persisted = next;
                    since_checkpoint = 0;
                }
            }
        }

        self.cache.flush()?;
        self.coordinator.finish_sweep()?;
        info!(pages = visited, target_encrypted, "sweep completed");
        Ok(SweepOutcome::Completed { pages: visited })
    }

    fn visit(&self, page: PageNumber, target_encrypted: bool) -> CryptResult<()> {
        let image = self.cache.fetch(page, FetchMode::Write)?;
        let result = if image.page_type().is_crypt_eligible()
            && image.is_encrypted() != target_encrypted
        {
            trace!(page = page.as_u32(), "page marked for rewrite");
            self.cache.mark_dirty(page)
        } else {
            Ok(())
        };
        self.cache.release(page, FetchMode::Write);
        result
    }

    /// Waits while a physical backup runs. Returns false if asked to stop.
    fn wait_for_backup(&self) -> bool {
        let delay = self.coordinator.config().backup_retry_delay;
        loop {
            if self.coordinator.sweep_stop_requested() {
                return false;
            }
            match self.coordinator.backup_state() {
                BackupState::Normal => return true,
                state => {
                    trace!(%state, "sweep paused for backup");
                    thread::sleep(delay);
                }
            }
        }
    }
}

impl std::fmt::Debug for SweepWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepWorker")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}
