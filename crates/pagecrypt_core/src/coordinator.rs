//! The encryption coordinator.
//!
//! One coordinator exists per process that has the database open. It owns
//! the encryption state machine, intercepts every page read and write, and
//! keeps its cached view of the header in step with other processes through
//! the `CryptState` lock.
//!
//! ## State changes
//!
//! ```text
//! prepare_transition   checks preconditions, loads and validates the key
//! commit_transition    Change lock -> barrier exclusive -> header write
//!                      -> Normal lock -> sweep
//! finish_sweep         Change lock -> barrier exclusive -> header write
//! ```
//!
//! ## Remote changes
//!
//! A process that wants to change the state asks for the `Change` lock.
//! Every other holder receives a blocking AST, gives up its `Normal` level
//! from the AST thread and records a debt in its barrier. The next page I/O
//! re-reads the header (after the change is complete) before going on.

use crate::backup::{BackupState, BackupStateReader};
use crate::barrier::{Barrier, BarrierSync};
use crate::cache::PageCache;
use crate::config::{AttachmentConfig, CryptConfig};
use crate::error::{CryptError, CryptResult};
use crate::header::{validation_hash, HeaderRecord, MAX_KEY_NAME, MAX_PLUGIN_NAME};
use crate::keyholder::{AttachmentStatus, KeyHolderRegistry};
use crate::lock::{BlockingAst, LockClient, LockLevel, LockResource, LockWait};
use crate::provider::{EncryptionProvider, PluginRegistry};
use crate::stats::CryptStats;
use crate::sweep::{SweepOutcome, SweepWorker};
use crate::types::{AttachmentId, EncryptionState};
use pagecrypt_storage::{Page, PageNumber, PageStore, StorageError};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// A requested change of the encryption state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRequest {
    /// Encrypt with `plugin` using the key called `key`.
    Encrypt {
        /// Encryption provider name.
        plugin: String,
        /// Key name.
        key: String,
    },
    /// Decrypt with the provider currently in use.
    Decrypt,
}

impl TransitionRequest {
    /// Creates an encrypt request.
    pub fn encrypt(plugin: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Encrypt {
            plugin: plugin.into(),
            key: key.into(),
        }
    }

    fn target_encrypted(&self) -> bool {
        matches!(self, Self::Encrypt { .. })
    }
}

/// A validated transition, ready to commit. Nothing has been persisted.
#[derive(Debug, Clone)]
pub struct PreparedTransition {
    attachment: AttachmentId,
    target_encrypted: bool,
    plugin: String,
    key_name: Option<String>,
    validation_hash: Option<String>,
    provider: Arc<dyn EncryptionProvider>,
}

impl PreparedTransition {
    /// Returns the attachment that prepared the transition.
    #[must_use]
    pub fn attachment(&self) -> AttachmentId {
        self.attachment
    }

    /// Returns whether pages will be encrypted.
    #[must_use]
    pub fn target_encrypted(&self) -> bool {
        self.target_encrypted
    }

    /// Returns the provider name.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Returns the key name.
    #[must_use]
    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    /// Returns the validation hash of the key.
    #[must_use]
    pub fn validation_hash(&self) -> Option<&str> {
        self.validation_hash.as_deref()
    }
}

#[derive(Debug, Clone, Default)]
struct CryptState {
    header: HeaderRecord,
    provider: Option<Arc<dyn EncryptionProvider>>,
}

/// Coordinates page encryption for one process.
pub struct EncryptionCoordinator {
    this: Weak<Self>,
    config: CryptConfig,
    store: Arc<dyn PageStore>,
    locks: Arc<dyn LockClient>,
    plugins: Arc<PluginRegistry>,
    backup: Arc<dyn BackupStateReader>,
    barrier: Barrier,
    key_holders: KeyHolderRegistry,
    state: RwLock<CryptState>,
    generation: AtomicU64,
    /// Serializes header writers in this process.
    header_writer: Mutex<()>,
    initialized: Mutex<bool>,
    cache: RwLock<Option<Weak<dyn PageCache>>>,
    sweep: Mutex<Option<JoinHandle<CryptResult<SweepOutcome>>>>,
    sweep_stop: AtomicBool,
    closed: AtomicBool,
    stats: CryptStats,
}

impl EncryptionCoordinator {
    /// Creates a coordinator and starts its AST dispatcher.
    ///
    /// `asts` must be the channel the lock manager delivers blocking ASTs
    /// for `locks` on.
    ///
    /// # Errors
    ///
    /// Fails if the store page size differs from the configured one or the
    /// dispatcher thread cannot be spawned.
    pub fn new(
        config: CryptConfig,
        store: Arc<dyn PageStore>,
        locks: Arc<dyn LockClient>,
        asts: Receiver<BlockingAst>,
        plugins: Arc<PluginRegistry>,
        backup: Arc<dyn BackupStateReader>,
    ) -> CryptResult<Arc<Self>> {
        if store.page_size() != config.page_size {
            return Err(StorageError::InvalidPageSize {
                expected: config.page_size,
                actual: store.page_size(),
            }
            .into());
        }

        let coordinator = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            store,
            locks,
            plugins,
            backup,
            barrier: Barrier::new(),
            key_holders: KeyHolderRegistry::new(),
            state: RwLock::new(CryptState::default()),
            generation: AtomicU64::new(0),
            header_writer: Mutex::new(()),
            initialized: Mutex::new(false),
            cache: RwLock::new(None),
            sweep: Mutex::new(None),
            sweep_stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: CryptStats::new(),
        });

        let this = Arc::downgrade(&coordinator);
        thread::Builder::new()
            .name("pagecrypt-ast".to_string())
            .spawn(move || {
                while let Ok(ast) = asts.recv() {
                    let Some(coordinator) = this.upgrade() else {
                        break;
                    };
                    coordinator.handle_ast(ast);
                }
            })
            .map_err(StorageError::from)?;

        Ok(coordinator)
    }

    /// Sets the page cache the sweep works through.
    ///
    /// Only a weak reference is kept; the cache owns the coordinator.
    pub fn set_page_cache(&self, cache: &Arc<dyn PageCache>) {
        *self.cache.write() = Some(Arc::downgrade(cache));
    }

    // ---------------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------------

    /// Attaches a session.
    ///
    /// The first attachment reads the header with full validation,
    /// creating it if the store is empty. Later attachments are checked
    /// against the loaded key. A pending sweep is resumed if `auto_sweep`
    /// is set.
    ///
    /// # Errors
    ///
    /// Fails on unknown key holders, invalid or tampered headers, a key
    /// mismatch, or an attachment that cannot supply the database key.
    pub fn attach(&self, config: &AttachmentConfig) -> CryptResult<AttachmentId> {
        self.ensure_open()?;
        let id = AttachmentId::new();
        self.key_holders.attach(id, config, &self.plugins)?;

        if let Err(err) = self.attach_inner(id) {
            let _ = self.key_holders.detach(id);
            return Err(err);
        }
        info!(attachment = %id, state = %self.state(), "attached");

        if self.config.auto_sweep && self.state().is_transitioning() {
            self.start_sweep()?;
        }
        Ok(id)
    }

    fn attach_inner(&self, id: AttachmentId) -> CryptResult<()> {
        let mut initialized = self.initialized.lock();
        if !*initialized {
            self.initialize()?;
            *initialized = true;
            return Ok(());
        }
        drop(initialized);
        if self.barrier.has_debt() {
            self.settle_debt()?;
        }

        let state = self.state.read().clone();
        if !state.header.needs_provider() {
            return Ok(());
        }
        if state.provider.is_none() {
            // The new attachment may bring the key nobody had so far.
            let _exclusive = self.barrier.lock_begin(self)?;
            return self.read_header(false);
        }

        let header = &state.header;
        let key = header.key_name.as_deref().unwrap_or_default();
        let hash = header.validation_hash.as_deref().unwrap_or_default();
        if self
            .key_holders
            .validate_attachment(id, &self.plugins, &header.plugin, key, hash)?
        {
            Ok(())
        } else {
            Err(CryptError::MissingKey {
                key: key.to_string(),
                attachments: vec![id],
            })
        }
    }

    fn initialize(&self) -> CryptResult<()> {
        let exclusive = self
            .locks
            .lock(LockResource::CryptState, LockLevel::Init, LockWait::NoWait)?;
        if !exclusive {
            self.locks
                .lock(LockResource::CryptState, LockLevel::Normal, LockWait::Wait)?;
        }

        let result: CryptResult<()> = (|| {
            if exclusive && self.store.page_count()? == 0 {
                let page = HeaderRecord::new().encode(self.config.page_size)?;
                self.store.write_page(PageNumber::HEADER, page.as_bytes())?;
                self.store.sync()?;
                info!("encryption header created");
            }
            self.read_header(true)?;
            if exclusive {
                self.locks
                    .convert(LockResource::CryptState, LockLevel::Normal, LockWait::Wait)?;
            }
            Ok(())
        })();

        if result.is_err() {
            self.locks.release(LockResource::CryptState);
        }
        result
    }

    /// Detaches a session.
    ///
    /// # Errors
    ///
    /// Returns `AttachmentNotFound` for an unknown attachment.
    pub fn detach(&self, attachment: AttachmentId) -> CryptResult<()> {
        self.key_holders.detach(attachment)?;
        info!(%attachment, "detached");
        Ok(())
    }

    /// Returns the status of an attachment.
    #[must_use]
    pub fn attachment_status(&self, attachment: AttachmentId) -> Option<AttachmentStatus> {
        self.key_holders.status(attachment)
    }

    /// Fails unless the attachment is registered and connected.
    ///
    /// # Errors
    ///
    /// Returns `AttachmentNotFound` or `AttachmentDisconnected`.
    pub fn ensure_attached(&self, attachment: AttachmentId) -> CryptResult<()> {
        self.key_holders.ensure_connected(attachment)
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// Validates a state change without persisting anything.
    ///
    /// # Errors
    ///
    /// Returns a precondition error if a sweep is active, the database is
    /// already in the target state, a backup is running or a name is too
    /// long; a configuration error if the provider is unknown or any
    /// attachment cannot supply the key.
    pub fn prepare_transition(
        &self,
        attachment: AttachmentId,
        request: &TransitionRequest,
    ) -> CryptResult<PreparedTransition> {
        self.ensure_open()?;
        self.ensure_attached(attachment)?;
        // Preconditions are checked against the cached header.
        if self.barrier.has_debt() {
            self.settle_debt()?;
        }

        let state = self.state.read().clone();
        self.check_preconditions(&state.header, request.target_encrypted())?;

        let prepared = match request {
            TransitionRequest::Encrypt { plugin, key } => {
                if plugin.len() > MAX_PLUGIN_NAME {
                    return Err(CryptError::PluginNameTooLong {
                        len: plugin.len(),
                        max: MAX_PLUGIN_NAME,
                    });
                }
                if key.len() > MAX_KEY_NAME {
                    return Err(CryptError::KeyNameTooLong {
                        len: key.len(),
                        max: MAX_KEY_NAME,
                    });
                }

                let provider = self.plugins.load_provider(plugin)?;
                if let Err(err) = provider.set_key(&self.key_holders.all_holders(), key) {
                    debug!(
                        plugin = %plugin,
                        key = %key,
                        error = %err,
                        "no attachment supplies key"
                    );
                    return Err(CryptError::MissingKey {
                        key: key.clone(),
                        attachments: self.key_holders.attachments(),
                    });
                }
                let hash = validation_hash(provider.as_ref())?;

                let report = self
                    .key_holders
                    .validate_all_attachments(&self.plugins, plugin, key, &hash)?;
                if !report.is_ok() {
                    return Err(CryptError::MissingKey {
                        key: key.clone(),
                        attachments: report.rejected,
                    });
                }

                PreparedTransition {
                    attachment,
                    target_encrypted: true,
                    plugin: plugin.clone(),
                    key_name: Some(key.clone()),
                    validation_hash: Some(hash),
                    provider,
                }
            }
            TransitionRequest::Decrypt => {
                let provider = state.provider.ok_or_else(|| CryptError::KeyUnavailable {
                    plugin: state.header.plugin.clone(),
                })?;
                PreparedTransition {
                    attachment,
                    target_encrypted: false,
                    plugin: state.header.plugin.clone(),
                    key_name: state.header.key_name.clone(),
                    validation_hash: state.header.validation_hash.clone(),
                    provider,
                }
            }
        };

        debug!(
            %attachment,
            target_encrypted = prepared.target_encrypted,
            plugin = %prepared.plugin,
            "transition prepared"
        );
        Ok(prepared)
    }

    /// Commits a prepared state change and starts the sweep.
    ///
    /// Attachments that attached after `prepare_transition` and cannot
    /// supply the key are disconnected.
    ///
    /// # Errors
    ///
    /// Fails if the preconditions no longer hold or the header cannot be
    /// written. In that case nothing was persisted.
    pub fn commit_transition(&self, prepared: &PreparedTransition) -> CryptResult<()> {
        self.ensure_open()?;
        self.ensure_attached(prepared.attachment)?;

        let rejected = {
            let _writer = self.header_writer.lock();
            self.locks
                .convert(LockResource::CryptState, LockLevel::Change, LockWait::Wait)?;

            let result = self.commit_locked(prepared);

            if let Err(err) = self
                .locks
                .convert(LockResource::CryptState, LockLevel::Normal, LockWait::Wait)
            {
                warn!(error = %err, "failed to return state lock to normal");
            }

            match result {
                Ok(rejected) => rejected,
                Err(err) => {
                    warn!(error = %err, "transition not committed");
                    if let Err(reread) = self.refresh() {
                        warn!(error = %reread, "header re-read after failed commit failed");
                    }
                    return Err(err);
                }
            }
        };

        self.stats.record_transition();
        info!(
            target_encrypted = prepared.target_encrypted,
            plugin = %prepared.plugin,
            generation = self.generation(),
            "transition committed"
        );

        if !rejected.is_empty() {
            self.key_holders.force_disconnect(&rejected);
        }
        if self.config.auto_sweep {
            self.start_sweep()?;
        }
        Ok(())
    }

    fn commit_locked(&self, prepared: &PreparedTransition) -> CryptResult<Vec<AttachmentId>> {
        // Another process may have raced ahead while we waited for the lock.
        let header = self.load_header()?;
        self.check_preconditions(&header, prepared.target_encrypted)?;

        let rejected = match (&prepared.key_name, &prepared.validation_hash) {
            (Some(key), Some(hash)) if prepared.target_encrypted => {
                self.key_holders
                    .validate_all_attachments(&self.plugins, &prepared.plugin, key, hash)?
                    .rejected
            }
            _ => Vec::new(),
        };

        let mut next = header;
        next.encrypted = prepared.target_encrypted;
        next.sweep_active = true;
        next.checkpoint = PageNumber::FIRST;
        next.plugin.clone_from(&prepared.plugin);
        next.key_name.clone_from(&prepared.key_name);
        next.validation_hash.clone_from(&prepared.validation_hash);
        next.sign(Some(prepared.provider.as_ref()))?;
        let page = next.encode(self.config.page_size)?;

        let exclusive = self.barrier.lock_begin(self)?;
        // Provider first: once the header is durable, pages must be readable.
        let previous = std::mem::replace(
            &mut *self.state.write(),
            CryptState {
                header: next,
                provider: Some(Arc::clone(&prepared.provider)),
            },
        );
        if let Err(err) = self.write_header_page(&page) {
            *self.state.write() = previous;
            return Err(err);
        }
        self.bump_generation();
        drop(exclusive);

        Ok(rejected)
    }

    fn check_preconditions(&self, header: &HeaderRecord, target: bool) -> CryptResult<()> {
        if header.sweep_active {
            return Err(CryptError::TransitionInProgress);
        }
        if header.encrypted == target {
            return Err(CryptError::AlreadyInState { encrypted: target });
        }
        let backup = self.backup.state();
        if backup != BackupState::Normal {
            return Err(CryptError::BackupActive {
                state: backup.to_string(),
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Header
    // ---------------------------------------------------------------------

    fn load_header(&self) -> CryptResult<HeaderRecord> {
        let bytes = self.store.read_page(PageNumber::HEADER)?;
        HeaderRecord::decode(&Page::from_bytes(bytes)?)
    }

    fn write_header_page(&self, page: &Page) -> CryptResult<()> {
        self.store.write_page(PageNumber::HEADER, page.as_bytes())?;
        self.store.sync()?;
        Ok(())
    }

    /// Re-reads the header and refreshes the cached state.
    ///
    /// Loads the provider when the header needs one and none (or a different
    /// one) is loaded, and checks the validation hash. The signature is
    /// checked with `init` and whenever a provider is newly loaded.
    fn read_header(&self, init: bool) -> CryptResult<()> {
        let header = self.load_header()?;
        let current = self.state.read().clone();

        let provider = if header.needs_provider() {
            let (provider, loaded) = match current.provider {
                Some(provider) if same_key(&current.header, &header) => {
                    (Some(provider), false)
                }
                _ => (self.load_provider(&header)?, true),
            };
            if let Some(provider) = &provider {
                let hash = validation_hash(provider.as_ref())?;
                if header.validation_hash.as_deref() != Some(hash.as_str()) {
                    return Err(CryptError::KeyMismatch {
                        plugin: header.plugin.clone(),
                        key: header.key_name.clone().unwrap_or_default(),
                    });
                }
                if init || loaded {
                    header.verify_signature(provider.as_ref())?;
                }
            }
            provider
        } else {
            header.verify_plain()?;
            None
        };

        self.generation.store(
            self.locks.read_data(LockResource::CryptState),
            Ordering::SeqCst,
        );
        debug!(
            encrypted = header.encrypted,
            sweep_active = header.sweep_active,
            checkpoint = header.checkpoint.as_u32(),
            keyed = provider.is_some(),
            "header read"
        );
        *self.state.write() = CryptState { header, provider };
        Ok(())
    }

    fn load_provider(
        &self,
        header: &HeaderRecord,
    ) -> CryptResult<Option<Arc<dyn EncryptionProvider>>> {
        let provider = self.plugins.load_provider(&header.plugin)?;
        let key = header
            .key_name
            .as_deref()
            .ok_or_else(|| CryptError::invalid_header("encrypted header has no key name"))?;
        match provider.set_key(&self.key_holders.all_holders(), key) {
            Ok(()) => Ok(Some(provider)),
            Err(err) => {
                warn!(plugin = %header.plugin, key, error = %err, "database key not available");
                Ok(None)
            }
        }
    }

    /// Persists sweep progress: every page below `page` matches the target.
    ///
    /// # Errors
    ///
    /// Fails if the header cannot be signed or written.
    pub fn write_checkpoint(&self, page: PageNumber) -> CryptResult<()> {
        let _writer = self.header_writer.lock();
        let state = self.state.read().clone();
        if !state.header.sweep_active {
            return Ok(());
        }

        let provider = state.provider.ok_or_else(|| CryptError::KeyUnavailable {
            plugin: state.header.plugin.clone(),
        })?;
        let mut header = state.header;
        header.checkpoint = page;
        header.sign(Some(provider.as_ref()))?;
        self.write_header_page(&header.encode(self.config.page_size)?)?;
        self.state.write().header = header;

        self.stats.record_checkpoint();
        debug!(checkpoint = page.as_u32(), "sweep checkpoint written");
        Ok(())
    }

    /// Marks the sweep complete.
    ///
    /// Clears the sweep flag and, after decryption, the key metadata.
    ///
    /// # Errors
    ///
    /// Fails if the lock, the signature or the header write fails.
    pub fn finish_sweep(&self) -> CryptResult<()> {
        let _writer = self.header_writer.lock();
        self.locks
            .convert(LockResource::CryptState, LockLevel::Change, LockWait::Wait)?;

        let result: CryptResult<()> = (|| {
            let mut header = self.load_header()?;
            if !header.sweep_active {
                return Ok(());
            }
            let provider = self.state.read().provider.clone();

            header.sweep_active = false;
            header.checkpoint = PageNumber::HEADER;
            if !header.encrypted {
                header.strip_key();
            }
            let provider = if header.needs_provider() {
                Some(provider.ok_or_else(|| CryptError::KeyUnavailable {
                    plugin: header.plugin.clone(),
                })?)
            } else {
                None
            };
            header.sign(provider.as_deref())?;
            let page = header.encode(self.config.page_size)?;

            let exclusive = self.barrier.lock_begin(self)?;
            self.write_header_page(&page)?;
            let encrypted = header.encrypted;
            *self.state.write() = CryptState { header, provider };
            self.bump_generation();
            drop(exclusive);

            info!(encrypted, "sweep finished");
            Ok(())
        })();

        if let Err(err) = self
            .locks
            .convert(LockResource::CryptState, LockLevel::Normal, LockWait::Wait)
        {
            warn!(error = %err, "failed to return state lock to normal");
        }
        result
    }

    fn bump_generation(&self) {
        let next = self
            .locks
            .read_data(LockResource::CryptState)
            .wrapping_add(1);
        self.locks.write_data(LockResource::CryptState, next);
        self.generation.store(next, Ordering::SeqCst);
    }

    // ---------------------------------------------------------------------
    // Page intercept
    // ---------------------------------------------------------------------

    /// Reads a page, decrypting the payload if it is stored encrypted.
    ///
    /// The encrypted bit of the returned page reflects the stored image.
    ///
    /// # Errors
    ///
    /// Returns a storage error or a crypt error. Crypt errors are retried
    /// only while remote notifications keep arriving.
    pub fn read_page(&self, page: PageNumber) -> CryptResult<Page> {
        self.ensure_open()?;
        self.with_retry(|| {
            if self.barrier.has_debt() {
                self.stats.record_slow_read();
                self.settle_debt()?;
            }
            self.read_once(page)
        })
    }

    /// Writes a page, encrypting it if the target state and page class say so.
    ///
    /// Sets or clears the encrypted bit of `page` to match what was stored.
    ///
    /// # Errors
    ///
    /// Returns a storage error or a crypt error, or `InvalidOperation` for
    /// the header page.
    pub fn write_page(&self, number: PageNumber, page: &mut Page) -> CryptResult<()> {
        self.ensure_open()?;
        if number == PageNumber::HEADER {
            return Err(CryptError::invalid_operation(
                "the header page is written by the coordinator",
            ));
        }
        self.with_retry(|| {
            if self.barrier.has_debt() {
                self.stats.record_slow_write();
                self.settle_debt()?;
            }
            let _io = self.barrier.io_begin(self)?;
            self.write_unlocked(number, page)
        })
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> CryptResult<T>) -> CryptResult<T> {
        let mut epoch = self.barrier.epoch();
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_crypt() => {
                    let now = self.barrier.epoch();
                    if now == epoch {
                        self.stats.record_error();
                        return Err(err);
                    }
                    debug!(error = %err, "crypt failure under stale state, retrying");
                    epoch = now;
                }
                Err(err) => {
                    self.stats.record_error();
                    return Err(err);
                }
            }
        }
    }

    fn settle_debt(&self) -> CryptResult<()> {
        let exclusive = self.barrier.lock_begin(self)?;
        drop(exclusive);
        Ok(())
    }

    fn read_once(&self, number: PageNumber) -> CryptResult<Page> {
        let io = self.barrier.io_begin(self)?;
        let mut page = Page::from_bytes(self.store.read_page(number)?)?;
        let decrypted = page.is_encrypted();
        if decrypted {
            let provider = self.current_provider()?;
            let mut plain = vec![0u8; page.payload().len()];
            provider.decrypt(u64::from(number.as_u32()), page.payload(), &mut plain)?;
            page.payload_mut().copy_from_slice(&plain);
        }
        io.end();
        self.stats.record_read(decrypted);
        Ok(page)
    }

    fn write_unlocked(&self, number: PageNumber, page: &mut Page) -> CryptResult<()> {
        let encrypt = self.state.read().header.encrypted && page.page_type().is_crypt_eligible();
        if encrypt {
            let provider = self.current_provider()?;
            let mut image = page.clone();
            provider.encrypt(
                u64::from(number.as_u32()),
                page.payload(),
                image.payload_mut(),
            )?;
            image.set_encrypted(true);
            self.store.write_page(number, image.as_bytes())?;
        } else {
            page.set_encrypted(false);
            self.store.write_page(number, page.as_bytes())?;
        }
        page.set_encrypted(encrypt);
        self.stats.record_write(encrypt);
        Ok(())
    }

    fn current_provider(&self) -> CryptResult<Arc<dyn EncryptionProvider>> {
        let state = self.state.read();
        state
            .provider
            .clone()
            .ok_or_else(|| CryptError::KeyUnavailable {
                plugin: state.header.plugin.clone(),
            })
    }

    /// Returns the number of pages in the store.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub fn page_count(&self) -> CryptResult<u32> {
        Ok(self.store.page_count()?)
    }

    // ---------------------------------------------------------------------
    // Remote notifications
    // ---------------------------------------------------------------------

    fn handle_ast(&self, ast: BlockingAst) {
        if ast.resource != LockResource::CryptState {
            return;
        }
        debug!(requester = %ast.requester, requested = ?ast.requested, "blocking AST received");
        self.stats.record_notification();
        self.barrier.notify(self);
    }

    fn reacquire_state_lock(&self) -> CryptResult<()> {
        match self.locks.level(LockResource::CryptState) {
            LockLevel::None => {
                self.locks
                    .lock(LockResource::CryptState, LockLevel::Normal, LockWait::Wait)?;
            }
            LockLevel::Release => {
                self.locks
                    .convert(LockResource::CryptState, LockLevel::Normal, LockWait::Wait)?;
            }
            LockLevel::Normal | LockLevel::Change | LockLevel::Init => {}
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Sweep
    // ---------------------------------------------------------------------

    /// Starts the sweep thread if a sweep is pending and none runs here.
    ///
    /// Returns whether a thread was started. Another process may already be
    /// sweeping, in which case the thread exits with
    /// [`SweepOutcome::AlreadyRunning`].
    ///
    /// # Errors
    ///
    /// Fails if the coordinator is shut down or the thread cannot start.
    pub fn start_sweep(&self) -> CryptResult<bool> {
        self.ensure_open()?;
        if !self.state.read().header.sweep_active {
            return Ok(false);
        }
        let Some(this) = self.this.upgrade() else {
            return Ok(false);
        };
        let Some(cache) = self.page_cache() else {
            debug!("no page cache attached, sweep deferred");
            return Ok(false);
        };

        let mut slot = self.sweep.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }
        if let Some(finished) = slot.take() {
            log_sweep_result(finished.join());
        }

        self.sweep_stop.store(false, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("pagecrypt-sweep".to_string())
            .spawn(move || SweepWorker::new(this, cache).run())
            .map_err(StorageError::from)?;
        *slot = Some(handle);
        Ok(true)
    }

    /// Waits for the sweep thread started by this coordinator.
    ///
    /// Returns `None` if no sweep thread was started.
    ///
    /// # Errors
    ///
    /// Returns the sweep's error, or `InvalidOperation` if it panicked.
    pub fn wait_for_sweep(&self) -> CryptResult<Option<SweepOutcome>> {
        let handle = self.sweep.lock().take();
        match handle {
            None => Ok(None),
            Some(handle) => handle
                .join()
                .map_err(|_| CryptError::invalid_operation("sweep thread panicked"))?
                .map(Some),
        }
    }

    /// Asks a running sweep to stop at the next page.
    ///
    /// The sweep flag stays set so the sweep resumes later.
    pub fn stop_sweep(&self) {
        self.sweep_stop.store(true, Ordering::SeqCst);
    }

    /// Returns whether the sweep was asked to stop.
    #[must_use]
    pub fn sweep_stop_requested(&self) -> bool {
        self.sweep_stop.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst)
    }

    /// Re-reads the header under the barrier's exclusive lock.
    ///
    /// # Errors
    ///
    /// Fails if the header cannot be read or validated.
    pub fn refresh(&self) -> CryptResult<()> {
        let _exclusive = self.barrier.lock_begin(self)?;
        self.read_header(false)
    }

    /// Stops the sweep, waits for it and refuses further page I/O.
    pub fn shutdown(&self) {
        self.stop_sweep();
        if let Err(err) = self.wait_for_sweep() {
            warn!(error = %err, "sweep ended with error during shutdown");
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("encryption coordinator shut down");
        }
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    /// Returns the current encryption state.
    #[must_use]
    pub fn state(&self) -> EncryptionState {
        let state = self.state.read();
        EncryptionState::from_parts(
            state.header.encrypted,
            state.header.sweep_active,
            state.header.checkpoint,
        )
    }

    /// Returns a copy of the cached header.
    #[must_use]
    pub fn header(&self) -> HeaderRecord {
        self.state.read().header.clone()
    }

    /// Returns whether a provider with a key is loaded.
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.state.read().provider.is_some()
    }

    /// Returns the state generation last seen.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns the statistics.
    #[must_use]
    pub fn stats(&self) -> &CryptStats {
        &self.stats
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CryptConfig {
        &self.config
    }

    /// Returns the barrier guarding page I/O.
    #[must_use]
    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    /// Returns the lock client.
    #[must_use]
    pub fn lock_client(&self) -> &Arc<dyn LockClient> {
        &self.locks
    }

    /// Returns the current backup state.
    #[must_use]
    pub fn backup_state(&self) -> BackupState {
        self.backup.state()
    }

    fn page_cache(&self) -> Option<Arc<dyn PageCache>> {
        self.cache.read().as_ref().and_then(Weak::upgrade)
    }

    fn ensure_open(&self) -> CryptResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CryptError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl BarrierSync for EncryptionCoordinator {
    fn resync(&self) -> CryptResult<()> {
        if !*self.initialized.lock() {
            return Ok(());
        }
        self.reacquire_state_lock()?;
        self.read_header(false)?;
        self.stats.record_resync();
        debug!(generation = self.generation(), "resynced after remote change");
        Ok(())
    }

    fn on_notify(&self) {
        if self
            .locks
            .downgrade(LockResource::CryptState, LockLevel::Normal, LockLevel::Release)
        {
            debug!("state lock released for remote change");
        }
    }
}

impl fmt::Debug for EncryptionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionCoordinator")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("attachments", &self.key_holders.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for EncryptionCoordinator {
    fn drop(&mut self) {
        // The AST thread may hold the last reference, so never join it here.
        self.sweep_stop.store(true, Ordering::SeqCst);
    }
}

fn same_key(current: &HeaderRecord, next: &HeaderRecord) -> bool {
    current.plugin == next.plugin
        && current.key_name == next.key_name
        && current.validation_hash == next.validation_hash
}

fn log_sweep_result(result: thread::Result<CryptResult<SweepOutcome>>) {
    match result {
        Ok(Ok(outcome)) => debug!(?outcome, "previous sweep reaped"),
        Ok(Err(err)) => warn!(error = %err, "previous sweep failed"),
        Err(_) => warn!("previous sweep panicked"),
    }
}
