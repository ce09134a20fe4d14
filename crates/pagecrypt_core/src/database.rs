//! Database facade.

use crate::backup::{BackupStateReader, SharedBackupState};
use crate::cache::{BufferCache, FetchMode, PageCache};
use crate::config::{AttachmentConfig, CryptConfig};
use crate::coordinator::{EncryptionCoordinator, TransitionRequest};
use crate::error::CryptResult;
use crate::lock::{BlockingAst, LocalLockManager, LockClient};
use crate::provider::PluginRegistry;
use crate::sweep::SweepOutcome;
use crate::types::AttachmentId;
use pagecrypt_storage::{InMemoryPageStore, Page, PageNumber, PageStore, PageType};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::warn;

/// One process's handle on a shared database.
///
/// `CryptDatabase` wires an [`EncryptionCoordinator`] to a [`BufferCache`]
/// and exposes the operations sessions use:
/// - attach and detach
/// - page reads, writes and allocation through the cache
/// - `encrypt` and `decrypt` state changes, swept in the background
///
/// # Example
///
/// ```rust,ignore
/// use pagecrypt_core::{AttachmentConfig, CryptConfig, CryptDatabase, KeyMaterial};
///
/// let db = CryptDatabase::open_in_memory(CryptConfig::default())?;
/// let session = db.attach(
///     &AttachmentConfig::new()
///         .key_holder("StaticKeys")
///         .key("red", KeyMaterial::generate()),
/// )?;
///
/// db.encrypt(session, "Sample", "red")?;
/// db.wait_for_sweep()?;
/// ```
///
/// Several handles model several processes: open each with its own client
/// of one [`LocalLockManager`] over the same store.
pub struct CryptDatabase {
    coordinator: Arc<EncryptionCoordinator>,
    cache: Arc<BufferCache>,
}

impl CryptDatabase {
    /// Opens a handle with injected collaborators.
    ///
    /// # Errors
    ///
    /// Fails if the store page size does not match `config.page_size`.
    pub fn open(
        store: Arc<dyn PageStore>,
        locks: Arc<dyn LockClient>,
        asts: Receiver<BlockingAst>,
        plugins: Arc<PluginRegistry>,
        backup: Arc<dyn BackupStateReader>,
        config: CryptConfig,
    ) -> CryptResult<Self> {
        let capacity = config.cache_capacity;
        let coordinator = EncryptionCoordinator::new(config, store, locks, asts, plugins, backup)?;
        let cache = Arc::new(BufferCache::new(Arc::clone(&coordinator), capacity));
        let dyn_cache: Arc<dyn PageCache> = cache.clone();
        coordinator.set_page_cache(&dyn_cache);
        Ok(Self { coordinator, cache })
    }

    /// Opens a handle as a new client of `manager`.
    ///
    /// # Errors
    ///
    /// Fails if the store page size does not match `config.page_size`.
    pub fn open_local(
        store: Arc<dyn PageStore>,
        manager: &Arc<LocalLockManager>,
        plugins: Arc<PluginRegistry>,
        backup: Arc<dyn BackupStateReader>,
        config: CryptConfig,
    ) -> CryptResult<Self> {
        let (client, asts) = manager.connect();
        Self::open(store, Arc::new(client), asts, plugins, backup, config)
    }

    /// Opens a private in-memory database with the default plugins.
    ///
    /// The lock manager created for it waits up to `config.lock_timeout`.
    ///
    /// # Errors
    ///
    /// Fails if `config.page_size` is invalid.
    pub fn open_in_memory(config: CryptConfig) -> CryptResult<Self> {
        let store = Arc::new(InMemoryPageStore::new(config.page_size)?);
        Self::open_local(
            store,
            &LocalLockManager::with_timeout(config.lock_timeout),
            Arc::new(PluginRegistry::with_defaults()),
            Arc::new(SharedBackupState::new()),
            config,
        )
    }

    /// Attaches a session.
    ///
    /// # Errors
    ///
    /// See [`EncryptionCoordinator::attach`].
    pub fn attach(&self, config: &AttachmentConfig) -> CryptResult<AttachmentId> {
        self.coordinator.attach(config)
    }

    /// Detaches a session.
    ///
    /// # Errors
    ///
    /// Returns `AttachmentNotFound` for an unknown session.
    pub fn detach(&self, attachment: AttachmentId) -> CryptResult<()> {
        self.coordinator.detach(attachment)
    }

    /// Encrypts the database with `plugin` and the key called `key`.
    ///
    /// Returns once the change is committed; the sweep runs in the
    /// background.
    ///
    /// # Errors
    ///
    /// See [`EncryptionCoordinator::prepare_transition`] and
    /// [`EncryptionCoordinator::commit_transition`].
    pub fn encrypt(&self, attachment: AttachmentId, plugin: &str, key: &str) -> CryptResult<()> {
        self.transition(attachment, &TransitionRequest::encrypt(plugin, key))
    }

    /// Decrypts the database.
    ///
    /// # Errors
    ///
    /// See [`EncryptionCoordinator::prepare_transition`] and
    /// [`EncryptionCoordinator::commit_transition`].
    pub fn decrypt(&self, attachment: AttachmentId) -> CryptResult<()> {
        self.transition(attachment, &TransitionRequest::Decrypt)
    }

    fn transition(&self, attachment: AttachmentId, request: &TransitionRequest) -> CryptResult<()> {
        let prepared = self.coordinator.prepare_transition(attachment, request)?;
        self.coordinator.commit_transition(&prepared)
    }

    /// Reads a page as plaintext.
    ///
    /// # Errors
    ///
    /// Fails if the session is not connected or the page cannot be read.
    pub fn read_page(&self, attachment: AttachmentId, page: PageNumber) -> CryptResult<Page> {
        self.coordinator.ensure_attached(attachment)?;
        let image = self.cache.fetch(page, FetchMode::Read)?;
        self.cache.release(page, FetchMode::Read);
        Ok(image)
    }

    /// Replaces a page. The change reaches the store on flush or eviction.
    ///
    /// # Errors
    ///
    /// Fails if the session is not connected or the page cannot be read.
    pub fn write_page(
        &self,
        attachment: AttachmentId,
        page: PageNumber,
        contents: Page,
    ) -> CryptResult<()> {
        self.coordinator.ensure_attached(attachment)?;
        self.cache.fetch(page, FetchMode::Write)?;
        let result = self.cache.update(page, contents);
        self.cache.release(page, FetchMode::Write);
        result
    }

    /// Appends a page of the given type.
    ///
    /// # Errors
    ///
    /// Fails if the session is not connected or the page cannot be written.
    pub fn allocate(
        &self,
        attachment: AttachmentId,
        page_type: PageType,
    ) -> CryptResult<PageNumber> {
        self.coordinator.ensure_attached(attachment)?;
        self.cache.allocate(page_type)
    }

    /// Writes all dirty pages back.
    ///
    /// # Errors
    ///
    /// Returns the first write error.
    pub fn flush(&self) -> CryptResult<()> {
        self.cache.flush()
    }

    /// Waits for the background sweep started by this handle.
    ///
    /// # Errors
    ///
    /// Returns the sweep's error.
    pub fn wait_for_sweep(&self) -> CryptResult<Option<SweepOutcome>> {
        self.coordinator.wait_for_sweep()
    }

    /// Returns the coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<EncryptionCoordinator> {
        &self.coordinator
    }

    /// Returns the page cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    /// Stops the sweep, flushes and shuts the coordinator down.
    ///
    /// # Errors
    ///
    /// Returns the flush error. The coordinator is shut down regardless.
    pub fn close(&self) -> CryptResult<()> {
        self.coordinator.stop_sweep();
        if let Err(err) = self.coordinator.wait_for_sweep() {
            warn!(error = %err, "sweep ended with error during close");
        }
        let flushed = self.cache.flush();
        self.coordinator.shutdown();
        flushed
    }
}

impl Drop for CryptDatabase {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "flush on drop failed");
        }
    }
}

impl std::fmt::Debug for CryptDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptDatabase")
            .field("coordinator", &self.coordinator)
            .field("cache", &self.cache)
            .finish()
    }
}
