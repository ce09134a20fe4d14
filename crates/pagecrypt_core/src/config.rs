//! Coordinator and attachment configuration.

use crate::provider::KeyMaterial;
use pagecrypt_storage::DEFAULT_PAGE_SIZE;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for an encryption coordinator.
#[derive(Debug, Clone)]
pub struct CryptConfig {
    /// Page size of the database.
    pub page_size: usize,

    /// Pages swept between persisted checkpoints.
    pub checkpoint_interval: u32,

    /// Pages swept between cooperative yields.
    pub yield_interval: u32,

    /// How long the sweep sleeps while a physical backup is running.
    pub backup_retry_delay: Duration,

    /// Maximum time to wait for a lock held by another process.
    ///
    /// Applied to the lock manager built by `CryptDatabase::open_in_memory`;
    /// an injected lock client enforces its own limit.
    pub lock_timeout: Duration,

    /// Whether to start (or resume) the sweep automatically.
    pub auto_sweep: bool,

    /// Number of page slots in the buffer cache.
    pub cache_capacity: usize,
}

impl Default for CryptConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            checkpoint_interval: 1024,
            yield_interval: 64,
            backup_retry_delay: Duration::from_millis(100),
            lock_timeout: Duration::from_secs(30),
            auto_sweep: true,
            cache_capacity: 256,
        }
    }
}

impl CryptConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the checkpoint interval. Zero is treated as one.
    #[must_use]
    pub const fn checkpoint_interval(mut self, pages: u32) -> Self {
        self.checkpoint_interval = if pages == 0 { 1 } else { pages };
        self
    }

    /// Sets the yield interval. Zero is treated as one.
    #[must_use]
    pub const fn yield_interval(mut self, pages: u32) -> Self {
        self.yield_interval = if pages == 0 { 1 } else { pages };
        self
    }

    /// Sets the backup retry delay.
    #[must_use]
    pub const fn backup_retry_delay(mut self, delay: Duration) -> Self {
        self.backup_retry_delay = delay;
        self
    }

    /// Sets the lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether the sweep starts automatically.
    #[must_use]
    pub const fn auto_sweep(mut self, value: bool) -> Self {
        self.auto_sweep = value;
        self
    }

    /// Sets the buffer cache capacity.
    #[must_use]
    pub const fn cache_capacity(mut self, pages: usize) -> Self {
        self.cache_capacity = pages;
        self
    }
}

/// Per-attachment configuration.
///
/// Names the key-holder plugins to instantiate for the session and carries
/// the key material the client brought with it.
#[derive(Debug, Clone, Default)]
pub struct AttachmentConfig {
    /// Key-holder plugin names, in lookup order.
    pub key_holders: Vec<String>,

    /// Keys supplied by the client, by key name.
    pub keys: HashMap<String, KeyMaterial>,
}

impl AttachmentConfig {
    /// Creates an empty attachment configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key-holder plugin.
    #[must_use]
    pub fn key_holder(mut self, name: impl Into<String>) -> Self {
        self.key_holders.push(name.into());
        self
    }

    /// Adds a client-supplied key.
    #[must_use]
    pub fn key(mut self, name: impl Into<String>, material: KeyMaterial) -> Self {
        self.keys.insert(name.into(), material);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = CryptConfig::default();
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.checkpoint_interval, 1024);
        assert!(config.auto_sweep);
    }

    #[test]
    fn builder_pattern() {
        let config = CryptConfig::new()
            .checkpoint_interval(0)
            .auto_sweep(false)
            .page_size(1024);

        assert_eq!(config.checkpoint_interval, 1);
        assert!(!config.auto_sweep);
        assert_eq!(config.page_size, 1024);
    }

    #[test]
    fn attachment_config_builder() {
        let config = AttachmentConfig::new()
            .key_holder("StaticKeys")
            .key("red", KeyMaterial::from_bytes(vec![1, 2, 3]));

        assert_eq!(config.key_holders, vec!["StaticKeys".to_string()]);
        assert!(config.keys.contains_key("red"));
    }
}
