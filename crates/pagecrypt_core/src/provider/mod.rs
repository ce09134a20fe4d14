//! Pluggable encryption providers and key holders.
//!
//! The coordinator never implements a cipher. It loads a named
//! [`EncryptionProvider`] from the [`PluginRegistry`], hands it the key
//! holders of the attached sessions and lets it find the key itself.
//!
//! ## Usage
//!
//! ```ignore
//! use pagecrypt_core::provider::{KeyMaterial, PluginRegistry};
//!
//! let plugins = PluginRegistry::with_defaults();
//! let provider = plugins.load_provider("Sample")?;
//! provider.set_key(&holders, "red")?;
//! provider.encrypt(7, &plain, &mut cipher)?;
//! ```

mod key_holder;
mod sample;

pub use key_holder::{StaticKeyHolder, OWN_KEYS_HOLDER, STATIC_KEYS_HOLDER};
pub use sample::{SampleProvider, SAMPLE_PROVIDER};

use crate::config::AttachmentConfig;
use crate::error::{CryptError, CryptResult};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of generated keys in bytes.
pub const GENERATED_KEY_SIZE: usize = 32;

/// Raw key bytes handed from a key holder to a provider.
///
/// Zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Wraps existing key bytes.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Copies key bytes from a slice.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Generates a random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; GENERATED_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Returns the key bytes. Do not log the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns whether the key is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A symmetric page cipher.
///
/// Transforms are length preserving. Callers pass buffers whose length is
/// a multiple of [`block_size`](Self::block_size); `block` is a tweak
/// (the page number for page payloads) so equal plaintext on different
/// pages encrypts differently.
pub trait EncryptionProvider: Send + Sync + fmt::Debug {
    /// Registered plugin name.
    fn name(&self) -> &str;

    /// Cipher block size in bytes.
    fn block_size(&self) -> usize;

    /// Loads `key_name` from the first holder that supplies it.
    ///
    /// # Errors
    ///
    /// Fails if no holder supplies the key or the key is unusable.
    fn set_key(&self, holders: &[Arc<dyn KeyHolder>], key_name: &str) -> CryptResult<()>;

    /// Encrypts `input` into `output`.
    ///
    /// # Errors
    ///
    /// Fails without a key or when the buffers differ in length.
    fn encrypt(&self, block: u64, input: &[u8], output: &mut [u8]) -> CryptResult<()>;

    /// Decrypts `input` into `output`.
    ///
    /// # Errors
    ///
    /// Fails without a key or when the buffers differ in length.
    fn decrypt(&self, block: u64, input: &[u8], output: &mut [u8]) -> CryptResult<()>;
}

/// A source of keys for one attachment.
pub trait KeyHolder: Send + Sync + fmt::Debug {
    /// Registered plugin name.
    fn name(&self) -> &str;

    /// Returns the key called `key_name`, if this holder has it.
    fn supply_key(&self, key_name: &str) -> Option<KeyMaterial>;

    /// Whether the owning attachment may only use keys from its own holders.
    ///
    /// Such attachments are not rescued by keys other sessions brought.
    fn uses_only_own_keys(&self) -> bool {
        false
    }
}

type ProviderFactory = Arc<dyn Fn() -> Arc<dyn EncryptionProvider> + Send + Sync>;
type KeyHolderFactory = Arc<dyn Fn(&AttachmentConfig) -> Arc<dyn KeyHolder> + Send + Sync>;

/// Named factories for providers and key holders.
///
/// Injected into the coordinator; there is no process-wide registry.
#[derive(Default)]
pub struct PluginRegistry {
    providers: RwLock<HashMap<String, ProviderFactory>>,
    key_holders: RwLock<HashMap<String, KeyHolderFactory>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the bundled `Sample` provider and the
    /// `StaticKeys` and `OwnKeys` key holders.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_provider(SAMPLE_PROVIDER, || {
            Arc::new(SampleProvider::new()) as Arc<dyn EncryptionProvider>
        });
        registry.register_key_holder(STATIC_KEYS_HOLDER, |config| {
            Arc::new(StaticKeyHolder::from_config(config)) as Arc<dyn KeyHolder>
        });
        registry.register_key_holder(OWN_KEYS_HOLDER, |config| {
            Arc::new(StaticKeyHolder::from_config(config).only_own_keys()) as Arc<dyn KeyHolder>
        });
        registry
    }

    /// Registers (or replaces) a provider factory.
    pub fn register_provider<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn EncryptionProvider> + Send + Sync + 'static,
    {
        self.providers.write().insert(name.into(), Arc::new(factory));
    }

    /// Registers (or replaces) a key-holder factory.
    pub fn register_key_holder<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AttachmentConfig) -> Arc<dyn KeyHolder> + Send + Sync + 'static,
    {
        self.key_holders
            .write()
            .insert(name.into(), Arc::new(factory));
    }

    /// Creates a fresh provider instance.
    ///
    /// # Errors
    ///
    /// Returns `ProviderNotFound` for an unknown name.
    pub fn load_provider(&self, name: &str) -> CryptResult<Arc<dyn EncryptionProvider>> {
        let factory = self
            .providers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CryptError::provider_not_found(name))?;
        Ok(factory())
    }

    /// Creates a key-holder instance for one attachment.
    ///
    /// # Errors
    ///
    /// Returns `KeyHolderNotFound` for an unknown name.
    pub fn load_key_holder(
        &self,
        name: &str,
        config: &AttachmentConfig,
    ) -> CryptResult<Arc<dyn KeyHolder>> {
        let factory = self
            .key_holders
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CryptError::key_holder_not_found(name))?;
        Ok(factory(config))
    }

    /// Returns whether a provider is registered under `name`.
    #[must_use]
    pub fn has_provider(&self, name: &str) -> bool {
        self.providers.read().contains_key(name)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<_> = self.providers.read().keys().cloned().collect();
        let mut key_holders: Vec<_> = self.key_holders.read().keys().cloned().collect();
        providers.sort();
        key_holders.sort();
        f.debug_struct("PluginRegistry")
            .field("providers", &providers)
            .field("key_holders", &key_holders)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn key_material_debug_is_redacted() {
        let key = KeyMaterial::from_slice(b"super secret");
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("super"));
    }

    #[test]
    fn generated_keys_differ() {
        let a = KeyMaterial::generate();
        let b = KeyMaterial::generate();
        assert_eq!(a.len(), GENERATED_KEY_SIZE);
        assert_ne!(a, b);
    }

    #[test]
    fn defaults_are_registered() {
        let plugins = PluginRegistry::with_defaults();
        let provider = plugins.load_provider(SAMPLE_PROVIDER).unwrap();
        assert_eq!(provider.name(), SAMPLE_PROVIDER);

        let config = AttachmentConfig::new();
        let holder = plugins.load_key_holder(OWN_KEYS_HOLDER, &config).unwrap();
        assert!(holder.uses_only_own_keys());
        let holder = plugins.load_key_holder(STATIC_KEYS_HOLDER, &config).unwrap();
        assert!(!holder.uses_only_own_keys());
    }

    #[test]
    fn unknown_plugins_are_configuration_errors() {
        let plugins = PluginRegistry::new();
        let err = plugins.load_provider("Nope").unwrap_err();
        assert!(matches!(err, CryptError::ProviderNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = plugins
            .load_key_holder("Nope", &AttachmentConfig::new())
            .unwrap_err();
        assert!(matches!(err, CryptError::KeyHolderNotFound { .. }));
    }

    #[test]
    fn each_load_is_a_fresh_instance() {
        let plugins = PluginRegistry::with_defaults();
        let a = plugins.load_provider(SAMPLE_PROVIDER).unwrap();
        let b = plugins.load_provider(SAMPLE_PROVIDER).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
