//! Reference key holder backed by the keys an attachment brought along.

use super::{KeyHolder, KeyMaterial};
use crate::config::AttachmentConfig;
use std::collections::HashMap;

/// Registered name of the pooling key holder.
pub const STATIC_KEYS_HOLDER: &str = "StaticKeys";

/// Registered name of the key holder that refuses pooled keys.
pub const OWN_KEYS_HOLDER: &str = "OwnKeys";

/// Supplies keys from a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyHolder {
    keys: HashMap<String, KeyMaterial>,
    only_own: bool,
}

impl StaticKeyHolder {
    /// Creates a holder with no keys.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a holder with the keys of an attachment configuration.
    #[must_use]
    pub fn from_config(config: &AttachmentConfig) -> Self {
        Self {
            keys: config.keys.clone(),
            only_own: false,
        }
    }

    /// Adds a key.
    #[must_use]
    pub fn with_key(mut self, name: impl Into<String>, material: KeyMaterial) -> Self {
        self.keys.insert(name.into(), material);
        self
    }

    /// Marks the holder as using only its own keys.
    #[must_use]
    pub fn only_own_keys(mut self) -> Self {
        self.only_own = true;
        self
    }
}

impl KeyHolder for StaticKeyHolder {
    fn name(&self) -> &str {
        if self.only_own {
            OWN_KEYS_HOLDER
        } else {
            STATIC_KEYS_HOLDER
        }
    }

    fn supply_key(&self, key_name: &str) -> Option<KeyMaterial> {
        self.keys.get(key_name).cloned()
    }

    fn uses_only_own_keys(&self) -> bool {
        self.only_own
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supplies_configured_keys() {
        let config = AttachmentConfig::new().key("red", KeyMaterial::from_slice(b"k1"));
        let holder = StaticKeyHolder::from_config(&config);

        assert_eq!(holder.supply_key("red").unwrap().as_bytes(), b"k1");
        assert!(holder.supply_key("blue").is_none());
        assert_eq!(holder.name(), STATIC_KEYS_HOLDER);
    }

    #[test]
    fn only_own_variant() {
        let holder = StaticKeyHolder::new().only_own_keys();
        assert!(holder.uses_only_own_keys());
        assert_eq!(holder.name(), OWN_KEYS_HOLDER);
    }
}
