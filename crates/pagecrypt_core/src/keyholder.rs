//! Per-attachment key-holder bookkeeping.
//!
//! Before a database is switched to a key, every attached session must be
//! able to keep reading it. The registry remembers which key holders each
//! attachment brought and checks them against a candidate key.

use crate::config::AttachmentConfig;
use crate::error::{CryptError, CryptResult};
use crate::header::validation_hash;
use crate::provider::{KeyHolder, PluginRegistry};
use crate::types::AttachmentId;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Connection state of a registered attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentStatus {
    /// The attachment may use the database.
    Connected,
    /// The attachment was cut off because it cannot supply the key.
    Disconnected,
}

/// Outcome of validating every attachment against a key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Attachments that can use the key.
    pub valid: Vec<AttachmentId>,
    /// Attachments that cannot.
    pub rejected: Vec<AttachmentId>,
}

impl ValidationReport {
    /// Returns whether every attachment passed.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.rejected.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    id: AttachmentId,
    holders: Vec<Arc<dyn KeyHolder>>,
    status: AttachmentStatus,
}

impl Entry {
    fn only_own_keys(&self) -> bool {
        self.holders.iter().any(|h| h.uses_only_own_keys())
    }
}

/// Key holders of all attachments in this process.
#[derive(Debug, Default)]
pub struct KeyHolderRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl KeyHolderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiates the key holders configured for an attachment.
    ///
    /// # Errors
    ///
    /// Returns `KeyHolderNotFound` if a configured plugin is unknown, or
    /// `InvalidOperation` if the attachment is already registered.
    pub fn attach(
        &self,
        id: AttachmentId,
        config: &AttachmentConfig,
        plugins: &PluginRegistry,
    ) -> CryptResult<()> {
        let holders = config
            .key_holders
            .iter()
            .map(|name| plugins.load_key_holder(name, config))
            .collect::<CryptResult<Vec<_>>>()?;

        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.id == id) {
            return Err(CryptError::invalid_operation(format!(
                "{id} is already attached"
            )));
        }
        debug!(attachment = %id, holders = holders.len(), "key holders registered");
        entries.push(Entry {
            id,
            holders,
            status: AttachmentStatus::Connected,
        });
        Ok(())
    }

    /// Drops the key holders of an attachment.
    ///
    /// # Errors
    ///
    /// Returns `AttachmentNotFound` for an unknown attachment.
    pub fn detach(&self, id: AttachmentId) -> CryptResult<()> {
        let mut entries = self.entries.write();
        let index = entries
            .iter()
            .position(|e| e.id == id)
            .ok_or(CryptError::AttachmentNotFound(id))?;
        entries.remove(index);
        debug!(attachment = %id, "key holders released");
        Ok(())
    }

    /// Returns the status of an attachment.
    #[must_use]
    pub fn status(&self, id: AttachmentId) -> Option<AttachmentStatus> {
        self.entries
            .read()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.status)
    }

    /// Fails unless the attachment is registered and connected.
    ///
    /// # Errors
    ///
    /// Returns `AttachmentNotFound` or `AttachmentDisconnected`.
    pub fn ensure_connected(&self, id: AttachmentId) -> CryptResult<()> {
        match self.status(id) {
            Some(AttachmentStatus::Connected) => Ok(()),
            Some(AttachmentStatus::Disconnected) => Err(CryptError::AttachmentDisconnected(id)),
            None => Err(CryptError::AttachmentNotFound(id)),
        }
    }

    /// Returns the attachments in registration order.
    #[must_use]
    pub fn attachments(&self) -> Vec<AttachmentId> {
        self.entries.read().iter().map(|e| e.id).collect()
    }

    /// Returns the number of registered attachments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns whether no attachment is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns the key holders of every connected attachment.
    #[must_use]
    pub fn all_holders(&self) -> Vec<Arc<dyn KeyHolder>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.status == AttachmentStatus::Connected)
            .flat_map(|e| e.holders.iter().cloned())
            .collect()
    }

    /// Checks one attachment against a key.
    ///
    /// # Errors
    ///
    /// Returns `AttachmentNotFound`, or `ProviderNotFound` if the plugin is
    /// unknown.
    pub fn validate_attachment(
        &self,
        id: AttachmentId,
        plugins: &PluginRegistry,
        plugin: &str,
        key_name: &str,
        expected_hash: &str,
    ) -> CryptResult<bool> {
        let entry = self
            .entries
            .read()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(CryptError::AttachmentNotFound(id))?;

        if reproduces(plugins, plugin, &entry.holders, key_name, expected_hash)? {
            return Ok(true);
        }
        if entry.only_own_keys() {
            return Ok(false);
        }
        reproduces(plugins, plugin, &self.all_holders(), key_name, expected_hash)
    }

    /// Checks every connected attachment against a key.
    ///
    /// An attachment passes if its own holders reproduce `expected_hash`, or,
    /// unless one of its holders insists on its own keys, if the pooled
    /// holders of all attachments do.
    ///
    /// # Errors
    ///
    /// Returns `ProviderNotFound` if the plugin is unknown.
    pub fn validate_all_attachments(
        &self,
        plugins: &PluginRegistry,
        plugin: &str,
        key_name: &str,
        expected_hash: &str,
    ) -> CryptResult<ValidationReport> {
        let entries: Vec<Entry> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.status == AttachmentStatus::Connected)
            .cloned()
            .collect();
        let pooled: Vec<Arc<dyn KeyHolder>> =
            entries.iter().flat_map(|e| e.holders.iter().cloned()).collect();
        let mut pooled_ok = None;

        let mut report = ValidationReport::default();
        for entry in &entries {
            let mut ok = reproduces(plugins, plugin, &entry.holders, key_name, expected_hash)?;
            if !ok && !entry.only_own_keys() {
                ok = match pooled_ok {
                    Some(result) => result,
                    None => {
                        let result =
                            reproduces(plugins, plugin, &pooled, key_name, expected_hash)?;
                        pooled_ok = Some(result);
                        result
                    }
                };
            }
            if ok {
                report.valid.push(entry.id);
            } else {
                report.rejected.push(entry.id);
            }
        }

        debug!(
            plugin,
            key = key_name,
            valid = report.valid.len(),
            rejected = report.rejected.len(),
            "attachments validated"
        );
        Ok(report)
    }

    /// Cuts off attachments that cannot supply the key.
    pub fn force_disconnect(&self, ids: &[AttachmentId]) {
        let mut entries = self.entries.write();
        for entry in entries.iter_mut().filter(|e| ids.contains(&e.id)) {
            if entry.status == AttachmentStatus::Connected {
                warn!(attachment = %entry.id, "disconnecting attachment without database key");
                entry.status = AttachmentStatus::Disconnected;
            }
        }
    }
}

fn reproduces(
    plugins: &PluginRegistry,
    plugin: &str,
    holders: &[Arc<dyn KeyHolder>],
    key_name: &str,
    expected_hash: &str,
) -> CryptResult<bool> {
    let provider = plugins.load_provider(plugin)?;
    if provider.set_key(holders, key_name).is_err() {
        return Ok(false);
    }
    Ok(validation_hash(provider.as_ref()).is_ok_and(|hash| hash == expected_hash))
}
