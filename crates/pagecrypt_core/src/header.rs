//! Encryption header stored on page 0.
//!
//! Payload layout (little endian, after the page header):
//!
//! ```text
//! magic "PCHD" | version u16 | flags u8 | reserved u8 | checkpoint u32
//! plugin name, 32 bytes, NUL padded
//! entries: tag u8 | len u16 | value ... terminated by tag 0
//! ```
//!
//! Entries with unknown tags are kept verbatim across rewrites.

use crate::error::{CryptError, CryptResult};
use crate::provider::EncryptionProvider;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use pagecrypt_storage::{Page, PageNumber, PageType};
use sha2::{Digest, Sha256};

/// Magic bytes of the encryption header.
pub const HEADER_MAGIC: [u8; 4] = *b"PCHD";

/// Current header format version.
pub const HEADER_VERSION: u16 = 1;

/// Longest plugin name the header can hold.
pub const MAX_PLUGIN_NAME: usize = 31;

/// Longest key name an entry can hold.
pub const MAX_KEY_NAME: usize = 255;

/// Fixed plaintext whose ciphertext identifies a key.
pub const VALIDATION_PROBE: &[u8; 16] = b"0123456789ABCDEF";

const PLUGIN_FIELD: usize = MAX_PLUGIN_NAME + 1;
const FIXED_SIZE: usize = 4 + 2 + 1 + 1 + 4 + PLUGIN_FIELD;

const FLAG_ENCRYPTED: u8 = 0x01;
const FLAG_SWEEP_ACTIVE: u8 = 0x02;

/// Tags of the extension entries the coordinator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryTag {
    /// Terminates the entry list.
    End = 0,
    /// Name of the key the database is encrypted with.
    KeyName = 1,
    /// Hash identifying the key.
    ValidationHash = 2,
    /// Signature over the signed fields.
    DigitalSignature = 3,
}

/// An entry with a tag this version does not interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEntry {
    /// Raw tag.
    pub tag: u8,
    /// Raw value.
    pub value: Vec<u8>,
}

/// Decoded encryption header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderRecord {
    /// Target state: pages are (or are becoming) encrypted.
    pub encrypted: bool,
    /// A sweep has not finished yet.
    pub sweep_active: bool,
    /// First page the sweep has not yet brought to the target state.
    pub checkpoint: PageNumber,
    /// Encryption provider name; empty if never encrypted.
    pub plugin: String,
    /// Key name.
    pub key_name: Option<String>,
    /// Base64 validation hash of the key.
    pub validation_hash: Option<String>,
    /// Base64 header signature.
    pub signature: Option<String>,
    /// Entries preserved verbatim.
    pub unknown: Vec<UnknownEntry>,
}

impl HeaderRecord {
    /// Creates the header of a plaintext database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a provider must be loaded to use the database.
    #[must_use]
    pub fn needs_provider(&self) -> bool {
        self.encrypted || self.sweep_active
    }

    /// Encodes the header into a fresh header page.
    ///
    /// # Errors
    ///
    /// Fails if a name exceeds its limit or the entries do not fit.
    pub fn encode(&self, page_size: usize) -> CryptResult<Page> {
        let mut page = Page::new(PageType::Header, page_size)?;
        let payload = page.payload_mut();
        let mut buf = Vec::with_capacity(FIXED_SIZE + 64);

        buf.extend_from_slice(&HEADER_MAGIC);
        buf.extend_from_slice(&HEADER_VERSION.to_le_bytes());

        let mut flags = 0u8;
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.sweep_active {
            flags |= FLAG_SWEEP_ACTIVE;
        }
        buf.push(flags);
        buf.push(0);
        buf.extend_from_slice(&self.checkpoint.as_u32().to_le_bytes());

        let plugin = self.plugin.as_bytes();
        if plugin.len() > MAX_PLUGIN_NAME {
            return Err(CryptError::PluginNameTooLong {
                len: plugin.len(),
                max: MAX_PLUGIN_NAME,
            });
        }
        let mut field = [0u8; PLUGIN_FIELD];
        field[..plugin.len()].copy_from_slice(plugin);
        buf.extend_from_slice(&field);

        if let Some(key) = &self.key_name {
            if key.len() > MAX_KEY_NAME {
                return Err(CryptError::KeyNameTooLong {
                    len: key.len(),
                    max: MAX_KEY_NAME,
                });
            }
            put_entry(&mut buf, EntryTag::KeyName as u8, key.as_bytes())?;
        }
        if let Some(hash) = &self.validation_hash {
            put_entry(&mut buf, EntryTag::ValidationHash as u8, hash.as_bytes())?;
        }
        if let Some(signature) = &self.signature {
            put_entry(&mut buf, EntryTag::DigitalSignature as u8, signature.as_bytes())?;
        }
        for entry in &self.unknown {
            put_entry(&mut buf, entry.tag, &entry.value)?;
        }
        buf.push(EntryTag::End as u8);

        if buf.len() > payload.len() {
            return Err(CryptError::invalid_header(format!(
                "header needs {} bytes, page holds {}",
                buf.len(),
                payload.len()
            )));
        }
        payload[..buf.len()].copy_from_slice(&buf);
        Ok(page)
    }

    /// Decodes the header from the header page.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeader` for a page that is not a valid header.
    pub fn decode(page: &Page) -> CryptResult<Self> {
        if page.page_type() != PageType::Header {
            return Err(CryptError::invalid_header(format!(
                "page 0 has type {:?}",
                page.page_type()
            )));
        }
        let data = page.payload();
        if data.len() < FIXED_SIZE || data[0..4] != HEADER_MAGIC {
            return Err(CryptError::invalid_header("invalid header magic"));
        }
        let mut cursor = 4;

        let version = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
        cursor += 2;
        if version > HEADER_VERSION {
            return Err(CryptError::invalid_header(format!(
                "unsupported header version: {version}"
            )));
        }

        let flags = data[cursor];
        cursor += 2;

        let checkpoint = u32::from_le_bytes([
            data[cursor],
            data[cursor + 1],
            data[cursor + 2],
            data[cursor + 3],
        ]);
        cursor += 4;

        let field = &data[cursor..cursor + PLUGIN_FIELD];
        let end = field.iter().position(|&b| b == 0).unwrap_or(MAX_PLUGIN_NAME);
        let plugin = std::str::from_utf8(&field[..end])
            .map_err(|_| CryptError::invalid_header("invalid plugin name"))?
            .to_string();
        cursor += PLUGIN_FIELD;

        let mut record = Self {
            encrypted: flags & FLAG_ENCRYPTED != 0,
            sweep_active: flags & FLAG_SWEEP_ACTIVE != 0,
            checkpoint: PageNumber::new(checkpoint),
            plugin,
            ..Self::default()
        };

        loop {
            let Some(&tag) = data.get(cursor) else {
                return Err(CryptError::invalid_header("unterminated entry list"));
            };
            cursor += 1;
            if tag == EntryTag::End as u8 {
                break;
            }

            if cursor + 2 > data.len() {
                return Err(CryptError::invalid_header("header too short"));
            }
            let len = u16::from_le_bytes([data[cursor], data[cursor + 1]]) as usize;
            cursor += 2;
            if cursor + len > data.len() {
                return Err(CryptError::invalid_header("header too short"));
            }
            let value = &data[cursor..cursor + len];
            cursor += len;

            match tag {
                t if t == EntryTag::KeyName as u8 => record.key_name = Some(text(value)?),
                t if t == EntryTag::ValidationHash as u8 => {
                    record.validation_hash = Some(text(value)?);
                }
                t if t == EntryTag::DigitalSignature as u8 => {
                    record.signature = Some(text(value)?);
                }
                _ => record.unknown.push(UnknownEntry {
                    tag,
                    value: value.to_vec(),
                }),
            }
        }

        Ok(record)
    }

    /// Returns the string the signature is computed over.
    #[must_use]
    pub fn signed_text(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            u8::from(self.sweep_active),
            u8::from(self.encrypted),
            self.checkpoint.as_u32(),
            self.plugin,
            self.key_name.as_deref().unwrap_or(""),
            self.validation_hash.as_deref().unwrap_or(""),
        )
    }

    /// Computes the signature of the current fields.
    ///
    /// # Errors
    ///
    /// Fails if the provider cannot encrypt.
    pub fn compute_signature(&self, provider: &dyn EncryptionProvider) -> CryptResult<String> {
        let mut text = self.signed_text().into_bytes();
        let block = provider.block_size().max(1);
        text.resize(text.len().div_ceil(block) * block, 0);

        let mut cipher = vec![0u8; text.len()];
        provider.encrypt(0, &text, &mut cipher)?;
        Ok(STANDARD.encode(Sha256::digest(&cipher)))
    }

    /// Recomputes and stores the signature.
    ///
    /// Without a provider the signature is removed.
    ///
    /// # Errors
    ///
    /// Fails if the provider cannot encrypt.
    pub fn sign(&mut self, provider: Option<&dyn EncryptionProvider>) -> CryptResult<()> {
        self.signature = match provider {
            Some(provider) => Some(self.compute_signature(provider)?),
            None => None,
        };
        Ok(())
    }

    /// Checks the stored signature.
    ///
    /// # Errors
    ///
    /// Returns `HeaderTampered` if the signature does not match, or is
    /// missing while the header says pages are encrypted.
    pub fn verify_signature(&self, provider: &dyn EncryptionProvider) -> CryptResult<()> {
        match &self.signature {
            Some(stored) if *stored == self.compute_signature(provider)? => Ok(()),
            None if !self.needs_provider() => Ok(()),
            _ => Err(CryptError::HeaderTampered),
        }
    }

    /// Checks a header that needs no provider.
    ///
    /// A plain header never keeps a signature or key metadata: finishing a
    /// decrypting sweep removes them.
    ///
    /// # Errors
    ///
    /// Returns `HeaderTampered` if any of them is present.
    pub fn verify_plain(&self) -> CryptResult<()> {
        if self.needs_provider() {
            return Ok(());
        }
        if self.signature.is_some() || self.key_name.is_some() || self.validation_hash.is_some() {
            return Err(CryptError::HeaderTampered);
        }
        Ok(())
    }

    /// Strips key metadata once pages no longer depend on it.
    pub fn strip_key(&mut self) {
        self.key_name = None;
        self.validation_hash = None;
    }
}

/// Computes the validation hash of the provider's current key.
///
/// # Errors
///
/// Fails if the provider cannot encrypt.
pub fn validation_hash(provider: &dyn EncryptionProvider) -> CryptResult<String> {
    let mut cipher = [0u8; VALIDATION_PROBE.len()];
    provider.encrypt(0, VALIDATION_PROBE, &mut cipher)?;
    Ok(STANDARD.encode(Sha256::digest(cipher)))
}

fn put_entry(buf: &mut Vec<u8>, tag: u8, value: &[u8]) -> CryptResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| CryptError::invalid_header(format!("entry {tag} too long")))?;
    buf.push(tag);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value);
    Ok(())
}

fn text(value: &[u8]) -> CryptResult<String> {
    std::str::from_utf8(value)
        .map(str::to_string)
        .map_err(|_| CryptError::invalid_header("entry is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SampleProvider;
    use pagecrypt_storage::DEFAULT_PAGE_SIZE;
    use proptest::prelude::*;

    fn encrypted_record() -> HeaderRecord {
        HeaderRecord {
            encrypted: true,
            sweep_active: true,
            checkpoint: PageNumber::FIRST,
            plugin: "Sample".to_string(),
            key_name: Some("red".to_string()),
            validation_hash: Some("aGFzaA==".to_string()),
            signature: None,
            unknown: vec![UnknownEntry {
                tag: 42,
                value: b"opaque".to_vec(),
            }],
        }
    }

    #[test]
    fn encode_decode_with_unknown_entries() {
        let record = encrypted_record();
        let page = record.encode(DEFAULT_PAGE_SIZE).unwrap();
        assert_eq!(page.page_type(), PageType::Header);
        assert_eq!(HeaderRecord::decode(&page).unwrap(), record);
    }

    #[test]
    fn fresh_header_is_plain() {
        let page = HeaderRecord::new().encode(DEFAULT_PAGE_SIZE).unwrap();
        let record = HeaderRecord::decode(&page).unwrap();
        assert!(!record.needs_provider());
        assert!(record.key_name.is_none());
    }

    #[test]
    fn rejects_bad_magic_and_type() {
        let page = Page::new(PageType::Header, DEFAULT_PAGE_SIZE).unwrap();
        assert!(matches!(
            HeaderRecord::decode(&page),
            Err(CryptError::InvalidHeader { .. })
        ));

        let page = Page::new(PageType::Data, DEFAULT_PAGE_SIZE).unwrap();
        assert!(HeaderRecord::decode(&page).is_err());
    }

    #[test]
    fn rejects_long_names() {
        let mut record = HeaderRecord::new();
        record.plugin = "P".repeat(MAX_PLUGIN_NAME + 1);
        assert!(matches!(
            record.encode(DEFAULT_PAGE_SIZE),
            Err(CryptError::PluginNameTooLong { .. })
        ));

        let mut record = HeaderRecord::new();
        record.key_name = Some("k".repeat(MAX_KEY_NAME + 1));
        assert!(matches!(
            record.encode(DEFAULT_PAGE_SIZE),
            Err(CryptError::KeyNameTooLong { .. })
        ));
    }

    #[test]
    fn signed_text_format() {
        let record = encrypted_record();
        assert_eq!(record.signed_text(), "1 1 1 Sample red aGFzaA==");
    }

    #[test]
    fn signature_detects_field_changes() {
        let provider = SampleProvider::with_key(b"key").unwrap();
        let mut record = encrypted_record();
        record.sign(Some(&provider)).unwrap();
        record.verify_signature(&provider).unwrap();

        let mut tampered = record.clone();
        tampered.checkpoint = PageNumber::new(9);
        assert!(matches!(
            tampered.verify_signature(&provider),
            Err(CryptError::HeaderTampered)
        ));

        let mut tampered = record.clone();
        tampered.key_name = Some("blue".to_string());
        assert!(tampered.verify_signature(&provider).is_err());

        let mut unsigned = record;
        unsigned.signature = None;
        assert!(unsigned.verify_signature(&provider).is_err());
    }

    #[test]
    fn plain_header_with_key_metadata_is_tampered() {
        HeaderRecord::new().verify_plain().unwrap();

        let provider = SampleProvider::with_key(b"key").unwrap();
        let mut record = encrypted_record();
        record.sign(Some(&provider)).unwrap();
        record.verify_plain().unwrap();

        let mut flipped = record;
        flipped.encrypted = false;
        flipped.sweep_active = false;
        assert!(matches!(
            flipped.verify_plain(),
            Err(CryptError::HeaderTampered)
        ));

        flipped.sign(None).unwrap();
        assert!(flipped.verify_plain().is_err());

        flipped.strip_key();
        flipped.verify_plain().unwrap();
    }

    #[test]
    fn signature_depends_on_key() {
        let a = SampleProvider::with_key(b"a").unwrap();
        let b = SampleProvider::with_key(b"b").unwrap();
        let mut record = encrypted_record();
        record.sign(Some(&a)).unwrap();
        assert!(record.verify_signature(&b).is_err());
    }

    #[test]
    fn validation_hash_identifies_key() {
        let a = SampleProvider::with_key(b"a").unwrap();
        let a2 = SampleProvider::with_key(b"a").unwrap();
        let b = SampleProvider::with_key(b"b").unwrap();
        assert_eq!(validation_hash(&a).unwrap(), validation_hash(&a2).unwrap());
        assert_ne!(validation_hash(&a).unwrap(), validation_hash(&b).unwrap());
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let mut page = Page::new(PageType::Header, 512).unwrap();
            page.payload_mut()[..bytes.len()].copy_from_slice(&bytes);
            let _ = HeaderRecord::decode(&page);
        }

        #[test]
        fn header_fields_survive_encoding(
            encrypted in any::<bool>(),
            sweep in any::<bool>(),
            checkpoint in any::<u32>(),
            plugin in "[A-Za-z]{0,31}",
            key in proptest::option::of("[a-z0-9_]{1,40}"),
        ) {
            let record = HeaderRecord {
                encrypted,
                sweep_active: sweep,
                checkpoint: PageNumber::new(checkpoint),
                plugin,
                key_name: key,
                ..HeaderRecord::default()
            };
            let page = record.encode(512).unwrap();
            prop_assert_eq!(HeaderRecord::decode(&page).unwrap(), record);
        }
    }
}
