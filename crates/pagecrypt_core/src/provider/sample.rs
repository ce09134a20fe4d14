//! Reference provider: AES-256 in counter mode.
//!
//! The cipher key is derived with HKDF-SHA256 from whatever material the
//! key holder supplies. The counter block is `block (8 bytes BE) || index
//! (8 bytes BE)`, so every page gets its own keystream and the transform
//! is its own inverse.

use super::{EncryptionProvider, KeyHolder};
use crate::error::{CryptError, CryptResult};
use aes_gcm::aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes_gcm::aes::{Aes256, Block};
use hkdf::Hkdf;
use parking_lot::RwLock;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroize;

/// Registered name of the reference provider.
pub const SAMPLE_PROVIDER: &str = "Sample";

const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const KDF_INFO: &[u8] = b"pagecrypt-sample-page-key-v1";

/// AES-256-CTR page cipher.
#[derive(Default)]
pub struct SampleProvider {
    cipher: RwLock<Option<Aes256>>,
}

impl SampleProvider {
    /// Creates a provider with no key loaded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider keyed directly from raw material.
    ///
    /// # Errors
    ///
    /// Fails if key derivation fails.
    pub fn with_key(material: &[u8]) -> CryptResult<Self> {
        let provider = Self::new();
        provider.install(material)?;
        Ok(provider)
    }

    /// Returns whether a key is loaded.
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.cipher.read().is_some()
    }

    fn install(&self, material: &[u8]) -> CryptResult<()> {
        let hk = Hkdf::<Sha256>::new(None, material);
        let mut key = [0u8; KEY_SIZE];
        hk.expand(KDF_INFO, &mut key)
            .map_err(|_| CryptError::crypt("HKDF expand failed"))?;
        let cipher = Aes256::new(GenericArray::from_slice(&key));
        key.zeroize();
        *self.cipher.write() = Some(cipher);
        Ok(())
    }

    fn apply_keystream(&self, block: u64, input: &[u8], output: &mut [u8]) -> CryptResult<()> {
        if input.len() != output.len() {
            return Err(CryptError::crypt(format!(
                "buffer length mismatch: {} in, {} out",
                input.len(),
                output.len()
            )));
        }
        let guard = self.cipher.read();
        let cipher = guard.as_ref().ok_or_else(|| CryptError::KeyUnavailable {
            plugin: SAMPLE_PROVIDER.to_string(),
        })?;

        for (index, (src, dst)) in input
            .chunks(BLOCK_SIZE)
            .zip(output.chunks_mut(BLOCK_SIZE))
            .enumerate()
        {
            let mut counter = Block::default();
            counter[..8].copy_from_slice(&block.to_be_bytes());
            counter[8..].copy_from_slice(&(index as u64).to_be_bytes());
            cipher.encrypt_block(&mut counter);
            for ((d, s), k) in dst.iter_mut().zip(src).zip(counter.iter()) {
                *d = s ^ k;
            }
        }
        Ok(())
    }
}

impl EncryptionProvider for SampleProvider {
    fn name(&self) -> &str {
        SAMPLE_PROVIDER
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn set_key(&self, holders: &[Arc<dyn KeyHolder>], key_name: &str) -> CryptResult<()> {
        let material = holders
            .iter()
            .find_map(|holder| holder.supply_key(key_name))
            .ok_or_else(|| CryptError::crypt(format!("no key holder supplies key {key_name}")))?;
        self.install(material.as_bytes())
    }

    fn encrypt(&self, block: u64, input: &[u8], output: &mut [u8]) -> CryptResult<()> {
        self.apply_keystream(block, input, output)
    }

    fn decrypt(&self, block: u64, input: &[u8], output: &mut [u8]) -> CryptResult<()> {
        self.apply_keystream(block, input, output)
    }
}

impl fmt::Debug for SampleProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleProvider")
            .field("cipher", &"Aes256Ctr")
            .field("keyed", &self.has_key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{KeyMaterial, StaticKeyHolder};
    use proptest::prelude::*;

    fn holders(key_name: &str, material: &[u8]) -> Vec<Arc<dyn KeyHolder>> {
        let holder = StaticKeyHolder::new().with_key(key_name, KeyMaterial::from_slice(material));
        vec![Arc::new(holder) as Arc<dyn KeyHolder>]
    }

    #[test]
    fn encrypt_without_key_fails() {
        let provider = SampleProvider::new();
        let mut out = [0u8; 16];
        let err = provider.encrypt(0, &[0u8; 16], &mut out).unwrap_err();
        assert!(err.is_crypt());
    }

    #[test]
    fn set_key_uses_first_supplying_holder() {
        let provider = SampleProvider::new();
        let mut all = holders("blue", b"wrong");
        all.extend(holders("red", b"right"));
        provider.set_key(&all, "red").unwrap();

        let reference = SampleProvider::with_key(b"right").unwrap();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        provider.encrypt(3, &[7u8; 32], &mut a).unwrap();
        reference.encrypt(3, &[7u8; 32], &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn set_key_without_supplier_fails() {
        let provider = SampleProvider::new();
        assert!(provider.set_key(&holders("blue", b"k"), "red").is_err());
        assert!(!provider.has_key());
    }

    #[test]
    fn tweak_changes_ciphertext() {
        let provider = SampleProvider::with_key(b"material").unwrap();
        let plain = [0x55u8; 64];
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        provider.encrypt(1, &plain, &mut a).unwrap();
        provider.encrypt(2, &plain, &mut b).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, plain);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let provider = SampleProvider::with_key(b"material").unwrap();
        let mut out = [0u8; 15];
        assert!(provider.encrypt(0, &[0u8; 16], &mut out).is_err());
    }

    proptest! {
        #[test]
        fn round_trip_block_aligned(
            blocks in 0usize..64,
            seed in any::<u8>(),
            tweak in any::<u64>(),
            key in proptest::collection::vec(any::<u8>(), 1..64),
        ) {
            let provider = SampleProvider::with_key(&key).unwrap();
            let plain: Vec<u8> = (0..blocks * BLOCK_SIZE)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect();
            let mut cipher = vec![0u8; plain.len()];
            let mut back = vec![0u8; plain.len()];
            provider.encrypt(tweak, &plain, &mut cipher).unwrap();
            provider.decrypt(tweak, &cipher, &mut back).unwrap();
            prop_assert_eq!(back, plain);
        }
    }
}
