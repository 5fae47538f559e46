//! Authenticated-encrypted persistent key/value store.
//!
//! Backs identities and group secrets. Every value is serialized as
//! stable JSON, then AES-256-GCM-encrypted under the process
//! [`PersonalKey`](crate::keyvault::PersonalKey) with a fresh 96-bit
//! iv, then stored as `iv || ciphertext` under its handle. Puts are
//! atomic per key; there are no cross-key transactions and the last
//! writer always wins.

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{EngineError, EngineResult};
use crate::keyvault::PersonalKey;
use crate::storage::Storage;

const IV_LEN: usize = 12;

/// Persistent, authenticated-encrypted key/value store.
pub struct SecureStore {
    storage: Storage,
    personal_key: PersonalKey,
}

impl SecureStore {
    pub fn new(storage: Storage, personal_key: PersonalKey) -> Self {
        Self {
            storage,
            personal_key,
        }
    }

    /// Serialize, encrypt, and persist `value` under `handle`.
    pub fn put<T: Serialize>(&self, handle: &str, value: &T) -> EngineResult<()> {
        let plaintext = serde_json::to_vec(value)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.personal_key.as_bytes()));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| EngineError::Internal("secure store encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);

        self.storage.put_secure_entry(handle, &blob)?;
        tracing::debug!(handle, "secure store entry written");
        Ok(())
    }

    /// Decrypt and deserialize the value stored under `handle`.
    ///
    /// Returns `Ok(None)` if no value exists. Fails with
    /// [`EngineError::AuthenticationFailed`] — leaving the stored
    /// value untouched — if decryption fails, whether from a wrong
    /// personal key or a corrupted blob.
    pub fn get<T: DeserializeOwned>(&self, handle: &str) -> EngineResult<Option<T>> {
        let Some(blob) = self.storage.get_secure_entry(handle)? else {
            return Ok(None);
        };

        if blob.len() < IV_LEN {
            return Err(EngineError::AuthenticationFailed);
        }
        let (iv_bytes, ciphertext) = blob.split_at(IV_LEN);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.personal_key.as_bytes()));
        let nonce = Nonce::from_slice(iv_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| EngineError::AuthenticationFailed)?;

        let value = serde_json::from_slice(&plaintext)?;
        Ok(Some(value))
    }

    /// Remove the entry stored under `handle`.
    pub fn delete(&self, handle: &str) -> EngineResult<bool> {
        self.storage.delete_secure_entry(handle)
    }
}
