//! Stateless per-segment hash → encrypt → upload pipeline.
//!
//! Parameterized by a session's content key; holds no session state
//! itself. Every step but the iv and the remote object id is a pure
//! function of its inputs.

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::EngineResult;
use crate::external::ContentStore;
use crate::keyvault::derive_segment_subkey;

/// Result of processing one segment: everything needed to build its
/// [`crate::manifest::SegmentRecord`] once the upload completes.
#[derive(Debug, Clone)]
pub struct ProcessedSegment {
    pub index: u32,
    pub object_id: String,
    pub plaintext_hash: [u8; 32],
    pub encrypted_hash: [u8; 32],
    pub iv: [u8; 12],
    pub size: u64,
    pub captured_at: u64,
}

/// Hashes, encrypts, and uploads one segment's plaintext bytes.
pub struct ChunkProcessor {
    content_key: [u8; 32],
    content_store: Arc<dyn ContentStore>,
}

impl ChunkProcessor {
    pub fn new(content_key: [u8; 32], content_store: Arc<dyn ContentStore>) -> Self {
        Self {
            content_key,
            content_store,
        }
    }

    /// Process one segment's plaintext bytes.
    ///
    /// Hashing and encryption are local and infallible; only the
    /// content-store upload can fail, and that failure is surfaced as
    /// whatever [`crate::error::EngineError`] the store returns
    /// (typically `NetworkTransient` or `NetworkFatal`) so the caller
    /// can decide whether to retry.
    pub async fn process_chunk(
        &self,
        bytes: &[u8],
        index: u32,
        captured_at: u64,
        object_hint: Option<String>,
    ) -> EngineResult<ProcessedSegment> {
        let plaintext_hash: [u8; 32] = Sha256::digest(bytes).into();

        let subkey = derive_segment_subkey(&self.content_key, index);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&subkey));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, bytes)
            .expect("AES-256-GCM encryption with a fresh nonce cannot fail");

        let encrypted_hash: [u8; 32] = Sha256::digest(&ciphertext).into();
        let size = ciphertext.len() as u64;

        let object_id = self.content_store.put(ciphertext, object_hint).await?;

        Ok(ProcessedSegment {
            index,
            object_id,
            plaintext_hash,
            encrypted_hash,
            iv: nonce.into(),
            size,
            captured_at,
        })
    }

    /// Decrypt a previously encrypted segment, given its index and the
    /// original iv. Used by holders of the content key to recover
    /// plaintext from a downloaded object.
    pub fn decrypt_segment(
        &self,
        ciphertext: &[u8],
        index: u32,
        iv: &[u8; 12],
    ) -> EngineResult<Vec<u8>> {
        let subkey = derive_segment_subkey(&self.content_key, index);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&subkey));
        let nonce = Nonce::from_slice(iv);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| crate::error::EngineError::AuthenticationFailed)
    }
}
