//! Deterministic in-memory fakes for the external collaborator traits.
//!
//! Used by the engine's own test suite to exercise retry, backoff,
//! and crash-recovery behavior without a real wallet, content store,
//! or ledger.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::external::{ContentStore, LedgerClient, LedgerStatus, TypedMessage, Wallet};

/// A wallet that always returns the same signature for the same
/// message, as a real deterministic signer would.
pub struct InMemoryWallet {
    address: String,
    seed: Vec<u8>,
}

impl InMemoryWallet {
    pub fn new(address: impl Into<String>, seed: impl Into<Vec<u8>>) -> Self {
        Self {
            address: address.into(),
            seed: seed.into(),
        }
    }
}

#[async_trait]
impl Wallet for InMemoryWallet {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign(&self, message: &TypedMessage) -> EngineResult<Vec<u8>> {
        let mut hasher = Sha256::new();
        hasher.update(&self.seed);
        hasher.update(serde_json::to_vec(message)?);
        Ok(hasher.finalize().to_vec())
    }
}

/// An in-memory content store that can be told to fail the next `n`
/// puts for a given hint, to exercise UploadQueue retry/backoff.
#[derive(Default)]
pub struct InMemoryContentStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pending_failures: Mutex<HashMap<String, u32>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause the next `n` `put` calls carrying this exact `hint` to
    /// fail with a transient network error.
    pub fn fail_next_puts(&self, hint: &str, n: u32) {
        self.pending_failures
            .lock()
            .expect("lock poisoned")
            .insert(hint.to_string(), n);
    }

    pub fn stored_object(&self, object_id: &str) -> Option<Vec<u8>> {
        self.objects.lock().expect("lock poisoned").get(object_id).cloned()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn put(&self, bytes: Vec<u8>, hint: Option<String>) -> EngineResult<String> {
        if let Some(hint) = &hint {
            let mut failures = self.pending_failures.lock().expect("lock poisoned");
            if let Some(remaining) = failures.get_mut(hint) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::NetworkTransient(format!(
                        "injected failure for {hint}"
                    )));
                }
            }
        }

        let object_id = hex::encode(Sha256::digest(&bytes));
        self.objects
            .lock()
            .expect("lock poisoned")
            .insert(object_id.clone(), bytes);
        Ok(object_id)
    }

    async fn get(&self, object_id: &str) -> EngineResult<Vec<u8>> {
        self.objects
            .lock()
            .expect("lock poisoned")
            .get(object_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown object id {object_id}")))
    }
}

/// An in-memory ledger that records every submitted update and always
/// reports inclusion as successful unless configured otherwise.
#[derive(Default)]
pub struct InMemoryLedgerClient {
    submissions: Mutex<Vec<([u8; 16], [u8; 32], Option<String>)>>,
    next_tx_id: Mutex<u64>,
    reject_next: Mutex<bool>,
}

impl InMemoryLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().expect("lock poisoned").len()
    }

    pub fn final_submission_count(&self) -> usize {
        self.submissions
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(_, _, manifest_ref)| manifest_ref.is_some())
            .count()
    }

    /// Cause the next `submit_update` to be reported as reverted.
    pub fn reject_next(&self) {
        *self.reject_next.lock().expect("lock poisoned") = true;
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedgerClient {
    async fn submit_update(
        &self,
        session_id: [u8; 16],
        root: [u8; 32],
        manifest_ref: Option<String>,
    ) -> EngineResult<String> {
        let mut counter = self.next_tx_id.lock().expect("lock poisoned");
        *counter += 1;
        let tx_id = format!("tx-{counter}");

        self.submissions
            .lock()
            .expect("lock poisoned")
            .push((session_id, root, manifest_ref));

        Ok(tx_id)
    }

    async fn wait_for_inclusion(&self, _tx_id: &str) -> EngineResult<LedgerStatus> {
        let mut reject = self.reject_next.lock().expect("lock poisoned");
        if *reject {
            *reject = false;
            return Ok(LedgerStatus::Reverted);
        }
        Ok(LedgerStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn content_store_is_content_addressed() {
        let store = InMemoryContentStore::new();
        let id_a = store.put(b"hello".to_vec(), None).await.unwrap();
        let id_b = store.put(b"hello".to_vec(), None).await.unwrap();
        assert_eq!(id_a, id_b);
    }

    #[tokio::test]
    async fn content_store_injects_failures_then_succeeds() {
        let store = InMemoryContentStore::new();
        store.fail_next_puts("session-a:1", 2);

        assert!(
            store
                .put(b"a".to_vec(), Some("session-a:1".to_string()))
                .await
                .is_err()
        );
        assert!(
            store
                .put(b"a".to_vec(), Some("session-a:1".to_string()))
                .await
                .is_err()
        );
        assert!(
            store
                .put(b"a".to_vec(), Some("session-a:1".to_string()))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn wallet_signature_is_deterministic() {
        let wallet = InMemoryWallet::new("0xabc", b"seed".to_vec());
        let message = TypedMessage::personal_key_request("witness-core", 1);
        let sig1 = wallet.sign(&message).await.unwrap();
        let sig2 = wallet.sign(&message).await.unwrap();
        assert_eq!(sig1, sig2);
    }
}
