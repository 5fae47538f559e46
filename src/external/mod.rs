//! External collaborator traits.
//!
//! The engine depends on three services it does not implement itself:
//! a signing wallet, a content-addressable object store, and an
//! append-only ledger. Each is an `async_trait` object-safe interface
//! so the engine can hold a `Arc<dyn Trait>` and tests can substitute
//! deterministic in-memory fakes ([`memory`]) for the real network
//! implementations ([`http`]).

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// The fixed typed-data message signed to derive the personal key.
///
/// Stability contract: this structure must not change across
/// releases — changing it breaks every deterministic key recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedMessage {
    pub domain_name: String,
    pub domain_version: String,
    pub chain_id: u64,
    pub purpose: String,
    pub application: String,
    pub version: u32,
}

impl TypedMessage {
    pub fn personal_key_request(application: &str, chain_id: u64) -> Self {
        Self {
            domain_name: "witness-protocol".to_string(),
            domain_version: "1".to_string(),
            chain_id,
            purpose: "derive-personal-key".to_string(),
            application: application.to_string(),
            version: 1,
        }
    }
}

/// Produces deterministic signatures over typed messages.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// The wallet address of the signer, used as `Session.uploader`.
    fn address(&self) -> String;

    /// Sign `message`. The response is treated opaquely as HKDF input
    /// key material by the caller.
    async fn sign(&self, message: &TypedMessage) -> EngineResult<Vec<u8>>;
}

/// An external content-addressable object store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Upload `bytes`, returning a content ID stable for identical
    /// bytes. `hint` may be used for logging/placement, never for
    /// addressing.
    async fn put(&self, bytes: Vec<u8>, hint: Option<String>) -> EngineResult<String>;

    /// Fetch the bytes previously stored under `object_id`.
    async fn get(&self, object_id: &str) -> EngineResult<Vec<u8>>;
}

/// Outcome of a ledger inclusion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Success,
    Reverted,
}

/// An external append-only ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit `(sessionId, merkleRoot, manifestRef)`. `manifest_ref`
    /// is absent until the session's final update.
    async fn submit_update(
        &self,
        session_id: [u8; 16],
        root: [u8; 32],
        manifest_ref: Option<String>,
    ) -> EngineResult<String>;

    /// Block until the transaction either lands or is reverted.
    async fn wait_for_inclusion(&self, tx_id: &str) -> EngineResult<LedgerStatus>;
}
