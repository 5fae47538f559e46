// Crate-level lint configuration
// Allow noisy pedantic/cargo lints that aren't worth fixing individually
#![allow(clippy::multiple_crate_versions)] // Transitive deps, can't easily fix
#![allow(clippy::missing_errors_doc)] // Would require extensive doc changes
#![allow(clippy::missing_panics_doc)] // Would require extensive doc changes
#![allow(clippy::must_use_candidate)] // Too many false positives for internal APIs
#![allow(clippy::module_name_repetitions)] // Acceptable for clarity (e.g., EngineError in error mod)
#![allow(clippy::doc_markdown)] // Too strict about backticks in docs
#![allow(clippy::missing_const_for_fn)] // Often debatable, runtime doesn't benefit

//! Witness Core
//!
//! A client-side evidence capture and preservation engine: derives a
//! per-device key hierarchy from a wallet signature, streams captured
//! media through a hash-encrypt-upload pipeline, commits every segment
//! to an incremental Merkle tree, and anchors that tree's root on an
//! external ledger at a bounded cadence.
//!
//! ## Architecture
//!
//! - [`keyvault`]: derives and wraps the engine's key hierarchy (personal
//!   key, group secret, content key, per-segment subkeys).
//! - [`secure_store`]: envelope-encrypted key/value storage layered over
//!   [`storage`], keyed by the personal key.
//! - [`chunk_processor`]: the stateless per-segment hash → encrypt →
//!   upload pipeline.
//! - [`upload_queue`]: the durable, crash-recoverable FIFO upload queue.
//! - [`merkle`]: the incremental binary Merkle tree over segment leaves.
//! - [`manifest`]: manifest assembly and canonical serialization.
//! - [`session_manager`]: orchestrates a capture session end to end,
//!   including ledger update cadence and crash recovery.
//! - [`audit`]: the engine's own hash-chained, signed audit trail.
//! - [`external`]: the wallet, content-store, and ledger collaborator
//!   traits, plus HTTP and in-memory implementations.
//!
//! ## Security Model
//!
//! - Every key below the wallet signature is derived, never persisted
//!   in plaintext: the content key is wrapped under the group secret,
//!   and the group secret itself never touches disk unwrapped.
//! - The Merkle commitment tree and the audit log's hash chain use
//!   distinct domain separation and must never share a root or leaf
//!   encoding.
//! - External collaborators (wallet, content store, ledger) are treated
//!   strictly as interfaces; this crate never assumes a specific wallet
//!   or blockchain.

pub mod audit;
pub mod chunk_processor;
pub mod config;
pub mod error;
pub mod external;
pub mod keyvault;
pub mod manifest;
pub mod merkle;
pub mod secure_store;
pub mod session_manager;
pub mod storage;
pub mod upload_queue;

#[cfg(feature = "otel")]
pub mod telemetry;

#[cfg(not(feature = "otel"))]
pub mod telemetry {
    //! Stub telemetry module when OpenTelemetry is disabled.

    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    /// Initialize tracing with console output only.
    pub fn init_tracing() {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "witness_core=info".into());
        let fmt_layer = tracing_subscriber::fmt::layer();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }

    /// No-op shutdown when OpenTelemetry is disabled.
    pub fn shutdown_tracing() {}
}

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use session_manager::{SessionHandle, SessionManager};
