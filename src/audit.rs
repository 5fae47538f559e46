//! Hash-chained audit log for the evidence capture engine.
//!
//! Provides tamper-evident audit logging with:
//! - Sequential entries linked by SHA-256 hashes
//! - Ed25519 signatures on each entry
//! - Chain verification for integrity checking
//!
//! This log is local and forensic only: it records every mutating call
//! into the engine's components, including attempts that never reach
//! the external ledger (a failed upload, a rejected ledger update). It
//! is never uploaded and never shares a root or leaf encoding with the
//! segment [`crate::merkle::MerkleTree`].
//!
//! ## Security Properties
//!
//! - **Tamper-evident**: Modifying any entry breaks the hash chain
//! - **Non-repudiation**: Ed25519 signatures prove entry authenticity
//! - **Ordered**: Sequence numbers prevent reordering attacks

use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use ed25519_dalek::{SecretKey, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::storage::Storage;

/// Types of auditable events, one per mutating operation across the
/// engine's components.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionCreated,
    ChunkAccepted,
    SegmentUploaded,
    SegmentFailed,
    MerkleInserted,
    LedgerSubmitted,
    LedgerConfirmed,
    ManifestFinalized,
    SessionCompleted,
    SessionFailed,
    SessionRecovered,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionCreated => write!(f, "session_created"),
            Self::ChunkAccepted => write!(f, "chunk_accepted"),
            Self::SegmentUploaded => write!(f, "segment_uploaded"),
            Self::SegmentFailed => write!(f, "segment_failed"),
            Self::MerkleInserted => write!(f, "merkle_inserted"),
            Self::LedgerSubmitted => write!(f, "ledger_submitted"),
            Self::LedgerConfirmed => write!(f, "ledger_confirmed"),
            Self::ManifestFinalized => write!(f, "manifest_finalized"),
            Self::SessionCompleted => write!(f, "session_completed"),
            Self::SessionFailed => write!(f, "session_failed"),
            Self::SessionRecovered => write!(f, "session_recovered"),
        }
    }
}

/// Component within the engine that triggered an audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditActor {
    /// A named internal component (e.g. `session_manager`, `upload_queue`).
    Engine { component: String },
    /// Startup/shutdown or other actions with no specific session.
    System,
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Operation succeeded.
    Success,
    /// Operation failed.
    Failure { reason: String },
    /// Operation is pending/in-progress.
    Pending,
}

/// A single audit log entry with hash-chain linking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Sequence number (monotonically increasing).
    pub seq: u64,
    /// Timestamp when the entry was created.
    pub timestamp: DateTime<Utc>,
    /// Type of event.
    pub event_type: AuditEventType,
    /// Component that triggered the event.
    pub actor: AuditActor,
    /// Related session ID (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Outcome of the operation.
    pub outcome: AuditOutcome,
    /// Additional context (JSON-serializable data).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    /// SHA-256 hash of the previous entry (hex).
    pub prev_hash: String,
    /// Ed25519 signature of this entry (hex).
    pub signature: String,
}

impl AsRef<Self> for AuditEntry {
    fn as_ref(&self) -> &Self {
        self
    }
}

impl AuditEntry {
    /// Compute the canonical bytes for hashing/signing.
    fn canonical_bytes(&self) -> Vec<u8> {
        // seq|timestamp|event_type|actor|session_id|outcome|context|prev_hash
        // Excludes the signature field itself.
        let mut data = Vec::new();
        data.extend_from_slice(&self.seq.to_be_bytes());
        data.extend_from_slice(self.timestamp.to_rfc3339().as_bytes());
        data.extend_from_slice(self.event_type.to_string().as_bytes());
        data.extend_from_slice(
            serde_json::to_string(&self.actor)
                .unwrap_or_default()
                .as_bytes(),
        );
        if let Some(ref session_id) = self.session_id {
            data.extend_from_slice(session_id.to_string().as_bytes());
        }
        data.extend_from_slice(
            serde_json::to_string(&self.outcome)
                .unwrap_or_default()
                .as_bytes(),
        );
        if let Some(ref context) = self.context {
            data.extend_from_slice(context.to_string().as_bytes());
        }
        data.extend_from_slice(self.prev_hash.as_bytes());
        data
    }

    /// Compute SHA-256 hash of this entry, including its signature.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        hasher.update(self.signature.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify the signature on this entry.
    pub fn verify_signature(&self, verifying_key: &VerifyingKey) -> bool {
        let Ok(signature_bytes) = hex::decode(&self.signature) else {
            return false;
        };

        let Ok(signature) = ed25519_dalek::Signature::from_slice(&signature_bytes) else {
            return false;
        };

        let data = self.canonical_bytes();
        verifying_key.verify(&data, &signature).is_ok()
    }
}

/// Genesis hash for the first entry in the chain: 32 zero bytes, hex-encoded.
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Audit logger with hash-chaining and signing.
pub struct AuditLogger {
    storage: Storage,
    signing_key: SigningKey,
    /// Current sequence number (atomic for thread safety).
    current_seq: AtomicU64,
    /// Serialize appends to preserve hash chain integrity.
    append_lock: Mutex<()>,
}

impl AuditLogger {
    /// Create a new audit logger, generating a fresh process-local
    /// Ed25519 signing key.
    pub fn new(storage: Storage) -> EngineResult<Self> {
        let mut secret_key_bytes: SecretKey = [0u8; 32];
        OsRng.fill_bytes(&mut secret_key_bytes);
        let signing_key = SigningKey::from_bytes(&secret_key_bytes);

        let current_seq = storage.get_latest_audit_seq()?.unwrap_or(0);

        Ok(Self {
            storage,
            signing_key,
            current_seq: AtomicU64::new(current_seq),
            append_lock: Mutex::new(()),
        })
    }

    /// Create an audit logger with a specific signing key, for
    /// reproducible tests or a caller-supplied identity.
    pub fn with_signing_key(storage: Storage, signing_key: SigningKey) -> EngineResult<Self> {
        let current_seq = storage.get_latest_audit_seq()?.unwrap_or(0);

        Ok(Self {
            storage,
            signing_key,
            current_seq: AtomicU64::new(current_seq),
            append_lock: Mutex::new(()),
        })
    }

    /// Get the verifying key for signature verification.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get the verifying key as hex.
    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    /// Append a new audit entry. Returns the sequence number assigned.
    pub fn append(
        &self,
        event_type: AuditEventType,
        actor: AuditActor,
        session_id: Option<Uuid>,
        outcome: AuditOutcome,
        context: Option<serde_json::Value>,
    ) -> EngineResult<u64> {
        let _append_guard = self
            .append_lock
            .lock()
            .map_err(|_e| EngineError::Internal("audit append lock poisoned".to_string()))?;

        let seq = self.current_seq.load(Ordering::SeqCst) + 1;

        let prev_hash = if seq == 1 {
            GENESIS_HASH.to_string()
        } else {
            self.storage
                .get_audit_entry(seq - 1)?
                .map(|entry| entry.hash())
                .ok_or_else(|| EngineError::Internal(format!("missing audit entry {}", seq - 1)))?
        };

        let mut entry = AuditEntry {
            seq,
            timestamp: Utc::now(),
            event_type,
            actor,
            session_id,
            outcome,
            context,
            prev_hash,
            signature: String::new(),
        };

        let data = entry.canonical_bytes();
        let signature = self.signing_key.sign(&data);
        entry.signature = hex::encode(signature.to_bytes());

        self.storage.put_audit_entry(&entry)?;
        self.current_seq.store(seq, Ordering::SeqCst);

        tracing::debug!(seq = seq, event_type = %event_type, "audit entry appended");

        Ok(seq)
    }

    /// Verify the hash chain integrity between two sequence numbers
    /// (inclusive). Returns `Ok(false)` rather than erroring on a
    /// broken link or invalid signature.
    pub fn verify_chain(&self, start: u64, end: u64) -> EngineResult<bool> {
        if start > end {
            return Ok(false);
        }

        let verifying_key = self.verifying_key();
        let mut expected_prev_hash = if start == 1 {
            GENESIS_HASH.to_string()
        } else {
            self.storage
                .get_audit_entry(start - 1)?
                .map(|e| e.hash())
                .ok_or_else(|| {
                    EngineError::Internal(format!("missing audit entry {}", start - 1))
                })?
        };

        for seq in start..=end {
            let entry = self
                .storage
                .get_audit_entry(seq)?
                .ok_or_else(|| EngineError::Internal(format!("missing audit entry {seq}")))?;

            if entry.prev_hash != expected_prev_hash {
                tracing::warn!(
                    seq = seq,
                    expected = %expected_prev_hash,
                    actual = %entry.prev_hash,
                    "audit hash chain broken"
                );
                return Ok(false);
            }

            if !entry.verify_signature(&verifying_key) {
                tracing::warn!(seq = seq, "invalid signature on audit entry");
                return Ok(false);
            }

            expected_prev_hash = entry.hash();
        }

        Ok(true)
    }

    /// Get the current sequence number.
    pub fn current_seq(&self) -> u64 {
        self.current_seq.load(Ordering::SeqCst)
    }

    /// Get an audit entry by sequence number.
    pub fn get_entry(&self, seq: u64) -> EngineResult<Option<AuditEntry>> {
        self.storage.get_audit_entry(seq)
    }

    /// List audit entries in a range (inclusive).
    pub fn list_entries(&self, start: u64, end: u64) -> EngineResult<Vec<AuditEntry>> {
        let mut entries = Vec::new();
        for seq in start..=end {
            if let Some(entry) = self.storage.get_audit_entry(seq)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_logger() -> AuditLogger {
        let storage = Storage::open_memory().expect("failed to create test storage");
        AuditLogger::new(storage).expect("failed to create audit logger")
    }

    #[test]
    fn test_append_and_retrieve() {
        let logger = create_test_logger();

        let seq = logger
            .append(
                AuditEventType::SessionCreated,
                AuditActor::Engine {
                    component: "session_manager".to_string(),
                },
                Some(Uuid::new_v4()),
                AuditOutcome::Success,
                None,
            )
            .unwrap();

        assert_eq!(seq, 1);

        let entry = logger.get_entry(1).unwrap().unwrap();
        assert_eq!(entry.seq, 1);
        assert_eq!(entry.event_type, AuditEventType::SessionCreated);
        assert_eq!(entry.prev_hash, GENESIS_HASH);
    }

    #[test]
    fn test_hash_chain() {
        let logger = create_test_logger();

        for _ in 1_u8..=3 {
            logger
                .append(
                    AuditEventType::ChunkAccepted,
                    AuditActor::Engine {
                        component: "chunk_processor".to_string(),
                    },
                    Some(Uuid::new_v4()),
                    AuditOutcome::Success,
                    None,
                )
                .unwrap();
        }

        assert!(logger.verify_chain(1, 3).unwrap());

        let entry1 = logger.get_entry(1).unwrap().unwrap();
        let entry2 = logger.get_entry(2).unwrap().unwrap();
        let entry3 = logger.get_entry(3).unwrap().unwrap();

        assert_eq!(entry1.prev_hash, GENESIS_HASH);
        assert_eq!(entry2.prev_hash, entry1.hash());
        assert_eq!(entry3.prev_hash, entry2.hash());
    }

    #[test]
    fn test_signature_verification() {
        let logger = create_test_logger();

        logger
            .append(
                AuditEventType::SessionRecovered,
                AuditActor::System,
                None,
                AuditOutcome::Success,
                None,
            )
            .unwrap();

        let entry = logger.get_entry(1).unwrap().unwrap();
        assert!(entry.verify_signature(&logger.verifying_key()));
    }

    #[test]
    fn test_tampered_prev_hash_fails_signature() {
        let logger = create_test_logger();

        for _ in 1_u8..=2 {
            logger
                .append(
                    AuditEventType::SegmentUploaded,
                    AuditActor::Engine {
                        component: "upload_queue".to_string(),
                    },
                    Some(Uuid::new_v4()),
                    AuditOutcome::Success,
                    None,
                )
                .unwrap();
        }

        let mut tampered = logger.get_entry(2).unwrap().unwrap();
        tampered.prev_hash = "deadbeef".repeat(8);
        assert!(!tampered.verify_signature(&logger.verifying_key()));
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(AuditEventType::SessionCreated.to_string(), "session_created");
        assert_eq!(
            AuditEventType::ManifestFinalized.to_string(),
            "manifest_finalized"
        );
    }
}
