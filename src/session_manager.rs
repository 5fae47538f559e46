//! Session lifecycle orchestration: the component that ties the key
//! hierarchy, chunk pipeline, upload queue, Merkle tree, and manifest
//! manager together for one recording, and schedules ledger updates.
//!
//! [`SessionManager`] is the multi-session engine entry point: it owns
//! the single shared [`UploadQueue`] worker and dispatches its
//! completion events to the right [`SessionHandle`]. A `SessionHandle`
//! is the live, in-memory state for one recording session; its
//! persisted counterpart is [`PersistedSession`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::{AuditActor, AuditEventType, AuditLogger, AuditOutcome};
use crate::chunk_processor::ChunkProcessor;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::external::{ContentStore, LedgerClient, LedgerStatus};
use crate::keyvault::{generate_content_key, wrap_content_key};
use crate::manifest::{Manifest, ManifestManager, SegmentRecord, WrappedContentKeyEntry, canonical_bytes};
use crate::merkle::{self, MerkleTree};
use crate::secure_store::SecureStore;
use crate::storage::Storage;
use crate::upload_queue::{PendingUpload, UploadOutcome, UploadQueue, UploadStatus};

const AUDIT_COMPONENT: &str = "session_manager";

fn log_audit(audit: &AuditLogger, event: AuditEventType, session_id: [u8; 16], outcome: AuditOutcome) {
    let result = audit.append(
        event,
        AuditActor::Engine {
            component: AUDIT_COMPONENT.to_string(),
        },
        Some(Uuid::from_bytes(session_id)),
        outcome,
        None,
    );
    if let Err(err) = result {
        tracing::warn!(error = %err, event = %event, "failed to append audit entry");
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

fn session_key(session_id: [u8; 16]) -> String {
    hex::encode(session_id)
}

fn group_secret_handle(group_id: &[u8; 32]) -> String {
    format!("group:{}", hex::encode(group_id))
}

fn session_content_key_handle(session_id: [u8; 16]) -> String {
    format!("session-content-key:{}", hex::encode(session_id))
}

/// Where a session sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ending,
    Complete,
    Failed,
}

macro_rules! hex_array_field {
    ($name:ident, $len:expr) => {
        mod $name {
            use serde::{Deserialize, Deserializer, Serializer};

            pub fn serialize<S: Serializer>(bytes: &[u8; $len], serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(bytes))
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; $len], D::Error> {
                let s = String::deserialize(deserializer)?;
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", $len)))
            }
        }
    };
}

hex_array_field!(hex16, 16);
hex_array_field!(hex20, 20);

/// The durable, on-disk shape of a session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(with = "hex16")]
    pub session_id: [u8; 16],
    #[serde(with = "hex20")]
    pub uploader: [u8; 20],
    pub group_ids: Vec<String>,
    pub wrapped_content_key: BTreeMap<String, WrappedContentKeyEntry>,
    pub status: SessionStatus,
    pub next_index: u32,
    pub segments: Vec<SegmentRecord>,
    pub merkle_root: Option<[u8; 32]>,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub last_ledger_update_at: u64,
    pub segments_since_ledger_update: u32,
    pub manifest_ref: Option<String>,
    pub failure_reason: Option<String>,
}

struct SessionState {
    status: SessionStatus,
    next_index: u32,
    merkle: MerkleTree,
    manifest: ManifestManager,
    started_at: u64,
    ended_at: Option<u64>,
    last_ledger_update_at: u64,
    segments_since_ledger_update: u32,
    manifest_ref: Option<String>,
    failure_reason: Option<String>,
}

/// Live, in-memory orchestration state for one recording session.
pub struct SessionHandle {
    session_id: [u8; 16],
    uploader: [u8; 20],
    group_ids: Vec<[u8; 32]>,
    wrapped_content_key: BTreeMap<String, WrappedContentKeyEntry>,
    storage: Storage,
    config: EngineConfig,
    upload_queue: UploadQueue,
    audit: Arc<AuditLogger>,
    state: Mutex<SessionState>,
}

impl SessionHandle {
    fn persist(&self, state: &SessionState) -> EngineResult<()> {
        let persisted = PersistedSession {
            session_id: self.session_id,
            uploader: self.uploader,
            group_ids: self.group_ids.iter().map(hex::encode).collect(),
            wrapped_content_key: self.wrapped_content_key.clone(),
            status: state.status,
            next_index: state.next_index,
            segments: state.manifest.segments_snapshot(),
            merkle_root: if state.merkle.is_empty() { None } else { state.merkle.root().ok() },
            started_at: state.started_at,
            ended_at: state.ended_at,
            last_ledger_update_at: state.last_ledger_update_at,
            segments_since_ledger_update: state.segments_since_ledger_update,
            manifest_ref: state.manifest_ref.clone(),
            failure_reason: state.failure_reason.clone(),
        };
        self.storage.put_session(&session_key(self.session_id), &persisted)
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().expect("lock poisoned").status
    }

    /// Number of segments enqueued but not yet durably uploaded.
    pub fn pending_count(&self) -> EngineResult<usize> {
        Ok(self
            .storage
            .list_pending_uploads_for_session::<PendingUpload>(&session_key(self.session_id))?
            .len())
    }

    pub fn backpressured(&self) -> EngineResult<bool> {
        Ok(self.pending_count()? > self.config.backpressure_soft_limit())
    }

    /// Assign the next segment index and enqueue its plaintext bytes
    /// for upload. Fails with `SessionClosed` unless the session is
    /// `active`.
    pub fn process_chunk(&self, bytes: Vec<u8>, captured_at: u64) -> EngineResult<u32> {
        let index = {
            let mut state = self.state.lock().expect("lock poisoned");
            if state.status != SessionStatus::Active {
                return Err(EngineError::SessionClosed(format!(
                    "session {} is not active",
                    session_key(self.session_id)
                )));
            }
            let index = state.next_index;
            state.next_index += 1;
            self.persist(&state)?;
            index
        };

        self.upload_queue
            .enqueue(&session_key(self.session_id), index, bytes, captured_at)?;

        log_audit(&self.audit, AuditEventType::ChunkAccepted, self.session_id, AuditOutcome::Success);

        if self.backpressured().unwrap_or(false) {
            tracing::warn!(
                session_id = %session_key(self.session_id),
                "upload queue backlog exceeds soft limit, emitting backpressure signal"
            );
        }

        Ok(index)
    }

    /// Record a completed upload. Returns `Some(root)` when the
    /// ledger-update cadence policy has just triggered.
    fn record_uploaded_segment(&self, segment: crate::chunk_processor::ProcessedSegment) -> EngineResult<Option<[u8; 32]>> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.status != SessionStatus::Active && state.status != SessionStatus::Ending {
            return Ok(None);
        }

        let record = SegmentRecord {
            index: segment.index,
            object_id: segment.object_id,
            size: segment.size,
            plaintext_hash: segment.plaintext_hash,
            encrypted_hash: segment.encrypted_hash,
            iv: segment.iv,
            captured_at: segment.captured_at,
            uploaded_at: now_millis(),
        };

        let leaf = merkle::leaf_value(record.index, &record.plaintext_hash, &record.encrypted_hash, record.captured_at);
        state.merkle.insert(leaf);
        let root = state.merkle.root()?;

        state.manifest.add_segment(record)?;
        state.manifest.set_merkle_root(root);
        state.segments_since_ledger_update += 1;

        self.persist(&state)?;

        log_audit(&self.audit, AuditEventType::SegmentUploaded, self.session_id, AuditOutcome::Success);
        log_audit(&self.audit, AuditEventType::MerkleInserted, self.session_id, AuditOutcome::Success);

        let elapsed_ms = now_millis().saturating_sub(state.last_ledger_update_at);
        let trigger = state.segments_since_ledger_update >= self.config.ledger_segment_interval()
            || (state.segments_since_ledger_update >= 1 && elapsed_ms >= self.config.ledger_time_interval().as_millis() as u64);

        if trigger {
            state.segments_since_ledger_update = 0;
            state.last_ledger_update_at = now_millis();
            Ok(Some(root))
        } else {
            Ok(None)
        }
    }

    fn mark_failed(&self, reason: impl Into<String>) -> EngineResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if matches!(state.status, SessionStatus::Complete | SessionStatus::Failed) {
            return Ok(());
        }
        let reason = reason.into();
        tracing::error!(session_id = %session_key(self.session_id), reason, "session failed");
        state.status = SessionStatus::Failed;
        state.ended_at = Some(now_millis());
        state.failure_reason = Some(reason.clone());
        log_audit(
            &self.audit,
            AuditEventType::SessionFailed,
            self.session_id,
            AuditOutcome::Failure { reason },
        );
        self.persist(&state)
    }

    fn begin_ending(&self) -> EngineResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.status != SessionStatus::Active {
            return Err(EngineError::SessionClosed(format!(
                "session {} is not active",
                session_key(self.session_id)
            )));
        }
        state.status = SessionStatus::Ending;
        self.persist(&state)
    }

    fn finalize_manifest(&self) -> EngineResult<Manifest> {
        let mut state = self.state.lock().expect("lock poisoned");
        let manifest = state.manifest.finalize()?;
        log_audit(&self.audit, AuditEventType::ManifestFinalized, self.session_id, AuditOutcome::Success);
        Ok(manifest)
    }

    fn mark_complete(&self, manifest_ref: String) -> EngineResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.status = SessionStatus::Complete;
        state.ended_at = Some(now_millis());
        state.manifest_ref = Some(manifest_ref);
        log_audit(&self.audit, AuditEventType::SessionCompleted, self.session_id, AuditOutcome::Success);
        self.persist(&state)
    }
}

/// Retry `submit_update` + `wait_for_inclusion` up to `max_retries`
/// times with linear backoff. A `reverted` result is success for
/// non-final updates and failure (after exhausting retries) for the
/// final one.
async fn submit_ledger_update_with_retry(
    ledger_client: &Arc<dyn LedgerClient>,
    audit: &Arc<AuditLogger>,
    session_id: [u8; 16],
    root: [u8; 32],
    manifest_ref: Option<String>,
    max_retries: u32,
    final_update: bool,
) -> EngineResult<()> {
    let mut last_err = None;
    log_audit(audit, AuditEventType::LedgerSubmitted, session_id, AuditOutcome::Pending);

    for attempt in 1..=max_retries.max(1) {
        let outcome = async {
            let tx_id = ledger_client.submit_update(session_id, root, manifest_ref.clone()).await?;
            ledger_client.wait_for_inclusion(&tx_id).await
        }
        .await;

        match outcome {
            Ok(LedgerStatus::Success) => {
                log_audit(audit, AuditEventType::LedgerConfirmed, session_id, AuditOutcome::Success);
                return Ok(());
            }
            Ok(LedgerStatus::Reverted) if !final_update => {
                log_audit(audit, AuditEventType::LedgerConfirmed, session_id, AuditOutcome::Success);
                return Ok(());
            }
            Ok(LedgerStatus::Reverted) => {
                last_err = Some(EngineError::LedgerRejected("final ledger update reverted".to_string()));
            }
            Err(err) => last_err = Some(err),
        }

        if attempt < max_retries {
            tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
        }
    }

    let err = last_err.unwrap_or_else(|| EngineError::LedgerRejected("ledger update failed".to_string()));
    log_audit(
        audit,
        AuditEventType::LedgerConfirmed,
        session_id,
        AuditOutcome::Failure { reason: err.to_string() },
    );
    Err(err)
}

struct ManagerInner {
    storage: Storage,
    config: EngineConfig,
    secure_store: SecureStore,
    upload_queue: UploadQueue,
    content_store: Arc<dyn ContentStore>,
    ledger_client: Arc<dyn LedgerClient>,
    audit: Arc<AuditLogger>,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl ManagerInner {
    fn handle(&self, key: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().expect("lock poisoned").get(key).cloned()
    }
}

/// Orchestrates every active recording session: the shared upload
/// queue, ledger-update cadence, and crash recovery.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionManager {
    /// Open the engine against `storage`, recovering any session left
    /// `active` or `ending` by a previous crash.
    pub async fn new(
        storage: Storage,
        config: EngineConfig,
        secure_store: SecureStore,
        content_store: Arc<dyn ContentStore>,
        ledger_client: Arc<dyn LedgerClient>,
    ) -> EngineResult<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let upload_queue = UploadQueue::open(storage.clone(), config.clone(), tx)?;
        let audit = Arc::new(AuditLogger::new(storage.clone())?);

        let inner = Arc::new(ManagerInner {
            storage: storage.clone(),
            config,
            secure_store,
            upload_queue: upload_queue.clone(),
            content_store,
            ledger_client,
            audit,
            sessions: Mutex::new(HashMap::new()),
        });

        for id in storage.list_session_ids()? {
            let Some(persisted) = storage.get_session::<PersistedSession>(&id)? else {
                continue;
            };
            if matches!(persisted.status, SessionStatus::Complete | SessionStatus::Failed) {
                continue;
            }
            Self::recover_session(&inner, persisted)?;
        }

        upload_queue.start();

        let dispatcher_inner = inner.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                dispatch_outcome(&dispatcher_inner, outcome).await;
            }
        });

        Ok(Self {
            inner,
            dispatcher: Arc::new(Mutex::new(Some(dispatcher))),
        })
    }

    fn recover_session(inner: &Arc<ManagerInner>, persisted: PersistedSession) -> EngineResult<()> {
        let content_key: [u8; 32] = inner
            .secure_store
            .get(&session_content_key_handle(persisted.session_id))?
            .ok_or_else(|| EngineError::Internal("missing content key for recovered session".to_string()))?;

        let group_ids: Vec<[u8; 32]> = persisted
            .group_ids
            .iter()
            .map(|hex_id| {
                let bytes = hex::decode(hex_id).map_err(|e| EngineError::Deserialization(e.to_string()))?;
                bytes
                    .try_into()
                    .map_err(|_| EngineError::Deserialization("group id must be 32 bytes".to_string()))
            })
            .collect::<EngineResult<_>>()?;

        let mut merkle = MerkleTree::new();
        for record in &persisted.segments {
            merkle.insert(merkle::leaf_value(record.index, &record.plaintext_hash, &record.encrypted_hash, record.captured_at));
        }

        let manifest = ManifestManager::from_segments(
            persisted.session_id,
            persisted.uploader,
            group_ids.clone(),
            persisted.wrapped_content_key.clone(),
            persisted.segments.clone(),
            persisted.merkle_root,
        );

        let handle = Arc::new(SessionHandle {
            session_id: persisted.session_id,
            uploader: persisted.uploader,
            group_ids,
            wrapped_content_key: persisted.wrapped_content_key.clone(),
            storage: inner.storage.clone(),
            config: inner.config.clone(),
            upload_queue: inner.upload_queue.clone(),
            audit: inner.audit.clone(),
            state: Mutex::new(SessionState {
                status: persisted.status,
                next_index: persisted.next_index,
                merkle,
                manifest,
                started_at: persisted.started_at,
                ended_at: persisted.ended_at,
                last_ledger_update_at: persisted.last_ledger_update_at,
                segments_since_ledger_update: persisted.segments_since_ledger_update,
                manifest_ref: persisted.manifest_ref,
                failure_reason: persisted.failure_reason,
            }),
        });

        let key = session_key(persisted.session_id);
        inner
            .upload_queue
            .register_processor(key.clone(), Arc::new(ChunkProcessor::new(content_key, inner.content_store.clone())));

        log_audit(&inner.audit, AuditEventType::SessionRecovered, persisted.session_id, AuditOutcome::Success);

        let resume_ending = persisted.status == SessionStatus::Ending;
        inner.sessions.lock().expect("lock poisoned").insert(key.clone(), handle.clone());

        if resume_ending {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                if let Err(err) = drain_and_finalize(&inner, &handle).await {
                    tracing::error!(session_id = %key, error = %err, "resumed session end failed");
                }
            });
        }

        Ok(())
    }

    /// Persist a group secret so sessions can later be created against
    /// its `groupId`. Callers generate the secret themselves (e.g. via
    /// [`crate::keyvault::generate_group_secret`]) and share it
    /// out-of-band with other members; each holder registers its own
    /// copy against its own secure store.
    pub fn register_group_secret(&self, secret: &[u8; 32]) -> EngineResult<[u8; 32]> {
        let group_id = crate::keyvault::derive_group_id(secret);
        self.inner.secure_store.put(&group_secret_handle(&group_id), secret)?;
        Ok(group_id)
    }

    /// Create a new recording session. Group secrets for every group
    /// in `group_ids` must already be present in the secure store, via
    /// [`Self::register_group_secret`].
    pub fn create(&self, uploader: [u8; 20], group_ids: Vec<[u8; 32]>) -> EngineResult<[u8; 16]> {
        if group_ids.is_empty() {
            return Err(EngineError::InvalidInput("a session needs at least one group".to_string()));
        }

        let mut session_id = [0u8; 16];
        OsRng.fill_bytes(&mut session_id);

        let content_key = generate_content_key();

        let mut wrapped_content_key = BTreeMap::new();
        for gid in &group_ids {
            let secret: [u8; 32] = self
                .inner
                .secure_store
                .get(&group_secret_handle(gid))?
                .ok_or_else(|| EngineError::InvalidInput(format!("unknown group {}", hex::encode(gid))))?;
            let wrapped = wrap_content_key(&content_key, &secret);
            wrapped_content_key.insert(hex::encode(gid), WrappedContentKeyEntry::from(wrapped));
        }

        self.inner
            .secure_store
            .put(&session_content_key_handle(session_id), &content_key)?;

        let now = now_millis();
        let handle = Arc::new(SessionHandle {
            session_id,
            uploader,
            group_ids: group_ids.clone(),
            wrapped_content_key: wrapped_content_key.clone(),
            storage: self.inner.storage.clone(),
            config: self.inner.config.clone(),
            upload_queue: self.inner.upload_queue.clone(),
            audit: self.inner.audit.clone(),
            state: Mutex::new(SessionState {
                status: SessionStatus::Active,
                next_index: 0,
                merkle: MerkleTree::new(),
                manifest: ManifestManager::new(session_id, uploader, group_ids, wrapped_content_key),
                started_at: now,
                ended_at: None,
                last_ledger_update_at: now,
                segments_since_ledger_update: 0,
                manifest_ref: None,
                failure_reason: None,
            }),
        });

        {
            let state = handle.state.lock().expect("lock poisoned");
            handle.persist(&state)?;
        }

        let key = session_key(session_id);
        self.inner
            .upload_queue
            .register_processor(key.clone(), Arc::new(ChunkProcessor::new(content_key, self.inner.content_store.clone())));
        self.inner.sessions.lock().expect("lock poisoned").insert(key, handle);

        log_audit(&self.inner.audit, AuditEventType::SessionCreated, session_id, AuditOutcome::Success);

        Ok(session_id)
    }

    fn handle(&self, session_id: [u8; 16]) -> EngineResult<Arc<SessionHandle>> {
        self.inner
            .handle(&session_key(session_id))
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown session {}", session_key(session_id))))
    }

    pub fn process_chunk(&self, session_id: [u8; 16], bytes: Vec<u8>, captured_at: u64) -> EngineResult<u32> {
        self.handle(session_id)?.process_chunk(bytes, captured_at)
    }

    pub fn status(&self, session_id: [u8; 16]) -> EngineResult<SessionStatus> {
        Ok(self.handle(session_id)?.status())
    }

    /// End a session: drain the queue, finalize and upload the
    /// manifest, submit the final ledger update.
    pub async fn end(&self, session_id: [u8; 16]) -> EngineResult<Manifest> {
        let handle = self.handle(session_id)?;
        handle.begin_ending()?;
        drain_and_finalize(&self.inner, &handle).await
    }

    /// The shared audit log backing every session this manager owns.
    /// Exposed so callers can export or verify the forensic trail
    /// independently of any single session's lifecycle.
    pub fn audit_log(&self) -> Arc<AuditLogger> {
        self.inner.audit.clone()
    }

    pub async fn shutdown(&self) {
        self.inner.upload_queue.stop().await;
        if let Some(handle) = self.dispatcher.lock().expect("lock poisoned").take() {
            handle.abort();
        }
    }
}

async fn dispatch_outcome(inner: &Arc<ManagerInner>, outcome: UploadOutcome) {
    match outcome {
        UploadOutcome::Completed { session_id, segment } => {
            let Some(handle) = inner.handle(&session_id) else {
                return;
            };

            match handle.record_uploaded_segment(segment) {
                Ok(Some(root)) => {
                    let ledger_client = inner.ledger_client.clone();
                    let audit = inner.audit.clone();
                    let max_retries = inner.config.ledger_max_retries();
                    let raw_session_id = handle.session_id;
                    tokio::spawn(async move {
                        if let Err(err) =
                            submit_ledger_update_with_retry(&ledger_client, &audit, raw_session_id, root, None, max_retries, false)
                                .await
                        {
                            tracing::warn!(error = %err, "non-final ledger update failed");
                        }
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(session_id, error = %err, "failed to record uploaded segment");
                }
            }
        }
        UploadOutcome::Failed { session_id, segment_index, error } => {
            if let Some(handle) = inner.handle(&session_id) {
                log_audit(
                    &inner.audit,
                    AuditEventType::SegmentFailed,
                    handle.session_id,
                    AuditOutcome::Failure { reason: error.clone() },
                );
                let _ = handle.mark_failed(format!("segment {segment_index} failed: {error}"));
            }
        }
    }
}

async fn drain_and_finalize(inner: &Arc<ManagerInner>, handle: &Arc<SessionHandle>) -> EngineResult<Manifest> {
    let key = session_key(handle.session_id);

    loop {
        let pending: Vec<PendingUpload> = inner.storage.list_pending_uploads_for_session(&key)?;
        if pending.is_empty() {
            break;
        }
        if pending.iter().any(|u| u.status == UploadStatus::Failed) {
            handle.mark_failed("one or more segment uploads permanently failed during drain")?;
            return Err(EngineError::NetworkFatal(format!(
                "session {key} failed: segment upload exhausted retries"
            )));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    if handle.status() == SessionStatus::Failed {
        return Err(EngineError::SessionClosed(format!("session {key} already failed")));
    }

    let manifest = handle.finalize_manifest()?;
    let canonical = canonical_bytes(&manifest)?;

    let manifest_ref = match inner.content_store.put(canonical, Some(format!("{key}:manifest"))).await {
        Ok(id) => id,
        Err(err) => {
            handle.mark_failed(format!("manifest upload failed: {err}"))?;
            return Err(err);
        }
    };

    let root = manifest.merkle_root;
    let final_result = submit_ledger_update_with_retry(
        &inner.ledger_client,
        &inner.audit,
        handle.session_id,
        root,
        Some(manifest_ref.clone()),
        inner.config.ledger_max_retries(),
        true,
    )
    .await;

    if let Err(err) = final_result {
        handle.mark_failed(format!("final ledger update failed: {err}"))?;
        return Err(err);
    }

    handle.mark_complete(manifest_ref)?;
    inner.upload_queue.unregister_processor(&key);

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::memory::{InMemoryContentStore, InMemoryLedgerClient};
    use crate::keyvault::generate_group_secret;
    use crate::secure_store::SecureStore;
    use std::path::PathBuf;

    fn test_manager_parts() -> (Storage, EngineConfig, SecureStore, Arc<InMemoryContentStore>, Arc<InMemoryLedgerClient>) {
        let storage = Storage::open_memory().unwrap();
        let config = EngineConfig::for_tests(PathBuf::from(":memory:"));
        let secure_store = SecureStore::new(storage.clone(), crate::keyvault::derive_personal_key(b"test-signature"));
        let content_store = Arc::new(InMemoryContentStore::new());
        let ledger_client = Arc::new(InMemoryLedgerClient::new());
        (storage, config, secure_store, content_store, ledger_client)
    }

    fn seed_group(secure_store: &SecureStore) -> [u8; 32] {
        let secret = generate_group_secret();
        let group_id = crate::keyvault::derive_group_id(&secret);
        secure_store.put(&group_secret_handle(&group_id), &secret).unwrap();
        group_id
    }

    #[tokio::test]
    async fn happy_path_five_segments_complete_with_manifest() {
        let (storage, config, secure_store, content_store, ledger_client) = test_manager_parts();
        let group_id = seed_group(&secure_store);

        let manager = SessionManager::new(storage, config, secure_store, content_store, ledger_client.clone())
            .await
            .unwrap();

        let session_id = manager.create([1u8; 20], vec![group_id]).unwrap();

        for (i, bytes) in [b"chunk0".to_vec(), b"chunk1".to_vec(), b"chunk2".to_vec(), b"chunk3".to_vec(), b"chunk4".to_vec()]
            .into_iter()
            .enumerate()
        {
            let index = manager.process_chunk(session_id, bytes, 1000 + i as u64 * 10).unwrap();
            assert_eq!(index, i as u32);
        }

        let manifest = manager.end(session_id).await.unwrap();
        assert_eq!(manifest.segments.len(), 5);
        assert_eq!(manager.status(session_id).unwrap(), SessionStatus::Complete);
        assert!(ledger_client.final_submission_count() >= 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn process_chunk_rejected_once_session_is_ending() {
        let (storage, config, secure_store, content_store, ledger_client) = test_manager_parts();
        let group_id = seed_group(&secure_store);

        let manager = SessionManager::new(storage, config, secure_store, content_store, ledger_client)
            .await
            .unwrap();
        let session_id = manager.create([2u8; 20], vec![group_id]).unwrap();

        manager.process_chunk(session_id, b"only chunk".to_vec(), 1000).unwrap();
        manager.end(session_id).await.unwrap();

        let result = manager.process_chunk(session_id, b"too late".to_vec(), 2000);
        assert!(matches!(result, Err(EngineError::SessionClosed(_))));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn create_fails_for_unknown_group() {
        let (storage, config, secure_store, content_store, ledger_client) = test_manager_parts();
        let manager = SessionManager::new(storage, config, secure_store, content_store, ledger_client)
            .await
            .unwrap();

        let result = manager.create([3u8; 20], vec![[9u8; 32]]);
        assert!(matches!(result, Err(EngineError::InvalidInput(_))));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn permanent_upload_failure_fails_the_session() {
        let (storage, config, secure_store, content_store, ledger_client) = test_manager_parts();
        let group_id = seed_group(&secure_store);
        let content_store_handle = content_store.clone();

        let manager = SessionManager::new(storage, config.with_upload_max_attempts(2), secure_store, content_store, ledger_client)
            .await
            .unwrap();
        let session_id = manager.create([4u8; 20], vec![group_id]).unwrap();

        // The worker hints every upload as "{session_key}:{segment_index:010}".
        let hint = format!("{}:{:010}", session_key(session_id), 0u32);
        content_store_handle.fail_next_puts(&hint, 10);

        manager.process_chunk(session_id, b"doomed".to_vec(), 1000).unwrap();

        let result = manager.end(session_id).await;
        assert!(result.is_err());
        assert_eq!(manager.status(session_id).unwrap(), SessionStatus::Failed);

        manager.shutdown().await;
    }
}
