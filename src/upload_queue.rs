//! Durable, crash-recoverable FIFO upload queue.
//!
//! Backs every session's chunk uploads with a `redb`-persisted queue so
//! that an engine restart resumes in-flight uploads rather than losing
//! them. Ordering is strict per session (segment `i+1` never starts
//! before segment `i` has left the queue) and FIFO by enqueue order
//! across sessions, since the engine runs a single cooperative worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::chunk_processor::{ChunkProcessor, ProcessedSegment};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::Storage;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Lifecycle status of one queued segment upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

/// One row of the durable upload queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUpload {
    pub session_id: String,
    pub segment_index: u32,
    pub status: UploadStatus,
    pub attempts: u32,
    pub next_attempt_at: u64,
    pub enqueued_at: u64,
    pub captured_at: u64,
    pub payload: Vec<u8>,
}

/// What the worker loop reports back to whoever owns a session.
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    Completed {
        session_id: String,
        segment: ProcessedSegment,
    },
    Failed {
        session_id: String,
        segment_index: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
    Stopped,
}

struct Inner {
    storage: Storage,
    config: EngineConfig,
    processors: Mutex<HashMap<String, Arc<ChunkProcessor>>>,
    run_state: Mutex<RunState>,
    outcomes: UnboundedSender<UploadOutcome>,
}

/// The durable FIFO upload queue. Cheap to clone; clones share the
/// same underlying state and worker.
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<Inner>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl UploadQueue {
    /// Open the queue against `storage`, resetting any row left in
    /// `processing` state back to `queued` (crash recovery: the
    /// process that was handling it is gone, but its attempt count is
    /// preserved).
    pub fn open(storage: Storage, config: EngineConfig, outcomes: UnboundedSender<UploadOutcome>) -> EngineResult<Self> {
        for (key, mut upload) in storage.list_all_pending_uploads::<PendingUpload>()? {
            if upload.status == UploadStatus::Processing {
                upload.status = UploadStatus::Queued;
                storage.put_pending_upload(&upload.session_id, upload.segment_index, &upload)?;
                tracing::warn!(key, "reset in-flight upload to queued after restart");
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                config,
                processors: Mutex::new(HashMap::new()),
                run_state: Mutex::new(RunState::Paused),
                outcomes,
            }),
            worker: Arc::new(Mutex::new(None)),
        })
    }

    /// Register the processor that will handle uploads for `session_id`.
    /// Must be called before segments for that session are enqueued.
    pub fn register_processor(&self, session_id: impl Into<String>, processor: Arc<ChunkProcessor>) {
        self.inner
            .processors
            .lock()
            .expect("lock poisoned")
            .insert(session_id.into(), processor);
    }

    pub fn unregister_processor(&self, session_id: &str) {
        self.inner.processors.lock().expect("lock poisoned").remove(session_id);
    }

    /// Enqueue one segment's plaintext bytes for upload. Fails with
    /// `InvalidSequence` if this `(session_id, segment_index)` pair is
    /// already queued.
    pub fn enqueue(
        &self,
        session_id: &str,
        segment_index: u32,
        payload: Vec<u8>,
        captured_at: u64,
    ) -> EngineResult<()> {
        if self
            .inner
            .storage
            .get_pending_upload::<PendingUpload>(session_id, segment_index)?
            .is_some()
        {
            return Err(EngineError::InvalidSequence(format!(
                "segment {segment_index} already queued for session {session_id}"
            )));
        }

        let upload = PendingUpload {
            session_id: session_id.to_string(),
            segment_index,
            status: UploadStatus::Queued,
            attempts: 0,
            next_attempt_at: now_millis(),
            enqueued_at: now_millis(),
            captured_at,
            payload,
        };

        self.inner.storage.put_pending_upload(session_id, segment_index, &upload)
    }

    pub fn status(&self, session_id: &str, segment_index: u32) -> EngineResult<Option<UploadStatus>> {
        Ok(self
            .inner
            .storage
            .get_pending_upload::<PendingUpload>(session_id, segment_index)?
            .map(|u| u.status))
    }

    /// Start (or resume) the background worker loop. Idempotent: calling
    /// `start` while already running is a no-op.
    pub fn start(&self) {
        *self.inner.run_state.lock().expect("lock poisoned") = RunState::Running;

        let mut worker = self.worker.lock().expect("lock poisoned");
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(run_worker_loop(inner)));
    }

    /// Stop picking up new work. In-flight uploads finish; the queue
    /// can be resumed with `start`.
    pub fn pause(&self) {
        *self.inner.run_state.lock().expect("lock poisoned") = RunState::Paused;
    }

    pub fn resume(&self) {
        self.start();
    }

    /// Stop the worker loop entirely and wait for it to exit.
    pub async fn stop(&self) {
        *self.inner.run_state.lock().expect("lock poisoned") = RunState::Stopped;

        let handle = self.worker.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Pick the next eligible row: among sessions whose lowest-indexed
/// queued/processing row is ready to attempt, the one enqueued first.
fn pick_next(rows: &[PendingUpload]) -> Option<PendingUpload> {
    let now = now_millis();

    let mut lowest_per_session: HashMap<&str, &PendingUpload> = HashMap::new();
    for row in rows {
        lowest_per_session
            .entry(row.session_id.as_str())
            .and_modify(|existing| {
                if row.segment_index < existing.segment_index {
                    *existing = row;
                }
            })
            .or_insert(row);
    }

    lowest_per_session
        .into_values()
        .filter(|row| row.status == UploadStatus::Queued && row.next_attempt_at <= now)
        .min_by_key(|row| row.enqueued_at)
        .cloned()
}

fn backoff_delay(config: &EngineConfig, attempts: u32) -> Duration {
    let base = config.upload_base_backoff().as_millis() as u64;
    let max = config.upload_max_backoff().as_millis() as u64;
    let exp = base.saturating_mul(1_u64 << attempts.saturating_sub(1).min(32));
    let capped = exp.min(max);
    let jitter = if base == 0 { 0 } else { rand::thread_rng().gen_range(0..base) };
    Duration::from_millis(capped.saturating_add(jitter))
}

async fn run_worker_loop(inner: Arc<Inner>) {
    loop {
        if *inner.run_state.lock().expect("lock poisoned") == RunState::Stopped {
            return;
        }

        if *inner.run_state.lock().expect("lock poisoned") == RunState::Paused {
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }

        let rows: Vec<PendingUpload> = match inner.storage.list_all_pending_uploads() {
            Ok(rows) => rows.into_iter().map(|(_, row)| row).collect(),
            Err(err) => {
                tracing::error!(error = %err, "failed to list pending uploads");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Some(mut candidate) = pick_next(&rows) else {
            tokio::time::sleep(Duration::from_millis(25)).await;
            continue;
        };

        candidate.status = UploadStatus::Processing;
        if let Err(err) = inner.storage.put_pending_upload(
            &candidate.session_id,
            candidate.segment_index,
            &candidate,
        ) {
            tracing::error!(error = %err, "failed to mark upload as processing");
            continue;
        }

        let processor = inner
            .processors
            .lock()
            .expect("lock poisoned")
            .get(&candidate.session_id)
            .cloned();

        let Some(processor) = processor else {
            tracing::warn!(
                session_id = %candidate.session_id,
                "no processor registered for session, leaving upload queued"
            );
            candidate.status = UploadStatus::Queued;
            let _ = inner.storage.put_pending_upload(
                &candidate.session_id,
                candidate.segment_index,
                &candidate,
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        };

        let hint = format!("{}:{:010}", candidate.session_id, candidate.segment_index);
        let result = processor
            .process_chunk(&candidate.payload, candidate.segment_index, candidate.captured_at, Some(hint))
            .await;

        match result {
            Ok(segment) => {
                if let Err(err) = inner
                    .storage
                    .delete_pending_upload(&candidate.session_id, candidate.segment_index)
                {
                    tracing::error!(error = %err, "failed to remove completed upload from queue");
                }

                tracing::debug!(
                    session_id = %candidate.session_id,
                    segment_index = candidate.segment_index,
                    "segment upload completed"
                );

                let _ = inner.outcomes.send(UploadOutcome::Completed {
                    session_id: candidate.session_id,
                    segment,
                });
            }
            Err(err) => {
                candidate.attempts += 1;

                if candidate.attempts >= inner.config.upload_max_attempts() {
                    candidate.status = UploadStatus::Failed;
                    let _ = inner.storage.put_pending_upload(
                        &candidate.session_id,
                        candidate.segment_index,
                        &candidate,
                    );

                    tracing::warn!(
                        session_id = %candidate.session_id,
                        segment_index = candidate.segment_index,
                        attempts = candidate.attempts,
                        error = %err,
                        "segment upload permanently failed"
                    );

                    let _ = inner.outcomes.send(UploadOutcome::Failed {
                        session_id: candidate.session_id,
                        segment_index: candidate.segment_index,
                        error: err.to_string(),
                    });
                } else {
                    let delay = backoff_delay(&inner.config, candidate.attempts);
                    candidate.status = UploadStatus::Queued;
                    candidate.next_attempt_at = now_millis() + delay.as_millis() as u64;

                    tracing::debug!(
                        session_id = %candidate.session_id,
                        segment_index = candidate.segment_index,
                        attempts = candidate.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "segment upload failed, backing off"
                    );

                    let _ = inner.storage.put_pending_upload(
                        &candidate.session_id,
                        candidate.segment_index,
                        &candidate,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::memory::InMemoryContentStore;
    use crate::keyvault::generate_content_key;
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc;

    fn test_config() -> EngineConfig {
        EngineConfig::for_tests(std::path::PathBuf::from(":memory:"))
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_segment() {
        let storage = Storage::open_memory().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = UploadQueue::open(storage, test_config(), tx).unwrap();

        queue.enqueue("session-a", 0, vec![1, 2, 3], 1000).unwrap();
        let result = queue.enqueue("session-a", 0, vec![4, 5, 6], 1000);
        assert!(matches!(result, Err(EngineError::InvalidSequence(_))));
    }

    #[tokio::test]
    async fn successful_upload_reports_completion_and_clears_row() {
        let storage = Storage::open_memory().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = UploadQueue::open(storage, test_config(), tx).unwrap();

        let content_store = Arc::new(InMemoryContentStore::new());
        let processor = Arc::new(ChunkProcessor::new(generate_content_key(), content_store));
        queue.register_processor("session-a", processor);

        queue.enqueue("session-a", 0, b"hello".to_vec(), 1000).unwrap();
        queue.start();

        let outcome = rx.recv().await.expect("expected one outcome");
        match outcome {
            UploadOutcome::Completed { session_id, segment } => {
                assert_eq!(session_id, "session-a");
                assert_eq!(segment.index, 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert!(queue.status("session-a", 0).unwrap().is_none());
        queue.stop().await;
    }

    #[tokio::test]
    async fn segment_with_higher_index_waits_for_lower_index_first() {
        let storage = Storage::open_memory().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = UploadQueue::open(storage, test_config(), tx).unwrap();

        let content_store = Arc::new(InMemoryContentStore::new());
        let processor = Arc::new(ChunkProcessor::new(generate_content_key(), content_store));
        queue.register_processor("session-a", processor);

        queue.enqueue("session-a", 1, b"second".to_vec(), 1000).unwrap();
        queue.enqueue("session-a", 0, b"first".to_vec(), 1000).unwrap();
        queue.start();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        queue.stop().await;

        let index_of = |outcome: &UploadOutcome| match outcome {
            UploadOutcome::Completed { segment, .. } => segment.index,
            _ => panic!("expected completion"),
        };

        assert_eq!(index_of(&first), 0);
        assert_eq!(index_of(&second), 1);
    }

    #[tokio::test]
    async fn repeated_transient_failures_exhaust_retries_and_report_failed() {
        let storage = Storage::open_memory().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = test_config().with_upload_max_attempts(2);
        let queue = UploadQueue::open(storage, config, tx).unwrap();

        let content_store = Arc::new(InMemoryContentStore::new());
        content_store.fail_next_puts("session-a:0000000000", 10);
        let processor = Arc::new(ChunkProcessor::new(generate_content_key(), content_store));
        queue.register_processor("session-a", processor);

        queue.enqueue("session-a", 0, b"doomed".to_vec(), 1000).unwrap();
        queue.start();

        let outcome = rx.recv().await.unwrap();
        queue.stop().await;

        match outcome {
            UploadOutcome::Failed { segment_index, .. } => assert_eq!(segment_index, 0),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn crash_recovery_resets_processing_rows_to_queued() {
        let storage = Storage::open_memory().unwrap();

        let stuck = PendingUpload {
            session_id: "session-a".to_string(),
            segment_index: 0,
            status: UploadStatus::Processing,
            attempts: 1,
            next_attempt_at: 0,
            enqueued_at: 0,
            captured_at: 1000,
            payload: b"stuck".to_vec(),
        };
        storage.put_pending_upload("session-a", 0, &stuck).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = UploadQueue::open(storage, test_config(), tx).unwrap();

        assert_eq!(queue.status("session-a", 0).unwrap(), Some(UploadStatus::Queued));
    }

    #[test]
    fn backoff_delay_is_monotonically_bounded() {
        let config = EngineConfig::for_tests(std::path::PathBuf::from(":memory:"));
        for attempts in 1..=5 {
            let delay = backoff_delay(&config, attempts);
            assert!(delay <= config.upload_max_backoff() + config.upload_base_backoff());
        }
    }
}
