//! ReDB storage implementation for the evidence capture engine.
//!
//! Provides persistent storage for:
//! - Sessions (capture session state and manifest progress)
//! - Pending uploads (the durable FIFO upload queue)
//! - Secure store (wrapped personal/content keys, never plaintext)
//! - Audit log (hash-chained forensic trail)
//!
//! Each table uses string or integer keys and JSON-serialized values.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{EngineError, EngineResult};

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const PENDING_UPLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_uploads");
const SECURE_STORE: TableDefinition<&str, &[u8]> = TableDefinition::new("secure_store");
const AUDIT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("audit_log");

/// Build the composite key used to enforce the `(sessionId, segmentIndex)`
/// uniqueness invariant on the upload queue table.
pub fn pending_upload_key(session_id: &str, segment_index: u32) -> String {
    format!("{session_id}:{segment_index:010}")
}

/// Storage wrapper for ReDB.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
}

impl Storage {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| EngineError::StorePersistence(e.to_string()))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS)?;
            let _ = write_txn.open_table(PENDING_UPLOADS)?;
            let _ = write_txn.open_table(SECURE_STORE)?;
            let _ = write_txn.open_table(AUDIT_LOG)?;
        }
        write_txn.commit()?;

        tracing::info!(path = %path.display(), "opened storage database");

        Ok(Self { db: Arc::new(db) })
    }

    /// Open an in-memory database for testing.
    #[cfg(test)]
    pub fn open_memory() -> EngineResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| EngineError::StorePersistence(e.to_string()))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS)?;
            let _ = write_txn.open_table(PENDING_UPLOADS)?;
            let _ = write_txn.open_table(SECURE_STORE)?;
            let _ = write_txn.open_table(AUDIT_LOG)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Store a session record.
    pub fn put_session<T: Serialize>(&self, session_id: &str, session: &T) -> EngineResult<()> {
        let value = serde_json::to_vec(session)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS)?;
            table.insert(session_id, value.as_slice())?;
        }
        write_txn.commit()?;
        tracing::debug!(session_id, "stored session");
        Ok(())
    }

    /// Get a session record by ID.
    pub fn get_session<T: DeserializeOwned>(&self, session_id: &str) -> EngineResult<Option<T>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS)?;

        match table.get(session_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Delete a session record.
    pub fn delete_session(&self, session_id: &str) -> EngineResult<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(SESSIONS)?;
            table.remove(session_id)?.is_some()
        };
        write_txn.commit()?;

        if deleted {
            tracing::debug!(session_id, "deleted session");
        }
        Ok(deleted)
    }

    /// List all session IDs.
    pub fn list_session_ids(&self) -> EngineResult<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS)?;

        let ids: Vec<String> = table
            .iter()?
            .filter_map(|entry| entry.ok().map(|(k, _)| k.value().to_string()))
            .collect();

        Ok(ids)
    }

    // =========================================================================
    // Pending uploads (durable FIFO queue)
    // =========================================================================

    /// Insert or overwrite a pending upload task. The key is
    /// `(sessionId, segmentIndex)`, enforced by the composite string key.
    pub fn put_pending_upload<T: Serialize>(
        &self,
        session_id: &str,
        segment_index: u32,
        task: &T,
    ) -> EngineResult<()> {
        let key = pending_upload_key(session_id, segment_index);
        let value = serde_json::to_vec(task)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PENDING_UPLOADS)?;
            table.insert(key.as_str(), value.as_slice())?;
        }
        write_txn.commit()?;
        tracing::trace!(session_id, segment_index, "stored pending upload");
        Ok(())
    }

    /// Get a pending upload task.
    pub fn get_pending_upload<T: DeserializeOwned>(
        &self,
        session_id: &str,
        segment_index: u32,
    ) -> EngineResult<Option<T>> {
        let key = pending_upload_key(session_id, segment_index);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_UPLOADS)?;

        match table.get(key.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Remove a pending upload task once it has been durably uploaded.
    pub fn delete_pending_upload(&self, session_id: &str, segment_index: u32) -> EngineResult<bool> {
        let key = pending_upload_key(session_id, segment_index);
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(PENDING_UPLOADS)?;
            table.remove(key.as_str())?.is_some()
        };
        write_txn.commit()?;

        if deleted {
            tracing::trace!(session_id, segment_index, "deleted pending upload");
        }
        Ok(deleted)
    }

    /// List every pending upload task belonging to one session, in
    /// segment-index order (the FIFO order the queue processes them in).
    pub fn list_pending_uploads_for_session<T: DeserializeOwned>(
        &self,
        session_id: &str,
    ) -> EngineResult<Vec<T>> {
        let prefix = format!("{session_id}:");
        let upper = format!("{session_id};"); // ';' follows ':' in ASCII, bounds the scan
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_UPLOADS)?;

        let mut tasks = Vec::new();
        for entry in table.range(prefix.as_str()..upper.as_str())? {
            let (_, v) = entry?;
            tasks.push(serde_json::from_slice(v.value())?);
        }
        Ok(tasks)
    }

    /// List every pending upload task across all sessions. Used at
    /// startup to recover queue state after a crash.
    pub fn list_all_pending_uploads<T: DeserializeOwned>(&self) -> EngineResult<Vec<(String, T)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_UPLOADS)?;

        let mut tasks = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            tasks.push((k.value().to_string(), serde_json::from_slice(v.value())?));
        }
        Ok(tasks)
    }

    // =========================================================================
    // Secure store (wrapped key material)
    // =========================================================================

    /// Store a wrapped key blob under an opaque handle. Callers must
    /// never pass plaintext key material here.
    pub fn put_secure_entry(&self, handle: &str, wrapped: &[u8]) -> EngineResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECURE_STORE)?;
            table.insert(handle, wrapped)?;
        }
        write_txn.commit()?;
        tracing::debug!(handle, "stored secure entry");
        Ok(())
    }

    /// Get a wrapped key blob.
    pub fn get_secure_entry(&self, handle: &str) -> EngineResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECURE_STORE)?;

        Ok(table.get(handle)?.map(|v| v.value().to_vec()))
    }

    /// Delete a wrapped key blob.
    pub fn delete_secure_entry(&self, handle: &str) -> EngineResult<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(SECURE_STORE)?;
            table.remove(handle)?.is_some()
        };
        write_txn.commit()?;

        if deleted {
            tracing::debug!(handle, "deleted secure entry");
        }
        Ok(deleted)
    }

    // =========================================================================
    // Audit log
    // =========================================================================

    /// Get the latest audit sequence number.
    pub fn get_latest_audit_seq(&self) -> EngineResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_LOG)?;

        Ok(table.iter()?.last().transpose()?.map(|(k, _)| k.value()))
    }

    /// Store a single audit entry by sequence number.
    pub fn put_audit_entry<T>(&self, entry: &T) -> EngineResult<()>
    where
        T: Serialize + AsRef<crate::audit::AuditEntry>,
    {
        let audit_entry = entry.as_ref();
        let value = serde_json::to_vec(audit_entry)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUDIT_LOG)?;
            table.insert(audit_entry.seq, value.as_slice())?;
        }
        write_txn.commit()?;
        tracing::trace!(seq = audit_entry.seq, "stored audit entry");
        Ok(())
    }

    /// Get a single audit entry by sequence number.
    pub fn get_audit_entry(&self, seq: u64) -> EngineResult<Option<crate::audit::AuditEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_LOG)?;

        match table.get(seq)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }
}
