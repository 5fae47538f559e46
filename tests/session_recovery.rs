//! Crash-recovery scenario: a session left `active` by a killed
//! process picks back up from its last persisted state, accepts the
//! remaining segments, and finalizes with a merkle root that matches
//! an independent recomputation from the final segment list.
//!
//! Segment ciphertexts use a fresh random iv every encryption (by
//! design, see `chunk_processor::tests::repeated_encryptions_use_distinct_ivs`),
//! so `encryptedHash` for a re-uploaded segment is never expected to
//! match a separate run's; what crash recovery must preserve is
//! ordering, completeness, and internal merkle-root consistency.

use std::sync::Arc;
use std::time::Duration;

use witness_core::config::EngineConfig;
use witness_core::external::memory::{InMemoryContentStore, InMemoryLedgerClient};
use witness_core::keyvault::{derive_personal_key, generate_group_secret};
use witness_core::merkle::{self, MerkleTree};
use witness_core::secure_store::SecureStore;
use witness_core::session_manager::SessionStatus;
use witness_core::storage::Storage;
use witness_core::SessionManager;

const WALLET_SIGNATURE: &[u8] = b"crash-recovery-wallet-signature";
const CHUNKS: [&[u8]; 5] = [b"chunk0", b"chunk1", b"chunk2", b"chunk3", b"chunk4"];
const TIMESTAMPS: [u64; 5] = [1000, 1010, 1020, 1030, 1040];

fn recompute_root(segments: &[witness_core::manifest::SegmentRecord]) -> [u8; 32] {
    let mut tree = MerkleTree::new();
    for segment in segments {
        tree.insert(merkle::leaf_value(
            segment.index,
            &segment.plaintext_hash,
            &segment.encrypted_hash,
            segment.captured_at,
        ));
    }
    tree.root().unwrap()
}

#[tokio::test]
async fn crash_after_three_segments_recovers_and_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("witness.redb");
    let group_secret = generate_group_secret();

    // First half of the run: accept three segments, then "crash" by
    // shutting the manager down without ever calling `end`.
    let session_id = {
        let storage = Storage::open(&db_path).unwrap();
        let config = EngineConfig::for_tests(db_path.clone());
        let secure_store = SecureStore::new(storage.clone(), derive_personal_key(WALLET_SIGNATURE));
        let manager = SessionManager::new(
            storage,
            config,
            secure_store,
            Arc::new(InMemoryContentStore::new()),
            Arc::new(InMemoryLedgerClient::new()),
        )
        .await
        .unwrap();
        let group_id = manager.register_group_secret(&group_secret).unwrap();
        let session_id = manager.create([1u8; 20], vec![group_id]).unwrap();

        for (bytes, ts) in CHUNKS[..3].iter().zip(&TIMESTAMPS[..3]) {
            manager.process_chunk(session_id, bytes.to_vec(), *ts).unwrap();
        }

        // Give the upload worker a chance to durably record the first
        // three segments before the process "dies".
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.status(session_id).unwrap(), SessionStatus::Active);

        manager.shutdown().await;
        session_id
    };

    // Restart against the same on-disk database, re-registering the
    // same group secret the way re-authenticating the wallet would.
    let storage = Storage::open(&db_path).unwrap();
    let config = EngineConfig::for_tests(db_path.clone());
    let secure_store = SecureStore::new(storage.clone(), derive_personal_key(WALLET_SIGNATURE));

    let manager = SessionManager::new(
        storage,
        config,
        secure_store,
        Arc::new(InMemoryContentStore::new()),
        Arc::new(InMemoryLedgerClient::new()),
    )
    .await
    .unwrap();

    assert_eq!(manager.status(session_id).unwrap(), SessionStatus::Active);

    for (bytes, ts) in CHUNKS[3..].iter().zip(&TIMESTAMPS[3..]) {
        manager.process_chunk(session_id, bytes.to_vec(), *ts).unwrap();
    }

    let manifest = manager.end(session_id).await.unwrap();
    assert_eq!(manifest.segments.len(), 5);
    assert_eq!(manager.status(session_id).unwrap(), SessionStatus::Complete);

    for (i, segment) in manifest.segments.iter().enumerate() {
        assert_eq!(segment.index, i as u32);
    }

    assert_eq!(manifest.merkle_root, recompute_root(&manifest.segments));

    manager.shutdown().await;
}
