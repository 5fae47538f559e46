//! Manifest assembly and canonical serialization.
//!
//! Accumulates [`SegmentRecord`]s in strict index order, then freezes
//! them into a [`Manifest`] whose canonical JSON bytes are
//! byte-identical for any two semantically identical manifests: keys
//! sorted lexicographically, byte sequences as lowercase hex, numbers
//! as JSON integers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// One recorded segment, in the manifest's on-disk shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub index: u32,
    pub object_id: String,
    pub size: u64,
    #[serde(with = "hex32")]
    pub plaintext_hash: [u8; 32],
    #[serde(with = "hex32")]
    pub encrypted_hash: [u8; 32],
    #[serde(with = "hex12")]
    pub iv: [u8; 12],
    pub captured_at: u64,
    pub uploaded_at: u64,
}

/// A content key wrapped for one group, in the manifest's on-disk shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrappedContentKeyEntry {
    #[serde(with = "hex12")]
    pub iv: [u8; 12],
    #[serde(with = "hex_vec")]
    pub ciphertext: Vec<u8>,
}

impl From<crate::keyvault::WrappedKey> for WrappedContentKeyEntry {
    fn from(wrapped: crate::keyvault::WrappedKey) -> Self {
        Self {
            iv: wrapped.iv,
            ciphertext: wrapped.ciphertext,
        }
    }
}

/// The frozen, canonically-serializable manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    #[serde(with = "hex16")]
    pub session_id: [u8; 16],
    #[serde(with = "hex20")]
    pub uploader: [u8; 20],
    #[serde(with = "hex32_vec")]
    pub group_ids: Vec<[u8; 32]>,
    #[serde(with = "hex32")]
    pub merkle_root: [u8; 32],
    pub wrapped_content_key: BTreeMap<String, WrappedContentKeyEntry>,
    pub segments: Vec<SegmentRecord>,
}

/// Serialize `manifest` to its canonical byte representation.
///
/// Round-tripping through [`serde_json::Value`] is what makes this
/// canonical: `serde_json`'s object map is key-sorted by default (the
/// crate is not built with the `preserve_order` feature), so any two
/// manifests with the same field values serialize identically
/// regardless of Rust struct field declaration order.
pub fn canonical_bytes(manifest: &Manifest) -> EngineResult<Vec<u8>> {
    let value = serde_json::to_value(manifest)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Accumulates segment records for one session and freezes them into
/// a [`Manifest`] on `finalize`.
pub struct ManifestManager {
    session_id: [u8; 16],
    uploader: [u8; 20],
    group_ids: Vec<[u8; 32]>,
    wrapped_content_key: BTreeMap<String, WrappedContentKeyEntry>,
    segments: Vec<SegmentRecord>,
    merkle_root: Option<[u8; 32]>,
    finalized: bool,
}

impl ManifestManager {
    pub fn new(
        session_id: [u8; 16],
        uploader: [u8; 20],
        group_ids: Vec<[u8; 32]>,
        wrapped_content_key: BTreeMap<String, WrappedContentKeyEntry>,
    ) -> Self {
        Self {
            session_id,
            uploader,
            group_ids,
            wrapped_content_key,
            segments: Vec::new(),
            merkle_root: None,
            finalized: false,
        }
    }

    /// Rebuild a manager from previously-persisted segments, e.g.
    /// during crash recovery. Does not re-validate index order of the
    /// supplied records.
    pub fn from_segments(
        session_id: [u8; 16],
        uploader: [u8; 20],
        group_ids: Vec<[u8; 32]>,
        wrapped_content_key: BTreeMap<String, WrappedContentKeyEntry>,
        segments: Vec<SegmentRecord>,
        merkle_root: Option<[u8; 32]>,
    ) -> Self {
        Self {
            session_id,
            uploader,
            group_ids,
            wrapped_content_key,
            segments,
            merkle_root,
            finalized: false,
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// A clone of the segment records accumulated so far, for
    /// persisting a session snapshot mid-recording.
    pub fn segments_snapshot(&self) -> Vec<SegmentRecord> {
        self.segments.clone()
    }

    /// Append a segment record. The caller must insert in strict
    /// index order; out-of-order insertion is a caller bug.
    pub fn add_segment(&mut self, record: SegmentRecord) -> EngineResult<()> {
        if self.finalized {
            return Err(EngineError::SessionClosed(
                "manifest already finalized".to_string(),
            ));
        }

        let expected = self.segments.len() as u32;
        if record.index != expected {
            return Err(EngineError::InvalidSequence(format!(
                "expected segment index {expected}, got {}",
                record.index
            )));
        }

        self.segments.push(record);
        Ok(())
    }

    /// Update the manifest's recorded merkle root, called by the
    /// session manager after each tree insert.
    pub fn set_merkle_root(&mut self, root: [u8; 32]) {
        self.merkle_root = Some(root);
    }

    /// Freeze the manifest. Further `add_segment` calls fail with
    /// `SessionClosed`.
    pub fn finalize(&mut self) -> EngineResult<Manifest> {
        if self.finalized {
            return Err(EngineError::SessionClosed(
                "manifest already finalized".to_string(),
            ));
        }

        let merkle_root = self.merkle_root.ok_or_else(|| {
            EngineError::InvalidSequence("cannot finalize a manifest with no segments".to_string())
        })?;

        self.finalized = true;

        Ok(Manifest {
            version: "1".to_string(),
            session_id: self.session_id,
            uploader: self.uploader,
            group_ids: self.group_ids.clone(),
            merkle_root,
            wrapped_content_key: self.wrapped_content_key.clone(),
            segments: self.segments.clone(),
        })
    }
}

macro_rules! hex_array_module {
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

hex_array_module!(hex32, 32);
hex_array_module!(hex20, 20);
hex_array_module!(hex16, 16);
hex_array_module!(hex12, 12);

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

mod hex32_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[[u8; 32]], serializer: S) -> Result<S::Ok, S::Error> {
        let hexed: Vec<String> = values.iter().map(hex::encode).collect();
        hexed.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<[u8; 32]>, D::Error> {
        let hexed: Vec<String> = Vec::deserialize(deserializer)?;
        hexed
            .into_iter()
            .map(|s| {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
            })
            .collect()
    }
}
