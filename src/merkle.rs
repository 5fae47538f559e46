//! Incremental binary Merkle tree over segment leaves.
//!
//! Distinct from, and never mixed with, [`crate::audit::AuditLogger`]'s
//! hash chain: the two use different domain separation and must never
//! share a root or leaf encoding.
//!
//! `leaf(i) = SHA-256(u32_be(i) || plaintextHash_i || encryptedHash_i || u64_be(capturedAt_i))`.
//! The tree node for a leaf is `SHA-256(0x00 || leaf(i))`; an internal
//! node combining `left` and `right` is `SHA-256(0x01 || left || right)`.
//! An odd-count level's lone node is paired with itself, standard
//! duplication, so the root is always defined for any `n >= 1`.

use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

const LEAF_DOMAIN: u8 = 0x00;
const INTERNAL_DOMAIN: u8 = 0x01;

/// Compute `leaf(i)` from a segment's recorded hashes and timestamp.
pub fn leaf_value(index: u32, plaintext_hash: &[u8; 32], encrypted_hash: &[u8; 32], captured_at: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(index.to_be_bytes());
    hasher.update(plaintext_hash);
    hasher.update(encrypted_hash);
    hasher.update(captured_at.to_be_bytes());
    hasher.finalize().into()
}

fn leaf_node(leaf: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_DOMAIN]);
    hasher.update(leaf);
    hasher.finalize().into()
}

fn internal_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([INTERNAL_DOMAIN]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Which side of a combining step a proof's sibling sat on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Left,
    Right,
}

/// One step of an inclusion proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: [u8; 32],
    pub position: Position,
}

fn build_pyramid(leaves: &[[u8; 32]]) -> Vec<Vec<[u8; 32]>> {
    let mut levels = vec![leaves.iter().map(leaf_node).collect::<Vec<_>>()];

    while levels.last().expect("always at least one level").len() > 1 {
        let current = levels.last().expect("checked above");
        let mut next = Vec::with_capacity(current.len().div_ceil(2));

        let mut i = 0;
        while i < current.len() {
            let left = &current[i];
            let right = if i + 1 < current.len() { &current[i + 1] } else { left };
            next.push(internal_node(left, right));
            i += 2;
        }

        levels.push(next);
    }

    levels
}

/// Incremental Merkle tree over segment leaves.
#[derive(Debug, Default, Clone)]
pub struct MerkleTree {
    leaves: Vec<[u8; 32]>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves inserted so far.
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Append a leaf (the output of [`leaf_value`]) and recompute the root.
    pub fn insert(&mut self, leaf: [u8; 32]) {
        self.leaves.push(leaf);
    }

    /// The current root. Defined only once at least one leaf has been
    /// inserted.
    pub fn root(&self) -> EngineResult<[u8; 32]> {
        if self.leaves.is_empty() {
            return Err(EngineError::InvalidInput(
                "merkle root undefined before the first insert".to_string(),
            ));
        }

        let pyramid = build_pyramid(&self.leaves);
        Ok(pyramid.last().expect("at least one level")[0])
    }

    /// Build an inclusion proof for leaf `index`, valid only against
    /// the root computed at the tree's current size.
    pub fn proof(&self, index: u32) -> EngineResult<Vec<ProofStep>> {
        let index = index as usize;
        if index >= self.leaves.len() {
            return Err(EngineError::InvalidInput(format!(
                "leaf index {index} out of range for a tree of size {}",
                self.leaves.len()
            )));
        }

        let pyramid = build_pyramid(&self.leaves);
        let mut steps = Vec::new();
        let mut pos = index;

        for level in &pyramid[..pyramid.len() - 1] {
            let sibling_index = if pos % 2 == 0 {
                if pos + 1 < level.len() { pos + 1 } else { pos }
            } else {
                pos - 1
            };
            let position = if pos % 2 == 0 { Position::Right } else { Position::Left };

            steps.push(ProofStep {
                sibling: level[sibling_index],
                position,
            });

            pos /= 2;
        }

        Ok(steps)
    }
}

/// Verify an inclusion proof for `leaf` against `root`.
pub fn verify(proof: &[ProofStep], leaf: &[u8; 32], root: &[u8; 32]) -> bool {
    let mut node = leaf_node(leaf);

    for step in proof {
        node = match step.position {
            Position::Left => internal_node(&step.sibling, &node),
            Position::Right => internal_node(&node, &step.sibling),
        };
    }

    &node == root
}
