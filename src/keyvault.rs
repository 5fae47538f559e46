//! Key hierarchy and wrapping layer.
//!
//! Derives the process-local [`PersonalKey`] from a wallet signature,
//! generates group secrets and content keys, and wraps/unwraps content
//! keys under a group secret. Every subkey used for AES-256-GCM is
//! derived so that no (key, iv) pair is ever reused: segment subkeys
//! are per-index, content keys are session-unique, and the personal
//! key is deterministic only with respect to the signature that
//! produced it.
//!
//! All unwrap operations collapse to the single opaque
//! [`EngineError::AuthenticationFailed`] — callers must not branch on
//! why a blob failed to authenticate.

use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{EngineError, EngineResult};

const PERSONAL_KEY_SALT: &[u8] = b"witness-protocol-v1";
const PERSONAL_KEY_INFO: &[u8] = b"encryption-key";
const SEGMENT_SUBKEY_PREFIX: &[u8] = b"segment-";

/// A raw 256-bit key. Zeroized on drop; never serialized, never logged.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PersonalKey([u8; 32]);

impl PersonalKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PersonalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PersonalKey(<redacted>)")
    }
}

/// A content key wrapped under a group secret: `{iv, ciphertext}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrappedKey {
    pub iv: [u8; 12],
    pub ciphertext: Vec<u8>,
}

/// Derive the personal key from a wallet signature.
///
/// Deterministic: the same signature bytes always produce the same
/// key. Treats `signature` as HKDF input key material.
pub fn derive_personal_key(signature: &[u8]) -> PersonalKey {
    let hk = Hkdf::<Sha256>::new(Some(PERSONAL_KEY_SALT), signature);
    let mut okm = [0u8; 32];
    hk.expand(PERSONAL_KEY_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA-256 output length");
    PersonalKey(okm)
}

/// Generate a fresh 32-byte group secret.
pub fn generate_group_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// `groupId := SHA-256(groupSecret)`.
pub fn derive_group_id(secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.finalize().into()
}

/// Generate a fresh 32-byte content key, unique to one session.
pub fn generate_content_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt `content_key` under `group_secret` with a fresh 96-bit iv.
pub fn wrap_content_key(content_key: &[u8; 32], group_secret: &[u8; 32]) -> WrappedKey {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(group_secret));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, content_key.as_slice())
        .expect("AES-256-GCM encryption of a fixed-size key cannot fail");

    WrappedKey {
        iv: nonce.into(),
        ciphertext,
    }
}

/// Decrypt a wrapped content key under `group_secret`.
///
/// Fails with [`EngineError::AuthenticationFailed`] on any tag
/// mismatch, whether from a tampered blob or the wrong secret.
pub fn unwrap_content_key(wrapped: &WrappedKey, group_secret: &[u8; 32]) -> EngineResult<[u8; 32]> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(group_secret));
    let nonce = Nonce::from_slice(&wrapped.iv);
    let plaintext = cipher
        .decrypt(nonce, wrapped.ciphertext.as_slice())
        .map_err(|_| EngineError::AuthenticationFailed)?;

    plaintext
        .try_into()
        .map_err(|_| EngineError::AuthenticationFailed)
}

/// Derive the per-segment subkey used to encrypt one segment.
///
/// `info = "segment-" || u32_be(index)`. Subkey-per-index removes all
/// (key, iv) collision risk without a global iv counter.
pub fn derive_segment_subkey(content_key: &[u8; 32], index: u32) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::from_prk(content_key).expect("32-byte PRK meets HKDF's minimum length");
    let mut info = Vec::with_capacity(SEGMENT_SUBKEY_PREFIX.len() + 4);
    info.extend_from_slice(SEGMENT_SUBKEY_PREFIX);
    info.extend_from_slice(&index.to_be_bytes());

    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA-256 output length");
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn personal_key_derivation_is_deterministic() {
        let sig = b"a wallet signature over a typed message";
        let k1 = derive_personal_key(sig);
        let k2 = derive_personal_key(sig);
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn segment_subkeys_are_distinct_per_index() {
        let content_key = generate_content_key();
        let k0 = derive_segment_subkey(&content_key, 0);
        let k1 = derive_segment_subkey(&content_key, 1);
        let k1000 = derive_segment_subkey(&content_key, 1000);
        assert_ne!(k0, k1);
        assert_ne!(k0, k1000);
        assert_ne!(k1, k1000);
    }

    #[test]
    fn wrap_unwrap_round_trips() {
        let content_key = generate_content_key();
        let group_secret = generate_group_secret();

        let wrapped = wrap_content_key(&content_key, &group_secret);
        let unwrapped = unwrap_content_key(&wrapped, &group_secret).unwrap();

        assert_eq!(content_key, unwrapped);
    }

    #[test]
    fn unwrap_with_wrong_secret_fails_authentication() {
        let content_key = generate_content_key();
        let group_secret_a = generate_group_secret();
        let group_secret_b = generate_group_secret();

        let wrapped = wrap_content_key(&content_key, &group_secret_a);
        let result = unwrap_content_key(&wrapped, &group_secret_b);

        assert!(matches!(result, Err(EngineError::AuthenticationFailed)));
    }

    #[test]
    fn group_id_is_sha256_of_secret() {
        let secret = generate_group_secret();
        let expected: [u8; 32] = Sha256::digest(secret).into();
        assert_eq!(derive_group_id(&secret), expected);
    }

    #[test]
    fn wrapping_is_randomized() {
        let content_key = generate_content_key();
        let group_secret = generate_group_secret();

        let first = wrap_content_key(&content_key, &group_secret);
        let second = wrap_content_key(&content_key, &group_secret);

        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }
}
