//! Signing primitives and the authority key set.
//!
//! Claims, certificates and disable messages are all signed with Ed25519 over
//! canonical JSON. The authority key set accepts a signature from any current
//! key so the authority can rotate keys without a flag day. Keys come from:
//! - Pinned roots (configured at construction, never revoked remotely)
//! - A keys manifest distributed by the authority

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{TrustError, TrustResult};

/// Key id: `sha256:` plus the hex digest of the SPKI DER encoding.
pub fn compute_key_id(spki_bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(spki_bytes)))
}

/// SPKI DER encoding of a public key.
pub fn encode_public_key(key: &VerifyingKey) -> TrustResult<Vec<u8>> {
    let doc = key.to_public_key_der().map_err(|e| TrustError::Signature {
        message: format!("failed to encode public key: {}", e),
    })?;
    Ok(doc.as_bytes().to_vec())
}

pub fn decode_public_key(spki_der: &[u8]) -> TrustResult<VerifyingKey> {
    VerifyingKey::from_public_key_der(spki_der).map_err(|e| TrustError::Signature {
        message: format!("invalid SPKI public key: {}", e),
    })
}

/// Decode a Base64-encoded SPKI public key.
pub fn decode_public_key_b64(b64: &str) -> TrustResult<VerifyingKey> {
    let bytes = BASE64.decode(b64.trim()).map_err(|e| TrustError::Signature {
        message: format!("invalid base64 public key: {}", e),
    })?;
    decode_public_key(&bytes)
}

/// PKCS#8 DER encoding of a private key.
pub fn encode_signing_key(key: &SigningKey) -> TrustResult<Vec<u8>> {
    let doc = key.to_pkcs8_der().map_err(|e| TrustError::Signature {
        message: format!("failed to encode private key: {}", e),
    })?;
    Ok(doc.as_bytes().to_vec())
}

pub fn decode_signing_key(pkcs8_der: &[u8]) -> TrustResult<SigningKey> {
    SigningKey::from_pkcs8_der(pkcs8_der).map_err(|e| TrustError::Signature {
        message: format!("invalid PKCS#8 private key: {}", e),
    })
}

pub fn sign_bytes(payload: &[u8], key: &SigningKey) -> Vec<u8> {
    key.sign(payload).to_bytes().to_vec()
}

/// Verify an Ed25519 signature. Malformed signatures simply fail.
pub fn verify_bytes(payload: &[u8], signature: &[u8], key: &VerifyingKey) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => key.verify(payload, &sig).is_ok(),
        Err(_) => false,
    }
}

/// A key entry as distributed in a keys manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKey {
    /// `sha256:` key id of the SPKI bytes.
    pub key_id: String,

    /// Public key (SPKI DER, Base64).
    pub public_key: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub revoked: bool,
}

impl TrustedKey {
    pub fn from_verifying_key(key: &VerifyingKey) -> TrustResult<Self> {
        let spki = encode_public_key(key)?;
        Ok(Self {
            key_id: compute_key_id(&spki),
            public_key: BASE64.encode(&spki),
            description: None,
            expires_at: None,
            revoked: false,
        })
    }
}

/// Authority keys manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeysManifest {
    #[serde(default)]
    pub keys: Vec<TrustedKey>,
}

/// Rotating set of authority public keys.
#[derive(Debug, Clone, Default)]
pub struct AuthorityKeys {
    inner: Arc<RwLock<AuthorityKeysInner>>,
}

#[derive(Debug, Default)]
struct AuthorityKeysInner {
    /// Insertion-ordered so disable record scans are deterministic.
    order: Vec<String>,
    keys: HashMap<String, KeyEntry>,
}

#[derive(Debug, Clone)]
struct KeyEntry {
    key: VerifyingKey,
    expires_at: Option<DateTime<Utc>>,
    pinned: bool,
}

impl AuthorityKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a key set where every key is pinned.
    pub fn pinned(keys: impl IntoIterator<Item = VerifyingKey>) -> TrustResult<Self> {
        let set = Self::new();
        for key in keys {
            set.add_pinned(key)?;
        }
        Ok(set)
    }

    pub fn add_pinned(&self, key: VerifyingKey) -> TrustResult<String> {
        let key_id = compute_key_id(&encode_public_key(&key)?);
        let mut inner = self.write();
        if !inner.keys.contains_key(&key_id) {
            inner.order.push(key_id.clone());
        }
        inner.keys.insert(
            key_id.clone(),
            KeyEntry {
                key,
                expires_at: None,
                pinned: true,
            },
        );
        Ok(key_id)
    }

    /// Apply a keys manifest: add new keys, drop revoked ones.
    ///
    /// Pinned keys are never overwritten or revoked. Entries whose key id
    /// does not match their key are skipped.
    pub fn apply_manifest(&self, manifest: &KeysManifest) {
        let now = Utc::now();
        let mut inner = self.write();

        for entry in &manifest.keys {
            if inner.keys.get(&entry.key_id).is_some_and(|k| k.pinned) {
                continue;
            }

            if entry.revoked {
                inner.keys.remove(&entry.key_id);
                inner.order.retain(|id| id != &entry.key_id);
                continue;
            }

            if entry.expires_at.is_some_and(|at| at < now) {
                continue;
            }

            let key = match decode_public_key_b64(&entry.public_key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(key_id = %entry.key_id, error = %e, "failed to decode key");
                    continue;
                }
            };

            let computed = match encode_public_key(&key) {
                Ok(spki) => compute_key_id(&spki),
                Err(_) => continue,
            };
            if computed != entry.key_id {
                tracing::warn!(
                    claimed = %entry.key_id,
                    computed = %computed,
                    "key_id mismatch, skipping"
                );
                continue;
            }

            if !inner.keys.contains_key(&entry.key_id) {
                inner.order.push(entry.key_id.clone());
            }
            inner.keys.insert(
                entry.key_id.clone(),
                KeyEntry {
                    key,
                    expires_at: entry.expires_at,
                    pinned: false,
                },
            );
        }
    }

    /// Keys that are currently usable, in insertion order.
    pub fn current(&self) -> Vec<VerifyingKey> {
        let now = Utc::now();
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.keys.get(id))
            .filter(|entry| entry.expires_at.map_or(true, |at| at >= now))
            .map(|entry| entry.key)
            .collect()
    }

    /// True if any current key verifies `signature` over `payload`.
    pub fn verify_any(&self, payload: &[u8], signature: &[u8]) -> bool {
        self.current()
            .iter()
            .any(|key| verify_bytes(payload, signature, key))
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.read().keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.read().keys.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, AuthorityKeysInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AuthorityKeysInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
