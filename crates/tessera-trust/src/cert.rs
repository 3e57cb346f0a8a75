//! Identity certificates and signing requests.
//!
//! A certificate binds an entity (service, host or user) on a host to an
//! Ed25519 public key. It is signed either by the credential authority or,
//! during bootstrap, by a previous certificate's key.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::claim::CLOCK_SKEW_SECS;
use crate::error::{TrustError, TrustResult};
use crate::keys::{decode_public_key, encode_public_key, sign_bytes, verify_bytes, AuthorityKeys};
use crate::wire::{self, base64_bytes};

/// Lifetime of a freshly generated certificate, in seconds.
pub const CERTIFICATE_TTL_SECS: i64 = 20 * 60 * 60;

pub const TAG_TASK_ID: &str = "TaskID";
pub const TAG_RUNTIME: &str = "Runtime";
pub const TAG_LAUNCH_REQUEST: &str = "LaunchRequest";
pub const TAG_BOOTSTRAP: &str = "BootstrapCertificate";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    #[default]
    Service,
    Host,
    User,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Service => "service",
            Self::Host => "host",
            Self::User => "user",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub entity_name: String,

    #[serde(default)]
    pub entity_type: EntityType,

    #[serde(default)]
    pub host: String,

    /// SPKI DER of the certified public key.
    #[serde(with = "base64_bytes", default)]
    pub key: Vec<u8>,

    #[serde(default)]
    pub serial: u64,

    #[serde(default)]
    pub valid_after: i64,

    #[serde(default)]
    pub valid_before: i64,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

impl Certificate {
    /// Generate a new keypair and an unsigned certificate for it.
    pub fn generate(
        entity_name: impl Into<String>,
        entity_type: EntityType,
        host: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> TrustResult<(Self, SigningKey)> {
        let mut rng = rand::thread_rng();
        let key = SigningKey::generate(&mut rng);
        let now = Utc::now().timestamp();

        let cert = Self {
            entity_name: entity_name.into(),
            entity_type,
            host: host.into(),
            key: encode_public_key(&key.verifying_key())?,
            serial: rng.gen(),
            valid_after: now - CLOCK_SKEW_SECS,
            valid_before: now + CERTIFICATE_TTL_SECS,
            tags,
            signature: Vec::new(),
        };
        Ok((cert, key))
    }

    pub fn public_key(&self) -> TrustResult<VerifyingKey> {
        decode_public_key(&self.key)
    }

    pub fn signing_bytes(&self) -> TrustResult<Vec<u8>> {
        let unsigned = Self {
            signature: Vec::new(),
            ..self.clone()
        };
        wire::canonical_bytes(&unsigned)
    }

    pub fn sign(&mut self, key: &SigningKey) -> TrustResult<()> {
        self.signature = sign_bytes(&self.signing_bytes()?, key);
        Ok(())
    }

    pub fn marshal(&self) -> TrustResult<String> {
        wire::encode_token(self)
    }

    pub fn unmarshal(encoded: &str) -> TrustResult<Self> {
        wire::decode_token(encoded)
    }

    /// Certificates carrying a launch request together with the bootstrap
    /// tag must be exchanged for a regular certificate before use.
    pub fn is_cert_granting(&self) -> bool {
        self.tags.contains_key(TAG_LAUNCH_REQUEST) && self.tags.contains_key(TAG_BOOTSTRAP)
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        now + CLOCK_SKEW_SECS >= self.valid_after && now - CLOCK_SKEW_SECS <= self.valid_before
    }

    /// Time window plus a signature from any authority key.
    pub fn check(&self, keys: &AuthorityKeys) -> TrustResult<()> {
        if !self.is_valid_at(Utc::now().timestamp()) {
            return Err(TrustError::Signature {
                message: format!(
                    "certificate for {} outside validity window [{}, {}]",
                    self.entity_name, self.valid_after, self.valid_before
                ),
            });
        }
        if !keys.verify_any(&self.signing_bytes()?, &self.signature) {
            return Err(TrustError::Signature {
                message: format!("certificate for {} not signed by authority", self.entity_name),
            });
        }
        Ok(())
    }

    /// Verify that `signer` signed this certificate with its key.
    pub fn check_signed_by(&self, signer: &Certificate) -> TrustResult<()> {
        let signer_key = signer.public_key()?;
        if !verify_bytes(&self.signing_bytes()?, &self.signature, &signer_key) {
            return Err(TrustError::Signature {
                message: format!("certificate not signed by {}", signer.entity_name),
            });
        }
        Ok(())
    }
}

/// Request asking the authority to sign `certificate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSigningRequest {
    pub certificate: Certificate,

    /// Certificate whose key signed this request.
    pub signing_certificate: Certificate,

    /// Launch proof forwarded from a cert-granting certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_request: Option<String>,

    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

impl CertificateSigningRequest {
    /// Build a request for `certificate`, signed with the key of the
    /// currently held `signing_certificate`.
    pub fn new(
        certificate: Certificate,
        signing_certificate: Certificate,
        signing_key: &SigningKey,
        launch_request: Option<String>,
    ) -> TrustResult<Self> {
        let mut csr = Self {
            certificate,
            signing_certificate,
            launch_request,
            signature: Vec::new(),
        };
        csr.signature = sign_bytes(&csr.signing_bytes()?, signing_key);
        Ok(csr)
    }

    pub fn signing_bytes(&self) -> TrustResult<Vec<u8>> {
        let unsigned = Self {
            signature: Vec::new(),
            ..self.clone()
        };
        wire::canonical_bytes(&unsigned)
    }

    /// Verify the request signature against the signing certificate.
    pub fn verify(&self) -> TrustResult<()> {
        let key = self.signing_certificate.public_key()?;
        if !verify_bytes(&self.signing_bytes()?, &self.signature, &key) {
            return Err(TrustError::Signature {
                message: "certificate signing request signature mismatch".to_string(),
            });
        }
        Ok(())
    }
}

/// A certificate together with its private key.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    pub certificate: Certificate,
    pub key: SigningKey,
}

impl CertKeyPair {
    pub fn new(certificate: Certificate, key: SigningKey) -> Self {
        Self { certificate, key }
    }
}
