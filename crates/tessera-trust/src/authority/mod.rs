//! Capabilities consumed from the credential authority and its neighbours.
//!
//! The client only talks to the outside world through these traits.
//! [`HttpAuthority`] is the production implementation of the authority
//! traits; tests substitute in-memory fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::cert::{CertKeyPair, Certificate, CertificateSigningRequest};
use crate::claim::Claim;
use crate::error::TrustResult;

mod daemon;
mod http;

pub use daemon::TcpDaemon;
pub use http::{HttpAuthority, AUTHORITY_USER_AGENT};

/// The identity on whose behalf a request is made.
#[derive(Debug, Clone)]
pub struct Requester {
    pub entity_name: String,
    pub signing_key: SigningKey,
    pub certificate: Option<Certificate>,
    pub implicit_claims: Vec<String>,
}

impl Requester {
    pub fn new(entity_name: impl Into<String>, signing_key: SigningKey) -> Self {
        Self {
            entity_name: entity_name.into(),
            signing_key,
            certificate: None,
            implicit_claims: Vec::new(),
        }
    }

    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    pub fn with_implicit_claims(mut self, claims: Vec<String>) -> Self {
        self.implicit_claims = claims;
        self
    }
}

/// Issues claims.
#[async_trait]
pub trait ClaimResolver: Send + Sync {
    /// Ask for a claim that lets `requester` call `requested_entity`.
    async fn resolve(&self, requester: &Requester, requested_entity: &str) -> TrustResult<Claim>;

    /// Ask for a specific `claim` scoped to `destination`.
    async fn claim_request(
        &self,
        requester: &Requester,
        claim: &str,
        destination: &str,
    ) -> TrustResult<Claim>;
}

/// Signs certificates.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Identifies the authority instance; part of the certificate registry key.
    fn endpoint(&self) -> &str;

    async fn certificate_sign(&self, csr: &CertificateSigningRequest) -> TrustResult<Certificate>;

    async fn health_check(&self) -> TrustResult<()>;
}

/// Reply to a derelict list fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerelictReply {
    /// Entity name to the time its bypass ends.
    #[serde(default)]
    pub derelicts: HashMap<String, DateTime<Utc>>,

    /// Suggested seconds until the next fetch; zero keeps the current period.
    #[serde(default)]
    pub check_interval_secs: u64,
}

/// Source of the central derelict (authentication bypass) list.
#[async_trait]
pub trait DerelictSource: Send + Sync {
    async fn fetch_derelicts(&self, requester: &Requester) -> TrustResult<DerelictReply>;
}

/// Out-of-band TXT-style record lookup used by the disable monitor.
#[async_trait]
pub trait RecordLookup: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> TrustResult<Vec<String>>;
}

/// Local daemon able to refresh a certificate when the authority is unreachable.
#[async_trait]
pub trait LocalDaemon: Send + Sync {
    async fn refresh(&self, current: &CertKeyPair) -> TrustResult<CertKeyPair>;
}
