//! HTTP transport to the credential authority.
//!
//! This is the ONLY place for status code handling. Requests are JSON
//! bodies signed with the requester's key; replies carry claims in their
//! token form. Nothing here retries: a failed call surfaces to the caller
//! and the outbound backoff decides when to try again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CertificateAuthority, ClaimResolver, DerelictReply, DerelictSource, Requester};
use crate::cert::{Certificate, CertificateSigningRequest};
use crate::claim::Claim;
use crate::config::TrustConfig;
use crate::error::{TrustError, TrustResult};
use crate::keys::sign_bytes;
use crate::wire::{self, base64_bytes};

pub const AUTHORITY_USER_AGENT: &str = concat!("tessera-trust/", env!("CARGO_PKG_VERSION"));

/// Lifetime of a signed request body, in seconds.
const REQUEST_TTL_SECS: i64 = 60;

/// Credential authority client over JSON/HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> TrustResult<Self> {
        let parsed = url::Url::parse(base_url).map_err(|e| {
            TrustError::config(format!("invalid authority url {}: {}", base_url, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TrustError::config(format!(
                "unsupported authority url scheme: {}",
                parsed.scheme()
            )));
        }

        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(AUTHORITY_USER_AGENT));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| TrustError::authority(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &TrustConfig) -> TrustResult<Self> {
        Self::new(&config.authority_url, config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<Req, Resp>(&self, path: &str, body: &Req) -> TrustResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "authority request");
        let response = self.client.post(&url).json(body).send().await?;
        Self::read_json(response).await
    }

    async fn read_json<Resp: DeserializeOwned>(response: reqwest::Response) -> TrustResult<Resp> {
        let status = response.status();
        match status.as_u16() {
            200..=299 => response.json::<Resp>().await.map_err(|e| {
                TrustError::authority(format!("invalid authority response: {}", e))
            }),

            401 | 403 => {
                let message = response.text().await.unwrap_or_default();
                Err(TrustError::authority(format!(
                    "rejected ({}): {}",
                    status.as_u16(),
                    message.trim()
                )))
            }

            _ => {
                let message = response.text().await.unwrap_or_else(|_| status.to_string());
                Err(TrustError::authority(format!(
                    "HTTP {}: {}",
                    status.as_u16(),
                    message.trim()
                )))
            }
        }
    }

    fn claim_from_reply(reply: ClaimReply) -> TrustResult<Claim> {
        Claim::unmarshal(&reply.token)
            .map_err(|e| TrustError::authority(format!("authority returned unusable claim: {}", e)))
    }
}

#[async_trait]
impl ClaimResolver for HttpAuthority {
    async fn resolve(&self, requester: &Requester, requested_entity: &str) -> TrustResult<Claim> {
        let now = Utc::now().timestamp();
        let body = ResolveBody {
            entity_name: requester.entity_name.clone(),
            requested_entity: requested_entity.to_string(),
            implicit_claims: requester.implicit_claims.clone(),
            certificate: requester.certificate.clone(),
            ctime: now,
            etime: now + REQUEST_TTL_SECS,
            signature: Vec::new(),
        }
        .signed_with(&requester.signing_key)?;

        let reply: ClaimReply = self.post_json("/resolve", &body).await?;
        Self::claim_from_reply(reply)
    }

    async fn claim_request(
        &self,
        requester: &Requester,
        claim: &str,
        destination: &str,
    ) -> TrustResult<Claim> {
        let now = Utc::now().timestamp();
        let body = ClaimRequestBody {
            entity_name: requester.entity_name.clone(),
            claim: claim.to_string(),
            destination: destination.to_string(),
            implicit_claims: requester.implicit_claims.clone(),
            certificate: requester.certificate.clone(),
            ctime: now,
            etime: now + REQUEST_TTL_SECS,
            signature: Vec::new(),
        }
        .signed_with(&requester.signing_key)?;

        let reply: ClaimReply = self.post_json("/claim/v2", &body).await?;
        Self::claim_from_reply(reply)
    }
}

#[async_trait]
impl CertificateAuthority for HttpAuthority {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn certificate_sign(&self, csr: &CertificateSigningRequest) -> TrustResult<Certificate> {
        let reply: CertificateReply = self.post_json("/csr", csr).await?;
        Ok(reply.certificate)
    }

    async fn health_check(&self) -> TrustResult<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        let _: serde_json::Value = Self::read_json(response).await?;
        Ok(())
    }
}

#[async_trait]
impl DerelictSource for HttpAuthority {
    async fn fetch_derelicts(&self, requester: &Requester) -> TrustResult<DerelictReply> {
        let body = DerelictBody {
            entity_name: requester.entity_name.clone(),
            ctime: Utc::now().timestamp(),
            signature: Vec::new(),
        }
        .signed_with(&requester.signing_key)?;

        self.post_json("/thehose", &body).await
    }
}

/// Request bodies signed over their canonical JSON without the signature.
trait SignedBody: Serialize + Sized {
    fn signature_mut(&mut self) -> &mut Vec<u8>;

    fn signed_with(mut self, key: &SigningKey) -> TrustResult<Self> {
        self.signature_mut().clear();
        let signature = sign_bytes(&wire::canonical_bytes(&self)?, key);
        *self.signature_mut() = signature;
        Ok(self)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResolveBody {
    pub entity_name: String,
    pub requested_entity: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implicit_claims: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    pub ctime: i64,
    pub etime: i64,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

impl SignedBody for ResolveBody {
    fn signature_mut(&mut self) -> &mut Vec<u8> {
        &mut self.signature
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ClaimRequestBody {
    pub entity_name: String,
    pub claim: String,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implicit_claims: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<Certificate>,
    pub ctime: i64,
    pub etime: i64,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

impl SignedBody for ClaimRequestBody {
    fn signature_mut(&mut self) -> &mut Vec<u8> {
        &mut self.signature
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DerelictBody {
    pub entity_name: String,
    pub ctime: i64,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

impl SignedBody for DerelictBody {
    fn signature_mut(&mut self) -> &mut Vec<u8> {
        &mut self.signature
    }
}

#[derive(Debug, Deserialize)]
struct ClaimReply {
    /// Marshalled claim.
    token: String,
}

#[derive(Debug, Deserialize)]
struct CertificateReply {
    certificate: Certificate,
}
