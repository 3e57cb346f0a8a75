//! Client-side trust library for service-to-service authentication.
//!
//! Services obtain short-lived signed claims from a credential authority,
//! attach them to outbound requests and check the claims on inbound ones.
//! This crate provides:
//!
//! - Claims and certificates signed with Ed25519 over canonical JSON
//! - An outbound claim cache with per-destination backoff
//! - Inbound checks with partial enforcement and a derelict bypass list
//! - A process-wide certificate registry with one refresh task per identity
//! - A global, out-of-band disable switch
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use tessera_trust::{
//!     AuthorityKeys, Collaborators, Identity, Metadata, RecordLookup, TrustClient, TrustConfig,
//!     TrustError, TrustResult, ValidationOption,
//! };
//!
//! struct Resolver;
//!
//! #[async_trait]
//! impl RecordLookup for Resolver {
//!     async fn lookup_txt(&self, _name: &str) -> TrustResult<Vec<String>> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! # async fn example(keys: AuthorityKeys) -> TrustResult<()> {
//! let config = TrustConfig::from_env();
//! let identity = Identity::from_env()?
//!     .ok_or_else(|| TrustError::Config { message: "no identity".into() })?;
//! let collaborators = Collaborators::http(&config, Arc::new(Resolver))?;
//! let client = TrustClient::new(config, identity, keys, collaborators).await?;
//!
//! // Outbound: attach a claim for the callee
//! let metadata = client.authenticate_out(Metadata::new(), "billing", None).await;
//!
//! // Inbound: check the caller
//! let mut incoming = metadata.clone();
//! let allowed = [ValidationOption::AllowedEntities(vec!["frontend".into()])];
//! if let Err(e) = client.authenticate_in(&mut incoming, &allowed) {
//!     eprintln!("denied: {}", e);
//! }
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `TESSERA_SERVICE_NAME` | Entity name of this process |
//! | `TESSERA_SERVICE_ALIASES` | Comma separated names inbound claims may address |
//! | `TESSERA_ALLOWED_ENTITIES` | Default allowed callers |
//! | `TESSERA_ENFORCE_PERCENTAGE` | Fraction of failed checks denied (default: 0) |
//! | `TESSERA_AUTHORITY_URL` | Authority base URL (default: `http://127.0.0.1:16746`) |
//! | `TESSERA_DISABLED` | Start fail-open |
//! | `TESSERA_REQUEST_TIMEOUT` | Authority call deadline in seconds (default: 5) |
//! | `TESSERA_DISABLE_RECORD_DOMAIN` | Domain of disable records |
//! | `TESSERA_CERTIFICATE` | Certificate JSON file |
//! | `TESSERA_PRIVATE_KEY` | Base64 PKCS#8 private key file |

pub mod authority;
pub mod backoff;
pub mod cache;
pub mod cert;
pub mod claim;
pub mod client;
pub mod config;
pub mod derelict;
pub mod disable;
pub mod enforcement;
pub mod error;
pub mod identity;
pub mod inbound;
pub mod keys;
pub mod metadata;
pub mod outbound;
pub mod registry;
mod wire;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use authority::{
    CertificateAuthority, ClaimResolver, DerelictReply, DerelictSource, HttpAuthority,
    LocalDaemon, RecordLookup, Requester, TcpDaemon,
};
pub use backoff::SkipList;
pub use cache::ClaimCache;
pub use cert::{CertKeyPair, Certificate, CertificateSigningRequest, EntityType};
pub use claim::{marshal_claim, unmarshal_claim, Claim, EVERYONE};
pub use client::{Collaborators, TrustClient};
pub use config::{Timings, TrustConfig};
pub use derelict::DerelictList;
pub use disable::{DisableFlag, DisableMessage, DisableMonitor};
pub use enforcement::Enforcement;
pub use error::{AuthError, InvalidityReason, TrustError, TrustResult, UnauthorizedReason};
pub use identity::Identity;
pub use inbound::{InboundAuthenticator, InboundDecision, InboundStatus, ValidationOption};
pub use keys::{AuthorityKeys, KeysManifest, TrustedKey};
pub use metadata::{Metadata, CLAIM_METADATA_KEY};
pub use outbound::OutboundAuthenticator;
pub use registry::{CertificateHandle, CertificateRegistry};
