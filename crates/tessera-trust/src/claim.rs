//! Claims: short-lived signed assertions that an entity may act under a set
//! of named permissions toward one destination.
//!
//! # Wire form
//!
//! A claim travels as base64 of its JSON encoding with short field names:
//!
//! | Field | JSON | Meaning |
//! |-------|------|---------|
//! | `claim_type` | `ct` | Format tag |
//! | `valid_after` | `va` | Unix seconds |
//! | `valid_before` | `vb` | Unix seconds |
//! | `entity_name` | `e` | Holder |
//! | `claims` | `c` | Granted permissions |
//! | `destination` | `d` | Intended receiver |
//! | `signature` | `s` | Ed25519 over the canonical JSON without `s` |

use chrono::Utc;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::error::{InvalidityReason, TrustError, TrustResult};
use crate::keys::{sign_bytes, AuthorityKeys};
use crate::wire::{self, base64_bytes};

/// Pseudo-entity that every authenticated caller is a member of.
pub const EVERYONE: &str = "EVERYONE";

/// Claim format tag.
pub const CLAIM_TYPE: &str = "tessera.claim.v1";

/// Tolerated clock difference between hosts, in seconds.
pub const CLOCK_SKEW_SECS: i64 = 60;

/// Cached claims closer than this to expiry are refreshed, in seconds.
pub const CLAIM_EXPIRY_BUFFER_SECS: i64 = 3 * CLOCK_SKEW_SECS;

/// Default lifetime of an issued claim, in seconds.
pub const DEFAULT_CLAIM_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(rename = "ct", default)]
    pub claim_type: String,

    #[serde(rename = "va", default)]
    pub valid_after: i64,

    #[serde(rename = "vb", default)]
    pub valid_before: i64,

    #[serde(rename = "e", default)]
    pub entity_name: String,

    #[serde(rename = "c", default)]
    pub claims: Vec<String>,

    #[serde(rename = "d", default)]
    pub destination: String,

    #[serde(
        rename = "s",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub signature: Vec<u8>,
}

impl Claim {
    /// Unsigned claim valid from `valid_after` for `ttl_secs`.
    pub fn new(
        entity_name: impl Into<String>,
        claims: Vec<String>,
        destination: impl Into<String>,
        valid_after: i64,
        ttl_secs: i64,
    ) -> Self {
        Self {
            claim_type: CLAIM_TYPE.to_string(),
            valid_after,
            valid_before: valid_after + ttl_secs,
            entity_name: entity_name.into(),
            claims,
            destination: destination.into(),
            signature: Vec::new(),
        }
    }

    /// Canonical bytes covered by the signature.
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

    pub fn unmarshal(token: &str) -> TrustResult<Self> {
        wire::decode_token(token)
    }

    /// Time-window and signature check against `now` (unix seconds).
    pub fn validate_at(&self, keys: &AuthorityKeys, now: i64) -> Result<(), InvalidityReason> {
        if now + CLOCK_SKEW_SECS < self.valid_after {
            return Err(InvalidityReason::FutureToken);
        }
        if now - CLOCK_SKEW_SECS > self.valid_before {
            return Err(InvalidityReason::ExpiredToken);
        }

        let payload = self
            .signing_bytes()
            .map_err(|_| InvalidityReason::MarshallingError)?;
        if !keys.verify_any(&payload, &self.signature) {
            return Err(InvalidityReason::InvalidSignature);
        }
        Ok(())
    }

    pub fn validate(&self, keys: &AuthorityKeys) -> TrustResult<()> {
        self.validate_at(keys, Utc::now().timestamp())
            .map_err(|reason| TrustError::InvalidToken { reason })
    }

    /// Validate, then require `destination` and at least one of `required`.
    pub fn check(
        &self,
        keys: &AuthorityKeys,
        destination: &str,
        required: &[String],
    ) -> TrustResult<()> {
        self.inspect(keys, std::slice::from_ref(&destination.to_string()), required)
    }

    /// Like [`Claim::check`] but accepts any of several destination names.
    pub fn inspect(
        &self,
        keys: &AuthorityKeys,
        destinations: &[String],
        required: &[String],
    ) -> TrustResult<()> {
        self.validate(keys)?;

        if !destinations
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&self.destination))
        {
            return Err(TrustError::WrongDestination {
                actual: self.destination.clone(),
                expected: destinations.to_vec(),
            });
        }

        if !self.has_any(required) {
            return Err(TrustError::NoCommonClaims {
                have: self.claims.clone(),
                need: required.to_vec(),
            });
        }
        Ok(())
    }

    pub fn has_claim(&self, claim: &str) -> bool {
        self.claims.iter().any(|c| c.eq_ignore_ascii_case(claim))
    }

    pub fn has_any(&self, required: &[String]) -> bool {
        required.iter().any(|r| self.has_claim(r))
    }
}

pub fn marshal_claim(claim: &Claim) -> TrustResult<String> {
    claim.marshal()
}

pub fn unmarshal_claim(token: &str) -> TrustResult<Claim> {
    Claim::unmarshal(token)
}
