//! Inbound authentication.
//!
//! A request moves through these checks in order, stopping at the first
//! failure:
//!
//! 1. a token is present (`no_token`)
//! 2. it decodes into a claim (`malformed_token`)
//! 3. the claim is within its validity window and signed by the authority
//!    (`invalid_token`)
//! 4. it is addressed to one of this service's names (`wrong_destination`)
//! 5. it carries an allowed entity (`no_common_claims`)
//!
//! A failure denies the request only if enforcement is drawn for it and the
//! caller's self-reported name is not on the derelict list. Every decision
//! is logged with its reason whether or not it was enforced.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::claim::{Claim, EVERYONE};
use crate::config::TrustConfig;
use crate::derelict::DerelictList;
use crate::disable::DisableFlag;
use crate::enforcement::Enforcement;
use crate::error::{AuthError, TrustError, TrustResult, UnauthorizedReason};
use crate::keys::AuthorityKeys;
use crate::metadata::Metadata;

/// Options for a single inbound check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOption {
    /// Entities allowed for this request, replacing the configured defaults.
    AllowedEntities(Vec<String>),
    /// Unauthenticated caller name, e.g. from a transport header.
    CallerName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundStatus {
    Denied,
    NotEnforced,
    Allowed,
}

impl InboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Denied => "denied",
            Self::NotEnforced => "not_enforced",
            Self::Allowed => "allowed",
        }
    }
}

impl fmt::Display for InboundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one inbound check.
#[derive(Debug)]
pub struct InboundDecision {
    pub status: InboundStatus,
    pub reason: Option<UnauthorizedReason>,
    pub remote_entity: Option<String>,
    pub allowed_entities: Vec<String>,
    pub derelict: bool,
    error: Option<TrustError>,
}

impl InboundDecision {
    pub fn is_allowed(&self) -> bool {
        self.status != InboundStatus::Denied
    }

    pub fn error(&self) -> Option<&TrustError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<(), AuthError> {
        match (self.status, self.error) {
            (InboundStatus::Denied, Some(error)) => {
                Err(AuthError::new(self.allowed_entities, error))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct InboundAuthenticator {
    service_name: String,
    destinations: Vec<String>,
    default_allowed: Vec<String>,
    keys: AuthorityKeys,
    enforcement: Arc<Enforcement>,
    derelicts: Arc<DerelictList>,
    flag: DisableFlag,
}

impl InboundAuthenticator {
    pub fn new(
        config: &TrustConfig,
        keys: AuthorityKeys,
        enforcement: Arc<Enforcement>,
        derelicts: Arc<DerelictList>,
        flag: DisableFlag,
    ) -> Self {
        Self {
            service_name: config.service_name.clone(),
            destinations: config.destinations(),
            default_allowed: config.allowed_entities.clone(),
            keys,
            enforcement,
            derelicts,
            flag,
        }
    }

    /// Check the token in `metadata` and remove it.
    pub fn authenticate_in(
        &self,
        metadata: &mut Metadata,
        options: &[ValidationOption],
    ) -> Result<(), AuthError> {
        let token = metadata.take_token();
        if self.flag.is_disabled() {
            warn!(entity = %self.service_name, "globally disabled, inbound request not checked");
            return Ok(());
        }
        self.evaluate(token.as_deref(), options).into_result()
    }

    /// Check a marshalled claim handed over outside of request metadata.
    pub fn validate_credential(
        &self,
        token: &str,
        options: &[ValidationOption],
    ) -> Result<(), AuthError> {
        if self.flag.is_disabled() {
            return Ok(());
        }
        self.evaluate(Some(token), options).into_result()
    }

    /// Run every check and fold in enforcement and derelict bypass.
    pub fn evaluate(&self, token: Option<&str>, options: &[ValidationOption]) -> InboundDecision {
        let mut allowed: Option<&[String]> = None;
        let mut caller: Option<&str> = None;
        for option in options {
            match option {
                ValidationOption::AllowedEntities(entities) => allowed = Some(entities.as_slice()),
                ValidationOption::CallerName(name) => caller = Some(name.as_str()),
            }
        }
        let allowed_entities = match allowed {
            Some(entities) if !entities.is_empty() => entities.to_vec(),
            _ => self.default_allowed.clone(),
        };
        let derelict = caller.is_some_and(|name| self.derelicts.is_derelict(name));

        let checked = self.check(token, &allowed_entities);

        let remote_entity = checked.as_ref().ok().map(|claim| claim.entity_name.clone());
        if let (Some(remote), Some(caller)) = (&remote_entity, caller) {
            if !caller.is_empty() && !remote.eq_ignore_ascii_case(caller) {
                warn!(
                    entity = %self.service_name,
                    remote_entity = %remote,
                    caller = %caller,
                    unauthorized_reason = %UnauthorizedReason::RemoteEntityMismatch,
                    "claim entity differs from caller name"
                );
            }
        }

        let (status, error) = match checked {
            Ok(_) => (InboundStatus::Allowed, None),
            Err(e) if derelict => (InboundStatus::NotEnforced, Some(e)),
            Err(e) if !self.enforcement.should_enforce() => (InboundStatus::NotEnforced, Some(e)),
            Err(e) => (InboundStatus::Denied, Some(e)),
        };

        let decision = InboundDecision {
            status,
            reason: error.as_ref().and_then(TrustError::unauthorized_reason),
            remote_entity,
            allowed_entities,
            derelict,
            error,
        };
        self.report(&decision, caller);
        decision
    }

    fn check(&self, token: Option<&str>, allowed_entities: &[String]) -> TrustResult<Claim> {
        let token = token.filter(|t| !t.is_empty()).ok_or(TrustError::NoToken)?;
        let claim = Claim::unmarshal(token)?;

        let required = required_claims(allowed_entities, &claim);
        claim.inspect(&self.keys, &self.destinations, &required)?;
        Ok(claim)
    }

    fn report(&self, decision: &InboundDecision, caller: Option<&str>) {
        let reason = decision.reason.map(|r| r.as_str()).unwrap_or("");
        let remote = decision.remote_entity.as_deref().or(caller).unwrap_or("");

        if decision.status == InboundStatus::Allowed {
            debug!(
                entity = %self.service_name,
                remote_entity = %remote,
                status = %decision.status,
                "inbound request authenticated"
            );
            return;
        }

        warn!(
            entity = %self.service_name,
            destination = ?self.destinations,
            remote_entity = %remote,
            allowed_entities = ?decision.allowed_entities,
            status = %decision.status,
            unauthorized_reason = %reason,
            derelict = decision.derelict,
            enforce_percentage = self.enforcement.percentage(),
            error = ?decision.error.as_ref().map(ToString::to_string),
            "inbound request failed authentication"
        );
    }
}

/// Allowed entities as matched against the claim. An empty list accepts
/// whatever the claim carries; `EVERYONE` also admits the claim's holder.
fn required_claims(allowed_entities: &[String], claim: &Claim) -> Vec<String> {
    if allowed_entities.is_empty() {
        return claim.claims.clone();
    }
    let mut required = allowed_entities.to_vec();
    if required.iter().any(|e| e.eq_ignore_ascii_case(EVERYONE)) {
        required.push(claim.entity_name.clone());
    }
    required
}
