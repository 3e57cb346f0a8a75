//! Error types for the trust client.

use std::fmt;

use crate::claim::EVERYONE;

/// Why a claim failed its time or signature checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidityReason {
    /// `valid_after` is later than now plus skew.
    FutureToken,
    /// `valid_before` is earlier than now minus skew.
    ExpiredToken,
    /// The claim could not be serialized for verification.
    MarshallingError,
    /// No authority key verifies the signature.
    InvalidSignature,
}

impl InvalidityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FutureToken => "future_token",
            Self::ExpiredToken => "expired_token",
            Self::MarshallingError => "marshalling_error",
            Self::InvalidSignature => "invalid_signature",
        }
    }
}

impl fmt::Display for InvalidityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trust client errors.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// The request carried no token.
    #[error("no token found in request metadata")]
    NoToken,

    /// The token did not decode into a claim.
    #[error("malformed token: {message}")]
    MalformedToken { message: String },

    /// The claim is outside its validity window or badly signed.
    #[error("invalid token: {reason}")]
    InvalidToken { reason: InvalidityReason },

    /// The claim was issued for another destination.
    #[error("wrong destination: claim is for {actual}, expected one of {expected:?}")]
    WrongDestination {
        actual: String,
        expected: Vec<String>,
    },

    /// None of the claim's entities are allowed.
    #[error("no common claims: have {have:?}, need one of {need:?}")]
    NoCommonClaims { have: Vec<String>, need: Vec<String> },

    /// The credential authority could not be reached or refused the request.
    #[error("credential authority unavailable: {message}")]
    AuthorityUnavailable { message: String },

    /// Destination is in its failure backoff window.
    #[error("destination {destination} skipped after recent resolution failures")]
    DestinationSkipped { destination: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Signing or key decoding failed.
    #[error("signature error: {message}")]
    Signature { message: String },

    /// Certificate registry bookkeeping error.
    #[error("registry error: {message}")]
    Registry { message: String },

    /// Serialization error.
    #[error("encoding error: {message}")]
    Encoding { message: String },

    /// Local I/O error (key files, daemon socket).
    #[error("io error: {message}")]
    Io { message: String },
}

impl TrustError {
    /// Stable observability reason for inbound failures.
    pub fn unauthorized_reason(&self) -> Option<UnauthorizedReason> {
        match self {
            Self::NoToken => Some(UnauthorizedReason::NoToken),
            Self::MalformedToken { .. } => Some(UnauthorizedReason::MalformedToken),
            Self::InvalidToken { .. } => Some(UnauthorizedReason::InvalidToken),
            Self::WrongDestination { .. } => Some(UnauthorizedReason::WrongDestination),
            Self::NoCommonClaims { .. } => Some(UnauthorizedReason::NoCommonClaims),
            _ => None,
        }
    }

    /// Whether the error is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AuthorityUnavailable { .. } | Self::DestinationSkipped { .. } | Self::Io { .. }
        )
    }

    pub(crate) fn authority(message: impl Into<String>) -> Self {
        Self::AuthorityUnavailable {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TrustError {
    fn from(err: reqwest::Error) -> Self {
        Self::AuthorityUnavailable {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TrustError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for TrustError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Result type for trust operations.
pub type TrustResult<T> = Result<T, TrustError>;

/// Reason recorded for an inbound request that failed authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnauthorizedReason {
    NoToken,
    MalformedToken,
    InvalidToken,
    NoCommonClaims,
    WrongDestination,
    /// Claim entity differs from the caller's unauthenticated name. Logged only.
    RemoteEntityMismatch,
}

impl UnauthorizedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoToken => "no_token",
            Self::MalformedToken => "malformed_token",
            Self::InvalidToken => "invalid_token",
            Self::NoCommonClaims => "no_common_claims",
            Self::WrongDestination => "wrong_destination",
            Self::RemoteEntityMismatch => "remote_entity_mismatch",
        }
    }
}

impl fmt::Display for UnauthorizedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound authentication failure returned to callers.
///
/// Besides the underlying cause it reports which entities would have been
/// accepted, so callers can build a diagnostic message without parsing logs.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct AuthError {
    allowed_entities: Vec<String>,
    #[source]
    source: TrustError,
}

impl AuthError {
    pub fn new(allowed_entities: Vec<String>, source: TrustError) -> Self {
        Self {
            allowed_entities,
            source,
        }
    }

    /// Entities that would have been allowed. Defaults to `EVERYONE`.
    pub fn allowed_entities(&self) -> Vec<String> {
        if self.allowed_entities.is_empty() {
            vec![EVERYONE.to_string()]
        } else {
            self.allowed_entities.clone()
        }
    }

    pub fn reason(&self) -> Option<UnauthorizedReason> {
        self.source.unauthorized_reason()
    }

    pub fn cause(&self) -> &TrustError {
        &self.source
    }

    pub fn into_cause(self) -> TrustError {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_reason_strings() {
        assert_eq!(TrustError::NoToken.unauthorized_reason().unwrap().as_str(), "no_token");
        assert_eq!(
            TrustError::InvalidToken {
                reason: InvalidityReason::ExpiredToken
            }
            .unauthorized_reason(),
            Some(UnauthorizedReason::InvalidToken)
        );
        assert_eq!(UnauthorizedReason::RemoteEntityMismatch.as_str(), "remote_entity_mismatch");
        assert!(TrustError::config("x").unauthorized_reason().is_none());
    }

    #[test]
    fn test_auth_error_defaults_to_everyone() {
        let err = AuthError::new(vec![], TrustError::NoToken);
        assert_eq!(err.allowed_entities(), vec!["EVERYONE".to_string()]);
        assert_eq!(err.reason(), Some(UnauthorizedReason::NoToken));
        assert_eq!(err.to_string(), "no token found in request metadata");

        let err = AuthError::new(vec!["alice".into()], TrustError::NoToken);
        assert_eq!(err.allowed_entities(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_retryable() {
        assert!(TrustError::authority("down").is_retryable());
        assert!(!TrustError::NoToken.is_retryable());
    }
}
