//! Wire-format helpers shared by claims, certificates and disable messages.
//!
//! Binary fields travel as standard base64 strings inside JSON, and whole
//! tokens travel as base64 of their JSON form.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{TrustError, TrustResult};

/// Serialize `value` as JSON and wrap it in base64.
pub(crate) fn encode_token<T: Serialize>(value: &T) -> TrustResult<String> {
    let json = serde_json::to_vec(value)?;
    Ok(BASE64.encode(json))
}

/// Reverse of [`encode_token`]. Both the base64 and JSON layers report
/// [`TrustError::MalformedToken`].
pub(crate) fn decode_token<T: DeserializeOwned>(token: &str) -> TrustResult<T> {
    let bytes = BASE64
        .decode(token.trim())
        .map_err(|e| TrustError::MalformedToken {
            message: format!("invalid base64: {}", e),
        })?;

    serde_json::from_slice(&bytes).map_err(|e| TrustError::MalformedToken {
        message: format!("invalid JSON: {}", e),
    })
}

/// Canonical (JCS) JSON bytes used as signing payloads.
pub(crate) fn canonical_bytes<T: Serialize>(value: &T) -> TrustResult<Vec<u8>> {
    serde_jcs::to_vec(value).map_err(|e| TrustError::Encoding {
        message: format!("failed to canonicalize: {}", e),
    })
}

/// `#[serde(with = "crate::wire::base64_bytes")]` for `Vec<u8>` fields.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
