//! Request metadata carried alongside an RPC.
//!
//! Transports copy their headers in and out of [`Metadata`]; keys are
//! case-insensitive.

use std::collections::BTreeMap;

/// Metadata key carrying the marshalled claim.
pub const CLAIM_METADATA_KEY: &str = "x-tessera-claim";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
    claim_request: Option<String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(&key.to_ascii_lowercase())
    }

    pub fn token(&self) -> Option<&str> {
        self.get(CLAIM_METADATA_KEY)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.insert(CLAIM_METADATA_KEY, token);
        self
    }

    /// Remove and return the token; claims are not forwarded past one hop.
    pub fn take_token(&mut self) -> Option<String> {
        self.remove(CLAIM_METADATA_KEY)
    }

    /// Claim to request for outbound calls made with this metadata, unless
    /// the call names one explicitly. Never sent on the wire.
    pub fn claim_request(&self) -> Option<&str> {
        self.claim_request.as_deref()
    }

    pub fn with_claim_request(mut self, claim: impl Into<String>) -> Self {
        self.claim_request = Some(claim.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Self::new();
        for (k, v) in iter {
            metadata.insert(k.as_ref(), v);
        }
        metadata
    }
}
