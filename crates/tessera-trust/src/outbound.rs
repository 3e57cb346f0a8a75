//! Outbound authentication: attach a claim to requests we send.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::authority::Requester;
use crate::backoff::SkipList;
use crate::cache::ClaimCache;
use crate::disable::DisableFlag;
use crate::error::{TrustError, TrustResult};
use crate::metadata::Metadata;

#[derive(Debug)]
pub struct OutboundAuthenticator {
    cache: ClaimCache,
    skips: Arc<SkipList>,
    flag: DisableFlag,
}

impl OutboundAuthenticator {
    pub fn new(cache: ClaimCache, skips: Arc<SkipList>, flag: DisableFlag) -> Self {
        Self { cache, skips, flag }
    }

    /// Attach a claim for `destination` to `metadata`.
    ///
    /// Never fails: when no claim can be obtained the metadata goes out
    /// unchanged and the receiver decides. `explicit_claim` takes precedence
    /// over a claim request carried in the metadata.
    pub async fn authenticate_out(
        &self,
        requester: &Requester,
        metadata: Metadata,
        destination: &str,
        explicit_claim: Option<&str>,
    ) -> Metadata {
        if self.flag.is_disabled() {
            debug!(destination = %destination, "globally disabled, sending without claim");
            return metadata;
        }
        if destination.is_empty() {
            warn!("no destination given, sending without claim");
            return metadata;
        }
        if self.skips.should_skip(destination) {
            debug!(destination = %destination, "destination in backoff, sending without claim");
            return metadata;
        }

        let explicit_claim = explicit_claim
            .filter(|c| !c.is_empty())
            .or_else(|| metadata.claim_request())
            .map(str::to_string);

        let token = self
            .cache
            .resolve(requester, destination, explicit_claim.as_deref())
            .await
            .and_then(|claim| claim.marshal());
        match token {
            Ok(token) => metadata.with_token(token),
            Err(e) => {
                warn!(
                    destination = %destination,
                    error = %e,
                    "failed to obtain claim, sending without one"
                );
                metadata
            }
        }
    }

    /// Marshalled claim for `destination`.
    ///
    /// Returns an empty string while globally disabled, and
    /// [`TrustError::DestinationSkipped`] while the destination is in
    /// backoff.
    pub async fn get_credential(
        &self,
        requester: &Requester,
        destination: &str,
        explicit_claim: Option<&str>,
    ) -> TrustResult<String> {
        if self.flag.is_disabled() {
            return Ok(String::new());
        }
        if self.skips.should_skip(destination) {
            return Err(TrustError::DestinationSkipped {
                destination: destination.to_string(),
            });
        }
        self.cache
            .resolve(requester, destination, explicit_claim)
            .await?
            .marshal()
    }

    pub fn cache(&self) -> &ClaimCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::Claim;
    use crate::metadata::CLAIM_METADATA_KEY;
    use crate::test_support::FakeAuthority;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn outbound(authority: &Arc<FakeAuthority>, flag: DisableFlag) -> OutboundAuthenticator {
        let skips = Arc::new(SkipList::new());
        let cache = ClaimCache::new(
            authority.clone(),
            authority.keys.clone(),
            skips.clone(),
            Duration::from_secs(5),
        );
        OutboundAuthenticator::new(cache, skips, flag)
    }

    #[tokio::test]
    async fn test_attaches_claim() {
        let authority = FakeAuthority::new();
        let out = outbound(&authority, DisableFlag::default());
        let alice = authority.requester("alice");

        let md = out
            .authenticate_out(&alice, Metadata::new(), "bob", None)
            .await;
        let claim = Claim::unmarshal(md.get(CLAIM_METADATA_KEY).unwrap()).unwrap();
        assert_eq!(claim.destination, "bob");
        claim.validate(&authority.keys).unwrap();

        out.authenticate_out(&alice, Metadata::new(), "bob", None)
            .await;
        assert_eq!(authority.resolve_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_claim_request_from_metadata() {
        let authority = FakeAuthority::new();
        let out = outbound(&authority, DisableFlag::default());
        let alice = authority.requester("alice");

        let md = Metadata::new().with_claim_request("admins");
        let md = out.authenticate_out(&alice, md, "bob", None).await;
        let claim = Claim::unmarshal(md.token().unwrap()).unwrap();
        assert_eq!(claim.claims, vec!["admins".to_string()]);

        let md = Metadata::new().with_claim_request("admins");
        let md = out.authenticate_out(&alice, md, "carol", Some("ops")).await;
        let claim = Claim::unmarshal(md.token().unwrap()).unwrap();
        assert_eq!(claim.claims, vec!["ops".to_string()]);
    }

    #[tokio::test]
    async fn test_failure_passes_metadata_through_and_skips() {
        let authority = FakeAuthority::new();
        authority.fail_claims.store(true, Ordering::SeqCst);
        let out = outbound(&authority, DisableFlag::default());
        let alice = authority.requester("alice");

        let md = Metadata::new().with_token("stale");
        let md = out.authenticate_out(&alice, md.clone(), "bob", None).await;
        assert_eq!(md.token(), Some("stale"));

        // the skip entry keeps the second call away from the authority
        out.authenticate_out(&alice, Metadata::new(), "bob", None)
            .await;
        assert_eq!(authority.resolve_calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            out.get_credential(&alice, "bob", None).await,
            Err(TrustError::DestinationSkipped { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_and_empty_destination_are_noops() {
        let authority = FakeAuthority::new();
        let flag = DisableFlag::new(true);
        let out = outbound(&authority, flag.clone());
        let alice = authority.requester("alice");

        let md = out
            .authenticate_out(&alice, Metadata::new(), "bob", None)
            .await;
        assert!(md.token().is_none());
        assert_eq!(out.get_credential(&alice, "bob", None).await.unwrap(), "");

        flag.set(false);
        let md = out.authenticate_out(&alice, Metadata::new(), "", None).await;
        assert!(md.token().is_none());
        assert_eq!(authority.resolve_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_credential() {
        let authority = FakeAuthority::new();
        let out = outbound(&authority, DisableFlag::default());
        let alice = authority.requester("alice");

        let token = out.get_credential(&alice, "bob", None).await.unwrap();
        assert_eq!(Claim::unmarshal(&token).unwrap().destination, "bob");
        assert_eq!(out.cache().len(), 1);
    }
}
