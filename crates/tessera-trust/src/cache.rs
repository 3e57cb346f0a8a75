//! Outbound claim cache and resolver.
//!
//! One claim is cached per destination. A cached claim is reused while it
//! still validates, is more than [`CLAIM_EXPIRY_BUFFER_SECS`] away from
//! expiry and, when the caller asks for a specific claim, carries it.
//! Anything else goes to the credential authority. The map lock is never
//! held across the authority call, so concurrent misses for one destination
//! may each fetch; the last write wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::authority::{ClaimResolver, Requester};
use crate::backoff::SkipList;
use crate::claim::{Claim, CLAIM_EXPIRY_BUFFER_SECS};
use crate::error::{TrustError, TrustResult};
use crate::keys::AuthorityKeys;

pub struct ClaimCache {
    authority: Arc<dyn ClaimResolver>,
    keys: AuthorityKeys,
    skips: Arc<SkipList>,
    entries: Mutex<HashMap<String, Claim>>,
    timeout: Duration,
}

impl std::fmt::Debug for ClaimCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimCache")
            .field("entries", &self.lock().len())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ClaimCache {
    pub fn new(
        authority: Arc<dyn ClaimResolver>,
        keys: AuthorityKeys,
        skips: Arc<SkipList>,
        timeout: Duration,
    ) -> Self {
        Self {
            authority,
            keys,
            skips,
            entries: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Return a usable claim for `destination`, fetching one if needed.
    ///
    /// A non-empty `explicit_claim` asks the authority for that claim string
    /// instead of resolving the destination. Failures are recorded in the
    /// skip list and returned; the cache is left as it was.
    pub async fn resolve(
        &self,
        requester: &Requester,
        destination: &str,
        explicit_claim: Option<&str>,
    ) -> TrustResult<Claim> {
        if destination.is_empty() {
            return Err(TrustError::config("destination is required"));
        }
        let explicit_claim = explicit_claim.filter(|c| !c.is_empty());

        {
            let mut entries = self.lock();
            if let Some(cached) = entries.get(destination) {
                if self.is_usable(cached, destination, explicit_claim, Utc::now().timestamp()) {
                    debug!(destination = %destination, "using cached claim");
                    return Ok(cached.clone());
                }
                entries.remove(destination);
            }
        }

        match self.fetch(requester, destination, explicit_claim).await {
            Ok(claim) => {
                self.lock().insert(destination.to_string(), claim.clone());
                Ok(claim)
            }
            Err(e) => {
                self.skips.record_failure(destination);
                Err(e)
            }
        }
    }

    async fn fetch(
        &self,
        requester: &Requester,
        destination: &str,
        explicit_claim: Option<&str>,
    ) -> TrustResult<Claim> {
        let call = async {
            match explicit_claim {
                Some(claim) => {
                    self.authority
                        .claim_request(requester, claim, destination)
                        .await
                }
                // resolve is for third parties; ask for our own name instead
                None if destination.eq_ignore_ascii_case(&requester.entity_name) => {
                    self.authority
                        .claim_request(requester, destination, destination)
                        .await
                }
                None => self.authority.resolve(requester, destination).await,
            }
        };

        debug!(
            destination = %destination,
            explicit_claim = ?explicit_claim,
            "requesting claim from authority"
        );
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                TrustError::authority(format!("claim request for {} timed out", destination))
            })?
    }

    pub fn is_usable(
        &self,
        claim: &Claim,
        destination: &str,
        explicit_claim: Option<&str>,
        now: i64,
    ) -> bool {
        if !claim.destination.eq_ignore_ascii_case(destination) {
            return false;
        }
        if claim.validate_at(&self.keys, now).is_err() {
            return false;
        }
        if now + CLAIM_EXPIRY_BUFFER_SECS >= claim.valid_before {
            return false;
        }
        explicit_claim.map_or(true, |c| claim.has_claim(c))
    }

    pub fn cached(&self, destination: &str) -> Option<Claim> {
        self.lock().get(destination).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Claim>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeAuthority;
    use std::sync::atomic::Ordering;

    fn cache(authority: &Arc<FakeAuthority>) -> (ClaimCache, Arc<SkipList>) {
        let skips = Arc::new(SkipList::new());
        let cache = ClaimCache::new(
            authority.clone(),
            authority.keys.clone(),
            skips.clone(),
            Duration::from_secs(5),
        );
        (cache, skips)
    }

    #[tokio::test]
    async fn test_second_resolve_uses_cache() {
        let authority = FakeAuthority::new();
        let (cache, _) = cache(&authority);
        let alice = authority.requester("alice");

        let first = cache.resolve(&alice, "bob", None).await.unwrap();
        assert_eq!(first.claims, vec!["EVERYONE".to_string(), "alice".to_string()]);
        assert_eq!(first.destination, "bob");

        let second = cache.resolve(&alice, "bob", None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(authority.resolve_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_claim_must_be_present() {
        let authority = FakeAuthority::new();
        let (cache, _) = cache(&authority);
        let alice = authority.requester("alice");

        cache.resolve(&alice, "bob", None).await.unwrap();
        cache.resolve(&alice, "bob", Some("alice")).await.unwrap();
        assert_eq!(authority.claim_calls.load(Ordering::SeqCst), 0);

        let admin = cache.resolve(&alice, "bob", Some("admins")).await.unwrap();
        assert_eq!(admin.claims, vec!["admins".to_string()]);
        assert_eq!(authority.claim_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached("bob").unwrap(), admin);
    }

    #[tokio::test]
    async fn test_claim_near_expiry_is_refreshed() {
        let authority = FakeAuthority::new();
        let (cache, _) = cache(&authority);
        let alice = authority.requester("alice");

        authority
            .ttl_secs
            .store(CLAIM_EXPIRY_BUFFER_SECS, Ordering::SeqCst);
        let short = cache.resolve(&alice, "bob", None).await.unwrap();

        authority.ttl_secs.store(3600, Ordering::SeqCst);
        let fresh = cache.resolve(&alice, "bob", None).await.unwrap();

        assert_ne!(short, fresh);
        assert_eq!(authority.resolve_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_self_destination_requests_own_claim() {
        let authority = FakeAuthority::new();
        let (cache, _) = cache(&authority);
        let alice = authority.requester("alice");

        let claim = cache.resolve(&alice, "Alice", None).await.unwrap();
        assert_eq!(claim.claims, vec!["Alice".to_string()]);
        assert_eq!(authority.resolve_calls.load(Ordering::SeqCst), 0);
        assert_eq!(authority.claim_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_records_skip_and_keeps_cache() {
        let authority = FakeAuthority::new();
        let (cache, skips) = cache(&authority);
        let alice = authority.requester("alice");

        authority.fail_claims.store(true, Ordering::SeqCst);
        let err = cache.resolve(&alice, "bob", None).await.unwrap_err();
        assert!(matches!(err, TrustError::AuthorityUnavailable { .. }));
        assert!(skips.should_skip("bob"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_empty_destination_rejected() {
        let authority = FakeAuthority::new();
        let (cache, _) = cache(&authority);
        let alice = authority.requester("alice");
        assert!(matches!(
            cache.resolve(&alice, "", None).await,
            Err(TrustError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_badly_signed_cached_claim_not_reused() {
        let authority = FakeAuthority::new();
        let (cache, _) = cache(&authority);
        let now = Utc::now().timestamp();

        let mut forged = authority.issue("alice", &["alice"], "bob", 3600);
        forged.claims.push("admins".into());
        assert!(!cache.is_usable(&forged, "bob", None, now));
    }

    #[tokio::test]
    async fn test_claim_for_other_destination_not_reused() {
        let authority = FakeAuthority::new();
        let (cache, _) = cache(&authority);
        let now = Utc::now().timestamp();

        let claim = authority.issue("alice", &["alice"], "carol", 3600);
        assert!(cache.is_usable(&claim, "carol", None, now));
        assert!(cache.is_usable(&claim, "Carol", None, now));
        assert!(!cache.is_usable(&claim, "bob", None, now));
    }
}
