//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::SigningKey;

use crate::authority::{
    CertificateAuthority, ClaimResolver, DerelictReply, DerelictSource, LocalDaemon,
    RecordLookup, Requester,
};
use crate::cert::{CertKeyPair, Certificate, CertificateSigningRequest};
use crate::claim::Claim;
use crate::error::{TrustError, TrustResult};
use crate::keys::AuthorityKeys;

/// Authority that signs everything it is asked for with one key.
pub struct FakeAuthority {
    pub key: SigningKey,
    pub keys: AuthorityKeys,
    pub resolve_calls: AtomicUsize,
    pub claim_calls: AtomicUsize,
    pub sign_calls: AtomicUsize,
    pub health_calls: AtomicUsize,
    pub derelict_calls: AtomicUsize,
    pub fail_claims: AtomicBool,
    pub fail_certs: AtomicBool,
    pub fail_health: AtomicBool,
    pub fail_derelicts: AtomicBool,
    pub ttl_secs: AtomicI64,
    derelicts: Mutex<DerelictReply>,
    launch_requests: Mutex<Vec<Option<String>>>,
}

impl FakeAuthority {
    pub fn new() -> Arc<Self> {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let keys = AuthorityKeys::pinned([key.verifying_key()]).unwrap();
        Arc::new(Self {
            key,
            keys,
            resolve_calls: AtomicUsize::new(0),
            claim_calls: AtomicUsize::new(0),
            sign_calls: AtomicUsize::new(0),
            health_calls: AtomicUsize::new(0),
            derelict_calls: AtomicUsize::new(0),
            fail_claims: AtomicBool::new(false),
            fail_certs: AtomicBool::new(false),
            fail_health: AtomicBool::new(false),
            fail_derelicts: AtomicBool::new(false),
            ttl_secs: AtomicI64::new(3600),
            derelicts: Mutex::new(DerelictReply::default()),
            launch_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requester(&self, entity: &str) -> Requester {
        Requester::new(entity, SigningKey::generate(&mut rand::thread_rng()))
    }

    /// Signed claim valid from now for `ttl_secs`.
    pub fn issue(&self, entity: &str, claims: &[&str], destination: &str, ttl_secs: i64) -> Claim {
        let mut claim = Claim::new(
            entity,
            claims.iter().map(|c| c.to_string()).collect(),
            destination,
            Utc::now().timestamp(),
            ttl_secs,
        );
        claim.sign(&self.key).unwrap();
        claim
    }

    pub fn set_derelicts(&self, reply: DerelictReply) {
        *self.derelicts.lock().unwrap() = reply;
    }

    pub fn last_launch_request(&self) -> Option<String> {
        self.launch_requests.lock().unwrap().last().cloned().flatten()
    }

    fn ttl(&self) -> i64 {
        self.ttl_secs.load(Ordering::SeqCst)
    }

    fn unavailable(flag: &AtomicBool, what: &str) -> TrustResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(TrustError::authority(format!("{} unavailable", what)));
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimResolver for FakeAuthority {
    async fn resolve(&self, requester: &Requester, requested_entity: &str) -> TrustResult<Claim> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Self::unavailable(&self.fail_claims, "resolve")?;
        Ok(self.issue(
            &requester.entity_name,
            &["EVERYONE", &requester.entity_name],
            requested_entity,
            self.ttl(),
        ))
    }

    async fn claim_request(
        &self,
        requester: &Requester,
        claim: &str,
        destination: &str,
    ) -> TrustResult<Claim> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        Self::unavailable(&self.fail_claims, "claim")?;
        Ok(self.issue(&requester.entity_name, &[claim], destination, self.ttl()))
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    fn endpoint(&self) -> &str {
        "fake://authority"
    }

    async fn certificate_sign(&self, csr: &CertificateSigningRequest) -> TrustResult<Certificate> {
        self.sign_calls.fetch_add(1, Ordering::SeqCst);
        Self::unavailable(&self.fail_certs, "certificate")?;
        csr.verify()?;
        self.launch_requests
            .lock()
            .unwrap()
            .push(csr.launch_request.clone());

        let mut cert = csr.certificate.clone();
        cert.sign(&self.key)?;
        Ok(cert)
    }

    async fn health_check(&self) -> TrustResult<()> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        Self::unavailable(&self.fail_health, "health")
    }
}

#[async_trait]
impl DerelictSource for FakeAuthority {
    async fn fetch_derelicts(&self, _requester: &Requester) -> TrustResult<DerelictReply> {
        self.derelict_calls.fetch_add(1, Ordering::SeqCst);
        Self::unavailable(&self.fail_derelicts, "derelicts")?;
        Ok(self.derelicts.lock().unwrap().clone())
    }
}

/// Local daemon that always has a fresh certificate from `authority`.
pub struct FakeDaemon {
    authority: Arc<FakeAuthority>,
    pub calls: AtomicUsize,
    /// Hand back an unsigned certificate that expired long ago.
    pub unsigned: AtomicBool,
}

impl FakeDaemon {
    pub fn new(authority: Arc<FakeAuthority>) -> Arc<Self> {
        Arc::new(Self {
            authority,
            calls: AtomicUsize::new(0),
            unsigned: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl LocalDaemon for FakeDaemon {
    async fn refresh(&self, current: &CertKeyPair) -> TrustResult<CertKeyPair> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let old = &current.certificate;
        let (mut cert, key) =
            Certificate::generate(&old.entity_name, old.entity_type, &old.host, old.tags.clone())?;
        if self.unsigned.load(Ordering::SeqCst) {
            cert.valid_after = 0;
            cert.valid_before = 10;
        } else {
            cert.sign(&self.authority.key)?;
        }
        Ok(CertKeyPair::new(cert, key))
    }
}

/// Record store keyed by record name.
#[derive(Default)]
pub struct FakeRecords {
    records: Mutex<HashMap<String, Vec<String>>>,
    pub fail: AtomicBool,
}

impl FakeRecords {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, name: &str, values: Vec<String>) {
        self.records.lock().unwrap().insert(name.to_string(), values);
    }

    pub fn remove(&self, name: &str) {
        self.records.lock().unwrap().remove(name);
    }
}

#[async_trait]
impl RecordLookup for FakeRecords {
    async fn lookup_txt(&self, name: &str) -> TrustResult<Vec<String>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TrustError::Io {
                message: "lookup failed".to_string(),
            });
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Poll `condition` until it holds, yielding to spawned tasks in between.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
