//! End-to-end tests for TrustClient against an in-memory authority.
//!
//! Two services, alice and bob, authenticate to each other through the
//! public API only. Covers claim caching, inbound allow/deny, aliases and
//! the global disable switch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use tessera_trust::disable::record_name;
use tessera_trust::{
    AuthorityKeys, CertificateAuthority, Certificate, CertificateSigningRequest, Claim,
    ClaimResolver, Collaborators, DerelictReply, DerelictSource, DisableMessage, Identity,
    Metadata, RecordLookup, Requester, TrustClient, TrustConfig, TrustError, TrustResult,
    UnauthorizedReason, ValidationOption,
};

const DOMAIN: &str = "disable.example";

struct InMemoryAuthority {
    key: SigningKey,
    resolves: AtomicUsize,
}

impl InMemoryAuthority {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            key: SigningKey::generate(&mut rand::thread_rng()),
            resolves: AtomicUsize::new(0),
        })
    }

    fn keys(&self) -> AuthorityKeys {
        AuthorityKeys::pinned([self.key.verifying_key()]).unwrap()
    }

    fn issue(&self, entity: &str, claims: Vec<String>, destination: &str) -> TrustResult<Claim> {
        let mut claim = Claim::new(entity, claims, destination, Utc::now().timestamp(), 3600);
        claim.sign(&self.key)?;
        Ok(claim)
    }
}

#[async_trait]
impl ClaimResolver for InMemoryAuthority {
    async fn resolve(&self, requester: &Requester, requested_entity: &str) -> TrustResult<Claim> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let mut claims = vec![requester.entity_name.clone()];
        claims.extend(requester.implicit_claims.iter().cloned());
        self.issue(&requester.entity_name, claims, requested_entity)
    }

    async fn claim_request(
        &self,
        requester: &Requester,
        claim: &str,
        destination: &str,
    ) -> TrustResult<Claim> {
        self.issue(&requester.entity_name, vec![claim.to_string()], destination)
    }
}

#[async_trait]
impl CertificateAuthority for InMemoryAuthority {
    fn endpoint(&self) -> &str {
        "memory://authority"
    }

    async fn certificate_sign(&self, csr: &CertificateSigningRequest) -> TrustResult<Certificate> {
        csr.verify()?;
        let mut cert = csr.certificate.clone();
        cert.sign(&self.key)?;
        Ok(cert)
    }

    async fn health_check(&self) -> TrustResult<()> {
        Ok(())
    }
}

#[async_trait]
impl DerelictSource for InMemoryAuthority {
    async fn fetch_derelicts(&self, _requester: &Requester) -> TrustResult<DerelictReply> {
        Ok(DerelictReply::default())
    }
}

#[derive(Default)]
struct Records(Mutex<HashMap<String, Vec<String>>>);

#[async_trait]
impl RecordLookup for Records {
    async fn lookup_txt(&self, name: &str) -> TrustResult<Vec<String>> {
        Ok(self.0.lock().unwrap().get(name).cloned().unwrap_or_default())
    }
}

struct World {
    authority: Arc<InMemoryAuthority>,
    records: Arc<Records>,
}

impl World {
    fn new() -> Self {
        Self {
            authority: InMemoryAuthority::new(),
            records: Arc::new(Records::default()),
        }
    }

    async fn client(&self, config: TrustConfig) -> TrustClient {
        let mut config = config;
        config.disable_record_domain = DOMAIN.to_string();
        let identity = Identity::Static {
            entity_name: config.service_name.clone(),
            key: SigningKey::generate(&mut rand::thread_rng()),
        };
        let collaborators = Collaborators::new(self.authority.clone(), self.records.clone());
        TrustClient::new(config, identity, self.authority.keys(), collaborators)
            .await
            .expect("client failed to start")
    }

    fn publish_disable(&self) {
        let now = Utc::now().timestamp();
        let mut message = DisableMessage::new(now - 5, now + 600);
        message.sign(&self.authority.key).unwrap();
        let name = record_name(&self.authority.key.verifying_key(), DOMAIN).unwrap();
        self.records
            .0
            .lock()
            .unwrap()
            .insert(name, vec![message.encode().unwrap()]);
    }

    fn withdraw_disable(&self) {
        self.records.0.lock().unwrap().clear();
    }
}

fn allow(entities: &[&str]) -> [ValidationOption; 1] {
    [ValidationOption::AllowedEntities(
        entities.iter().map(|e| e.to_string()).collect(),
    )]
}

#[tokio::test]
async fn test_alice_calls_bob() {
    let world = World::new();
    let alice = world.client(TrustConfig::new("alice")).await;
    let bob = world
        .client(TrustConfig::new("bob").with_enforce_percentage(1.0))
        .await;

    let mut md = alice.authenticate_out(Metadata::new(), "bob", None).await;
    assert!(md.token().is_some());
    bob.authenticate_in(&mut md, &allow(&["alice"]))
        .expect("alice should be allowed");
    assert!(md.token().is_none(), "token must not be forwarded");

    // second call is served from the claim cache
    let mut md = alice.authenticate_out(Metadata::new(), "bob", None).await;
    assert_eq!(world.authority.resolves.load(Ordering::SeqCst), 1);

    let err = bob
        .authenticate_in(&mut md, &allow(&["carol"]))
        .unwrap_err();
    assert_eq!(err.reason(), Some(UnauthorizedReason::NoCommonClaims));
    assert_eq!(err.allowed_entities(), vec!["carol".to_string()]);

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_claim_for_another_service_rejected() {
    let world = World::new();
    let alice = world.client(TrustConfig::new("alice")).await;
    let bob = world
        .client(TrustConfig::new("bob").with_enforce_percentage(1.0))
        .await;

    let token = alice.get_credential("carol", None).await.unwrap();
    let err = bob.validate_credential(&token, &[]).unwrap_err();
    assert!(matches!(err.cause(), TrustError::WrongDestination { .. }));

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_aliases_accept_canary_destination() {
    let world = World::new();
    let alice = world.client(TrustConfig::new("alice")).await;
    let bob = world
        .client(
            TrustConfig::new("bob")
                .with_aliases(vec!["bob".into(), "bob-canary".into()])
                .with_enforce_percentage(1.0),
        )
        .await;

    let token = alice.get_credential("bob-canary", None).await.unwrap();
    bob.validate_credential(&token, &allow(&["alice"])).unwrap();

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_unenforced_failures_pass() {
    let world = World::new();
    let bob = world.client(TrustConfig::new("bob")).await;

    let mut md = Metadata::new();
    bob.authenticate_in(&mut md, &allow(&["alice"]))
        .expect("zero enforcement lets requests through");

    bob.close().await.unwrap();
}

#[tokio::test]
async fn test_global_disable_round_trip() {
    let world = World::new();
    let alice = world.client(TrustConfig::new("alice")).await;
    let bob = world
        .client(TrustConfig::new("bob").with_enforce_percentage(1.0))
        .await;

    world.publish_disable();
    assert!(alice.force_disable_check().await);
    assert!(bob.force_disable_check().await);

    let mut md = alice.authenticate_out(Metadata::new(), "bob", None).await;
    assert!(md.token().is_none());
    bob.authenticate_in(&mut md, &allow(&["alice"]))
        .expect("disabled clients are fail-open");
    assert_eq!(world.authority.resolves.load(Ordering::SeqCst), 0);

    world.withdraw_disable();
    assert!(!alice.force_disable_check().await);
    assert!(!bob.force_disable_check().await);

    let mut md = Metadata::new();
    assert!(bob.authenticate_in(&mut md, &allow(&["alice"])).is_err());

    alice.close().await.unwrap();
    bob.close().await.unwrap();
}
