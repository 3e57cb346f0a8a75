//! The trust client.
//!
//! [`TrustClient`] owns one service's view of the trust system: its
//! identity and certificate, the outbound claim cache, inbound checks, the
//! derelict list and the global disable switch. Background tasks run until
//! [`TrustClient::close`] is called or the client is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::authority::{
    CertificateAuthority, ClaimResolver, DerelictSource, HttpAuthority, LocalDaemon,
    RecordLookup, Requester,
};
use crate::backoff::SkipList;
use crate::cache::ClaimCache;
use crate::cert::{CertKeyPair, Certificate};
use crate::config::TrustConfig;
use crate::derelict::{DerelictList, DerelictRefresher};
use crate::disable::{DisableFlag, DisableMonitor};
use crate::enforcement::Enforcement;
use crate::error::{AuthError, TrustError, TrustResult};
use crate::identity::{renew_certificate, Identity};
use crate::inbound::{InboundAuthenticator, InboundDecision, ValidationOption};
use crate::keys::AuthorityKeys;
use crate::metadata::Metadata;
use crate::outbound::OutboundAuthenticator;
use crate::registry::{CertificateHandle, CertificateRegistry, RefreshContext};

/// External services the client talks to.
pub struct Collaborators {
    pub claims: Arc<dyn ClaimResolver>,
    pub certificates: Arc<dyn CertificateAuthority>,
    pub derelicts: Arc<dyn DerelictSource>,
    pub records: Arc<dyn RecordLookup>,
    pub daemon: Option<Arc<dyn LocalDaemon>>,
    /// Shared registry; a private one is created when unset.
    pub registry: Option<CertificateRegistry>,
}

impl Collaborators {
    /// Use one authority for claims, certificates and derelicts.
    pub fn new<A>(authority: Arc<A>, records: Arc<dyn RecordLookup>) -> Self
    where
        A: ClaimResolver + CertificateAuthority + DerelictSource + 'static,
    {
        Self {
            claims: authority.clone(),
            certificates: authority.clone(),
            derelicts: authority,
            records,
            daemon: None,
            registry: None,
        }
    }

    /// HTTP authority at `config.authority_url`.
    pub fn http(config: &TrustConfig, records: Arc<dyn RecordLookup>) -> TrustResult<Self> {
        Ok(Self::new(Arc::new(HttpAuthority::from_config(config)?), records))
    }

    pub fn with_daemon(mut self, daemon: Arc<dyn LocalDaemon>) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn with_registry(mut self, registry: CertificateRegistry) -> Self {
        self.registry = Some(registry);
        self
    }
}

#[derive(Debug)]
enum ActiveIdentity {
    Registered(CertificateHandle),
    Static(SigningKey),
}

/// Builds requesters from whatever the identity currently holds.
#[derive(Clone)]
struct Requesters {
    service_name: String,
    implicit_claims: Vec<String>,
    identity: Arc<ActiveIdentity>,
}

impl Requesters {
    fn current(&self) -> Requester {
        let requester = match self.identity.as_ref() {
            ActiveIdentity::Registered(handle) => {
                let pair = handle.current();
                Requester::new(&self.service_name, pair.key).with_certificate(pair.certificate)
            }
            ActiveIdentity::Static(key) => Requester::new(&self.service_name, key.clone()),
        };
        requester.with_implicit_claims(self.implicit_claims.clone())
    }
}

/// Retries the certificate upgrade after the library comes back from a
/// global disable.
#[derive(Clone)]
struct Recovery {
    certificates: Arc<dyn CertificateAuthority>,
    keys: AuthorityKeys,
    identity: Arc<ActiveIdentity>,
    registry: CertificateRegistry,
    timeout: Duration,
    retry: Duration,
    running: Arc<AtomicBool>,
}

impl Recovery {
    async fn attempt(&self) -> TrustResult<()> {
        tokio::time::timeout(self.timeout, self.certificates.health_check())
            .await
            .map_err(|_| TrustError::authority("health check timed out"))??;

        if let ActiveIdentity::Registered(handle) = self.identity.as_ref() {
            let current = handle.current();
            if current.certificate.is_cert_granting() {
                let pair = tokio::time::timeout(
                    self.timeout,
                    renew_certificate(self.certificates.as_ref(), &self.keys, &current),
                )
                .await
                .map_err(|_| TrustError::authority("certificate upgrade timed out"))??;
                self.registry.update(handle, pair).await?;
            }
        }
        Ok(())
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.attempt().await {
                Ok(()) => {
                    info!("recovered after global disable");
                    break;
                }
                Err(e) => warn!(error = %e, "recovery after global disable failed, retrying"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry) => {}
                _ = shutdown.changed() => break,
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Start one recovery task per re-enable, never two at once.
    async fn watch(self, signal: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = signal.notified() => {}
                _ = shutdown.changed() => break,
            }
            if self.running.swap(true, Ordering::SeqCst) {
                debug!("recovery already in progress");
                continue;
            }
            tokio::spawn(self.clone().run(shutdown.clone()));
        }
    }
}

/// A service's handle on the trust system.
///
/// Call [`TrustClient::close`] when done: dropping the client stops its
/// background tasks but leaves its certificate registered.
pub struct TrustClient {
    config: TrustConfig,
    requesters: Requesters,
    registry: CertificateRegistry,
    outbound: OutboundAuthenticator,
    inbound: InboundAuthenticator,
    enforcement: Arc<Enforcement>,
    flag: DisableFlag,
    monitor: Option<Arc<DisableMonitor>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TrustClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustClient")
            .field("service_name", &self.config.service_name)
            .field("disabled", &self.flag.is_disabled())
            .field("enforce_percentage", &self.enforcement.percentage())
            .finish_non_exhaustive()
    }
}

impl TrustClient {
    /// Build a client and start its background tasks.
    ///
    /// Fails on invalid configuration, missing authority keys, or when a
    /// cert-granting certificate cannot be upgraded while enforcement is on.
    pub async fn new(
        config: TrustConfig,
        identity: Identity,
        keys: AuthorityKeys,
        collaborators: Collaborators,
    ) -> TrustResult<Self> {
        config.validate()?;
        if keys.is_empty() {
            return Err(TrustError::config("at least one authority key is required"));
        }
        if !identity.entity_name().eq_ignore_ascii_case(&config.service_name) {
            warn!(
                entity = %config.service_name,
                identity = %identity.entity_name(),
                "identity name differs from service name"
            );
        }

        let Collaborators {
            claims,
            certificates,
            derelicts: derelict_source,
            records,
            daemon,
            registry,
        } = collaborators;
        let registry =
            registry.unwrap_or_else(|| CertificateRegistry::new(config.timings.cert_refresh()));
        let timeout = config.request_timeout();

        let flag = DisableFlag::new(config.disabled);
        let monitor = if config.disabled {
            warn!(entity = %config.service_name, "configured disabled, authentication is fail-open");
            None
        } else {
            let monitor = Arc::new(DisableMonitor::new(
                keys.clone(),
                records,
                config.disable_record_domain.clone(),
                flag.clone(),
            )?);
            monitor.force_check().await;
            Some(monitor)
        };

        let identity = match identity {
            Identity::Certificate(pair) => {
                let pair =
                    upgrade_if_cert_granting(pair, certificates.as_ref(), &keys, timeout, &flag)
                        .await?;
                let ctx = RefreshContext {
                    authority: certificates.clone(),
                    keys: keys.clone(),
                    daemon,
                };
                ActiveIdentity::Registered(registry.register(pair, ctx).await)
            }
            Identity::Static { key, .. } => ActiveIdentity::Static(key),
        };
        let requesters = Requesters {
            service_name: config.service_name.clone(),
            implicit_claims: config.implicit_claims.clone(),
            identity: Arc::new(identity),
        };

        let enforcement = Arc::new(Enforcement::new(config.normalized_enforce_percentage()));
        let derelicts = Arc::new(DerelictList::new(config.timings.derelict_refresh()));
        let skips = Arc::new(SkipList::new());

        let outbound = OutboundAuthenticator::new(
            ClaimCache::new(claims, keys.clone(), skips.clone(), timeout),
            skips,
            flag.clone(),
        );
        let inbound = InboundAuthenticator::new(
            &config,
            keys.clone(),
            enforcement.clone(),
            derelicts.clone(),
            flag.clone(),
        );

        let (shutdown, _) = watch::channel(false);

        let refresher = DerelictRefresher::new(derelicts, derelict_source, flag.clone(), timeout);
        let source = requesters.clone();
        tokio::spawn(refresher.run(move || source.current(), shutdown.subscribe()));

        if let Some(monitor) = &monitor {
            let recovery = Recovery {
                certificates,
                keys,
                identity: requesters.identity.clone(),
                registry: registry.clone(),
                timeout,
                retry: config.timings.recovery_retry(),
                running: Arc::new(AtomicBool::new(false)),
            };
            tokio::spawn(recovery.watch(monitor.recovery_signal(), shutdown.subscribe()));
            tokio::spawn(
                monitor
                    .clone()
                    .run(config.timings.disable_check(), shutdown.subscribe()),
            );
        }

        info!(
            entity = %config.service_name,
            disabled = flag.is_disabled(),
            enforce_percentage = enforcement.percentage(),
            "trust client started"
        );

        Ok(Self {
            config,
            requesters,
            registry,
            outbound,
            inbound,
            enforcement,
            flag,
            monitor,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Requester for calls made right now.
    pub fn requester(&self) -> Requester {
        self.requesters.current()
    }

    /// The certificate in use, if the identity is certificate based.
    pub fn current_certificate(&self) -> Option<Certificate> {
        match self.requesters.identity.as_ref() {
            ActiveIdentity::Registered(handle) => Some(handle.current().certificate),
            ActiveIdentity::Static(_) => None,
        }
    }

    pub fn current_pair(&self) -> Option<CertKeyPair> {
        match self.requesters.identity.as_ref() {
            ActiveIdentity::Registered(handle) => Some(handle.current()),
            ActiveIdentity::Static(_) => None,
        }
    }

    /// See [`OutboundAuthenticator::authenticate_out`].
    pub async fn authenticate_out(
        &self,
        metadata: Metadata,
        destination: &str,
        explicit_claim: Option<&str>,
    ) -> Metadata {
        self.outbound
            .authenticate_out(&self.requester(), metadata, destination, explicit_claim)
            .await
    }

    /// See [`OutboundAuthenticator::get_credential`].
    pub async fn get_credential(
        &self,
        destination: &str,
        explicit_claim: Option<&str>,
    ) -> TrustResult<String> {
        self.outbound
            .get_credential(&self.requester(), destination, explicit_claim)
            .await
    }

    pub fn authenticate_in(
        &self,
        metadata: &mut Metadata,
        options: &[ValidationOption],
    ) -> Result<(), AuthError> {
        self.inbound.authenticate_in(metadata, options)
    }

    pub fn validate_credential(
        &self,
        token: &str,
        options: &[ValidationOption],
    ) -> Result<(), AuthError> {
        self.inbound.validate_credential(token, options)
    }

    /// Full inbound decision, without the disable short-circuit.
    pub fn evaluate(&self, token: Option<&str>, options: &[ValidationOption]) -> InboundDecision {
        self.inbound.evaluate(token, options)
    }

    pub fn enforce_percentage(&self) -> f64 {
        self.enforcement.percentage()
    }

    pub fn set_enforcement_percentage(&self, percentage: f64) -> TrustResult<()> {
        self.enforcement.set(percentage)
    }

    pub fn is_disabled(&self) -> bool {
        self.flag.is_disabled()
    }

    /// Check disable records now instead of waiting for the next period.
    /// Has no effect when configured disabled.
    pub async fn force_disable_check(&self) -> bool {
        match &self.monitor {
            Some(monitor) => monitor.force_check().await,
            None => self.flag.is_disabled(),
        }
    }

    /// Stop background tasks and release the certificate registration.
    /// Later calls do nothing.
    pub async fn close(&self) -> TrustResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(true);
        if let ActiveIdentity::Registered(handle) = self.requesters.identity.as_ref() {
            self.registry.unregister(handle).await?;
        }
        info!(entity = %self.config.service_name, "trust client closed");
        Ok(())
    }
}

async fn upgrade_if_cert_granting(
    pair: CertKeyPair,
    authority: &dyn CertificateAuthority,
    keys: &AuthorityKeys,
    timeout: Duration,
    flag: &DisableFlag,
) -> TrustResult<CertKeyPair> {
    if !pair.certificate.is_cert_granting() {
        return Ok(pair);
    }

    let upgraded = tokio::time::timeout(timeout, renew_certificate(authority, keys, &pair))
        .await
        .unwrap_or_else(|_| Err(TrustError::authority("certificate upgrade timed out")));
    match upgraded {
        Ok(upgraded) => {
            info!(entity = %upgraded.certificate.entity_name, "exchanged cert-granting certificate");
            Ok(upgraded)
        }
        Err(e) if flag.is_disabled() => {
            warn!(error = %e, "cert-granting upgrade failed while disabled, retrying on recovery");
            Ok(pair)
        }
        Err(e) => Err(e),
    }
}
