//! Shared certificate registry.
//!
//! Several clients in one process often run as the same identity against
//! the same authority. The registry keeps one entry per
//! `(entity, type, host, authority endpoint)` and runs exactly one refresh
//! task per entry, however many handles are registered. When the last
//! handle unregisters, the entry is removed and its task stops.
//!
//! Each handle keeps its own copy of the current pair behind its own lock,
//! so readers never wait on the registry map or on a refresh in progress.
//! New pairs are pushed to every handle while the map is locked for
//! writing, so concurrent updates land in the order they were made.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as SyncRwLock, Weak};
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::authority::{CertificateAuthority, LocalDaemon};
use crate::cert::{CertKeyPair, Certificate, EntityType};
use crate::config::Timings;
use crate::error::{TrustError, TrustResult};
use crate::identity::renew_certificate;
use crate::keys::AuthorityKeys;

/// Deadline for one authority refresh attempt.
pub const AUTHORITY_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub entity_name: String,
    pub entity_type: EntityType,
    pub host: String,
    pub endpoint: String,
}

impl RegistryKey {
    pub fn new(certificate: &Certificate, endpoint: &str) -> Self {
        Self {
            entity_name: certificate.entity_name.clone(),
            entity_type: certificate.entity_type,
            host: certificate.host.clone(),
            endpoint: endpoint.to_string(),
        }
    }
}

/// What a refresh task needs to renew a certificate.
#[derive(Clone)]
pub struct RefreshContext {
    pub authority: Arc<dyn CertificateAuthority>,
    pub keys: AuthorityKeys,
    pub daemon: Option<Arc<dyn LocalDaemon>>,
}

/// A consumer's registration. Read the current pair with
/// [`CertificateHandle::current`].
#[derive(Debug)]
pub struct CertificateHandle {
    id: u64,
    key: RegistryKey,
    current: Arc<SyncRwLock<CertKeyPair>>,
}

impl CertificateHandle {
    pub fn current(&self) -> CertKeyPair {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn key(&self) -> &RegistryKey {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Entry {
    /// Id of the handle that created the entry. A refresh task only touches
    /// the entry it was started for.
    generation: u64,
    current: CertKeyPair,
    handles: HashMap<u64, Arc<SyncRwLock<CertKeyPair>>>,
    /// Dropping the entry drops this sender, which stops its task.
    _stop: watch::Sender<bool>,
}

struct RegistryInner {
    entries: RwLock<HashMap<RegistryKey, Entry>>,
    next_id: AtomicU64,
    active_tasks: Arc<AtomicUsize>,
    refresh_period: Duration,
}

/// Deduplicating certificate registry. Cheap to clone.
#[derive(Clone)]
pub struct CertificateRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for CertificateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRegistry")
            .field("refresh_period", &self.inner.refresh_period)
            .field("active_tasks", &self.active_tasks())
            .finish_non_exhaustive()
    }
}

impl Default for CertificateRegistry {
    fn default() -> Self {
        Self::new(Timings::default().cert_refresh())
    }
}

impl CertificateRegistry {
    pub fn new(refresh_period: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                active_tasks: Arc::new(AtomicUsize::new(0)),
                refresh_period,
            }),
        }
    }

    /// Register `pair`, joining an existing entry for the same key.
    ///
    /// Must be called inside a tokio runtime when it creates a new entry.
    pub async fn register(&self, pair: CertKeyPair, ctx: RefreshContext) -> CertificateHandle {
        let key = RegistryKey::new(&pair.certificate, ctx.authority.endpoint());
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.inner.entries.write().await;

        if let Some(entry) = entries.get_mut(&key) {
            warn!(
                entity = %key.entity_name,
                host = %key.host,
                handles = entry.handles.len() + 1,
                "identity already registered, sharing its certificate"
            );
            let slot = Arc::new(SyncRwLock::new(entry.current.clone()));
            entry.handles.insert(id, slot.clone());
            return CertificateHandle {
                id,
                key,
                current: slot,
            };
        }

        let slot = Arc::new(SyncRwLock::new(pair.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);
        entries.insert(
            key.clone(),
            Entry {
                generation: id,
                current: pair,
                handles: HashMap::from([(id, slot.clone())]),
                _stop: stop_tx,
            },
        );

        let guard = TaskGuard::new(self.inner.active_tasks.clone());
        tokio::spawn(refresh_loop(
            Arc::downgrade(&self.inner),
            key.clone(),
            id,
            ctx,
            stop_rx,
            self.inner.refresh_period,
            guard,
        ));
        debug!(entity = %key.entity_name, host = %key.host, "started certificate refresh task");

        CertificateHandle {
            id,
            key,
            current: slot,
        }
    }

    /// Remove one handle. The last handle out tears the entry down.
    pub async fn unregister(&self, handle: &CertificateHandle) -> TrustResult<()> {
        let mut entries = self.inner.entries.write().await;

        let removed = entries
            .get_mut(&handle.key)
            .map(|entry| entry.handles.remove(&handle.id).is_some())
            .unwrap_or(false);
        if !removed {
            return Err(TrustError::Registry {
                message: "failed to unregister instance because it was not in the registry"
                    .to_string(),
            });
        }

        if entries
            .get(&handle.key)
            .is_some_and(|entry| entry.handles.is_empty())
        {
            entries.remove(&handle.key);
            debug!(entity = %handle.key.entity_name, "last handle unregistered, entry removed");
        }
        Ok(())
    }

    /// Install `pair` as the current pair for `handle`'s entry and push it
    /// to every handle sharing that entry.
    pub async fn update(&self, handle: &CertificateHandle, pair: CertKeyPair) -> TrustResult<()> {
        let updated = self
            .inner
            .update_entry(&handle.key, pair, |entry| entry.handles.contains_key(&handle.id))
            .await;
        if !updated {
            return Err(TrustError::Registry {
                message: "failed to update instance because it was not in the registry".to_string(),
            });
        }
        Ok(())
    }

    pub async fn handle_count(&self, key: &RegistryKey) -> usize {
        self.inner
            .entries
            .read()
            .await
            .get(key)
            .map_or(0, |entry| entry.handles.len())
    }

    pub async fn contains(&self, key: &RegistryKey) -> bool {
        self.inner.entries.read().await.contains_key(key)
    }

    /// Number of refresh tasks currently alive.
    pub fn active_tasks(&self) -> usize {
        self.inner.active_tasks.load(Ordering::SeqCst)
    }
}

impl RegistryInner {
    /// Install `pair` on the entry for `key` if `owns` accepts it.
    async fn update_entry(
        &self,
        key: &RegistryKey,
        pair: CertKeyPair,
        owns: impl Fn(&Entry) -> bool,
    ) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key).filter(|entry| owns(&**entry)) else {
            return false;
        };
        for slot in entry.handles.values() {
            *slot.write().unwrap_or_else(|e| e.into_inner()) = pair.clone();
        }
        entry.current = pair;
        true
    }
}

struct TaskGuard(Arc<AtomicUsize>);

impl TaskGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn refresh_loop(
    registry: Weak<RegistryInner>,
    key: RegistryKey,
    generation: u64,
    ctx: RefreshContext,
    mut stop: watch::Receiver<bool>,
    period: Duration,
    _guard: TaskGuard,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = registry.upgrade() else {
            break;
        };
        let current = match inner.entries.read().await.get(&key) {
            Some(entry) if entry.generation == generation => entry.current.clone(),
            _ => break,
        };

        match refresh_once(&ctx, &current).await {
            Ok(pair) => {
                info!(
                    entity = %key.entity_name,
                    host = %key.host,
                    valid_before = pair.certificate.valid_before,
                    "refreshed certificate"
                );
                let owned = inner
                    .update_entry(&key, pair, |entry| entry.generation == generation)
                    .await;
                if !owned {
                    break;
                }
            }
            Err(e) => {
                warn!(
                    entity = %key.entity_name,
                    error = %e,
                    "certificate refresh failed, retrying next period"
                );
            }
        }
    }

    debug!(entity = %key.entity_name, host = %key.host, "certificate refresh task stopped");
}

/// Authority first, local daemon only when that fails.
async fn refresh_once(ctx: &RefreshContext, current: &CertKeyPair) -> TrustResult<CertKeyPair> {
    let from_authority = tokio::time::timeout(
        AUTHORITY_REFRESH_TIMEOUT,
        renew_certificate(ctx.authority.as_ref(), &ctx.keys, current),
    )
    .await
    .unwrap_or_else(|_| Err(TrustError::authority("certificate refresh timed out")));

    let authority_err = match from_authority {
        Ok(pair) => return Ok(pair),
        Err(e) => e,
    };

    let Some(daemon) = &ctx.daemon else {
        return Err(authority_err);
    };
    debug!(error = %authority_err, "authority refresh failed, asking local daemon");

    tokio::time::timeout(AUTHORITY_REFRESH_TIMEOUT, daemon.refresh(current))
        .await
        .unwrap_or_else(|_| Err(TrustError::authority("local daemon refresh timed out")))
        .and_then(|pair| {
            pair.certificate.check(&ctx.keys)?;
            Ok(pair)
        })
        .map_err(|daemon_err| TrustError::AuthorityUnavailable {
            message: format!("authority: {}; daemon: {}", authority_err, daemon_err),
        })
}
