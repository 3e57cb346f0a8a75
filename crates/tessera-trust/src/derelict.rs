//! Derelict list: entities allowed through inbound checks without a valid
//! claim until a given time, fetched periodically from the authority.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::authority::{DerelictReply, DerelictSource, Requester};
use crate::disable::DisableFlag;
use crate::error::{TrustError, TrustResult};

#[derive(Debug)]
pub struct DerelictList {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
    period: RwLock<Duration>,
}

impl DerelictList {
    pub fn new(period: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            period: RwLock::new(period),
        }
    }

    pub fn is_derelict(&self, entity: &str) -> bool {
        self.is_derelict_at(entity, Utc::now())
    }

    pub fn is_derelict_at(&self, entity: &str, now: DateTime<Utc>) -> bool {
        if entity.is_empty() {
            return false;
        }
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(entity).is_some_and(|expiry| now < *expiry)
    }

    /// Replace the list with `reply`, adopting its check interval if set.
    pub fn apply(&self, reply: DerelictReply) {
        if reply.check_interval_secs > 0 {
            *self.period.write().unwrap_or_else(|e| e.into_inner()) =
                Duration::from_secs(reply.check_interval_secs);
        }
        debug!(count = reply.derelicts.len(), "updated derelict list");
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = reply.derelicts;
    }

    pub fn period(&self) -> Duration {
        *self.period.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background refresher for a [`DerelictList`].
pub struct DerelictRefresher {
    list: Arc<DerelictList>,
    source: Arc<dyn DerelictSource>,
    flag: DisableFlag,
    timeout: Duration,
}

impl DerelictRefresher {
    pub fn new(
        list: Arc<DerelictList>,
        source: Arc<dyn DerelictSource>,
        flag: DisableFlag,
        timeout: Duration,
    ) -> Self {
        Self {
            list,
            source,
            flag,
            timeout,
        }
    }

    /// Fetch once. Skipped while globally disabled.
    pub async fn refresh(&self, requester: &Requester) -> TrustResult<()> {
        if self.flag.is_disabled() {
            debug!("globally disabled, not refreshing derelicts");
            return Ok(());
        }
        let reply = tokio::time::timeout(self.timeout, self.source.fetch_derelicts(requester))
            .await
            .map_err(|_| TrustError::authority("derelict fetch timed out"))??;
        self.list.apply(reply);
        Ok(())
    }

    /// Refresh now, then every period, until `shutdown` fires.
    ///
    /// `requester` is called before each fetch so refreshed certificates are
    /// picked up.
    pub async fn run<F>(self, requester: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn() -> Requester + Send + Sync + 'static,
    {
        loop {
            if let Err(e) = self.refresh(&requester()).await {
                warn!(error = %e, "failed to refresh derelict list");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.list.period()) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("derelict refresher stopped");
    }
}
