//! Global disable switch.
//!
//! The authority can suspend enforcement everywhere by publishing a signed
//! message in an out-of-band TXT record, one record name per authority key:
//! `<sha256(spki) hex>.<domain>`. While a valid message is published the
//! library is fail-open.
//!
//! Once a message from key K has been accepted, K is the sentinel and later
//! checks only look at K's record until it stops validating. Only then do
//! checks go back to scanning every key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::authority::RecordLookup;
use crate::error::{TrustError, TrustResult};
use crate::keys::{encode_public_key, sign_bytes, verify_bytes, AuthorityKeys};
use crate::wire::{self, base64_bytes};

/// Longest accepted span between a message's creation and expiry.
pub const MAX_DISABLE_SECS: i64 = 24 * 60 * 60;

/// Records shorter than this cannot hold a signed message and are ignored.
pub const MIN_RECORD_LEN: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisableMessage {
    pub ctime: i64,
    pub etime: i64,
    pub is_disabled: bool,
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

impl DisableMessage {
    pub fn new(ctime: i64, etime: i64) -> Self {
        Self {
            ctime,
            etime,
            is_disabled: true,
            signature: Vec::new(),
        }
    }

    pub fn signing_bytes(&self) -> TrustResult<Vec<u8>> {
        let unsigned = Self {
            signature: Vec::new(),
            ..self.clone()
        };
        wire::canonical_bytes(&unsigned)
    }

    pub fn sign(&mut self, key: &SigningKey) -> TrustResult<()> {
        self.signature = sign_bytes(&self.signing_bytes()?, key);
        Ok(())
    }

    /// Record text: base64 of the JSON message.
    pub fn encode(&self) -> TrustResult<String> {
        wire::encode_token(self)
    }

    pub fn decode(record: &str) -> TrustResult<Self> {
        wire::decode_token(record)
    }

    /// Accept the message only if it is current, spans at most
    /// [`MAX_DISABLE_SECS`] and is signed by `key`.
    pub fn validate_at(&self, key: &VerifyingKey, now: i64) -> TrustResult<()> {
        let invalid = |message: &str| TrustError::Signature {
            message: format!("disable message {}", message),
        };

        if self.ctime > now {
            return Err(invalid("created in the future"));
        }
        if self.etime < now {
            return Err(invalid("expired"));
        }
        if self.ctime + MAX_DISABLE_SECS <= self.etime {
            return Err(invalid("valid for too long"));
        }
        if !verify_bytes(&self.signing_bytes()?, &self.signature, key) {
            return Err(invalid("signature mismatch"));
        }
        Ok(())
    }
}

/// Record name holding the disable message signed by `key`.
pub fn record_name(key: &VerifyingKey, domain: &str) -> TrustResult<String> {
    let spki = encode_public_key(key)?;
    Ok(format!(
        "{}.{}",
        hex::encode(Sha256::digest(&spki)),
        domain.trim_matches('.')
    ))
}

/// Process-wide disabled bit shared by all components of one client.
#[derive(Debug, Clone, Default)]
pub struct DisableFlag(Arc<AtomicBool>);

impl DisableFlag {
    pub fn new(disabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(disabled)))
    }

    pub fn is_disabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn set(&self, disabled: bool) -> bool {
        self.0.swap(disabled, Ordering::SeqCst)
    }
}

pub struct DisableMonitor {
    keys: AuthorityKeys,
    records: Arc<dyn RecordLookup>,
    domain: String,
    flag: DisableFlag,
    sentinel: Mutex<Option<VerifyingKey>>,
    recovered: Arc<Notify>,
}

impl std::fmt::Debug for DisableMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisableMonitor")
            .field("domain", &self.domain)
            .field("disabled", &self.flag.is_disabled())
            .finish_non_exhaustive()
    }
}

impl DisableMonitor {
    pub fn new(
        keys: AuthorityKeys,
        records: Arc<dyn RecordLookup>,
        domain: impl Into<String>,
        flag: DisableFlag,
    ) -> TrustResult<Self> {
        let domain = domain.into();
        if domain.trim_matches('.').is_empty() {
            return Err(TrustError::config("disable record domain is required"));
        }
        let current = keys.current();
        if current.is_empty() {
            return Err(TrustError::config(
                "no authority keys to check disable records against",
            ));
        }
        for key in &current {
            record_name(key, &domain)?;
        }

        Ok(Self {
            keys,
            records,
            domain,
            flag,
            sentinel: Mutex::new(None),
            recovered: Arc::new(Notify::new()),
        })
    }

    pub fn flag(&self) -> &DisableFlag {
        &self.flag
    }

    pub fn is_disabled(&self) -> bool {
        self.flag.is_disabled()
    }

    /// Notified each time the library goes from disabled back to enabled.
    pub fn recovery_signal(&self) -> Arc<Notify> {
        self.recovered.clone()
    }

    /// Run one check cycle now and return the resulting state.
    pub async fn force_check(&self) -> bool {
        self.check_at(Utc::now().timestamp()).await
    }

    pub(crate) async fn check_at(&self, now: i64) -> bool {
        let mut sentinel = self.sentinel.lock().await;

        match *sentinel {
            Some(key) => {
                let still_disabled = match self.lookup(&key).await {
                    Some(record) => self.accept(&record, &key, now),
                    None => false,
                };
                if !still_disabled {
                    *sentinel = None;
                    self.flag.set(false);
                    info!("disable message withdrawn, enforcement re-enabled");
                    self.recovered.notify_one();
                }
            }
            None => {
                for key in self.keys.current() {
                    let Some(record) = self.lookup(&key).await else {
                        continue;
                    };
                    // only the first record that resolves is considered
                    if self.accept(&record, &key, now) {
                        *sentinel = Some(key);
                        if !self.flag.set(true) {
                            warn!("valid disable message found, authentication is fail-open");
                        }
                    }
                    break;
                }
            }
        }

        self.flag.is_disabled()
    }

    fn accept(&self, record: &str, key: &VerifyingKey, now: i64) -> bool {
        let result = DisableMessage::decode(record).and_then(|message| {
            message.validate_at(key, now)?;
            Ok(message.is_disabled)
        });
        match result {
            Ok(disabled) => disabled,
            Err(e) => {
                debug!(error = %e, "ignoring disable record");
                false
            }
        }
    }

    /// Lookup failures count as "no record".
    async fn lookup(&self, key: &VerifyingKey) -> Option<String> {
        let name = record_name(key, &self.domain).ok()?;
        match self.records.lookup_txt(&name).await {
            Ok(values) => values
                .into_iter()
                .next()
                .filter(|record| record.len() >= MIN_RECORD_LEN),
            Err(e) => {
                debug!(record = %name, error = %e, "disable record lookup failed");
                None
            }
        }
    }

    /// Check every `period` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(period_secs = period.as_secs(), "disable monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.force_check().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("disable monitor stopped");
    }
}
