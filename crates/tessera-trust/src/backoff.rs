//! Per-destination backoff after claim resolution failures.
//!
//! A failing destination is skipped for a window that starts at one minute.
//! If it fails again before its previous window ended plus one minute of
//! grace, the window doubles, up to thirty minutes. Failures after that
//! reset it to one minute.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;

/// Initial skip window.
pub const SKIP_FLOOR: Duration = Duration::from_secs(60);

/// Largest skip window.
pub const SKIP_CEILING: Duration = Duration::from_secs(30 * 60);

/// Failures this soon after the previous window still count as consecutive.
pub const SKIP_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipEntry {
    pub start: Instant,
    pub duration: Duration,
}

impl SkipEntry {
    pub fn end(&self) -> Instant {
        self.start + self.duration
    }
}

#[derive(Debug, Default)]
pub struct SkipList {
    entries: RwLock<HashMap<String, SkipEntry>>,
}

impl SkipList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_skip(&self, destination: &str) -> bool {
        self.should_skip_at(destination, Instant::now())
    }

    /// Expired entries stay in the map; they just stop matching.
    pub fn should_skip_at(&self, destination: &str, now: Instant) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(destination)
            .is_some_and(|entry| now < entry.end())
    }

    pub fn record_failure(&self, destination: &str) -> SkipEntry {
        self.record_failure_at(destination, Instant::now())
    }

    pub fn record_failure_at(&self, destination: &str, now: Instant) -> SkipEntry {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        let duration = match entries.get(destination) {
            Some(prev) if now < prev.end() + SKIP_GRACE => {
                (prev.duration * 2).min(SKIP_CEILING)
            }
            _ => SKIP_FLOOR,
        };

        let entry = SkipEntry {
            start: now,
            duration,
        };
        entries.insert(destination.to_string(), entry);

        tracing::debug!(
            destination = %destination,
            skip_secs = duration.as_secs(),
            "skipping destination after resolution failure"
        );
        entry
    }

    pub fn get(&self, destination: &str) -> Option<SkipEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(destination).copied()
    }
}
