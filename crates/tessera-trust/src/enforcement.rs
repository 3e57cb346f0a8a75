//! Partial enforcement of inbound authentication.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::error::{TrustError, TrustResult};

/// Fraction of failed inbound checks that deny the request.
///
/// Stored as the bit pattern of an `f64` so readers and writers never lock.
#[derive(Debug)]
pub struct Enforcement(AtomicU64);

impl Enforcement {
    /// `percentage` must already be within `[0, 1]`.
    pub fn new(percentage: f64) -> Self {
        Self(AtomicU64::new(percentage.clamp(0.0, 1.0).to_bits()))
    }

    pub fn percentage(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, percentage: f64) -> TrustResult<()> {
        if !(0.0..=1.0).contains(&percentage) {
            return Err(TrustError::config(format!(
                "enforce percentage must be within [0, 1], got {}",
                percentage
            )));
        }
        self.0.store(percentage.to_bits(), Ordering::SeqCst);
        tracing::info!(enforce_percentage = percentage, "updated enforce percentage");
        Ok(())
    }

    /// 0 and 1 are exact; anything between is a random draw.
    pub fn should_enforce(&self) -> bool {
        let p = self.percentage();
        if p <= 0.0 {
            return false;
        }
        if p >= 1.0 {
            return true;
        }
        rand::thread_rng().gen::<f64>() <= p
    }
}

impl Default for Enforcement {
    fn default() -> Self {
        Self::new(0.0)
    }
}
