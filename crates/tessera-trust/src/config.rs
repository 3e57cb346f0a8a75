//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TrustError, TrustResult};

/// Trust client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Entity name this process authenticates as.
    #[serde(default)]
    pub service_name: String,

    /// Destination names inbound claims may be addressed to.
    /// Empty means just `service_name`.
    #[serde(default)]
    pub service_aliases: Vec<String>,

    /// Entities allowed to call this service when a request names none.
    #[serde(default)]
    pub allowed_entities: Vec<String>,

    /// Fraction of failed inbound checks that are actually denied.
    #[serde(default)]
    pub enforce_percentage: f64,

    /// Base URL for the credential authority.
    #[serde(default = "default_authority_url")]
    pub authority_url: String,

    /// Start in fail-open mode regardless of disable records.
    #[serde(default)]
    pub disabled: bool,

    /// Deadline for each authority call in seconds.
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,

    /// Domain under which disable records are published.
    #[serde(default = "default_disable_record_domain")]
    pub disable_record_domain: String,

    /// Claims added to every authority request.
    #[serde(default)]
    pub implicit_claims: Vec<String>,

    #[serde(default)]
    pub timings: Timings,
}

fn default_authority_url() -> String {
    "http://127.0.0.1:16746".to_string()
}

fn default_timeout() -> u64 {
    5
}

fn default_disable_record_domain() -> String {
    "disable.tessera.internal".to_string()
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            service_aliases: Vec::new(),
            allowed_entities: Vec::new(),
            enforce_percentage: 0.0,
            authority_url: default_authority_url(),
            disabled: false,
            request_timeout_secs: default_timeout(),
            disable_record_domain: default_disable_record_domain(),
            implicit_claims: Vec::new(),
            timings: Timings::default(),
        }
    }
}

impl TrustConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `TESSERA_SERVICE_NAME` | Entity name of this process |
    /// | `TESSERA_SERVICE_ALIASES` | Comma separated destination aliases |
    /// | `TESSERA_ALLOWED_ENTITIES` | Comma separated default allowed callers |
    /// | `TESSERA_ENFORCE_PERCENTAGE` | Enforcement fraction, 0.0 to 1.0 |
    /// | `TESSERA_AUTHORITY_URL` | Credential authority base URL |
    /// | `TESSERA_DISABLED` | Start disabled (`1` or `true`) |
    /// | `TESSERA_REQUEST_TIMEOUT` | Authority call deadline in seconds |
    /// | `TESSERA_DISABLE_RECORD_DOMAIN` | Domain of disable records |
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("TESSERA_SERVICE_NAME").unwrap_or_default(),
            service_aliases: env_list("TESSERA_SERVICE_ALIASES"),
            allowed_entities: env_list("TESSERA_ALLOWED_ENTITIES"),
            enforce_percentage: std::env::var("TESSERA_ENFORCE_PERCENTAGE")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0.0),
            authority_url: std::env::var("TESSERA_AUTHORITY_URL")
                .unwrap_or_else(|_| default_authority_url()),
            disabled: std::env::var("TESSERA_DISABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            request_timeout_secs: std::env::var("TESSERA_REQUEST_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_timeout),
            disable_record_domain: std::env::var("TESSERA_DISABLE_RECORD_DOMAIN")
                .unwrap_or_else(|_| default_disable_record_domain()),
            implicit_claims: Vec::new(),
            timings: Timings::default(),
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.service_aliases = aliases;
        self
    }

    pub fn with_allowed_entities(mut self, entities: Vec<String>) -> Self {
        self.allowed_entities = entities;
        self
    }

    pub fn with_enforce_percentage(mut self, percentage: f64) -> Self {
        self.enforce_percentage = percentage;
        self
    }

    pub fn with_authority_url(mut self, url: impl Into<String>) -> Self {
        self.authority_url = url.into();
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_implicit_claims(mut self, claims: Vec<String>) -> Self {
        self.implicit_claims = claims;
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Configured aliases, or the service name alone.
    pub fn destinations(&self) -> Vec<String> {
        if self.service_aliases.is_empty() {
            vec![self.service_name.clone()]
        } else {
            self.service_aliases.clone()
        }
    }

    pub fn validate(&self) -> TrustResult<()> {
        if self.service_name.trim().is_empty() {
            return Err(TrustError::config("service name is required"));
        }
        if self.request_timeout_secs == 0 {
            return Err(TrustError::config("request timeout must be positive"));
        }
        Ok(())
    }

    /// The enforcement fraction, coerced into `[0, 1]`.
    ///
    /// Values in `(1, 100]` are read as percentages.
    pub fn normalized_enforce_percentage(&self) -> f64 {
        let p = self.enforce_percentage;
        let normalized = if p.is_nan() || p < 0.0 {
            0.0
        } else if p <= 1.0 {
            p
        } else if p <= 100.0 {
            p / 100.0
        } else {
            1.0
        };

        if normalized != p {
            tracing::warn!(
                configured = p,
                using = normalized,
                "enforce percentage outside [0, 1], normalized"
            );
        }
        normalized
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Periods of the background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    #[serde(default = "default_cert_refresh_secs")]
    pub cert_refresh_secs: u64,

    #[serde(default = "default_disable_check_secs")]
    pub disable_check_secs: u64,

    #[serde(default = "default_derelict_refresh_secs")]
    pub derelict_refresh_secs: u64,

    #[serde(default = "default_recovery_retry_secs")]
    pub recovery_retry_secs: u64,
}

fn default_cert_refresh_secs() -> u64 {
    30 * 60
}

fn default_disable_check_secs() -> u64 {
    60
}

fn default_derelict_refresh_secs() -> u64 {
    10 * 60
}

fn default_recovery_retry_secs() -> u64 {
    60
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            cert_refresh_secs: default_cert_refresh_secs(),
            disable_check_secs: default_disable_check_secs(),
            derelict_refresh_secs: default_derelict_refresh_secs(),
            recovery_retry_secs: default_recovery_retry_secs(),
        }
    }
}

impl Timings {
    pub fn cert_refresh(&self) -> Duration {
        Duration::from_secs(self.cert_refresh_secs.max(1))
    }

    pub fn disable_check(&self) -> Duration {
        Duration::from_secs(self.disable_check_secs.max(1))
    }

    pub fn derelict_refresh(&self) -> Duration {
        Duration::from_secs(self.derelict_refresh_secs.max(1))
    }

    pub fn recovery_retry(&self) -> Duration {
        Duration::from_secs(self.recovery_retry_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = TrustConfig::new("bob");
        assert_eq!(config.destinations(), vec!["bob".to_string()]);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.timings.cert_refresh(), Duration::from_secs(1800));
        config.validate().unwrap();
        assert!(TrustConfig::default().validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: TrustConfig =
            serde_json::from_str(r#"{"service_name":"bob","service_aliases":["b1","b2"]}"#)
                .unwrap();
        assert_eq!(config.destinations(), vec!["b1".to_string(), "b2".to_string()]);
        assert_eq!(config.timings, Timings::default());
        assert_eq!(config.disable_record_domain, "disable.tessera.internal");
    }

    #[test]
    fn test_normalized_enforce_percentage() {
        let cases = [(-0.5, 0.0), (0.25, 0.25), (1.0, 1.0), (50.0, 0.5), (250.0, 1.0)];
        for (configured, expected) in cases {
            let config = TrustConfig::new("bob").with_enforce_percentage(configured);
            assert_eq!(config.normalized_enforce_percentage(), expected);
        }
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("TESSERA_SERVICE_NAME", "bob");
        std::env::set_var("TESSERA_SERVICE_ALIASES", "bob, bob-canary ,");
        std::env::set_var("TESSERA_ENFORCE_PERCENTAGE", "0.3");
        std::env::set_var("TESSERA_DISABLED", "true");

        let config = TrustConfig::from_env();
        assert_eq!(config.service_name, "bob");
        assert_eq!(
            config.service_aliases,
            vec!["bob".to_string(), "bob-canary".to_string()]
        );
        assert_eq!(config.enforce_percentage, 0.3);
        assert!(config.disabled);

        std::env::remove_var("TESSERA_SERVICE_NAME");
        std::env::remove_var("TESSERA_SERVICE_ALIASES");
        std::env::remove_var("TESSERA_ENFORCE_PERCENTAGE");
        std::env::remove_var("TESSERA_DISABLED");
    }
}
