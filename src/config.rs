//! Engine configuration.
//!
//! Every tunable the engine consumes lives in an explicit [`EngineConfig`]
//! passed to components at construction time; there is no ambient global
//! state. Configuration is loaded from a YAML file with environment variable
//! overrides: variables prefixed with `HARBORMASTER_` override YAML values,
//! using double underscores for nesting (e.g.
//! `HARBORMASTER_GATEWAY__MAX_ATTEMPTS=5` sets `gateway.max_attempts`).
//!
//! Durations are written in humantime form ("500ms", "2m 30s").

use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::Deserialize;

use crate::error::Result;
use crate::types::ConfigId;

/// Root configuration for the provisioning engine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Remote panel client behavior (timeouts, retry budget, backoff).
    pub gateway: GatewayConfig,
    /// Reconciliation pass cadence and bounds.
    pub reconcile: ReconcileConfig,
    /// Remote client naming and server registration constraints.
    pub naming: NamingConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file merged with `HARBORMASTER_`
    /// environment overrides. Later sources win.
    pub fn load(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("HARBORMASTER_").split("__"))
            .extract()?;
        Ok(config)
    }
}

/// Behavior of the HTTP client talking to one gateway panel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Timeout for each individual request attempt (default: 15s).
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Total attempt budget per operation, including the first attempt
    /// (default: 4). Only retryable failures consume further attempts.
    pub max_attempts: u32,
    /// Base backoff before the second attempt (default: 500ms).
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Multiplier applied per attempt (default: 2).
    pub backoff_factor: u32,
    /// Upper bound on a single backoff delay (default: 30s).
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_factor: 2,
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    /// Backoff delay after the given zero-based attempt:
    /// `backoff_base * backoff_factor^attempt`, capped at `backoff_max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_base
            .saturating_mul(self.backoff_factor.saturating_pow(attempt));
        exponential.min(self.backoff_max)
    }
}

/// Cadence and bounds of the reconciliation jobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    /// How often the expiry enforcer runs (default: 1m).
    #[serde(with = "humantime_serde")]
    pub expiry_interval: Duration,
    /// How often the quota enforcer runs (default: 1m).
    #[serde(with = "humantime_serde")]
    pub quota_interval: Duration,
    /// How often remote usage is synced (default: 5m).
    #[serde(with = "humantime_serde")]
    pub usage_interval: Duration,
    /// Maximum candidates examined per pass (default: 500).
    pub batch_size: usize,
    /// Overall deadline for one pass; when exceeded mid-batch the pass stops
    /// cleanly, leaving committed per-item transitions intact (default: 30s).
    #[serde(with = "humantime_serde")]
    pub pass_deadline: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            expiry_interval: Duration::from_secs(60),
            quota_interval: Duration::from_secs(60),
            usage_interval: Duration::from_secs(300),
            batch_size: 500,
            pass_deadline: Duration::from_secs(30),
        }
    }
}

/// Remote client naming and server registration constraints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NamingConfig {
    /// Template for the deterministic client email sent to the panel on
    /// create. Placeholders: `{id}` (short config id), `{domain}`.
    pub template: String,
    /// Domain substituted into the template. Not a routable domain; panels
    /// only require the identifier to look like an email.
    pub domain: String,
    /// Panel ports accepted at server registration.
    pub port_range: PortRange,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            template: "{id}@{domain}".to_string(),
            domain: "clients.invalid".to_string(),
            port_range: PortRange::default(),
        }
    }
}

impl NamingConfig {
    /// Deterministic client email for a config. The same config id always
    /// yields the same email, which is what makes remote creates safe to
    /// retry after an ambiguous failure.
    pub fn client_email(&self, id: ConfigId) -> String {
        self.template
            .replace("{id}", &id.to_short_string())
            .replace("{domain}", &self.domain)
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self { min: 1024, max: 65535 }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.min && port <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.gateway.max_attempts, 4);
        assert_eq!(config.gateway.request_timeout, Duration::from_secs(15));
        assert_eq!(config.reconcile.batch_size, 500);
        assert!(config.naming.port_range.contains(8443));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = GatewayConfig {
            backoff_base: Duration::from_millis(500),
            backoff_factor: 2,
            backoff_max: Duration::from_secs(3),
            ..GatewayConfig::default()
        };
        assert_eq!(config.backoff_for(0), Duration::from_millis(500));
        assert_eq!(config.backoff_for(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for(2), Duration::from_secs(2));
        // 4s would exceed the cap
        assert_eq!(config.backoff_for(3), Duration::from_secs(3));
        assert_eq!(config.backoff_for(30), Duration::from_secs(3));
    }

    #[test]
    fn test_client_email_is_deterministic() {
        let naming = NamingConfig::default();
        let id = ConfigId::new();
        let first = naming.client_email(id);
        let second = naming.client_email(id);
        assert_eq!(first, second);
        assert!(first.ends_with("@clients.invalid"));
        assert!(first.starts_with("cfg_"));
    }

    #[test]
    fn test_load_yaml_with_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "engine.yaml",
                r#"
gateway:
  max_attempts: 6
  backoff_base: 250ms
reconcile:
  usage_interval: 2m
naming:
  domain: fleet.example
"#,
            )?;
            jail.set_env("HARBORMASTER_GATEWAY__MAX_ATTEMPTS", "2");

            let config = EngineConfig::load("engine.yaml").expect("load");
            // Env beats YAML
            assert_eq!(config.gateway.max_attempts, 2);
            assert_eq!(config.gateway.backoff_base, Duration::from_millis(250));
            assert_eq!(config.reconcile.usage_interval, Duration::from_secs(120));
            assert_eq!(config.naming.domain, "fleet.example");
            // Untouched values keep defaults
            assert_eq!(config.reconcile.batch_size, 500);
            Ok(())
        });
    }
}
