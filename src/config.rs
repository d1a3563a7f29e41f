//! Configuration management for Turnstile.
//!
//! Settings come from a YAML file, overridden by `TURNSTILE_*` environment
//! variables (nested keys separated by `__`, e.g.
//! `TURNSTILE_CHAIN__REJECT_STATUS=503`).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use http::{HeaderName, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::throttle::{
    Classifier, Clock, EventStore, FailurePolicy, MemoryEventStore, ShardedEventStore,
    ThrottleChain, ThrottleRule, WindowRule,
};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Event store backend
    #[serde(default)]
    pub store: StoreKind,

    /// Throttle chain configuration
    #[serde(default)]
    pub chain: ChainConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which event store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Single lock shared by all keys
    #[default]
    Memory,
    /// Per-key locking
    Sharded,
}

impl StoreKind {
    /// Create an empty store of this kind.
    pub fn build(self, clock: Arc<dyn Clock>) -> Arc<dyn EventStore> {
        match self {
            StoreKind::Memory => Arc::new(MemoryEventStore::with_clock(clock)),
            StoreKind::Sharded => Arc::new(ShardedEventStore::with_clock(clock)),
        }
    }
}

/// Throttle chain configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Status code returned for throttled requests
    #[serde(default = "default_reject_status")]
    pub reject_status: u16,

    /// Body returned for throttled requests
    #[serde(default = "default_reject_body")]
    pub reject_body: String,

    /// What to do when the event store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Seconds between eviction passes of each rule
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Rules, evaluated in order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            reject_status: default_reject_status(),
            reject_body: default_reject_body(),
            failure_policy: FailurePolicy::default(),
            cleanup_interval_secs: default_cleanup_interval(),
            rules: Vec::new(),
        }
    }
}

fn default_reject_status() -> u16 {
    429
}

fn default_reject_body() -> String {
    "Too Many Requests".to_string()
}

fn default_cleanup_interval() -> u64 {
    60
}

/// A single throttle rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Storage key for the rule's events
    pub prefix: String,
    /// Trailing window length in seconds
    pub window_secs: u64,
    /// Maximum events tolerated within the window
    pub threshold: u64,
    /// Which requests the rule applies to
    #[serde(default, rename = "match")]
    pub matcher: MatchConfig,
}

/// Request matching criteria. All given criteria must hold; none given
/// matches every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchConfig {
    /// HTTP methods, e.g. `[GET, POST]`
    #[serde(default)]
    pub methods: Vec<String>,
    /// Path prefix, e.g. `/api`
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Header that must be present
    #[serde(default)]
    pub header: Option<String>,
}

impl MatchConfig {
    /// Turn the criteria into a classifier.
    pub fn classifier(&self) -> Result<Classifier> {
        let mut parts = Vec::new();

        if !self.methods.is_empty() {
            let methods = self
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                        .map_err(|e| TurnstileError::Config(format!("invalid method '{}': {}", m, e)))
                })
                .collect::<Result<Vec<_>>>()?;
            parts.push(Classifier::methods(methods));
        }

        if let Some(prefix) = &self.path_prefix {
            parts.push(Classifier::path_prefix(prefix.clone()));
        }

        if let Some(header) = &self.header {
            let name = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
                TurnstileError::Config(format!("invalid header name '{}': {}", header, e))
            })?;
            parts.push(Classifier::has_header(name));
        }

        Ok(Classifier::all_of(parts))
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");
        Self::load(File::new(path, FileFormat::Yaml))
    }

    /// Load configuration from a YAML string, with environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::load(File::from_str(yaml, FileFormat::Yaml))
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::load(File::from_str("{}", FileFormat::Yaml))
    }

    fn load<S>(source: S) -> Result<Self>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let config: TurnstileConfig = Config::builder()
            .add_source(source)
            .add_source(
                Environment::with_prefix("TURNSTILE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.chain.validate()
    }

    /// Render the effective configuration.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| TurnstileError::Config(e.to_string()))
    }
}

impl ChainConfig {
    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.status()?;

        if self.cleanup_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }

        for rule in &self.rules {
            if rule.prefix.is_empty() {
                return Err(TurnstileError::Config("rule prefix must not be empty".to_string()));
            }
            if rule.window_secs == 0 {
                return Err(TurnstileError::Config(format!(
                    "rule '{}' window_secs must be greater than 0",
                    rule.prefix
                )));
            }
            rule.matcher.classifier()?;
        }

        Ok(())
    }

    fn status(&self) -> Result<StatusCode> {
        StatusCode::from_u16(self.reject_status).map_err(|_| {
            TurnstileError::Config(format!("invalid reject_status {}", self.reject_status))
        })
    }

    /// Build the chain, starting every rule's eviction task.
    ///
    /// Fails if called outside a tokio runtime.
    pub fn build(&self, store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Result<ThrottleChain> {
        let status = self.status()?;
        let interval = Duration::from_secs(self.cleanup_interval_secs);

        let rules = self
            .rules
            .iter()
            .map(|rule| -> Result<Arc<dyn ThrottleRule>> {
                let built = WindowRule::builder(
                    rule.prefix.clone(),
                    Duration::from_secs(rule.window_secs),
                    rule.threshold,
                    store.clone(),
                )
                .classify(rule.matcher.classifier()?)
                .clock(clock.clone())
                .cleanup_interval(interval)
                .build()?;
                Ok(Arc::new(built) as Arc<dyn ThrottleRule>)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(
            ThrottleChain::new(rules, status, self.reject_body.clone().into_bytes())
                .with_failure_policy(self.failure_policy),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::SystemClock;

    const SAMPLE: &str = r#"
server:
  listen_addr: "0.0.0.0:9000"
store: sharded
chain:
  reject_status: 503
  reject_body: "busy"
  failure_policy: fail_closed
  cleanup_interval_secs: 30
  rules:
    - prefix: ip
      window_secs: 60
      threshold: 100
    - prefix: login
      window_secs: 300
      threshold: 5
      match:
        methods: [post]
        path_prefix: /login
"#;

    #[test]
    fn test_default_config() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.listen_addr, default_listen_addr());
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.chain.reject_status, 429);
        assert_eq!(config.chain.failure_policy, FailurePolicy::FailOpen);
        assert!(config.chain.rules.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let config = TurnstileConfig::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.store, StoreKind::Sharded);
        assert_eq!(config.chain.reject_status, 503);
        assert_eq!(config.chain.reject_body, "busy");
        assert_eq!(config.chain.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.chain.rules.len(), 2);
        assert_eq!(config.chain.rules[1].matcher.methods, vec!["post"]);
        assert_eq!(config.chain.rules[1].matcher.path_prefix.as_deref(), Some("/login"));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = TurnstileConfig::from_yaml("store: memory").unwrap();
        assert_eq!(config.chain.reject_body, "Too Many Requests");
        assert_eq!(config.chain.cleanup_interval_secs, 60);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_status = "chain:\n  reject_status: 42\n";
        assert!(matches!(
            TurnstileConfig::from_yaml(bad_status),
            Err(TurnstileError::Config(_))
        ));

        let bad_window = "chain:\n  rules:\n    - prefix: ip\n      window_secs: 0\n      threshold: 1\n";
        assert!(TurnstileConfig::from_yaml(bad_window).is_err());

        let bad_method =
            "chain:\n  rules:\n    - prefix: ip\n      window_secs: 1\n      threshold: 1\n      match:\n        methods: [\"GE T\"]\n";
        assert!(TurnstileConfig::from_yaml(bad_method).is_err());
    }

    #[test]
    fn test_rendered_yaml_loads_back() {
        let config = TurnstileConfig::from_yaml(SAMPLE).unwrap();
        let rendered = config.to_yaml().unwrap();

        assert!(rendered.contains("failure_policy: fail_closed"));
        let reloaded = TurnstileConfig::from_yaml(&rendered).unwrap();
        assert_eq!(reloaded.chain.rules.len(), 2);
        assert_eq!(reloaded.store, StoreKind::Sharded);
    }

    #[tokio::test]
    async fn test_build_chain_from_config() {
        let config = TurnstileConfig::from_yaml(SAMPLE).unwrap();
        let clock = SystemClock::shared();
        let store = config.store.build(clock.clone());

        let chain = config.chain.build(store, clock).unwrap();

        assert_eq!(chain.reject_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(chain.reject_body().as_ref(), b"busy");
        assert_eq!(chain.failure_policy(), FailurePolicy::FailClosed);
        let prefixes: Vec<&str> = chain.rules().iter().map(|r| r.prefix()).collect();
        assert_eq!(prefixes, vec!["ip", "login"]);

        chain.shutdown().await;
    }

    #[test]
    fn test_build_chain_outside_runtime_fails() {
        let config = TurnstileConfig::from_yaml(SAMPLE).unwrap();
        let clock = SystemClock::shared();
        let store = config.store.build(clock.clone());

        let err = tokio_test::assert_err!(config.chain.build(store, clock));
        assert!(err.to_string().contains("rule 'ip' must be built inside a tokio runtime"));
    }
}
