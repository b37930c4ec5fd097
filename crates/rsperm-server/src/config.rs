//! Configuration management for the rsperm service.
//!
//! This module provides configuration loading with multiple sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! # Configuration Hierarchy
//!
//! Environment variables take precedence over config file values,
//! which take precedence over defaults. This follows the 12-factor app pattern.
//!
//! # Example
//!
//! ```ignore
//! use rsperm_server::config::ServerConfig;
//!
//! // Load from file with env overrides
//! let config = ServerConfig::load("rsperm.yaml")?;
//!
//! // Or load from environment only
//! let config = ServerConfig::from_env()?;
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use rsperm_domain::boundary::BoundaryConfig;
use rsperm_domain::cache::AdaptiveConfig;
use rsperm_domain::collector::DEFAULT_WINDOW_SIZE;
use rsperm_domain::graph::DEFAULT_MAX_EXPAND_DEPTH;
use rsperm_domain::model::Permission;
use rsperm_domain::resolver::{BreakerConfig, DEFAULT_SUPER_ADMIN_ROLE};
use rsperm_domain::{DecisionCacheConfig, ResolverConfig};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RSPERM";

/// Service configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub resolver: ResolverSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub boundary: BoundarySettings,

    #[serde(default)]
    pub breaker: BreakerSettings,

    #[serde(default)]
    pub adaptive: AdaptiveSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Permission implications loaded at startup.
    #[serde(default)]
    pub dependencies: Vec<DependencyEdge>,
}

/// One `from -> to` implication: holding `from` grants `to`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

impl DependencyEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Resolver settings.
///
/// Environment variables: `RSPERM_RESOLVER__TIMEOUT_MS`,
/// `RSPERM_RESOLVER__SUPER_ADMIN_ROLE`, and so on.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ResolverSettings {
    /// Bound on one uncached resolution.
    #[serde(default = "default_resolver_timeout")]
    pub timeout_ms: u64,

    /// Bound on each backing store call.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Dependency expansion depth cap.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_super_admin_role")]
    pub super_admin_role: String,

    /// Permission key that lets a non-member cross a tenant boundary.
    /// Disabled when unset.
    #[serde(default)]
    pub cross_entity_permission: Option<String>,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// TTL for cached decisions; the cache default applies when unset.
    #[serde(default)]
    pub decision_ttl_ms: Option<u64>,

    /// How often expired assignments are removed from the store.
    /// Zero disables the purge task.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_ms: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_resolver_timeout(),
            store_timeout_ms: default_store_timeout(),
            max_depth: default_max_depth(),
            super_admin_role: default_super_admin_role(),
            cross_entity_permission: None,
            max_in_flight: default_max_in_flight(),
            decision_ttl_ms: None,
            purge_interval_ms: default_purge_interval(),
        }
    }
}

fn default_resolver_timeout() -> u64 {
    250
}

fn default_store_timeout() -> u64 {
    50
}

fn default_max_depth() -> u32 {
    DEFAULT_MAX_EXPAND_DEPTH
}

fn default_super_admin_role() -> String {
    DEFAULT_SUPER_ADMIN_ROLE.to_string()
}

fn default_max_in_flight() -> usize {
    1024
}

fn default_purge_interval() -> u64 {
    60_000
}

/// Decision cache settings.
///
/// # Example YAML Configuration
///
/// ```yaml
/// cache:
///   max_capacity: 50000
///   default_ttl_ms: 30000
///   high_flush_interval_ms: 10
///   medium_flush_interval_ms: 50
///   low_flush_interval_ms: 200
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,

    #[serde(default = "default_ttl")]
    pub default_ttl_ms: u64,

    /// Upper bound on any per-entry TTL.
    #[serde(default = "default_max_ttl")]
    pub max_ttl_ms: u64,

    #[serde(default = "default_high_flush")]
    pub high_flush_interval_ms: u64,

    #[serde(default = "default_medium_flush")]
    pub medium_flush_interval_ms: u64,

    #[serde(default = "default_low_flush")]
    pub low_flush_interval_ms: u64,

    #[serde(default = "default_hot_key_capacity")]
    pub hot_key_capacity: u64,

    /// How long a tag's invalidation epoch is remembered.
    #[serde(default = "default_tag_epoch_retention")]
    pub tag_epoch_retention_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_capacity: default_cache_capacity(),
            default_ttl_ms: default_ttl(),
            max_ttl_ms: default_max_ttl(),
            high_flush_interval_ms: default_high_flush(),
            medium_flush_interval_ms: default_medium_flush(),
            low_flush_interval_ms: default_low_flush(),
            hot_key_capacity: default_hot_key_capacity(),
            tag_epoch_retention_ms: default_tag_epoch_retention(),
        }
    }
}

fn default_cache_capacity() -> u64 {
    100_000
}

fn default_ttl() -> u64 {
    60_000
}

fn default_max_ttl() -> u64 {
    600_000
}

fn default_high_flush() -> u64 {
    10
}

fn default_medium_flush() -> u64 {
    50
}

fn default_low_flush() -> u64 {
    200
}

fn default_hot_key_capacity() -> u64 {
    1024
}

fn default_tag_epoch_retention() -> u64 {
    300_000
}

/// Membership cache settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BoundarySettings {
    #[serde(default = "default_membership_ttl")]
    pub membership_ttl_ms: u64,

    #[serde(default = "default_membership_capacity")]
    pub capacity: u64,

    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
}

impl Default for BoundarySettings {
    fn default() -> Self {
        Self {
            membership_ttl_ms: default_membership_ttl(),
            capacity: default_membership_capacity(),
            lookup_timeout_ms: default_lookup_timeout(),
        }
    }
}

fn default_membership_ttl() -> u64 {
    30_000
}

fn default_membership_capacity() -> u64 {
    10_000
}

fn default_lookup_timeout() -> u64 {
    50
}

/// Backing store circuit breaker settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BreakerSettings {
    /// Consecutive failures within the window that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_failure_window")]
    pub failure_window_ms: u64,

    /// Time spent open before a half-open probe is allowed.
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window(),
            cooldown_ms: default_cooldown(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> u64 {
    10_000
}

fn default_cooldown() -> u64 {
    5_000
}

/// Adaptive cache controller settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AdaptiveSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_target_hit_rate")]
    pub target_hit_rate: f64,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_ms: u64,

    #[serde(default = "default_warm_batch_size")]
    pub warm_batch_size: usize,

    #[serde(default = "default_eviction_rate_threshold")]
    pub eviction_rate_threshold: f64,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_hit_rate: default_target_hit_rate(),
            min_samples: default_min_samples(),
            evaluation_interval_ms: default_evaluation_interval(),
            warm_batch_size: default_warm_batch_size(),
            eviction_rate_threshold: default_eviction_rate_threshold(),
        }
    }
}

fn default_target_hit_rate() -> f64 {
    0.95
}

fn default_min_samples() -> usize {
    50
}

fn default_evaluation_interval() -> u64 {
    30_000
}

fn default_warm_batch_size() -> usize {
    64
}

fn default_eviction_rate_threshold() -> f64 {
    0.2
}

/// Metrics settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetricsSettings {
    /// Install the Prometheus recorder at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rolling window size per action.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: default_window_size(),
        }
    }
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

fn invalid(message: impl Into<String>) -> ConfigLoadError {
    ConfigLoadError::Invalid {
        message: message.into(),
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables are prefixed with `RSPERM_` and use `__` as separator.
    /// For example:
    /// - `RSPERM_CACHE__DEFAULT_TTL_MS=5000` overrides `cache.default_ttl_ms`
    /// - `RSPERM_LOGGING__LEVEL=debug` overrides `logging.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(env_source())
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(env_source())
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    /// Validate the configuration.
    ///
    /// Dependency cycles are not checked here; they surface when the service
    /// builds its graph.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let resolver = &self.resolver;
        if resolver.timeout_ms == 0 || resolver.store_timeout_ms == 0 {
            return Err(invalid(
                "resolver.timeout_ms and resolver.store_timeout_ms must be greater than 0",
            ));
        }
        if resolver.max_depth == 0 {
            return Err(invalid("resolver.max_depth must be greater than 0"));
        }
        if resolver.max_in_flight == 0 {
            return Err(invalid("resolver.max_in_flight must be greater than 0"));
        }
        if resolver.super_admin_role.trim().is_empty() {
            return Err(invalid("resolver.super_admin_role cannot be empty"));
        }
        if let Some(permission) = &resolver.cross_entity_permission {
            Permission::parse(permission).map_err(|e| {
                invalid(format!("resolver.cross_entity_permission: {e}"))
            })?;
        }

        let cache = &self.cache;
        if cache.max_capacity == 0 {
            return Err(invalid("cache.max_capacity must be greater than 0"));
        }
        if cache.default_ttl_ms == 0 || cache.default_ttl_ms > cache.max_ttl_ms {
            return Err(invalid(format!(
                "cache.default_ttl_ms must be in 1..={}, got: {}",
                cache.max_ttl_ms, cache.default_ttl_ms
            )));
        }
        if !(cache.high_flush_interval_ms <= cache.medium_flush_interval_ms
            && cache.medium_flush_interval_ms <= cache.low_flush_interval_ms)
        {
            return Err(invalid(
                "cache flush intervals must be ordered high <= medium <= low",
            ));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold must be greater than 0"));
        }

        let adaptive = &self.adaptive;
        if !(adaptive.target_hit_rate > 0.0 && adaptive.target_hit_rate <= 1.0) {
            return Err(invalid(format!(
                "adaptive.target_hit_rate must be in (0, 1], got: {}",
                adaptive.target_hit_rate
            )));
        }
        if adaptive.evaluation_interval_ms == 0 {
            return Err(invalid(
                "adaptive.evaluation_interval_ms must be greater than 0",
            ));
        }

        if self.metrics.window_size == 0 {
            return Err(invalid("metrics.window_size must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "logging.level must be one of: {:?}, got: {}",
                valid_levels, self.logging.level
            )));
        }

        for (index, edge) in self.dependencies.iter().enumerate() {
            for key in [&edge.from, &edge.to] {
                let permission = Permission::parse(key)
                    .map_err(|e| invalid(format!("dependencies[{index}]: {e}")))?;
                if permission.resource_id.is_some() {
                    return Err(invalid(format!(
                        "dependencies[{index}]: '{key}' must be an unscoped action:resource key"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        let settings = &self.resolver;
        let mut config = ResolverConfig::default()
            .with_timeout(Duration::from_millis(settings.timeout_ms))
            .with_store_timeout(Duration::from_millis(settings.store_timeout_ms))
            .with_super_admin_role(settings.super_admin_role.clone())
            .with_max_in_flight(settings.max_in_flight);
        if let Some(permission) = &settings.cross_entity_permission {
            config = config.with_cross_entity_permission(permission.clone());
        }
        if let Some(ttl) = settings.decision_ttl_ms {
            config = config.with_decision_ttl(Duration::from_millis(ttl));
        }
        config
    }

    pub fn cache_config(&self) -> DecisionCacheConfig {
        let settings = &self.cache;
        DecisionCacheConfig {
            enabled: settings.enabled,
            max_capacity: settings.max_capacity,
            default_ttl: Duration::from_millis(settings.default_ttl_ms),
            max_ttl: Duration::from_millis(settings.max_ttl_ms),
            high_flush_interval: Duration::from_millis(settings.high_flush_interval_ms),
            medium_flush_interval: Duration::from_millis(settings.medium_flush_interval_ms),
            low_flush_interval: Duration::from_millis(settings.low_flush_interval_ms),
            hot_key_capacity: settings.hot_key_capacity,
            tag_epoch_retention: Duration::from_millis(settings.tag_epoch_retention_ms),
        }
    }

    pub fn boundary_config(&self) -> BoundaryConfig {
        BoundaryConfig {
            membership_ttl: Duration::from_millis(self.boundary.membership_ttl_ms),
            capacity: self.boundary.capacity,
            lookup_timeout: Duration::from_millis(self.boundary.lookup_timeout_ms),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(self.breaker.failure_threshold)
            .with_failure_window(Duration::from_millis(self.breaker.failure_window_ms))
            .with_cooldown(Duration::from_millis(self.breaker.cooldown_ms))
    }

    pub fn adaptive_config(&self) -> AdaptiveConfig {
        let settings = &self.adaptive;
        AdaptiveConfig {
            enabled: settings.enabled,
            target_hit_rate: settings.target_hit_rate,
            min_samples: settings.min_samples,
            evaluation_interval: Duration::from_millis(settings.evaluation_interval_ms),
            warm_batch_size: settings.warm_batch_size,
            eviction_rate_threshold: settings.eviction_rate_threshold,
        }
    }
}

// `__` separates nested keys: RSPERM_CACHE__MAX_CAPACITY -> cache.max_capacity
fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}
