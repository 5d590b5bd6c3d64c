// Layered configuration: optional file, then LOBX__* environment variables
use std::net::IpAddr;
use std::path::Path;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use tokio::time::Duration;

use crate::dispatch::{QueryWeights, WorkerLimits};

pub const DEFAULT_CONFIG_FILE: &str = "lobx-feed";

/// Durations are written as integer milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub venue: VenueConfig,
    pub instruments: Vec<String>,
    pub listener: ListenerConfig,
    pub dispatch: DispatchConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            venue: VenueConfig::default(),
            instruments: vec!["ETH".to_string()],
            listener: ListenerConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Load from `path` (or `lobx-feed.{toml,json,yaml}` in the working directory when absent),
    /// then apply environment overrides such as `LOBX__LISTENER__STALE_FEED_MS=60000`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Self::from_builder(Config::builder().add_source(file))
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let env = Environment::with_prefix("LOBX")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("instruments")
            .try_parsing(true);
        let cfg: FeedConfig = builder.add_source(env).build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Message(msg.to_string()));
        if self.instruments.is_empty() {
            return fail("at least one instrument must be configured");
        }
        if self.dispatch.workers.is_empty() {
            return fail("dispatch.workers must not be empty");
        }
        let l = &self.listener;
        if l.heartbeat_check.is_zero() || l.health_check.is_zero() {
            return fail("listener check intervals must be non-zero");
        }
        if l.max_sync_attempts == 0 {
            return fail("listener.max_sync_attempts must be at least 1");
        }
        if l.backoff.initial > l.backoff.max || l.backoff.multiplier < 1.0 {
            return fail("listener.backoff needs initial <= max and multiplier >= 1");
        }
        if l.coarse_depth == Some(0) {
            return fail("listener.coarse_depth must be positive when set");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    pub ws_url: String,
    pub info_url: String,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.hyperliquid.xyz/ws".into(),
            info_url: "https://api.hyperliquid.xyz/info".into(),
        }
    }
}

/// Where the authoritative book snapshot comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Pushed, // the feed sends one after subscribing
    Pulled, // fetched through the market data executor
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "initial_ms", with = "millis")]
    pub initial: Duration,
    #[serde(rename = "max_ms", with = "millis")]
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_millis(250), max: Duration::from_secs(30), multiplier: 2.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    // Emit a heartbeat after this long without any published event
    #[serde(rename = "heartbeat_idle_ms", with = "millis")]
    pub heartbeat_idle: Duration,
    #[serde(rename = "heartbeat_check_ms", with = "millis")]
    pub heartbeat_check: Duration,
    #[serde(rename = "health_check_ms", with = "millis")]
    pub health_check: Duration,
    // Ping when nothing was sent for this long
    #[serde(rename = "keepalive_after_ms", with = "millis")]
    pub keepalive_after: Duration,
    // Resync when nothing was received for this long
    #[serde(rename = "stale_feed_ms", with = "millis")]
    pub stale_feed: Duration,
    #[serde(rename = "trade_flush_ms", with = "millis")]
    pub trade_flush: Duration,
    #[serde(rename = "snapshot_timeout_ms", with = "millis")]
    pub snapshot_timeout: Duration,
    #[serde(rename = "sync_retry_ms", with = "millis")]
    pub sync_retry: Duration,
    pub max_sync_attempts: u32,
    pub snapshot_source: SnapshotSource,
    // Publish fine levels merged with the coarse feed up to this depth
    pub coarse_depth: Option<usize>,
    pub backoff: BackoffConfig,
    pub event_buffer: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            heartbeat_idle: Duration::from_secs(2),
            heartbeat_check: Duration::from_millis(250),
            health_check: Duration::from_secs(5),
            keepalive_after: Duration::from_secs(10),
            stale_feed: Duration::from_secs(30),
            trade_flush: Duration::from_millis(20),
            snapshot_timeout: Duration::from_secs(5),
            sync_retry: Duration::from_millis(200),
            max_sync_attempts: 100,
            snapshot_source: SnapshotSource::Pushed,
            coarse_depth: None,
            backoff: BackoffConfig::default(),
            event_buffer: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    // Egress address to bind outgoing REST connections to; None = OS default route
    pub local_address: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    pub workers: Vec<WorkerConfig>,
    pub limits: WorkerLimits,
    pub weights: QueryWeights,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            workers: vec![WorkerConfig::default()],
            limits: WorkerLimits::default(),
            weights: QueryWeights::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn from_toml(toml: &str) -> Result<FeedConfig, ConfigError> {
        FeedConfig::from_builder(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn test_defaults() {
        let cfg = from_toml("").unwrap();
        assert_eq!(cfg.instruments, vec!["ETH".to_string()]);
        assert_eq!(cfg.listener.heartbeat_idle, Duration::from_secs(2));
        assert_eq!(cfg.listener.keepalive_after, Duration::from_secs(10));
        assert_eq!(cfg.listener.trade_flush, Duration::from_millis(20));
        assert_eq!(cfg.listener.max_sync_attempts, 100);
        assert_eq!(cfg.dispatch.weights.catalog, 20);
        assert_eq!(cfg.dispatch.limits.order_book.capacity, 1200);
    }

    #[test]
    fn test_file_overrides() {
        let cfg = from_toml(
            r#"
            instruments = ["BTC", "SOL"]

            [listener]
            stale_feed_ms = 60000
            snapshot_source = "pulled"
            coarse_depth = 50

            [listener.backoff]
            max_ms = 5000

            [dispatch]
            workers = [{ local_address = "10.0.0.2" }, {}]

            [dispatch.limits.catalog]
            capacity = 10
            window_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.instruments.len(), 2);
        assert_eq!(cfg.listener.stale_feed, Duration::from_secs(60));
        assert_eq!(cfg.listener.snapshot_source, SnapshotSource::Pulled);
        assert_eq!(cfg.listener.coarse_depth, Some(50));
        assert_eq!(cfg.listener.backoff.max, Duration::from_secs(5));
        assert_eq!(cfg.listener.backoff.initial, Duration::from_millis(250));
        assert_eq!(cfg.dispatch.workers.len(), 2);
        assert!(cfg.dispatch.workers[0].local_address.is_some());
        assert_eq!(cfg.dispatch.limits.catalog.capacity, 10);
        assert_eq!(cfg.dispatch.limits.order_book.capacity, 1200);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(from_toml("instruments = []").is_err());
        assert!(from_toml("[listener]\nmax_sync_attempts = 0").is_err());
        assert!(from_toml("[listener.backoff]\ninitial_ms = 9000\nmax_ms = 10").is_err());
    }
}
