use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tera::Tera;

use crate::accounting::MemoryAccounting;
use crate::aggregator::{resolve_window, FlowAggregator};
use crate::geo::{GeoCache, IpApiProvider, DEFAULT_BASE_URL, DEFAULT_TIMEOUT};
use crate::models::Granularity;

/// Application configuration from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind_address: String,
    /// Aggregation interval in seconds; non-positive means the 2 s default.
    pub aggregation_interval: i64,
    /// Report at L4 (with ports) instead of L3.
    pub decode_l4: bool,
    /// Base URL of the geolocation API; the address is appended as a path segment.
    pub geoip_base_url: String,
    pub geoip_timeout: Duration,
    /// Recorded snapshots replayed into accounting, if present.
    pub flow_data_path: PathBuf,
    /// How often the recorded snapshots are replayed as a new window.
    pub replay_interval: Duration,
    /// How long accounting windows are kept.
    pub history_retention: Duration,
    /// Cron expression for the accounting prune job.
    pub prune_cron: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8201".into(),
            aggregation_interval: 2,
            decode_l4: true,
            geoip_base_url: DEFAULT_BASE_URL.into(),
            geoip_timeout: DEFAULT_TIMEOUT,
            flow_data_path: PathBuf::from("data/flows.json"),
            replay_interval: Duration::from_secs(1),
            history_retention: Duration::from_secs(300),
            prune_cron: "*/30 * * * * *".into(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates Config from environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_address: env_or("BIND_ADDRESS", defaults.bind_address),
            aggregation_interval: env_or("AGGREGATION_INTERVAL", defaults.aggregation_interval),
            decode_l4: env_or("DECODE_L4", defaults.decode_l4),
            geoip_base_url: env_or("GEOIP_BASE_URL", defaults.geoip_base_url),
            geoip_timeout: Duration::from_secs(env_or(
                "GEOIP_TIMEOUT_SECS",
                defaults.geoip_timeout.as_secs(),
            )),
            flow_data_path: env_or("FLOW_DATA_PATH", defaults.flow_data_path),
            replay_interval: Duration::from_secs(
                env_or("REPLAY_INTERVAL_SECS", defaults.replay_interval.as_secs()).max(1),
            ),
            history_retention: Duration::from_secs(env_or(
                "HISTORY_RETENTION_SECS",
                defaults.history_retention.as_secs(),
            )),
            prune_cron: env_or("PRUNE_CRON", defaults.prune_cron),
        }
    }

    pub fn window(&self) -> Duration {
        resolve_window(self.aggregation_interval)
    }

    pub fn granularity(&self) -> Granularity {
        Granularity::from_decode_l4(self.decode_l4)
    }
}

/// Shared application state passed to all request handlers.
pub struct AppState {
    pub config: Config,
    /// Template engine for rendering HTML pages.
    pub tera: Tera,
    pub accounting: Arc<MemoryAccounting>,
    pub aggregator: FlowAggregator,
    pub geo: GeoCache<IpApiProvider>,
}

impl AppState {
    pub fn new(
        config: Config,
        tera: Tera,
        accounting: Arc<MemoryAccounting>,
        aggregator: FlowAggregator,
        geo: GeoCache<IpApiProvider>,
    ) -> Self {
        Self {
            config,
            tera,
            accounting,
            aggregator,
            geo,
        }
    }
}
