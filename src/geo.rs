//! IP geolocation with a permanent in-process cache.
//!
//! Lookups go to ip-api.com (no key required). Results are cached forever,
//! keyed by the literal address string. Failures and non-public addresses
//! are never cached.

use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::FlowVizError;
use crate::models::GeoInfo;

pub const DEFAULT_BASE_URL: &str = "http://ip-api.com/json/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

const FIELDS: &str = "status,message,country,city";

/// External service resolving a public address to a location.
pub trait GeoProvider: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> impl Future<Output = Result<GeoInfo, FlowVizError>> + Send;
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    city: String,
}

/// ip-api.com JSON endpoint.
#[derive(Debug, Clone)]
pub struct IpApiProvider {
    client: reqwest::Client,
    base_url: String,
}

impl IpApiProvider {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FlowVizError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("FlowViz/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self { client, base_url })
    }
}

impl GeoProvider for IpApiProvider {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, FlowVizError> {
        let url = format!("{}{}?fields={}", self.base_url, ip, FIELDS);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(FlowVizError::lookup)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FlowVizError::LookupFailed(format!(
                "api request failed with status: {}",
                status
            )));
        }

        let body: IpApiResponse = resp.json().await.map_err(FlowVizError::lookup)?;
        if body.status == "fail" {
            return Err(FlowVizError::LookupFailed(format!(
                "api error: {}",
                body.message
            )));
        }

        Ok(GeoInfo {
            country: body.country,
            city: body.city,
        })
    }
}

/// Parses `ip_str` and rejects anything that is not publicly routable.
pub fn validate_public_ip(ip_str: &str) -> Result<IpAddr, FlowVizError> {
    let invalid = || FlowVizError::InvalidAddress(ip_str.to_string());
    let ip = ip_str.parse::<IpAddr>().map_err(|_| invalid())?.to_canonical();

    let non_public = match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unique_local() || v6.is_loopback() || v6.is_unspecified(),
    };
    if non_public {
        return Err(invalid());
    }
    Ok(ip)
}

/// Address to location cache in front of a `GeoProvider`.
///
/// The provider is called with no lock held. Two concurrent misses for the
/// same address may both reach the provider; the later insert overwrites an
/// equivalent value.
#[derive(Debug)]
pub struct GeoCache<P> {
    provider: P,
    entries: RwLock<HashMap<String, GeoInfo>>,
}

impl<P: GeoProvider> GeoCache<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves `ip_str`. The cache key is the literal string, while the
    /// provider is queried with the canonical address, so `::ffff:8.8.8.8`
    /// is cached under that spelling but looked up as `8.8.8.8`.
    pub async fn lookup(&self, ip_str: &str) -> Result<GeoInfo, FlowVizError> {
        let ip = validate_public_ip(ip_str)?;

        if let Some(info) = self.cached(ip_str).await {
            return Ok(info);
        }

        debug!("geoip cache miss for {}", ip_str);
        let info = self.provider.lookup(ip).await?;

        let cached = {
            let mut entries = self.entries.write().await;
            entries.insert(ip_str.to_string(), info.clone());
            entries.len()
        };

        info!(
            "geoip lookup for {}, result: {}, {} ({} cached)",
            ip_str, info.country, info.city, cached
        );
        Ok(info)
    }

    pub async fn cached(&self, ip_str: &str) -> Option<GeoInfo> {
        self.entries.read().await.get(ip_str).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
