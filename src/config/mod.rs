//! TOML configuration for a sync run.
//!
//! Everything here is static lookup data read once at run start. A malformed
//! file fails the run in [`HaloConfig::validate`] before any fetch begins.

use crate::error::SyncError;
use crate::row::{ChannelGroup, Market};
use anyhow::Context;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Upper bound on concurrent requests against one upstream API.
pub const MAX_IN_FLIGHT_PER_API: usize = 5;

/// Complete configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HaloConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub attribution: AttributionConfig,
    /// Upstream ad format → channel group name
    #[serde(default = "default_channels")]
    pub channels: BTreeMap<String, String>,
    #[serde(default = "default_advertising_api")]
    pub advertising: ApiConfig,
    #[serde(default = "default_sales_api")]
    pub sales: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub dtc: DtcConfig,
}

/// Run window and fan-out
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Market codes to sync (US, CA, MX)
    #[serde(default = "default_markets")]
    pub markets: Vec<String>,
    /// Days before the sync date re-fetched to absorb attribution lag
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// (date, market) partitions processed concurrently
    #[serde(default = "default_max_parallel_keys")]
    pub max_parallel_keys: usize,
}

fn default_markets() -> Vec<String> {
    vec!["US".to_string()]
}

fn default_lookback_days() -> u32 {
    7
}

fn default_max_parallel_keys() -> usize {
    8
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            markets: default_markets(),
            lookback_days: default_lookback_days(),
            max_parallel_keys: default_max_parallel_keys(),
        }
    }
}

/// Conversion types counted towards attributed revenue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionType {
    Online,
    InStore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributionConfig {
    #[serde(default = "default_conversion_types")]
    pub conversion_types: Vec<ConversionType>,
}

fn default_conversion_types() -> Vec<ConversionType> {
    vec![ConversionType::Online, ConversionType::InStore]
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            conversion_types: default_conversion_types(),
        }
    }
}

impl AttributionConfig {
    pub fn counts(&self, kind: ConversionType) -> bool {
        self.conversion_types.contains(&kind)
    }
}

fn default_channels() -> BTreeMap<String, String> {
    [
        ("SPONSORED_PRODUCTS", "Sponsored Products"),
        ("SPONSORED_BRANDS", "Sponsored Brands"),
        ("SPONSORED_DISPLAY", "Sponsored Display"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Endpoints and limits for one upstream API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub token_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_page_size() -> u32 {
    500
}

fn default_max_in_flight() -> usize {
    MAX_IN_FLIGHT_PER_API
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_advertising_api() -> ApiConfig {
    ApiConfig {
        base_url: "https://advertising.api.walmart.com".to_string(),
        token_url: "https://marketplace.walmartapis.com/v3/token".to_string(),
        page_size: default_page_size(),
        max_in_flight: default_max_in_flight(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

fn default_sales_api() -> ApiConfig {
    ApiConfig {
        base_url: "https://marketplace.walmartapis.com".to_string(),
        token_url: "https://marketplace.walmartapis.com/v3/token".to_string(),
        page_size: default_page_size(),
        max_in_flight: default_max_in_flight(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

/// Exponential backoff for transient upstream failures
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Extra backoff factor applied to rate-limit responses
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: u32,
    /// Ceiling on a server-sent `Retry-After`
    #[serde(default = "default_max_retry_after_ms")]
    pub max_retry_after_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_rate_limit_multiplier() -> u32 {
    4
}

fn default_max_retry_after_ms() -> u64 {
    300_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
            max_retry_after_ms: default_max_retry_after_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_path")]
    pub path: PathBuf,
}

fn default_sink_path() -> PathBuf {
    PathBuf::from("halo.db")
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            path: default_sink_path(),
        }
    }
}

/// External DTC spend/revenue feed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DtcConfig {
    /// JSON file of per (date, market) spend and revenue
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for HaloConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            attribution: AttributionConfig::default(),
            channels: default_channels(),
            advertising: default_advertising_api(),
            sales: default_sales_api(),
            retry: RetryConfig::default(),
            sink: SinkConfig::default(),
            dtc: DtcConfig::default(),
        }
    }
}

/// Ad format → channel group lookup. Keys are matched case-insensitively.
#[derive(Debug, Clone)]
pub struct ChannelMap {
    entries: HashMap<String, ChannelGroup>,
}

impl ChannelMap {
    /// Fails with `UnmappedChannel` for unrecognized formats; never defaults.
    pub fn resolve(&self, ad_format: &str) -> Result<ChannelGroup, SyncError> {
        self.entries
            .get(&ad_format.trim().to_ascii_uppercase())
            .copied()
            .ok_or_else(|| SyncError::UnmappedChannel(ad_format.to_string()))
    }
}

impl HaloConfig {
    /// Parsed, de-duplicated market list, in configured order.
    pub fn markets(&self) -> Result<Vec<Market>, SyncError> {
        let mut markets = Vec::with_capacity(self.sync.markets.len());
        for code in &self.sync.markets {
            let market: Market = code.parse()?;
            if !markets.contains(&market) {
                markets.push(market);
            }
        }
        Ok(markets)
    }

    pub fn channel_map(&self) -> Result<ChannelMap, SyncError> {
        let mut entries = HashMap::new();
        for (format, group) in &self.channels {
            let group: ChannelGroup = group.parse()?;
            if group == ChannelGroup::Organic {
                return Err(SyncError::InvalidConfig(format!(
                    "ad format '{}' cannot map to the organic channel",
                    format
                )));
            }
            entries.insert(format.trim().to_ascii_uppercase(), group);
        }
        Ok(ChannelMap { entries })
    }

    /// Rejects configuration that would make a run meaningless.
    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |msg: String| Err(SyncError::InvalidConfig(msg));

        if self.markets()?.is_empty() {
            return invalid("sync.markets must list at least one market".to_string());
        }
        if self.sync.lookback_days == 0 || self.sync.lookback_days > 60 {
            return invalid(format!(
                "sync.lookback_days must be within 1..=60, got {}",
                self.sync.lookback_days
            ));
        }
        if self.sync.max_parallel_keys == 0 {
            return invalid("sync.max_parallel_keys must be positive".to_string());
        }
        if self.attribution.conversion_types.is_empty() {
            return invalid("attribution.conversion_types must not be empty".to_string());
        }
        if self.channels.is_empty() {
            return invalid("channels mapping must not be empty".to_string());
        }
        self.channel_map()?;

        for (name, api) in [("advertising", &self.advertising), ("sales", &self.sales)] {
            if api.base_url.is_empty() || api.token_url.is_empty() {
                return invalid(format!("{}: base_url and token_url are required", name));
            }
            if api.page_size == 0 {
                return invalid(format!("{}.page_size must be positive", name));
            }
            if api.max_in_flight == 0 || api.max_in_flight > MAX_IN_FLIGHT_PER_API {
                return invalid(format!(
                    "{}.max_in_flight must be within 1..={}, got {}",
                    name, MAX_IN_FLIGHT_PER_API, api.max_in_flight
                ));
            }
        }

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms exceeds retry.max_delay_ms".to_string());
        }

        Ok(())
    }
}

/// Load and validate configuration from a TOML file
pub fn load_config(path: &str) -> anyhow::Result<HaloConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path))?;
    let config: HaloConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path))?;
    config.validate()?;
    Ok(config)
}
