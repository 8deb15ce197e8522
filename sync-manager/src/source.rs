use crate::auth::TokenManager;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use retail_halo::config::{AttributionConfig, ChannelMap};
use retail_halo::credentials::UpstreamApi;
use retail_halo::{CanonicalRow, DateRange, Market, MarketTotals, SyncError};
use serde::{Deserialize, Serialize};

/// Everything a source needs to fetch one market over one date range.
pub struct FetchContext<'a> {
    pub tokens: &'a TokenManager,
    pub retry: &'a RetryPolicy,
    pub market: Market,
    pub range: DateRange,
}

/// Static lookups used while mapping upstream records.
pub struct TransformContext<'a> {
    pub channels: &'a ChannelMap,
    pub attribution: &'a AttributionConfig,
    pub market: Market,
    pub range: DateRange,
}

/// A record dropped during transformation, with the reason.
#[derive(Clone, Debug)]
pub struct RejectedRecord {
    pub source: String,
    pub reason: SyncError,
}

/// Canonical output of one source for one (market, range).
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub ad_rows: Vec<CanonicalRow>,
    pub totals: Vec<MarketTotals>,
    pub rejected: Vec<RejectedRecord>,
}

impl TransformOutput {
    pub fn merge(&mut self, other: TransformOutput) {
        self.ad_rows.extend(other.ad_rows);
        self.totals.extend(other.totals);
        self.rejected.extend(other.rejected);
    }
}

/// Today's figures for one campaign, as reported so far.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct CampaignStats {
    pub campaign_id: String,
    #[serde(default)]
    pub campaign_name: String,
    #[serde(default)]
    pub today_ad_spend: f64,
    #[serde(default)]
    pub today_impressions: u64,
    #[serde(default)]
    pub today_clicks: u64,
    #[serde(default)]
    pub daily_budget: Option<f64>,
    #[serde(default, alias = "dailyRemainingBudget")]
    pub remaining_budget: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Near real-time snapshot of the current day. Informational only: never
/// written to the sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "camelCase"))]
pub struct RealtimeStats {
    #[serde(default)]
    pub as_of: Option<String>,
    #[serde(default)]
    pub campaigns: Vec<CampaignStats>,
}

impl RealtimeStats {
    pub fn today_ad_spend(&self) -> f64 {
        self.campaigns.iter().map(|c| c.today_ad_spend).sum()
    }
}

/// Raw upstream records held between fetching and transforming.
pub trait RecordBatch: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps every record to canonical form. Records that cannot be mapped
    /// land in `rejected`; they never fail the batch.
    fn transform(self: Box<Self>, ctx: &TransformContext<'_>) -> TransformOutput;
}

/// Upstream reporting source.
///
/// The orchestrator treats every source alike: fetch raw records for a
/// (market, range), then transform them into ad rows or market totals.
///
/// # Lifecycle
/// 1. Orchestrator primes a token for [`DataSource::api`]
/// 2. [`DataSource::fetch`] pages through the upstream report, retrying
///    transient failures per page
/// 3. [`RecordBatch::transform`] maps the raw records
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use retail_halo::credentials::UpstreamApi;
/// use retail_halo::SyncError;
/// use sync_manager::source::{
///     DataSource, FetchContext, RecordBatch, TransformContext, TransformOutput,
/// };
///
/// struct Empty;
///
/// impl RecordBatch for Empty {
///     fn len(&self) -> usize {
///         0
///     }
///     fn transform(self: Box<Self>, _: &TransformContext<'_>) -> TransformOutput {
///         TransformOutput::default()
///     }
/// }
///
/// struct NullSource;
///
/// #[async_trait]
/// impl DataSource for NullSource {
///     fn name(&self) -> &str {
///         "null"
///     }
///
///     fn api(&self) -> UpstreamApi {
///         UpstreamApi::Sales
///     }
///
///     async fn fetch(&self, _: &FetchContext<'_>) -> Result<Box<dyn RecordBatch>, SyncError> {
///         Ok(Box::new(Empty))
///     }
/// }
/// ```
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Lowercase identifier used in logs and the run summary.
    fn name(&self) -> &str;

    /// Upstream API this source authenticates against.
    fn api(&self) -> UpstreamApi;

    /// Fetches all records for `ctx.market` over `ctx.range`.
    ///
    /// # Error Handling
    /// - Transient failures are retried per page with backoff
    /// - 401 invalidates the cached token before the retry
    /// - Non-retryable failures, or exhausted retries, are returned
    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Box<dyn RecordBatch>, SyncError>;

    /// Today's running figures for `ctx.market`, for sources that have them.
    async fn realtime_stats(
        &self,
        _ctx: &FetchContext<'_>,
    ) -> Result<Option<RealtimeStats>, SyncError> {
        Ok(None)
    }
}
