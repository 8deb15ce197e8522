pub mod api;
pub mod config;
pub mod transformer;

use crate::source::{
    DataSource, FetchContext, RealtimeStats, RecordBatch, TransformContext, TransformOutput,
};
use async_trait::async_trait;
use retail_halo::config::ApiConfig;
use retail_halo::credentials::UpstreamApi;
use retail_halo::SyncError;

use self::api::{AdRecord, AdvertisingClient};
use self::transformer::transform_records;

/// Advertising connector: pulls campaign performance from the snapshot
/// report and emits one canonical ad row per (date, campaign, market).
pub struct AdvertisingSource {
    client: AdvertisingClient,
}

impl AdvertisingSource {
    pub fn new(config: &ApiConfig) -> Result<Self, SyncError> {
        Ok(Self {
            client: AdvertisingClient::new(config)?,
        })
    }
}

/// Raw snapshot records awaiting transformation.
pub struct AdBatch(pub Vec<AdRecord>);

impl RecordBatch for AdBatch {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn transform(self: Box<Self>, ctx: &TransformContext<'_>) -> TransformOutput {
        transform_records(&self.0, ctx)
    }
}

#[async_trait]
impl DataSource for AdvertisingSource {
    fn name(&self) -> &str {
        "advertising"
    }

    fn api(&self) -> UpstreamApi {
        UpstreamApi::Advertising
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Box<dyn RecordBatch>, SyncError> {
        let records = self.client.fetch_ad_performance(ctx).await?;
        Ok(Box::new(AdBatch(records)))
    }

    async fn realtime_stats(
        &self,
        ctx: &FetchContext<'_>,
    ) -> Result<Option<RealtimeStats>, SyncError> {
        self.client.fetch_realtime_stats(ctx).await.map(Some)
    }
}
