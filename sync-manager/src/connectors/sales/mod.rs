pub mod api;
pub mod config;
pub mod transformer;

use crate::source::{DataSource, FetchContext, RecordBatch, TransformContext, TransformOutput};
use async_trait::async_trait;
use retail_halo::config::ApiConfig;
use retail_halo::credentials::UpstreamApi;
use retail_halo::SyncError;

use self::api::{SaleRecord, SalesClient};
use self::transformer::aggregate_daily_totals;

/// Marketplace sales connector: emits one [`retail_halo::MarketTotals`] per
/// day, covering every order whether or not an ad was attributed to it.
pub struct SalesSource {
    client: SalesClient,
}

impl SalesSource {
    pub fn new(config: &ApiConfig) -> Result<Self, SyncError> {
        Ok(Self {
            client: SalesClient::new(config)?,
        })
    }
}

pub struct SalesBatch(pub Vec<SaleRecord>);

impl RecordBatch for SalesBatch {
    fn len(&self) -> usize {
        self.0.len()
    }

    fn transform(self: Box<Self>, ctx: &TransformContext<'_>) -> TransformOutput {
        aggregate_daily_totals(&self.0, ctx.market, ctx.range)
    }
}

#[async_trait]
impl DataSource for SalesSource {
    fn name(&self) -> &str {
        "sales"
    }

    fn api(&self) -> UpstreamApi {
        UpstreamApi::Sales
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Box<dyn RecordBatch>, SyncError> {
        let records = self.client.fetch_marketplace_sales(ctx).await?;
        Ok(Box::new(SalesBatch(records)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use retail_halo::config::HaloConfig;
    use retail_halo::{DateRange, Market};

    #[test]
    fn test_batch_transform_yields_totals_only() {
        let config = HaloConfig::default();
        let channels = config.channel_map().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let batch: Box<dyn RecordBatch> = Box::new(SalesBatch(vec![SaleRecord {
            date,
            market: "ca".to_string(),
            total_sales: 4200.0,
            order_count: 30,
            units_sold: 41,
        }]));
        assert_eq!(batch.len(), 1);

        let output = batch.transform(&TransformContext {
            channels: &channels,
            attribution: &config.attribution,
            market: Market::Ca,
            range: DateRange::single(date),
        });
        assert!(output.ad_rows.is_empty());
        assert_eq!(output.totals.len(), 1);
        assert_eq!(output.totals[0].market, Market::Ca);
        assert_eq!(output.totals[0].total_orders, 30);
    }

    #[test]
    fn test_source_identity() {
        let source = SalesSource::new(&HaloConfig::default().sales).unwrap();
        assert_eq!(source.name(), "sales");
        assert_eq!(source.api(), UpstreamApi::Sales);
    }
}
