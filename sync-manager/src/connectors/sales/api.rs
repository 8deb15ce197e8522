use super::config::SALES_PATH;
use super::transformer::aggregate_daily_totals;
use crate::connectors::{build_http_client, get_json, report_date, with_cursor};
use crate::retry::with_retry;
use crate::source::FetchContext;
use chrono::NaiveDate;
use reqwest::Client;
use retail_halo::config::ApiConfig;
use retail_halo::credentials::UpstreamApi;
use retail_halo::{MarketTotals, SyncError};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

const API: UpstreamApi = UpstreamApi::Sales;

/// Marketplace sales for one day, all channels, ad-attributed or not.
///
/// A day may be split over several records (e.g. per fulfillment channel).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRecord {
    #[serde(deserialize_with = "report_date")]
    pub date: NaiveDate,
    pub market: String,
    #[serde(default)]
    pub total_sales: f64,
    #[serde(default)]
    pub order_count: i64,
    #[serde(default)]
    pub units_sold: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesPage {
    #[serde(default)]
    pub sales: Vec<SaleRecord>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// HTTP client for the marketplace sales report.
pub struct SalesClient {
    http_client: Client,
    base_url: String,
    page_size: u32,
    limiter: Arc<Semaphore>,
}

impl SalesClient {
    pub fn new(config: &ApiConfig) -> Result<Self, SyncError> {
        Ok(Self {
            http_client: build_http_client(Duration::from_secs(config.request_timeout_secs))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            limiter: Arc::new(Semaphore::new(config.max_in_flight)),
        })
    }

    fn page_url(&self, ctx: &FetchContext<'_>, cursor: Option<&str>) -> String {
        let url = format!(
            "{}{}?market={}&startDate={}&endDate={}&limit={}",
            self.base_url,
            SALES_PATH,
            ctx.market,
            ctx.range.start.format("%Y-%m-%d"),
            ctx.range.end.format("%Y-%m-%d"),
            self.page_size
        );
        with_cursor(url, "nextCursor", cursor)
    }

    pub async fn fetch_page(
        &self,
        ctx: &FetchContext<'_>,
        cursor: Option<&str>,
    ) -> Result<SalesPage, SyncError> {
        let _permit = self.limiter.acquire().await.map_err(|e| SyncError::Network {
            api: API,
            reason: e.to_string(),
        })?;
        get_json(&self.http_client, ctx, API, &self.page_url(ctx, cursor)).await
    }

    /// Pages through the sales report for `ctx.market` over `ctx.range`.
    pub async fn fetch_marketplace_sales(
        &self,
        ctx: &FetchContext<'_>,
    ) -> Result<Vec<SaleRecord>, SyncError> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let page = with_retry(ctx.retry, API, "sales page", |_| {
                self.fetch_page(ctx, cursor.as_deref())
            })
            .await?;
            pages += 1;
            records.extend(page.sales);

            match page.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(SyncError::Decode {
                        api: API,
                        reason: format!("cursor '{}' repeated", next),
                    });
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(
            market = %ctx.market,
            range = %ctx.range,
            pages = pages,
            records = records.len(),
            "Fetched marketplace sales"
        );
        Ok(records)
    }

    /// Daily totals for `ctx.market`, one entry per day that reported sales.
    ///
    /// Days with no usable sales records are absent rather than zero.
    pub async fn fetch_order_totals(
        &self,
        ctx: &FetchContext<'_>,
    ) -> Result<Vec<MarketTotals>, SyncError> {
        let records = self.fetch_marketplace_sales(ctx).await?;
        Ok(aggregate_daily_totals(&records, ctx.market, ctx.range).totals)
    }
}
