use super::config::{SNAPSHOT_PATH, STATS_PATH};
use crate::connectors::{build_http_client, get_json, report_date, with_cursor};
use crate::retry::with_retry;
use crate::source::{FetchContext, RealtimeStats};
use chrono::NaiveDate;
use reqwest::Client;
use retail_halo::config::ApiConfig;
use retail_halo::credentials::UpstreamApi;
use retail_halo::SyncError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

const API: UpstreamApi = UpstreamApi::Advertising;

/// Campaign-level performance for one day, 14-day attribution window.
///
/// Numeric fields default to 0 when absent. Counts are signed so that a
/// negative value reaches the transformer and is rejected there.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdRecord {
    #[serde(deserialize_with = "report_date")]
    pub date: NaiveDate,
    #[serde(deserialize_with = "string_or_number")]
    pub campaign_id: String,
    #[serde(default)]
    pub campaign_name: String,
    pub ad_format: String,
    pub market: String,
    #[serde(default)]
    pub ad_spend: f64,
    #[serde(default)]
    pub impressions: i64,
    #[serde(default)]
    pub clicks: i64,
    #[serde(default)]
    pub attributed_sales_14d: f64,
    #[serde(default)]
    pub in_store_attributed_sales_14d: f64,
    #[serde(default)]
    pub online_attributed_sales_14d: f64,
    #[serde(default)]
    pub in_store_attributed_units_14d: i64,
    #[serde(default)]
    pub online_attributed_units_14d: i64,
    #[serde(default)]
    pub new_to_brand_sales_14d: f64,
    #[serde(default)]
    pub new_to_brand_orders_14d: i64,
}

/// One page of the snapshot report.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPage {
    #[serde(default)]
    pub records: Vec<AdRecord>,
    #[serde(default)]
    pub next_continuation_token: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// HTTP client for the advertising snapshot report.
///
/// Requests are bounded by a semaphore of `max_in_flight` permits shared by
/// every partition of a run.
pub struct AdvertisingClient {
    http_client: Client,
    base_url: String,
    page_size: u32,
    limiter: Arc<Semaphore>,
}

impl AdvertisingClient {
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
            "{}{}?market={}&startDate={}&endDate={}&pageSize={}",
            self.base_url,
            SNAPSHOT_PATH,
            ctx.market,
            ctx.range.start.format("%Y-%m-%d"),
            ctx.range.end.format("%Y-%m-%d"),
            self.page_size
        );
        with_cursor(url, "continuationToken", cursor)
    }

    /// Fetches today's running campaign figures for `ctx.market`.
    pub async fn fetch_realtime_stats(
        &self,
        ctx: &FetchContext<'_>,
    ) -> Result<RealtimeStats, SyncError> {
        let url = format!("{}{}?market={}", self.base_url, STATS_PATH, ctx.market);
        let stats: RealtimeStats =
            with_retry(ctx.retry, API, "realtime stats", |_| self.limited_get(ctx, &url))
                .await?;

        debug!(
            market = %ctx.market,
            campaigns = stats.campaigns.len(),
            today_ad_spend = stats.today_ad_spend(),
            "Fetched realtime stats"
        );
        Ok(stats)
    }

    /// One GET under a limiter permit. No retries.
    async fn limited_get<T: DeserializeOwned>(
        &self,
        ctx: &FetchContext<'_>,
        url: &str,
    ) -> Result<T, SyncError> {
        let _permit = self.limiter.acquire().await.map_err(|e| SyncError::Network {
            api: API,
            reason: e.to_string(),
        })?;
        get_json(&self.http_client, ctx, API, url).await
    }

    /// Fetches a single page. No retries.
    pub async fn fetch_page(
        &self,
        ctx: &FetchContext<'_>,
        cursor: Option<&str>,
    ) -> Result<SnapshotPage, SyncError> {
        self.limited_get(ctx, &self.page_url(ctx, cursor)).await
    }

    /// Pages through the snapshot report for `ctx.market` over `ctx.range`.
    ///
    /// A failed page is retried with the same continuation token; pages
    /// already received are kept.
    pub async fn fetch_ad_performance(
        &self,
        ctx: &FetchContext<'_>,
    ) -> Result<Vec<AdRecord>, SyncError> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let page = with_retry(ctx.retry, API, "ad snapshot page", |_| {
                self.fetch_page(ctx, cursor.as_deref())
            })
            .await?;
            pages += 1;
            records.extend(page.records);

            match page.next_continuation_token.filter(|t| !t.is_empty()) {
                Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                    return Err(SyncError::Decode {
                        api: API,
                        reason: format!("continuation token '{}' repeated", next),
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
            "Fetched ad performance"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenManager;
    use crate::connectors::advertising::config::oauth_config;
    use crate::retry::RetryPolicy;
    use mockito::{Server, ServerGuard};
    use retail_halo::credentials::ClientCredentials;
    use retail_halo::{DateRange, Market};

    const PAGE_1: &str =
        "/api/v1/reports/snapshot?market=US&startDate=2026-01-15&endDate=2026-01-15&pageSize=2";

    fn api_config(server: &ServerGuard) -> ApiConfig {
        ApiConfig {
            base_url: server.url(),
            token_url: format!("{}/token", server.url()),
            page_size: 2,
            max_in_flight: 2,
            request_timeout_secs: 5,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            rate_limit_multiplier: 1,
            max_retry_after: Duration::from_millis(5),
        }
    }

    fn tokens(config: &ApiConfig) -> TokenManager {
        TokenManager::new(Client::new(), RetryPolicy::none()).register(
            API,
            oauth_config(config),
            ClientCredentials {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                account_id: "ADV-1".to_string(),
            },
        )
    }

    async fn mock_token(server: &mut ServerGuard, token: &str) -> mockito::Mock {
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(format!(r#"{{"access_token":"{}","expires_in":3600}}"#, token))
            .create_async()
            .await
    }

    fn record_json(campaign: &str) -> String {
        format!(
            r#"{{"date":"2026-01-15","campaignId":"{}","campaignName":"Golf","adFormat":"SPONSORED_PRODUCTS",
                "market":"US","adSpend":10.5,"impressions":1000,"clicks":20,"attributedSales14d":50.0,
                "inStoreAttributedSales14d":20.0,"onlineAttributedSales14d":30.0}}"#,
            campaign
        )
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
    }

    #[tokio::test]
    async fn test_follows_continuation_tokens() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server, "tok").await;
        let page_1 = server
            .mock("GET", PAGE_1)
            .match_header("authorization", "Bearer tok")
            .match_header("x-advertiser-id", "ADV-1")
            .with_status(200)
            .with_body(format!(
                r#"{{"records":[{},{}],"nextContinuationToken":"abc/2"}}"#,
                record_json("1"),
                record_json("2")
            ))
            .create_async()
            .await;
        let page_2 = server
            .mock("GET", format!("{}&continuationToken=abc%2F2", PAGE_1).as_str())
            .with_status(200)
            .with_body(format!(
                r#"{{"records":[{}],"nextContinuationToken":null}}"#,
                record_json("3")
            ))
            .create_async()
            .await;

        let config = api_config(&server);
        let client = AdvertisingClient::new(&config).unwrap();
        let tokens = tokens(&config);
        let retry = fast_retry();
        let ctx = FetchContext {
            tokens: &tokens,
            retry: &retry,
            market: Market::Us,
            range: DateRange::single(date()),
        };

        let records = client.fetch_ad_performance(&ctx).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.campaign_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(records[0].in_store_attributed_sales_14d, 20.0);
        assert_eq!(records[0].new_to_brand_orders_14d, 0);
        page_1.assert_async().await;
        page_2.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limited_page_is_retried() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server, "tok").await;
        let limited = server
            .mock("GET", PAGE_1)
            .with_status(429)
            .with_header("Retry-After", "0")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", PAGE_1)
            .with_status(200)
            .with_body(format!(r#"{{"records":[{}]}}"#, record_json("1")))
            .expect(1)
            .create_async()
            .await;

        let config = api_config(&server);
        let client = AdvertisingClient::new(&config).unwrap();
        let tokens = tokens(&config);
        let retry = fast_retry();
        let ctx = FetchContext {
            tokens: &tokens,
            retry: &retry,
            market: Market::Us,
            range: DateRange::single(date()),
        };

        let records = client.fetch_ad_performance(&ctx).await.unwrap();
        assert_eq!(records.len(), 1);
        limited.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_401_invalidates_token_and_retries() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server, "tok").await;
        let _rejected = server
            .mock("GET", PAGE_1)
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let _ok = server
            .mock("GET", PAGE_1)
            .with_status(200)
            .with_body(r#"{"records":[]}"#)
            .create_async()
            .await;

        let config = api_config(&server);
        let client = AdvertisingClient::new(&config).unwrap();
        let tokens = tokens(&config);
        let retry = fast_retry();
        let ctx = FetchContext {
            tokens: &tokens,
            retry: &retry,
            market: Market::Us,
            range: DateRange::single(date()),
        };

        assert!(client.fetch_ad_performance(&ctx).await.unwrap().is_empty());
        assert_eq!(tokens.exchange_count(API), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server, "tok").await;
        let bad = server
            .mock("GET", PAGE_1)
            .with_status(400)
            .with_body(r#"{"error":"bad market"}"#)
            .expect(1)
            .create_async()
            .await;

        let config = api_config(&server);
        let client = AdvertisingClient::new(&config).unwrap();
        let tokens = tokens(&config);
        let retry = fast_retry();
        let ctx = FetchContext {
            tokens: &tokens,
            retry: &retry,
            market: Market::Us,
            range: DateRange::single(date()),
        };

        let err = client.fetch_ad_performance(&ctx).await.unwrap_err();
        assert!(matches!(err, SyncError::Upstream { status: 400, .. }));
        bad.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_realtime_stats() {
        let mut server = Server::new_async().await;
        let _token = mock_token(&mut server, "tok").await;
        let stats = server
            .mock("GET", "/api/v1/stats?market=US")
            .match_header("authorization", "Bearer tok")
            .match_header("x-advertiser-id", "ADV-1")
            .with_status(200)
            .with_body(
                r#"{"advertiserId":"ADV-1","asOf":"2026-01-15T14:05:00Z","campaigns":[
                    {"campaignId":"CMP-SP-001","campaignName":"Drivers","todayAdSpend":2456.78,
                     "todayImpressions":125000,"todayClicks":3750,"dailyBudget":5000.0,
                     "dailyRemainingBudget":2543.22,"status":"ENABLED"},
                    {"campaignId":"CMP-SB-001","todayAdSpend":1234.56}
                ]}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let config = api_config(&server);
        let client = AdvertisingClient::new(&config).unwrap();
        let tokens = tokens(&config);
        let retry = RetryPolicy::none();
        let ctx = FetchContext {
            tokens: &tokens,
            retry: &retry,
            market: Market::Us,
            range: DateRange::single(date()),
        };

        let realtime = client.fetch_realtime_stats(&ctx).await.unwrap();
        stats.assert_async().await;
        assert_eq!(realtime.as_of.as_deref(), Some("2026-01-15T14:05:00Z"));
        assert_eq!(realtime.campaigns.len(), 2);
        let drivers = &realtime.campaigns[0];
        assert_eq!(drivers.today_impressions, 125000);
        assert_eq!(drivers.today_clicks, 3750);
        assert_eq!(drivers.daily_budget, Some(5000.0));
        assert_eq!(drivers.remaining_budget, Some(2543.22));
        assert_eq!(realtime.campaigns[1].remaining_budget, None);
        assert!((realtime.today_ad_spend() - 3691.34).abs() < 1e-9);
    }

    #[test]
    fn test_record_accepts_timestamp_and_numeric_id() {
        let json = r#"{"date":"2026-01-15T23:30:00Z","campaignId":98765,"adFormat":"VIDEO","market":"MX"}"#;
        let record: AdRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.date, date());
        assert_eq!(record.campaign_id, "98765");
        assert_eq!(record.ad_spend, 0.0);
        assert_eq!(record.campaign_name, "");
    }

    #[test]
    fn test_record_rejects_garbage_date() {
        let json = r#"{"date":"yesterday","campaignId":"1","adFormat":"VIDEO","market":"US"}"#;
        assert!(serde_json::from_str::<AdRecord>(json).is_err());
    }
}
