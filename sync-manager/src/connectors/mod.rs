pub mod advertising;
pub mod sales;

use crate::source::FetchContext;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Response, StatusCode};
use retail_halo::credentials::UpstreamApi;
use retail_halo::SyncError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Builds the HTTP client shared by a connector's requests.
pub fn build_http_client(timeout: Duration) -> Result<Client, SyncError> {
    Client::builder()
        .user_agent("halo-sync/0.1")
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::InvalidConfig(format!("failed to build HTTP client: {}", e)))
}

/// One authenticated GET against a report endpoint, decoded as JSON.
///
/// A 401 invalidates the token that was used, so the retry loop picks up a
/// fresh one on its next attempt.
pub(crate) async fn get_json<T: DeserializeOwned>(
    http_client: &Client,
    ctx: &FetchContext<'_>,
    api: UpstreamApi,
    url: &str,
) -> Result<T, SyncError> {
    let token = ctx.tokens.get_token(api).await?;
    let (account_header, account_id) = ctx.tokens.account(api)?;

    let response = http_client
        .get(url)
        .bearer_auth(&token.access_token)
        .header(account_header, account_id)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|e| SyncError::Network {
            api,
            reason: e.to_string(),
        })?;

    if response.status() == StatusCode::UNAUTHORIZED {
        ctx.tokens.invalidate(api, &token).await;
        return Err(SyncError::Unauthorized { api });
    }
    let response = check_response_status(response, api).await?;

    response.json::<T>().await.map_err(|e| {
        if e.is_decode() {
            SyncError::Decode {
                api,
                reason: e.to_string(),
            }
        } else {
            SyncError::Network {
                api,
                reason: e.to_string(),
            }
        }
    })
}

/// Maps non-success statuses to [`SyncError`]s.
///
/// - 429 → rate limit, honoring `Retry-After` (seconds)
/// - 5xx → retryable upstream error
/// - Other non-2xx → non-retryable upstream error
async fn check_response_status(
    response: Response,
    api: UpstreamApi,
) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SyncError::RateLimit { api, retry_after });
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    Err(SyncError::Upstream {
        api,
        status: status.as_u16(),
        body,
    })
}

/// Appends a pagination cursor to a query string, if there is one.
pub(crate) fn with_cursor(url: String, param: &str, cursor: Option<&str>) -> String {
    match cursor {
        Some(cursor) => format!("{}&{}={}", url, param, urlencoding::encode(cursor)),
        None => url,
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp, taken in UTC.
pub(crate) fn report_date<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<NaiveDate, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if let Ok(date) = NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        return Ok(date);
    }
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc).date_naive())
        .map_err(|e| serde::de::Error::custom(format!("invalid report date '{}': {}", raw, e)))
}
