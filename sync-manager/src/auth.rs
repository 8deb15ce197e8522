//! Bearer tokens for the upstream APIs.
//!
//! One cached token per API. The slot's async mutex is held across the
//! exchange, so concurrent callers wait for a single refresh instead of
//! racing their own.

use crate::retry::{with_retry, RetryPolicy};
use crate::types::OAuthConfig;
use chrono::{Duration, Utc};
use reqwest::Client;
use retail_halo::credentials::{BearerToken, ClientCredentials, TokenStore, UpstreamApi};
use retail_halo::SyncError;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct ApiSlot {
    oauth: OAuthConfig,
    credentials: ClientCredentials,
    token: Mutex<Option<BearerToken>>,
    exchanges: AtomicU32,
}

/// Owns the per-API token cache and performs client-credentials exchanges.
pub struct TokenManager {
    http_client: Client,
    slots: HashMap<UpstreamApi, ApiSlot>,
    retry: RetryPolicy,
    store: Option<Arc<TokenStore>>,
}

impl TokenManager {
    pub fn new(http_client: Client, retry: RetryPolicy) -> Self {
        Self {
            http_client,
            slots: HashMap::new(),
            retry,
            store: None,
        }
    }

    /// Registers an API. Replaces any previous registration.
    pub fn register(
        mut self,
        api: UpstreamApi,
        oauth: OAuthConfig,
        credentials: ClientCredentials,
    ) -> Self {
        self.slots.insert(
            api,
            ApiSlot {
                oauth,
                credentials,
                token: Mutex::new(None),
                exchanges: AtomicU32::new(0),
            },
        );
        self
    }

    /// Persists tokens across runs; a still-valid stored token is reused.
    pub fn with_store(mut self, store: Arc<TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn slot(&self, api: UpstreamApi) -> Result<&ApiSlot, SyncError> {
        self.slots
            .get(&api)
            .ok_or_else(|| {
                SyncError::InvalidConfig(format!("no credentials registered for {}", api))
            })
    }

    /// Account id sent alongside data requests for `api`.
    pub fn account(&self, api: UpstreamApi) -> Result<(&str, &str), SyncError> {
        let slot = self.slot(api)?;
        Ok((
            slot.oauth.account_header.as_str(),
            slot.credentials.account_id.as_str(),
        ))
    }

    pub fn apis(&self) -> impl Iterator<Item = UpstreamApi> + '_ {
        self.slots.keys().copied()
    }

    /// Number of token exchanges performed for `api` so far.
    pub fn exchange_count(&self, api: UpstreamApi) -> u32 {
        self.slots
            .get(&api)
            .map_or(0, |slot| slot.exchanges.load(Ordering::SeqCst))
    }

    /// Returns a valid token, exchanging credentials if the cached one is
    /// absent or within the expiry margin.
    pub async fn get_token(&self, api: UpstreamApi) -> Result<BearerToken, SyncError> {
        let slot = self.slot(api)?;
        let mut cached = slot.token.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref().filter(|t| t.is_valid_at(now)) {
            return Ok(token.clone());
        }

        if cached.is_none() {
            if let Some(token) = self.load_stored(api, slot).filter(|t| t.is_valid_at(now)) {
                debug!(api = %api, "Reusing stored bearer token");
                *cached = Some(token.clone());
                return Ok(token);
            }
        }

        let token = with_retry(&self.retry, api, "token exchange", |_| self.exchange(api, slot))
            .await?;

        if let Some(store) = &self.store {
            if let Err(e) = store.store(&slot.credentials.account_id, api, &token) {
                warn!(api = %api, error = %e, "Failed to persist bearer token");
            }
        }

        *cached = Some(token.clone());
        Ok(token)
    }

    /// Drops the cached token if it is still `stale`. A token refreshed by a
    /// concurrent caller in the meantime is kept.
    pub async fn invalidate(&self, api: UpstreamApi, stale: &BearerToken) {
        let Ok(slot) = self.slot(api) else {
            return;
        };
        let mut cached = slot.token.lock().await;
        if cached
            .as_ref()
            .is_some_and(|t| t.access_token == stale.access_token)
        {
            info!(api = %api, "Invalidating rejected bearer token");
            *cached = None;
            if let Some(store) = &self.store {
                if let Err(e) = store.delete(&slot.credentials.account_id, api) {
                    warn!(api = %api, error = %e, "Failed to delete stored bearer token");
                }
            }
        }
    }

    fn load_stored(&self, api: UpstreamApi, slot: &ApiSlot) -> Option<BearerToken> {
        let store = self.store.as_ref()?;
        match store.get(&slot.credentials.account_id, api) {
            Ok(token) => token,
            Err(e) => {
                warn!(api = %api, error = %e, "Failed to read stored bearer token");
                None
            }
        }
    }

    async fn exchange(&self, api: UpstreamApi, slot: &ApiSlot) -> Result<BearerToken, SyncError> {
        slot.exchanges.fetch_add(1, Ordering::SeqCst);
        info!(api = %api, "Exchanging client credentials for bearer token");

        let response = self
            .http_client
            .post(&slot.oauth.token_url)
            .basic_auth(
                &slot.credentials.client_id,
                Some(&slot.credentials.client_secret),
            )
            .header("Accept", "application/json")
            .header(slot.oauth.account_header.as_str(), &slot.credentials.account_id)
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| SyncError::TransientAuth {
                api,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            let reason = format!("HTTP {}: {}", status, body);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                SyncError::TransientAuth { api, reason }
            } else {
                SyncError::Auth { api, reason }
            });
        }

        let token_response: TokenResponse =
            response.json().await.map_err(|e| SyncError::Decode {
                api,
                reason: format!("token response: {}", e),
            })?;

        let expires_in = token_response
            .expires_in
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        Ok(BearerToken {
            access_token: token_response.access_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }
}
