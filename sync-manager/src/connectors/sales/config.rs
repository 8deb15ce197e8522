use crate::OAuthConfig;
use retail_halo::config::ApiConfig;

pub const SALES_PATH: &str = "/v3/reports/sales";
pub const ACCOUNT_HEADER: &str = "X-Seller-Id";

/// OAuth configuration for the marketplace sales API.
pub fn oauth_config(api: &ApiConfig) -> OAuthConfig {
    OAuthConfig {
        token_url: api.token_url.clone(),
        account_header: ACCOUNT_HEADER.to_string(),
    }
}
