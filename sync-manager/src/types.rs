use serde::{Deserialize, Serialize};

/// OAuth client-credentials configuration for one upstream API.
///
/// # Example
/// ```
/// use sync_manager::OAuthConfig;
///
/// let config = OAuthConfig {
///     token_url: "https://marketplace.walmartapis.com/v3/token".to_string(),
///     account_header: "X-Seller-Id".to_string(),
/// };
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Token exchange endpoint URL
    pub token_url: String,

    /// Header carrying the advertiser or seller id on every request
    pub account_header: String,
}
