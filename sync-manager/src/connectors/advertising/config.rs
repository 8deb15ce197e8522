use crate::OAuthConfig;
use retail_halo::config::ApiConfig;

pub const SNAPSHOT_PATH: &str = "/api/v1/reports/snapshot";
pub const STATS_PATH: &str = "/api/v1/stats";
pub const ACCOUNT_HEADER: &str = "X-Advertiser-Id";

/// OAuth configuration for the advertising API.
pub fn oauth_config(api: &ApiConfig) -> OAuthConfig {
    OAuthConfig {
        token_url: api.token_url.clone(),
        account_header: ACCOUNT_HEADER.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retail_halo::config::HaloConfig;

    #[test]
    fn test_oauth_config_uses_advertiser_header() {
        let config = HaloConfig::default();
        let oauth = oauth_config(&config.advertising);
        assert_eq!(oauth.account_header, "X-Advertiser-Id");
        assert_eq!(oauth.token_url, config.advertising.token_url);
    }
}
