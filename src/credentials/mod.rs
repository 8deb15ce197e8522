//! Upstream API identities, client credentials and bearer tokens.
//!
//! Bearer tokens can be cached across runs in an encrypted SQLite store so a
//! daily run reuses a still-valid token instead of exchanging a new one.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenStore                         │
//! │  - upsert / get / delete per (account,   │
//! │    api)                                  │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher (AES-256-GCM)          │
//! │  - unique nonce per token                │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!              SQLite database
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use retail_halo::credentials::{BearerToken, TokenStore, UpstreamApi};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let key = std::env::var("HALO_ENCRYPTION_KEY")?;
//! let store = TokenStore::new("tokens.db", &key)?;
//!
//! let token = BearerToken {
//!     access_token: "eyJ...".to_string(),
//!     expires_at: Utc::now() + Duration::hours(1),
//! };
//! store.store("ADV-001", UpstreamApi::Advertising, &token)?;
//! let cached = store.get("ADV-001", UpstreamApi::Advertising)?;
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod storage;

pub use encryption::TokenCipher;
pub use storage::TokenStore;

/// A token is treated as expired this long before its reported expiry.
pub const EXPIRY_MARGIN_SECS: i64 = 300;

/// Upstream API a token is issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamApi {
    Advertising,
    Sales,
}

impl UpstreamApi {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamApi::Advertising => "advertising",
            UpstreamApi::Sales => "sales",
        }
    }

    fn env_prefix(&self) -> String {
        format!("HALO_{}", self.as_str().to_uppercase())
    }
}

impl fmt::Display for UpstreamApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth client-credentials grant inputs for one upstream API.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    /// Advertiser id (advertising API) or seller id (sales API)
    pub account_id: String,
}

impl ClientCredentials {
    /// Loads credentials from the environment:
    /// - `HALO_{API}_CLIENT_ID`
    /// - `HALO_{API}_CLIENT_SECRET`
    /// - `HALO_{API}_ACCOUNT_ID`
    pub fn from_env(api: UpstreamApi) -> Result<Self> {
        let prefix = api.env_prefix();
        let var = |suffix: &str| {
            let name = format!("{}_{}", prefix, suffix);
            std::env::var(&name).with_context(|| format!("{} not set", name))
        };
        Ok(Self {
            client_id: var("CLIENT_ID")?,
            client_secret: var("CLIENT_SECRET")?,
            account_id: var("ACCOUNT_ID")?,
        })
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

/// Bearer token with its absolute expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BearerToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl BearerToken {
    /// Usable at `now`, with [`EXPIRY_MARGIN_SECS`] to spare.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty()
            && now < self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS)
    }
}
