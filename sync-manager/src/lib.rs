//! Halo Sync Manager - daily retail-media sync and attribution runs.
//!
//! Pulls campaign performance from the advertising API and order totals from
//! the marketplace sales API, reconciles them into canonical rows, and
//! upserts one partition per (date, market) with its organic row and halo
//! metrics.
//!
//! # Architecture
//!
//! ```text
//! Advertising API          Marketplace sales API
//!          ↓                        ↓
//!     OAuth (client credentials, one token per API)
//!          ↓                        ↓
//! ┌─────────────────────────────────────────┐
//! │       DataSource (per upstream)          │
//! │  - Page through the report               │
//! │  - Transform to ad rows / daily totals   │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       SyncOrchestrator                   │
//! │  - Fan out over (date, market)           │
//! │  - Compute organic + halo metrics        │
//! │  - Upsert each partition atomically      │
//! └─────────────────────────────────────────┘
//!          ↓
//!       RowSink (SQLite)
//! ```
//!
//! # Core Types
//!
//! - [`DataSource`] - Trait every upstream report implements
//! - [`TokenManager`] - Cached, single-flight bearer tokens per API
//! - [`SyncOrchestrator`] - Runs the daily pipeline
//! - [`RunSummary`] - Per-key outcome and run totals
//!
//! # Running a sync
//!
//! ```no_run
//! use retail_halo::config::HaloConfig;
//! use retail_halo::credentials::{ClientCredentials, UpstreamApi};
//! use retail_halo::dtc::StaticDtcFeed;
//! use retail_halo::sink::MemoryRowSink;
//! use std::sync::Arc;
//! use sync_manager::{get_all_sources, RetryPolicy, SyncOrchestrator, TokenManager};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = HaloConfig::default();
//! let tokens = TokenManager::new(reqwest::Client::new(), RetryPolicy::from(&config.retry))
//!     .register(
//!         UpstreamApi::Advertising,
//!         sync_manager::connectors::advertising::config::oauth_config(&config.advertising),
//!         ClientCredentials::from_env(UpstreamApi::Advertising)?,
//!     )
//!     .register(
//!         UpstreamApi::Sales,
//!         sync_manager::connectors::sales::config::oauth_config(&config.sales),
//!         ClientCredentials::from_env(UpstreamApi::Sales)?,
//!     );
//!
//! let orchestrator = SyncOrchestrator::new(
//!     config.clone(),
//!     get_all_sources(&config)?,
//!     Arc::new(tokens),
//!     Arc::new(MemoryRowSink::new()),
//!     Arc::new(StaticDtcFeed::empty()),
//! )?;
//! let summary = orchestrator.run(chrono::Utc::now().date_naive()).await;
//! println!("{}", summary.state);
//! # Ok(())
//! # }
//! ```

mod types;
pub mod auth;
pub mod connectors;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod source;
pub mod summary;

// Re-export public types
pub use auth::TokenManager;
pub use orchestrator::SyncOrchestrator;
pub use registry::get_all_sources;
pub use retry::RetryPolicy;
pub use source::DataSource;
pub use summary::{KeyReport, KeyStatus, RunState, RunSummary, RunTotals};
pub use types::OAuthConfig;
