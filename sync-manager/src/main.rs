use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use retail_halo::config::{load_config, HaloConfig};
use retail_halo::credentials::{ClientCredentials, TokenStore, UpstreamApi};
use retail_halo::dtc::StaticDtcFeed;
use retail_halo::sink::SqliteRowSink;
use std::sync::Arc;
use sync_manager::connectors::{advertising, build_http_client, sales};
use sync_manager::{get_all_sources, RetryPolicy, RunState, SyncOrchestrator, TokenManager};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "halo_sync=info,sync_manager=info,retail_halo=info".into()),
        )
        .init();

    info!("Halo sync starting...");

    // Read configuration from environment
    let config = match std::env::var("HALO_CONFIG") {
        Ok(path) => load_config(&path)?,
        Err(_) => {
            let config = HaloConfig::default();
            config.validate()?;
            config
        }
    };

    let sync_date = match std::env::var("HALO_SYNC_DATE") {
        Ok(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .with_context(|| format!("HALO_SYNC_DATE must be YYYY-MM-DD, got '{}'", raw))?,
        Err(_) => Utc::now().date_naive(),
    };

    info!(
        sync_date = %sync_date,
        markets = ?config.sync.markets,
        lookback_days = config.sync.lookback_days,
        sink = %config.sink.path.display(),
        "Configuration loaded"
    );

    let retry = RetryPolicy::from(&config.retry);
    let http_client = build_http_client(std::time::Duration::from_secs(
        config.advertising.request_timeout_secs,
    ))?;
    let mut tokens = TokenManager::new(http_client, retry)
        .register(
            UpstreamApi::Advertising,
            advertising::config::oauth_config(&config.advertising),
            ClientCredentials::from_env(UpstreamApi::Advertising)?,
        )
        .register(
            UpstreamApi::Sales,
            sales::config::oauth_config(&config.sales),
            ClientCredentials::from_env(UpstreamApi::Sales)?,
        );

    // Token cache is optional; without it every run exchanges fresh tokens
    if let Ok(token_db) = std::env::var("HALO_TOKEN_DB") {
        let encryption_key = std::env::var("HALO_ENCRYPTION_KEY")
            .context("HALO_ENCRYPTION_KEY is required with HALO_TOKEN_DB (base64-encoded 32-byte key)")?;
        let store = TokenStore::new(&token_db, &encryption_key)
            .context("Failed to initialize token store")?;
        tokens = tokens.with_store(Arc::new(store));
        info!(token_db = %token_db, "Token store initialized");
    }

    let sink = SqliteRowSink::new(&config.sink.path).context("Failed to open row sink")?;
    let dtc = match &config.dtc.path {
        Some(path) => StaticDtcFeed::load_json(path)?,
        None => StaticDtcFeed::empty(),
    };
    info!(dtc_entries = dtc.len(), "DTC feed loaded");

    let sources = get_all_sources(&config)?;
    let orchestrator = SyncOrchestrator::new(
        config,
        sources,
        Arc::new(tokens),
        Arc::new(sink),
        Arc::new(dtc),
    )?;

    let summary = orchestrator.run(sync_date).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize run summary")?
    );

    if summary.state == RunState::Failed {
        anyhow::bail!(
            "sync run {} failed: {}",
            summary.run_id,
            summary
                .fatal_error
                .as_deref()
                .unwrap_or("no partition could be upserted")
        );
    }
    Ok(())
}
