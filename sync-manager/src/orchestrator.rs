//! Daily sync run.
//!
//! A run covers every (date, market) partition of the lookback window and
//! moves through its phases in lockstep:
//!
//! ```text
//! Authenticating   prime one token per upstream API (single-flight)
//!       ↓
//! Fetching         partitions in parallel, ≤ max_parallel_keys at once,
//!       ↓          every source per partition, ≤ max_in_flight per API
//! Transforming     raw records → ad rows + marketplace totals
//!       ↓
//! Computing        organic row and halo metrics per partition
//!       ↓
//! Upserting        one atomic upsert per partition
//! ```
//!
//! Nothing is upserted until every fetch has finished, so a run aborted by a
//! rejected credential leaves the sink untouched. Realtime stats are fetched
//! once per market at the end of the fetch phase; their failure is logged
//! and never affects the run's state.

use crate::auth::TokenManager;
use crate::retry::RetryPolicy;
use crate::source::{
    DataSource, FetchContext, RealtimeStats, RecordBatch, TransformContext, TransformOutput,
};
use crate::summary::{KeyReport, KeyStatus, RunState, RunSummary};
use chrono::NaiveDate;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all};
use futures::stream::{self, StreamExt};
use retail_halo::config::{ChannelMap, HaloConfig};
use retail_halo::credentials::UpstreamApi;
use retail_halo::dtc::DtcFeed;
use retail_halo::sink::RowSink;
use retail_halo::{compute_partition, DateRange, Market, PartitionKey, SyncError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Fetched but untransformed data for one partition.
struct FetchedKey {
    key: PartitionKey,
    batches: Vec<Box<dyn RecordBatch>>,
}

/// Drives one daily run over all configured markets.
pub struct SyncOrchestrator {
    config: HaloConfig,
    markets: Vec<Market>,
    channels: ChannelMap,
    sources: Vec<Arc<dyn DataSource>>,
    tokens: Arc<TokenManager>,
    retry: RetryPolicy,
    sink: Arc<dyn RowSink>,
    dtc: Arc<dyn DtcFeed>,
    state: Mutex<RunState>,
}

impl SyncOrchestrator {
    /// Validates `config` up front; an unknown market or unmapped channel
    /// table fails here, before any request is made.
    pub fn new(
        config: HaloConfig,
        sources: Vec<Arc<dyn DataSource>>,
        tokens: Arc<TokenManager>,
        sink: Arc<dyn RowSink>,
        dtc: Arc<dyn DtcFeed>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        if sources.is_empty() {
            return Err(SyncError::InvalidConfig("no data sources registered".to_string()));
        }
        let markets = config.markets()?;
        let channels = config.channel_map()?;
        let retry = RetryPolicy::from(&config.retry);
        Ok(Self {
            config,
            markets,
            channels,
            sources,
            tokens,
            retry,
            sink,
            dtc,
            state: Mutex::new(RunState::Idle),
        })
    }

    /// Phase of the current or most recent run.
    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, run_id: Uuid, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(run_id = %run_id, from = %*state, to = %next, "Run state transition");
        *state = next;
    }

    /// Partitions covered by a run for `sync_date`, ordered by date then market.
    pub fn partitions(&self, sync_date: NaiveDate) -> (DateRange, Vec<PartitionKey>) {
        let range = DateRange::lookback(sync_date, self.config.sync.lookback_days);
        let keys = range
            .days()
            .flat_map(|date| {
                self.markets
                    .iter()
                    .map(move |market| PartitionKey::new(date, *market))
            })
            .collect();
        (range, keys)
    }

    /// Runs the pipeline for `sync_date` and its lookback window.
    ///
    /// Never returns an error: failures are reported per key, or as the
    /// run's `fatal_error`, in the summary.
    pub async fn run(&self, sync_date: NaiveDate) -> RunSummary {
        let run_id = Uuid::now_v7();
        let (range, keys) = self.partitions(sync_date);
        let mut summary = RunSummary::new(run_id, sync_date, range);

        info!(
            run_id = %run_id,
            sync_date = %sync_date,
            range = %range,
            markets = self.markets.len(),
            partitions = keys.len(),
            "Starting sync run"
        );

        self.enter(run_id, RunState::Authenticating);
        if let Err(e) = self.authenticate(run_id).await {
            error!(run_id = %run_id, error = %e, "Authentication failed, aborting run");
            summary.fatal_error = Some(e.to_string());
            summary.keys = keys
                .into_iter()
                .map(|key| {
                    KeyReport::new(
                        key,
                        KeyStatus::Skipped {
                            reason: "run aborted: authentication failed".to_string(),
                        },
                    )
                })
                .collect();
            return self.finish(summary);
        }

        self.enter(run_id, RunState::Fetching);
        let abort: AtomicBool = AtomicBool::new(false);
        let fatal: Mutex<Option<SyncError>> = Mutex::new(None);
        let halted: DashMap<Market, String> = DashMap::new();

        let results: Vec<Result<FetchedKey, KeyReport>> = stream::iter(keys)
            .map(|key| self.fetch_key(run_id, key, &abort, &fatal, &halted))
            .buffer_unordered(self.config.sync.max_parallel_keys)
            .collect()
            .await;

        let fatal = fatal.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(e) = fatal {
            error!(run_id = %run_id, error = %e, "Credential rejected mid-run, nothing upserted");
            summary.fatal_error = Some(e.to_string());
            summary.keys = results
                .into_iter()
                .map(|result| match result {
                    Ok(fetched) => KeyReport::new(
                        fetched.key,
                        KeyStatus::Skipped {
                            reason: "run aborted before upsert".to_string(),
                        },
                    ),
                    Err(report) => report,
                })
                .collect();
            return self.finish(summary);
        }

        summary.realtime_stats = self.realtime_stats(run_id, sync_date, &halted).await;

        let mut fetched = Vec::new();
        for result in results {
            match result {
                Ok(key) => fetched.push(key),
                Err(report) => summary.keys.push(report),
            }
        }
        fetched.sort_by_key(|f| f.key);

        self.enter(run_id, RunState::Transforming);
        let transformed: Vec<(PartitionKey, TransformOutput)> = fetched
            .into_iter()
            .map(|f| (f.key, self.transform_key(f)))
            .collect();

        self.enter(run_id, RunState::Computing);
        let mut computed = Vec::with_capacity(transformed.len());
        for (key, output) in transformed {
            let rejected = output.rejected.len();
            let ad_rows = output.ad_rows.len();
            let sales = output.totals.into_iter().find(|t| t.partition() == key);
            match compute_partition(key, output.ad_rows, sales, self.dtc.lookup(key)) {
                Ok(partition) => computed.push((partition, rejected)),
                Err(e) => {
                    warn!(
                        run_id = %run_id,
                        partition = %key,
                        error = %e,
                        "Partition computation failed"
                    );
                    let mut report = KeyReport::new(
                        key,
                        KeyStatus::Failed {
                            reason: e.to_string(),
                        },
                    );
                    report.ad_rows = ad_rows;
                    report.rejected_records = rejected;
                    summary.keys.push(report);
                }
            }
        }

        self.enter(run_id, RunState::Upserting);
        for (partition, rejected) in computed {
            let status = match &partition.gap {
                Some(gap) => KeyStatus::Gap {
                    reason: gap.reason.clone(),
                },
                None => KeyStatus::Succeeded,
            };
            let mut report = KeyReport::new(partition.key, status);
            report.ad_rows = partition.ad_rows().count();
            report.rejected_records = rejected;
            report.clamped = partition.clamped;
            report.duplicates_collapsed = partition.duplicates_collapsed;

            match self.sink.upsert_partition(&partition) {
                Ok(written) => {
                    report.rows_upserted = written;
                    if let Some(gap) = &partition.gap {
                        warn!(
                            run_id = %run_id,
                            partition = %gap.key,
                            reason = %gap.reason,
                            "Data gap: ad rows upserted without organic row"
                        );
                    }
                    summary
                        .totals
                        .entry(partition.key.market)
                        .or_default()
                        .add_partition(&partition);
                }
                Err(e) => {
                    error!(
                        run_id = %run_id,
                        partition = %partition.key,
                        error = %e,
                        "Upsert failed"
                    );
                    report.status = KeyStatus::Failed {
                        reason: format!("upsert failed: {:#}", e),
                    };
                }
            }
            summary.keys.push(report);
        }

        self.finish(summary)
    }

    fn finish(&self, summary: RunSummary) -> RunSummary {
        let summary = summary.finish();
        self.enter(summary.run_id, summary.state);
        info!(
            run_id = %summary.run_id,
            state = %summary.state,
            succeeded = summary.succeeded,
            gaps = summary.gaps,
            failed = summary.failed,
            skipped = summary.skipped,
            clamped = summary.clamped,
            rows_upserted = summary.rows_upserted,
            rejected_records = summary.rejected_records,
            "Sync run finished"
        );
        summary
    }

    /// Primes one token per upstream API. Only a rejected credential is
    /// fatal; a transient failure is left for the per-key fetches to retry.
    async fn authenticate(&self, run_id: Uuid) -> Result<(), SyncError> {
        let apis: BTreeSet<UpstreamApi> = self.sources.iter().map(|s| s.api()).collect();
        for api in apis {
            match self.tokens.get_token(api).await {
                Ok(_) => debug!(run_id = %run_id, api = %api, "Bearer token ready"),
                Err(e) if e.is_run_fatal() || matches!(e, SyncError::InvalidConfig(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(run_id = %run_id, api = %api, error = %e, "Could not prime bearer token");
                }
            }
        }
        Ok(())
    }

    /// Fetches every source for one partition. Sources run concurrently; the
    /// first failure fails the whole partition.
    async fn fetch_key(
        &self,
        run_id: Uuid,
        key: PartitionKey,
        abort: &AtomicBool,
        fatal: &Mutex<Option<SyncError>>,
        halted: &DashMap<Market, String>,
    ) -> Result<FetchedKey, KeyReport> {
        if abort.load(Ordering::SeqCst) {
            return Err(KeyReport::new(
                key,
                KeyStatus::Skipped {
                    reason: "run aborted".to_string(),
                },
            ));
        }
        if let Some(reason) = halted.get(&key.market) {
            return Err(KeyReport::new(
                key,
                KeyStatus::Skipped {
                    reason: format!("market {} halted: {}", key.market, reason.value()),
                },
            ));
        }

        let ctx = FetchContext {
            tokens: &self.tokens,
            retry: &self.retry,
            market: key.market,
            range: DateRange::single(key.activity_date),
        };
        let fetches = self.sources.iter().map(|source| {
            let ctx = &ctx;
            async move {
                let batch = source.fetch(ctx).await?;
                debug!(
                    run_id = %run_id,
                    partition = %key,
                    source = source.name(),
                    records = batch.len(),
                    "Fetched partition"
                );
                Ok::<_, SyncError>(batch)
            }
        });

        match try_join_all(fetches).await {
            Ok(batches) => Ok(FetchedKey { key, batches }),
            Err(e) => {
                warn!(run_id = %run_id, partition = %key, error = %e, "Partition fetch failed");
                if e.is_run_fatal() {
                    abort.store(true, Ordering::SeqCst);
                    fatal
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .get_or_insert_with(|| e.clone());
                } else if !e.is_retryable() {
                    halted.entry(key.market).or_insert_with(|| e.to_string());
                }
                Err(KeyReport::new(
                    key,
                    KeyStatus::Failed {
                        reason: e.to_string(),
                    },
                ))
            }
        }
    }

    /// Collects realtime stats for every market that was not halted.
    async fn realtime_stats(
        &self,
        run_id: Uuid,
        sync_date: NaiveDate,
        halted: &DashMap<Market, String>,
    ) -> BTreeMap<Market, RealtimeStats> {
        let markets: Vec<Market> = self
            .markets
            .iter()
            .copied()
            .filter(|market| !halted.contains_key(market))
            .collect();
        let lookups = markets.into_iter().map(|market| async move {
            let ctx = FetchContext {
                tokens: &self.tokens,
                retry: &self.retry,
                market,
                range: DateRange::single(sync_date),
            };
            let mut found = None;
            for source in &self.sources {
                match source.realtime_stats(&ctx).await {
                    Ok(Some(stats)) => {
                        found = Some(stats);
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(
                        run_id = %run_id,
                        market = %market,
                        source = source.name(),
                        error = %e,
                        "Realtime stats unavailable"
                    ),
                }
            }
            found.map(|stats| (market, stats))
        });

        join_all(lookups).await.into_iter().flatten().collect()
    }

    fn transform_key(&self, fetched: FetchedKey) -> TransformOutput {
        let ctx = TransformContext {
            channels: &self.channels,
            attribution: &self.config.attribution,
            market: fetched.key.market,
            range: DateRange::single(fetched.key.activity_date),
        };
        let mut output = TransformOutput::default();
        for batch in fetched.batches {
            output.merge(batch.transform(&ctx));
        }
        if !output.rejected.is_empty() {
            debug!(
                partition = %fetched.key,
                rejected = output.rejected.len(),
                "Records rejected during transformation"
            );
        }
        output
    }
}
