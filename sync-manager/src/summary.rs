//! Run-level reporting.
//!
//! A [`RunSummary`] is produced by every run, including aborted ones, and is
//! what the binary prints on exit.

use crate::source::RealtimeStats;
use chrono::{DateTime, NaiveDate, Utc};
use retail_halo::row::ratio;
use retail_halo::{DateRange, Market, PartitionKey, PartitionOutput};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Phase of a run.
///
/// `Idle → Authenticating → Fetching → Transforming → Computing → Upserting`,
/// ending in one of the three terminal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Authenticating,
    Fetching,
    Transforming,
    Computing,
    Upserting,
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::PartiallyFailed | RunState::Failed
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Authenticating => "authenticating",
            RunState::Fetching => "fetching",
            RunState::Transforming => "transforming",
            RunState::Computing => "computing",
            RunState::Upserting => "upserting",
            RunState::Succeeded => "succeeded",
            RunState::PartiallyFailed => "partially_failed",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of one (date, market) partition.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyStatus {
    /// Ad rows and the organic row were upserted.
    Succeeded,
    /// Ad rows were upserted but marketplace totals were missing.
    Gap { reason: String },
    /// Nothing was upserted for this key.
    Failed { reason: String },
    /// Never attempted because the run aborted or the market was halted.
    Skipped { reason: String },
}

impl KeyStatus {
    /// Whether the key's rows reached the sink.
    pub fn is_upserted(&self) -> bool {
        matches!(self, KeyStatus::Succeeded | KeyStatus::Gap { .. })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct KeyReport {
    pub key: PartitionKey,
    #[serde(flatten)]
    pub status: KeyStatus,
    pub ad_rows: usize,
    pub rows_upserted: usize,
    pub rejected_records: usize,
    pub clamped: bool,
    pub duplicates_collapsed: usize,
}

impl KeyReport {
    pub fn new(key: PartitionKey, status: KeyStatus) -> Self {
        Self {
            key,
            status,
            ad_rows: 0,
            rows_upserted: 0,
            rejected_records: 0,
            clamped: false,
            duplicates_collapsed: 0,
        }
    }
}

/// Aggregates over every upserted partition of one market, in its currency.
///
/// Gap days contribute their ad figures but no marketplace or organic revenue.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunTotals {
    pub total_marketplace_revenue: f64,
    pub ad_revenue: f64,
    pub organic_revenue: f64,
    pub in_store_sales: f64,
    pub ad_spend: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub external_dtc_spend: f64,
    pub external_dtc_revenue: f64,
    pub roas: Option<f64>,
    pub unified_roas: Option<f64>,
    pub halo_multiplier: Option<f64>,
}

impl RunTotals {
    pub fn add_partition(&mut self, output: &PartitionOutput) {
        for row in output.ad_rows() {
            self.ad_revenue += row.revenue;
            self.in_store_sales += row.in_store_attributed_sales;
            self.ad_spend += row.cost;
            self.impressions += row.impressions;
            self.clicks += row.clicks;
            self.conversions += row.conversions;
        }
        if let Some(halo) = &output.halo {
            self.total_marketplace_revenue += halo.total_marketplace_sales;
            self.organic_revenue += halo.organic_revenue;
            self.external_dtc_spend += halo.external_dtc_spend;
            self.external_dtc_revenue += halo.external_dtc_revenue;
        }
        self.refresh_ratios();
    }

    fn refresh_ratios(&mut self) {
        self.roas = ratio(self.ad_revenue, self.ad_spend);
        self.unified_roas = ratio(
            self.external_dtc_revenue + self.total_marketplace_revenue,
            self.external_dtc_spend + self.ad_spend,
        );
        self.halo_multiplier = ratio(self.total_marketplace_revenue, self.ad_revenue);
    }
}

/// Everything a run did, serializable for logs and the binary's output.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub sync_date: NaiveDate,
    pub range: DateRange,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub fatal_error: Option<String>,
    pub succeeded: usize,
    pub gaps: usize,
    pub failed: usize,
    pub skipped: usize,
    pub clamped: usize,
    pub rows_upserted: usize,
    pub rejected_records: usize,
    pub keys: Vec<KeyReport>,
    pub totals: BTreeMap<Market, RunTotals>,
    /// Today's running figures per market, where the source reported them
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub realtime_stats: BTreeMap<Market, RealtimeStats>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, sync_date: NaiveDate, range: DateRange) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            sync_date,
            range,
            started_at: now,
            finished_at: now,
            state: RunState::Idle,
            fatal_error: None,
            succeeded: 0,
            gaps: 0,
            failed: 0,
            skipped: 0,
            clamped: 0,
            rows_upserted: 0,
            rejected_records: 0,
            keys: Vec::new(),
            totals: BTreeMap::new(),
            realtime_stats: BTreeMap::new(),
        }
    }

    pub fn key(&self, key: PartitionKey) -> Option<&KeyReport> {
        self.keys.iter().find(|report| report.key == key)
    }

    /// Sorts key reports, fills in the counters and picks the terminal state.
    ///
    /// `Failed` when a fatal error was recorded or no key reached the sink;
    /// `PartiallyFailed` when some did and some did not.
    pub fn finish(mut self) -> Self {
        self.keys.sort_by_key(|report| report.key);
        self.succeeded = 0;
        self.gaps = 0;
        self.failed = 0;
        self.skipped = 0;
        for report in &self.keys {
            match report.status {
                KeyStatus::Succeeded => self.succeeded += 1,
                KeyStatus::Gap { .. } => self.gaps += 1,
                KeyStatus::Failed { .. } => self.failed += 1,
                KeyStatus::Skipped { .. } => self.skipped += 1,
            }
        }
        self.clamped = self.keys.iter().filter(|r| r.clamped).count();
        self.rows_upserted = self.keys.iter().map(|r| r.rows_upserted).sum();
        self.rejected_records = self.keys.iter().map(|r| r.rejected_records).sum();

        let upserted = self.succeeded + self.gaps;
        self.state = if self.fatal_error.is_some() || upserted == 0 {
            RunState::Failed
        } else if upserted < self.keys.len() {
            RunState::PartiallyFailed
        } else {
            RunState::Succeeded
        };
        self.finished_at = Utc::now();
        self
    }
}
