//! Organic and halo attribution per (date, market) partition.
//!
//! Runs once per partition, after every ad row for that partition has been
//! fetched and transformed. Marketplace sales are the anchor: whatever the
//! ad platform does not claim is organic.
//!
//! ```text
//!   ad rows ──► Σ revenue / conversions / spend ─┐
//!                                                ├─► organic = max(0, sales − ad revenue)
//!   marketplace totals ──────────────────────────┘         │
//!                                                          ▼
//!   DTC feed ──► unified ROAS = (dtc revenue + sales) / (dtc spend + ad spend)
//! ```

use crate::dtc::DtcSpend;
use crate::error::SyncError;
use crate::row::{check_row, ratio, round_cents, CanonicalRow, MarketTotals, PartitionKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// Marketplace totals were missing for a partition, so no organic row exists.
///
/// Non-fatal: ad rows for the partition are still upserted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataGapWarning {
    pub key: PartitionKey,
    pub reason: String,
}

/// Partition-level attribution signals, in the market's currency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HaloMetrics {
    pub key: PartitionKey,
    pub currency_code: String,
    pub total_marketplace_sales: f64,
    pub total_orders: u64,
    pub total_units: u64,
    pub total_ad_attributed_revenue: f64,
    pub total_ad_attributed_conversions: u64,
    pub total_ad_spend: f64,
    pub organic_revenue: f64,
    pub organic_conversions: u64,
    pub external_dtc_spend: f64,
    pub external_dtc_revenue: f64,
    /// Whether the DTC feed had an entry for this partition
    pub dtc_available: bool,
    /// Ad-attributed revenue / ad spend
    pub platform_roas: Option<f64>,
    /// (DTC revenue + marketplace sales) / (DTC spend + ad spend)
    pub unified_roas: Option<f64>,
    /// Marketplace sales / ad-attributed revenue
    pub halo_multiplier: Option<f64>,
    /// Marketplace sales / orders, in cents
    pub average_order_value: Option<f64>,
}

/// Complete, internally consistent output for one partition.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionOutput {
    pub key: PartitionKey,
    /// Ad rows followed by the organic row, if any
    pub rows: Vec<CanonicalRow>,
    pub halo: Option<HaloMetrics>,
    pub gap: Option<DataGapWarning>,
    /// Ad attribution exceeded marketplace sales and organic was clamped to 0
    pub clamped: bool,
    /// Ad rows dropped because a later row had the same key
    pub duplicates_collapsed: usize,
}

impl PartitionOutput {
    pub fn organic_row(&self) -> Option<&CanonicalRow> {
        self.rows.iter().find(|row| row.is_organic())
    }

    pub fn ad_rows(&self) -> impl Iterator<Item = &CanonicalRow> {
        self.rows.iter().filter(|row| !row.is_organic())
    }
}

/// Sums ad figures for a partition into its marketplace totals.
pub fn with_ad_totals(mut totals: MarketTotals, ad_rows: &[CanonicalRow]) -> MarketTotals {
    let (revenue, conversions, spend) =
        ad_rows
            .iter()
            .fold((0.0, 0u64, 0.0), |(revenue, conversions, spend), row| {
                (
                    revenue + row.revenue,
                    conversions + row.conversions,
                    spend + row.cost,
                )
            });
    totals.total_ad_attributed_revenue = round_cents(revenue);
    totals.total_ad_attributed_conversions = conversions;
    totals.total_ad_spend = round_cents(spend);
    totals
}

/// Computes the organic row and halo metrics for one partition.
///
/// - `ad_rows` must all belong to `key`; duplicates by campaign are collapsed
///   with the last one winning.
/// - `sales` of `None` is an upstream gap: no organic row, a
///   [`DataGapWarning`], ad rows still emitted.
/// - Organic revenue and conversions are clamped at zero; a clamp is not a gap.
///
/// Fails without emitting anything if any row breaks a row invariant.
pub fn compute_partition(
    key: PartitionKey,
    ad_rows: Vec<CanonicalRow>,
    sales: Option<MarketTotals>,
    dtc: Option<DtcSpend>,
) -> Result<PartitionOutput, SyncError> {
    let received = ad_rows.len();
    let mut by_campaign: BTreeMap<String, CanonicalRow> = BTreeMap::new();
    for row in ad_rows {
        if row.partition() != key {
            return Err(SyncError::InconsistentRecord(format!(
                "row for {} handed to partition {}",
                row.partition(),
                key
            )));
        }
        if row.is_organic() {
            return Err(SyncError::InconsistentRecord(format!(
                "organic row supplied as ad input for {}",
                key
            )));
        }
        check_row(&row)?;
        by_campaign.insert(row.campaign_key().to_string(), row);
    }
    let duplicates_collapsed = received - by_campaign.len();
    if duplicates_collapsed > 0 {
        warn!(
            partition = %key,
            duplicates = duplicates_collapsed,
            "Collapsed duplicate ad rows"
        );
    }
    let mut rows: Vec<CanonicalRow> = by_campaign.into_values().collect();

    let Some(sales) = sales else {
        debug!(partition = %key, ad_rows = rows.len(), "Marketplace totals missing");
        return Ok(PartitionOutput {
            key,
            rows,
            halo: None,
            gap: Some(DataGapWarning {
                key,
                reason: "marketplace sales totals missing".to_string(),
            }),
            clamped: false,
            duplicates_collapsed,
        });
    };

    if sales.partition() != key {
        return Err(SyncError::InconsistentRecord(format!(
            "totals for {} handed to partition {}",
            sales.partition(),
            key
        )));
    }

    let totals = with_ad_totals(sales, &rows);
    let residual = totals.total_marketplace_sales - totals.total_ad_attributed_revenue;
    let organic_revenue = round_cents(residual.max(0.0));
    let organic_conversions = totals
        .total_orders
        .saturating_sub(totals.total_ad_attributed_conversions);
    let clamped = residual < 0.0 || totals.total_ad_attributed_conversions > totals.total_orders;
    if clamped {
        debug!(
            partition = %key,
            marketplace_sales = totals.total_marketplace_sales,
            ad_revenue = totals.total_ad_attributed_revenue,
            "Ad attribution exceeds marketplace sales, organic clamped to zero"
        );
    }

    let organic = CanonicalRow::organic(key, organic_revenue, organic_conversions);
    check_row(&organic)?;
    rows.push(organic);

    let (dtc_spend, dtc_revenue, dtc_available) = match &dtc {
        Some(entry) => (entry.external_dtc_spend, entry.external_dtc_revenue, true),
        None => (0.0, 0.0, false),
    };

    let halo = HaloMetrics {
        key,
        currency_code: key.market.currency_code().to_string(),
        total_marketplace_sales: totals.total_marketplace_sales,
        total_orders: totals.total_orders,
        total_units: totals.total_units,
        total_ad_attributed_revenue: totals.total_ad_attributed_revenue,
        total_ad_attributed_conversions: totals.total_ad_attributed_conversions,
        total_ad_spend: totals.total_ad_spend,
        organic_revenue,
        organic_conversions,
        external_dtc_spend: dtc_spend,
        external_dtc_revenue: dtc_revenue,
        dtc_available,
        platform_roas: ratio(totals.total_ad_attributed_revenue, totals.total_ad_spend),
        unified_roas: ratio(
            dtc_revenue + totals.total_marketplace_sales,
            dtc_spend + totals.total_ad_spend,
        ),
        halo_multiplier: ratio(
            totals.total_marketplace_sales,
            totals.total_ad_attributed_revenue,
        ),
        average_order_value: ratio(totals.total_marketplace_sales, totals.total_orders as f64)
            .map(round_cents),
    };

    Ok(PartitionOutput {
        key,
        rows,
        halo: Some(halo),
        gap: None,
        clamped,
        duplicates_collapsed,
    })
}
