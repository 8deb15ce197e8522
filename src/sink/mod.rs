//! Idempotent persistence of canonical rows and halo metrics.
//!
//! A write replaces the whole partition: rows keyed by [`RowKey`] that the new
//! [`PartitionOutput`] no longer carries are removed, and so are the halo
//! metrics of a gap partition. Writing the same output twice leaves the store
//! unchanged.

use crate::attribution::{HaloMetrics, PartitionOutput};
use crate::row::{CanonicalRow, PartitionKey, RowKey};
use anyhow::Result;
use dashmap::DashMap;

mod sqlite;

pub use sqlite::SqliteRowSink;

/// Destination for computed partitions.
pub trait RowSink: Send + Sync {
    /// Replaces the rows and halo metrics of one partition atomically.
    ///
    /// Returns the number of rows written.
    fn upsert_partition(&self, output: &PartitionOutput) -> Result<usize>;
}

/// In-memory sink keyed like the SQLite tables. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryRowSink {
    rows: DashMap<RowKey, CanonicalRow>,
    halo: DashMap<PartitionKey, HaloMetrics>,
}

impl MemoryRowSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &RowKey) -> Option<CanonicalRow> {
        self.rows.get(key).map(|row| row.value().clone())
    }

    pub fn halo(&self, key: PartitionKey) -> Option<HaloMetrics> {
        self.halo.get(&key).map(|metrics| metrics.value().clone())
    }

    /// All rows ordered by key.
    pub fn rows(&self) -> Vec<CanonicalRow> {
        let mut rows: Vec<CanonicalRow> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by_key(|row| row.key());
        rows
    }

    pub fn rows_for(&self, partition: PartitionKey) -> Vec<CanonicalRow> {
        let mut rows: Vec<CanonicalRow> = self
            .rows
            .iter()
            .filter(|r| r.value().partition() == partition)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|row| row.key());
        rows
    }
}

impl RowSink for MemoryRowSink {
    fn upsert_partition(&self, output: &PartitionOutput) -> Result<usize> {
        self.rows.retain(|_, row| row.partition() != output.key);
        for row in &output.rows {
            self.rows.insert(row.key(), row.clone());
        }
        match &output.halo {
            Some(halo) => {
                self.halo.insert(output.key, halo.clone());
            }
            None => {
                self.halo.remove(&output.key);
            }
        }
        Ok(output.rows.len())
    }
}

impl<T: RowSink + ?Sized> RowSink for std::sync::Arc<T> {
    fn upsert_partition(&self, output: &PartitionOutput) -> Result<usize> {
        (**self).upsert_partition(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::compute_partition;
    use crate::row::{ChannelGroup, Market, MarketTotals};
    use chrono::NaiveDate;

    fn key() -> PartitionKey {
        PartitionKey::new(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(), Market::Ca)
    }

    fn ad_row(campaign: &str, online: f64) -> CanonicalRow {
        CanonicalRow {
            activity_date: key().activity_date,
            campaign_id: Some(campaign.to_string()),
            campaign_name: campaign.to_string(),
            market: Market::Ca,
            currency_code: "CAD".to_string(),
            cost: 50.0,
            impressions: 1000,
            clicks: 10,
            revenue: online,
            conversions: 2,
            in_store_attributed_sales: 0.0,
            online_attributed_sales: online,
            new_to_brand_sales: 0.0,
            new_to_brand_orders: 0,
            channel_group: ChannelGroup::SponsoredBrands,
            is_drain: false,
            is_boost: true,
            roas: None,
            ctr: None,
            cpc: None,
        }
        .with_derived_metrics()
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let sink = MemoryRowSink::new();
        let totals = MarketTotals::from_sales(key(), 1200.0, 10, 14);
        let output = compute_partition(key(), Vec::new(), Some(totals), None).unwrap();

        assert_eq!(sink.upsert_partition(&output).unwrap(), 1);
        let first = sink.rows();
        sink.upsert_partition(&output).unwrap();

        assert_eq!(sink.rows(), first);
        assert_eq!(sink.len(), 1);
        assert_eq!(first[0].currency_code, "CAD");
        assert!(sink.halo(key()).is_some());
    }

    #[test]
    fn test_later_write_overwrites() {
        let sink = MemoryRowSink::new();
        let early = MarketTotals::from_sales(key(), 1000.0, 10, 10);
        let late = MarketTotals::from_sales(key(), 1500.0, 12, 12);
        sink.upsert_partition(&compute_partition(key(), Vec::new(), Some(early), None).unwrap())
            .unwrap();
        sink.upsert_partition(&compute_partition(key(), Vec::new(), Some(late), None).unwrap())
            .unwrap();

        let rows = sink.rows_for(key());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].revenue, 1500.0);
        assert_eq!(sink.halo(key()).unwrap().total_marketplace_sales, 1500.0);
    }

    #[test]
    fn test_gap_partition_replaces_previous_rows() {
        let sink = MemoryRowSink::new();
        let totals = MarketTotals::from_sales(key(), 1000.0, 10, 10);
        sink.upsert_partition(&compute_partition(key(), Vec::new(), Some(totals), None).unwrap())
            .unwrap();
        assert_eq!(sink.rows_for(key()).len(), 1);

        let gap = compute_partition(key(), Vec::new(), None, None).unwrap();
        assert_eq!(sink.upsert_partition(&gap).unwrap(), 0);
        assert!(sink.rows_for(key()).is_empty());
        assert!(sink.halo(key()).is_none());
    }

    #[test]
    fn test_dropped_campaign_is_removed() {
        let sink = MemoryRowSink::new();
        let totals = MarketTotals::from_sales(key(), 1000.0, 10, 10);
        let first = compute_partition(
            key(),
            vec![ad_row("CMP-A", 200.0), ad_row("CMP-B", 100.0)],
            Some(totals.clone()),
            None,
        )
        .unwrap();
        sink.upsert_partition(&first).unwrap();
        assert_eq!(sink.rows_for(key()).len(), 3);

        let second =
            compute_partition(key(), vec![ad_row("CMP-A", 200.0)], Some(totals), None).unwrap();
        sink.upsert_partition(&second).unwrap();

        let rows = sink.rows_for(key());
        assert_eq!(rows.len(), 2);
        let ad_revenue: f64 = rows.iter().filter(|r| !r.is_organic()).map(|r| r.revenue).sum();
        let organic = rows.iter().find(|r| r.is_organic()).unwrap();
        assert_eq!(ad_revenue + organic.revenue, 1000.0);
        assert_eq!(sink.halo(key()).unwrap().organic_revenue, 800.0);
    }

    #[test]
    fn test_other_partitions_untouched() {
        let sink = MemoryRowSink::new();
        let other = PartitionKey::new(key().activity_date, Market::Us);
        for partition in [key(), other] {
            let totals = MarketTotals::from_sales(partition, 500.0, 5, 5);
            sink.upsert_partition(
                &compute_partition(partition, Vec::new(), Some(totals), None).unwrap(),
            )
            .unwrap();
        }
        sink.upsert_partition(&compute_partition(key(), Vec::new(), None, None).unwrap())
            .unwrap();

        assert_eq!(sink.rows_for(other).len(), 1);
        assert!(sink.halo(other).is_some());
    }
}
