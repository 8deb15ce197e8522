//! External direct-to-consumer spend and revenue feed.
//!
//! Supplied by the paid-media connectors outside this pipeline. Entries are
//! keyed per (date, market) so unified ROAS never mixes currencies.

use crate::row::{Market, PartitionKey};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// DTC ad spend and revenue for one (date, market), in the market's currency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DtcSpend {
    pub activity_date: NaiveDate,
    pub market: Market,
    pub external_dtc_spend: f64,
    pub external_dtc_revenue: f64,
}

/// Source of DTC figures consulted by the halo calculator.
pub trait DtcFeed: Send + Sync {
    fn lookup(&self, key: PartitionKey) -> Option<DtcSpend>;
}

/// In-memory feed, usually loaded from a JSON array of [`DtcSpend`].
#[derive(Debug, Default)]
pub struct StaticDtcFeed {
    entries: HashMap<PartitionKey, DtcSpend>,
}

impl StaticDtcFeed {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a feed; duplicate keys are summed.
    pub fn from_entries(entries: Vec<DtcSpend>) -> Result<Self> {
        let mut feed = Self::default();
        for entry in entries {
            if !(entry.external_dtc_spend >= 0.0 && entry.external_dtc_revenue >= 0.0) {
                bail!(
                    "DTC entry {} {} has negative or invalid figures",
                    entry.activity_date,
                    entry.market
                );
            }
            let key = PartitionKey::new(entry.activity_date, entry.market);
            feed.entries
                .entry(key)
                .and_modify(|existing| {
                    existing.external_dtc_spend += entry.external_dtc_spend;
                    existing.external_dtc_revenue += entry.external_dtc_revenue;
                })
                .or_insert(entry);
        }
        Ok(feed)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read DTC feed {}", path.display()))?;
        let entries: Vec<DtcSpend> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse DTC feed {}", path.display()))?;
        Self::from_entries(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DtcFeed for StaticDtcFeed {
    fn lookup(&self, key: PartitionKey) -> Option<DtcSpend> {
        self.entries.get(&key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dtc.json");
        std::fs::write(
            &path,
            r#"[
                {"activity_date": "2026-01-15", "market": "US",
                 "external_dtc_spend": 5000.0, "external_dtc_revenue": 20000.0},
                {"activity_date": "2026-01-15", "market": "CA",
                 "external_dtc_spend": 700.0, "external_dtc_revenue": 2100.0}
            ]"#,
        )
        .unwrap();

        let feed = StaticDtcFeed::load_json(&path).unwrap();
        assert_eq!(feed.len(), 2);
        let us = feed
            .lookup(PartitionKey::new(date("2026-01-15"), Market::Us))
            .unwrap();
        assert_eq!(us.external_dtc_spend, 5000.0);
        assert!(feed
            .lookup(PartitionKey::new(date("2026-01-15"), Market::Mx))
            .is_none());
    }

    #[test]
    fn test_duplicate_entries_are_summed() {
        let entry = |spend| DtcSpend {
            activity_date: date("2026-01-15"),
            market: Market::Us,
            external_dtc_spend: spend,
            external_dtc_revenue: spend * 2.0,
        };
        let feed = StaticDtcFeed::from_entries(vec![entry(100.0), entry(50.0)]).unwrap();
        let merged = feed
            .lookup(PartitionKey::new(date("2026-01-15"), Market::Us))
            .unwrap();
        assert_eq!(merged.external_dtc_spend, 150.0);
        assert_eq!(merged.external_dtc_revenue, 300.0);
    }

    #[test]
    fn test_negative_spend_is_rejected() {
        let entry = DtcSpend {
            activity_date: date("2026-01-15"),
            market: Market::Us,
            external_dtc_spend: -1.0,
            external_dtc_revenue: 0.0,
        };
        assert!(StaticDtcFeed::from_entries(vec![entry]).is_err());
    }

    #[test]
    fn test_unknown_market_in_feed_fails_to_parse() {
        let json = r#"[{"activity_date": "2026-01-15", "market": "BR",
                        "external_dtc_spend": 1.0, "external_dtc_revenue": 1.0}]"#;
        assert!(serde_json::from_str::<Vec<DtcSpend>>(json).is_err());
    }
}
