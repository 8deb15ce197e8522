//! SQLite sink behavior across reopen and repeated upserts.

use chrono::NaiveDate;
use retail_halo::row::round_cents;
use retail_halo::sink::{RowSink, SqliteRowSink};
use retail_halo::{
    compute_partition, CanonicalRow, ChannelGroup, Market, MarketTotals, PartitionKey,
};

fn key(day: u32) -> PartitionKey {
    PartitionKey::new(NaiveDate::from_ymd_opt(2026, 1, day).unwrap(), Market::Us)
}

fn ad_row(partition: PartitionKey, campaign: &str, in_store: f64, online: f64) -> CanonicalRow {
    CanonicalRow {
        activity_date: partition.activity_date,
        campaign_id: Some(campaign.to_string()),
        campaign_name: campaign.to_lowercase(),
        market: partition.market,
        currency_code: partition.market.currency_code().to_string(),
        cost: 250.0,
        impressions: 40000,
        clicks: 800,
        revenue: round_cents(in_store + online),
        conversions: 20,
        in_store_attributed_sales: in_store,
        online_attributed_sales: online,
        new_to_brand_sales: 100.0,
        new_to_brand_orders: 4,
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
fn test_repeated_upsert_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("halo.db");
    let sink = SqliteRowSink::new(&path).unwrap();

    let partition = key(10);
    let output = compute_partition(
        partition,
        vec![
            ad_row(partition, "CMP-SB-001", 300.0, 700.0),
            ad_row(partition, "CMP-SB-002", 0.0, 450.25),
        ],
        Some(MarketTotals::from_sales(partition, 9000.0, 120, 150)),
        None,
    )
    .unwrap();

    assert_eq!(sink.upsert_partition(&output).unwrap(), 3);
    let first = sink.load_rows(partition).unwrap();
    assert_eq!(sink.upsert_partition(&output).unwrap(), 3);
    let second = sink.load_rows(partition).unwrap();

    assert_eq!(first, second);
    assert_eq!(sink.count_rows().unwrap(), 3);
    let organic = second.iter().find(|row| row.is_organic()).unwrap();
    assert_eq!(organic.revenue, 7549.75);
}

#[test]
fn test_late_attribution_overwrites_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("halo.db");
    let partition = key(8);
    let totals = MarketTotals::from_sales(partition, 5000.0, 50, 60);

    {
        let sink = SqliteRowSink::new(&path).unwrap();
        let early = compute_partition(
            partition,
            vec![ad_row(partition, "CMP-SB-001", 100.0, 400.0)],
            Some(totals.clone()),
            None,
        )
        .unwrap();
        sink.upsert_partition(&early).unwrap();
    }

    let sink = SqliteRowSink::new(&path).unwrap();
    let late = compute_partition(
        partition,
        vec![ad_row(partition, "CMP-SB-001", 200.0, 900.0)],
        Some(totals),
        None,
    )
    .unwrap();
    sink.upsert_partition(&late).unwrap();

    let rows = sink.load_rows(partition).unwrap();
    assert_eq!(rows.len(), 2);
    let ad = rows.iter().find(|row| !row.is_organic()).unwrap();
    assert_eq!(ad.revenue, 1100.0);
    let organic = rows.iter().find(|row| row.is_organic()).unwrap();
    assert_eq!(organic.revenue, 3900.0);

    let halo = sink.load_halo(partition).unwrap().unwrap();
    assert_eq!(halo.total_ad_attributed_revenue, 1100.0);
    assert_eq!(halo.organic_revenue, 3900.0);
}

#[test]
fn test_partitions_do_not_interfere() {
    let sink = SqliteRowSink::new(":memory:").unwrap();
    for day in [1, 2, 3] {
        let partition = key(day);
        let totals = MarketTotals::from_sales(partition, 1000.0 * f64::from(day), 10, 10);
        let output = compute_partition(partition, Vec::new(), Some(totals), None).unwrap();
        sink.upsert_partition(&output).unwrap();
    }

    assert_eq!(sink.count_rows().unwrap(), 3);
    assert_eq!(sink.load_rows(key(2)).unwrap()[0].revenue, 2000.0);
}

#[test]
fn test_rerun_replaces_partition_rows() {
    let dir = tempfile::tempdir().unwrap();
    let sink = SqliteRowSink::new(dir.path().join("halo.db")).unwrap();
    let partition = key(12);
    let totals = MarketTotals::from_sales(partition, 1000.0, 20, 25);

    let both = compute_partition(
        partition,
        vec![
            ad_row(partition, "CMP-A", 0.0, 200.0),
            ad_row(partition, "CMP-B", 0.0, 100.0),
        ],
        Some(totals.clone()),
        None,
    )
    .unwrap();
    sink.upsert_partition(&both).unwrap();
    assert_eq!(sink.count_rows().unwrap(), 3);

    // CMP-B no longer reported
    let only_a = compute_partition(
        partition,
        vec![ad_row(partition, "CMP-A", 0.0, 200.0)],
        Some(totals),
        None,
    )
    .unwrap();
    sink.upsert_partition(&only_a).unwrap();

    let rows = sink.load_rows(partition).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.campaign_id.as_deref() != Some("CMP-B")));
    let ad_revenue: f64 = rows.iter().filter(|r| !r.is_organic()).map(|r| r.revenue).sum();
    let organic = rows.iter().find(|row| row.is_organic()).unwrap();
    assert_eq!(ad_revenue + organic.revenue, 1000.0);
    assert_eq!(sink.load_halo(partition).unwrap().unwrap().organic_revenue, 800.0);

    // Sales missing on the next run: no organic row, no halo metrics
    let gap = compute_partition(
        partition,
        vec![ad_row(partition, "CMP-A", 0.0, 400.0)],
        None,
        None,
    )
    .unwrap();
    assert_eq!(sink.upsert_partition(&gap).unwrap(), 1);

    let rows = sink.load_rows(partition).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].revenue, 400.0);
    assert!(!rows[0].is_organic());
    assert!(sink.load_halo(partition).unwrap().is_none());
}
