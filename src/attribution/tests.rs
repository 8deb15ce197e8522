use super::*;
use crate::row::{ChannelGroup, Market, ORGANIC_CAMPAIGN_KEY};
use chrono::NaiveDate;

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn key() -> PartitionKey {
    PartitionKey::new(date("2026-01-15"), Market::Us)
}

fn ad_row(campaign: &str, cost: f64, in_store: f64, online: f64, conversions: u64) -> CanonicalRow {
    CanonicalRow {
        activity_date: date("2026-01-15"),
        campaign_id: Some(campaign.to_string()),
        campaign_name: format!("{} name", campaign),
        market: Market::Us,
        currency_code: "USD".to_string(),
        cost,
        impressions: 10000,
        clicks: 300,
        revenue: round_cents(in_store + online),
        conversions,
        in_store_attributed_sales: in_store,
        online_attributed_sales: online,
        new_to_brand_sales: 0.0,
        new_to_brand_orders: 0,
        channel_group: ChannelGroup::SponsoredProducts,
        is_drain: false,
        is_boost: true,
        roas: None,
        ctr: None,
        cpc: None,
    }
    .with_derived_metrics()
}

fn totals(sales: f64, orders: u64) -> MarketTotals {
    MarketTotals::from_sales(key(), sales, orders, orders * 2)
}

#[test]
fn test_organic_is_marketplace_minus_ad_revenue() {
    let rows = vec![ad_row("CMP-SP-001", 2456.78, 4558.64, 13675.92, 120)];
    let out = compute_partition(key(), rows, Some(totals(100000.0, 900)), None).unwrap();

    let organic = out.organic_row().expect("organic row");
    assert_eq!(organic.revenue, 81765.44);
    assert_eq!(organic.conversions, 780);
    assert_eq!(organic.campaign_key(), ORGANIC_CAMPAIGN_KEY);
    assert!(organic.is_drain);
    assert!(!organic.is_boost);
    assert_eq!(organic.cost, 0.0);
    assert!(!out.clamped);
    assert!(out.gap.is_none());
    assert_eq!(out.rows.len(), 2);
}

#[test]
fn test_organic_clamped_at_zero_is_not_a_gap() {
    let rows = vec![ad_row("CMP-SP-001", 1000.0, 5000.0, 10000.0, 50)];
    let out = compute_partition(key(), rows, Some(totals(10000.0, 40)), None).unwrap();

    let organic = out.organic_row().unwrap();
    assert_eq!(organic.revenue, 0.0);
    assert_eq!(organic.conversions, 0);
    assert!(out.clamped);
    assert!(out.gap.is_none());
    assert!(out.halo.is_some());
}

#[test]
fn test_missing_totals_emit_gap_and_keep_ad_rows() {
    let rows = vec![
        ad_row("CMP-SP-001", 100.0, 200.0, 300.0, 5),
        ad_row("CMP-SB-002", 50.0, 0.0, 150.0, 2),
    ];
    let out = compute_partition(key(), rows, None, None).unwrap();

    assert!(out.organic_row().is_none());
    assert!(out.halo.is_none());
    assert!(!out.clamped);
    assert_eq!(out.ad_rows().count(), 2);
    let gap = out.gap.expect("gap warning");
    assert_eq!(gap.key, key());
}

#[test]
fn test_duplicate_campaign_rows_collapse_last_wins() {
    let rows = vec![
        ad_row("CMP-SP-001", 100.0, 200.0, 300.0, 5),
        ad_row("CMP-SP-001", 120.0, 250.0, 350.0, 6),
    ];
    let out = compute_partition(key(), rows, Some(totals(5000.0, 50)), None).unwrap();

    assert_eq!(out.duplicates_collapsed, 1);
    let ads: Vec<_> = out.ad_rows().collect();
    assert_eq!(ads.len(), 1);
    assert_eq!(ads[0].cost, 120.0);
    assert_eq!(out.organic_row().unwrap().revenue, 4400.0);
}

#[test]
fn test_no_ad_rows_makes_all_sales_organic() {
    let out = compute_partition(key(), Vec::new(), Some(totals(2500.5, 12)), None).unwrap();

    assert_eq!(out.rows.len(), 1);
    assert_eq!(out.organic_row().unwrap().revenue, 2500.5);
    let halo = out.halo.unwrap();
    assert_eq!(halo.platform_roas, None);
    assert_eq!(halo.halo_multiplier, None);
    assert_eq!(halo.unified_roas, None);
    assert_eq!(halo.average_order_value, Some(208.38));
}

#[test]
fn test_no_orders_leaves_average_order_value_unset() {
    let out = compute_partition(key(), Vec::new(), Some(totals(0.0, 0)), None).unwrap();
    let halo = out.halo.unwrap();
    assert_eq!(halo.total_units, 0);
    assert_eq!(halo.average_order_value, None);
}

#[test]
fn test_halo_metrics_without_dtc() {
    let rows = vec![ad_row("CMP-SP-001", 2456.78, 4558.64, 13675.92, 120)];
    let out = compute_partition(key(), rows, Some(totals(100000.0, 900)), None).unwrap();
    let halo = out.halo.unwrap();

    assert!(!halo.dtc_available);
    assert_eq!(halo.currency_code, "USD");
    assert_eq!(halo.total_ad_attributed_revenue, 18234.56);
    assert_eq!(halo.total_ad_spend, 2456.78);
    assert_eq!(halo.organic_revenue, 81765.44);
    assert_eq!(halo.total_orders, 900);
    assert_eq!(halo.total_units, 1800);
    assert_eq!(halo.average_order_value, Some(111.11));

    let platform = halo.platform_roas.unwrap();
    assert!((platform - 7.422).abs() < 1e-3);
    let unified = halo.unified_roas.unwrap();
    assert!((unified - 100000.0 / 2456.78).abs() < 1e-9);
    let multiplier = halo.halo_multiplier.unwrap();
    assert!((multiplier - 100000.0 / 18234.56).abs() < 1e-9);
}

#[test]
fn test_unified_roas_includes_dtc() {
    let rows = vec![ad_row("CMP-SP-001", 2000.0, 4000.0, 6000.0, 80)];
    let dtc = DtcSpend {
        activity_date: date("2026-01-15"),
        market: Market::Us,
        external_dtc_spend: 3000.0,
        external_dtc_revenue: 15000.0,
    };
    let out = compute_partition(key(), rows, Some(totals(50000.0, 400)), Some(dtc)).unwrap();
    let halo = out.halo.unwrap();

    assert!(halo.dtc_available);
    assert_eq!(halo.unified_roas, Some(65000.0 / 5000.0));
    assert_eq!(halo.external_dtc_revenue, 15000.0);
}

#[test]
fn test_rows_from_another_partition_are_rejected() {
    let mut row = ad_row("CMP-SP-001", 10.0, 10.0, 10.0, 1);
    row.market = Market::Ca;
    row.currency_code = "CAD".to_string();
    let err = compute_partition(key(), vec![row], Some(totals(100.0, 1)), None).unwrap_err();
    assert!(matches!(err, SyncError::InconsistentRecord(_)));
}

#[test]
fn test_invalid_row_fails_whole_partition() {
    let mut row = ad_row("CMP-SP-001", 10.0, 10.0, 10.0, 1);
    row.online_attributed_sales = 50.0;
    assert!(compute_partition(key(), vec![row], Some(totals(100.0, 1)), None).is_err());
}

#[test]
fn test_totals_for_wrong_partition_are_rejected() {
    let other = MarketTotals::from_sales(PartitionKey::new(date("2026-01-14"), Market::Us), 1.0, 1, 1);
    assert!(compute_partition(key(), Vec::new(), Some(other), None).is_err());
}

#[test]
fn test_recompute_is_deterministic() {
    let rows = || {
        vec![
            ad_row("CMP-SB-002", 50.0, 0.0, 150.0, 2),
            ad_row("CMP-SP-001", 100.0, 200.0, 300.0, 5),
        ]
    };
    let first = compute_partition(key(), rows(), Some(totals(5000.0, 50)), None).unwrap();
    let second = compute_partition(key(), rows(), Some(totals(5000.0, 50)), None).unwrap();
    assert_eq!(first, second);
}
