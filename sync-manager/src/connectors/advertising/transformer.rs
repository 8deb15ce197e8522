use super::api::AdRecord;
use crate::source::{RejectedRecord, TransformContext, TransformOutput};
use retail_halo::config::ConversionType;
use retail_halo::row::{check_row, round_cents, SPLIT_TOLERANCE};
use retail_halo::{CanonicalRow, Market, SyncError};
use tracing::warn;

/// Transform one advertising record into a canonical ad row.
///
/// Row key: `{date}/{campaignId}/{market}`
pub fn ad_record_to_row(
    record: &AdRecord,
    ctx: &TransformContext<'_>,
) -> Result<CanonicalRow, SyncError> {
    let inconsistent = |msg: String| {
        SyncError::InconsistentRecord(format!(
            "{} {} {}: {}",
            record.date, record.campaign_id, record.market, msg
        ))
    };

    let market: Market = record.market.parse()?;
    if market != ctx.market {
        return Err(inconsistent(format!("requested market {}", ctx.market)));
    }
    if !ctx.range.contains(record.date) {
        return Err(inconsistent(format!("outside requested range {}", ctx.range)));
    }
    if record.campaign_id.trim().is_empty() {
        return Err(inconsistent("missing campaign id".to_string()));
    }
    let channel_group = ctx.channels.resolve(&record.ad_format)?;

    let money = [
        ("adSpend", record.ad_spend),
        ("attributedSales14d", record.attributed_sales_14d),
        ("inStoreAttributedSales14d", record.in_store_attributed_sales_14d),
        ("onlineAttributedSales14d", record.online_attributed_sales_14d),
        ("newToBrandSales14d", record.new_to_brand_sales_14d),
    ];
    for (name, value) in money {
        if !value.is_finite() || value < 0.0 {
            return Err(inconsistent(format!("{} is {}", name, value)));
        }
    }
    let counts = [
        ("impressions", record.impressions),
        ("clicks", record.clicks),
        ("inStoreAttributedUnits14d", record.in_store_attributed_units_14d),
        ("onlineAttributedUnits14d", record.online_attributed_units_14d),
        ("newToBrandOrders14d", record.new_to_brand_orders_14d),
    ];
    for (name, value) in counts {
        if value < 0 {
            return Err(inconsistent(format!("{} is {}", name, value)));
        }
    }

    let online_enabled = ctx.attribution.counts(ConversionType::Online);
    let in_store_enabled = ctx.attribution.counts(ConversionType::InStore);

    if online_enabled && in_store_enabled {
        let split = record.in_store_attributed_sales_14d + record.online_attributed_sales_14d;
        if (split - record.attributed_sales_14d).abs() > SPLIT_TOLERANCE {
            return Err(inconsistent(format!(
                "attributedSales14d {} disagrees with in-store {} + online {}",
                record.attributed_sales_14d,
                record.in_store_attributed_sales_14d,
                record.online_attributed_sales_14d
            )));
        }
    }

    let (in_store_sales, in_store_units) = if in_store_enabled {
        (
            round_cents(record.in_store_attributed_sales_14d),
            record.in_store_attributed_units_14d as u64,
        )
    } else {
        (0.0, 0)
    };
    let (online_sales, online_units) = if online_enabled {
        (
            round_cents(record.online_attributed_sales_14d),
            record.online_attributed_units_14d as u64,
        )
    } else {
        (0.0, 0)
    };
    let revenue = round_cents(in_store_sales + online_sales);
    let conversions = in_store_units + online_units;

    let row = CanonicalRow {
        activity_date: record.date,
        campaign_id: Some(record.campaign_id.trim().to_string()),
        campaign_name: record.campaign_name.clone(),
        market,
        currency_code: market.currency_code().to_string(),
        cost: round_cents(record.ad_spend),
        impressions: record.impressions as u64,
        clicks: record.clicks as u64,
        revenue,
        conversions,
        in_store_attributed_sales: in_store_sales,
        online_attributed_sales: online_sales,
        new_to_brand_sales: round_cents(record.new_to_brand_sales_14d).min(revenue),
        new_to_brand_orders: (record.new_to_brand_orders_14d as u64).min(conversions),
        channel_group,
        is_drain: channel_group.is_drain(),
        is_boost: channel_group.is_boost(),
        roas: None,
        ctr: None,
        cpc: None,
    }
    .with_derived_metrics();

    check_row(&row)?;
    Ok(row)
}

/// Transform a batch, dropping and logging records that cannot be mapped.
pub fn transform_records(records: &[AdRecord], ctx: &TransformContext<'_>) -> TransformOutput {
    let mut output = TransformOutput::default();
    for record in records {
        match ad_record_to_row(record, ctx) {
            Ok(row) => output.ad_rows.push(row),
            Err(e) => {
                warn!(
                    market = %ctx.market,
                    date = %record.date,
                    campaign_id = %record.campaign_id,
                    error = %e,
                    "Dropping advertising record"
                );
                output.rejected.push(RejectedRecord {
                    source: "advertising".to_string(),
                    reason: e,
                });
            }
        }
    }
    output
}
