use super::CanonicalRow;
use crate::error::SyncError;

/// Allowed gap between `in_store + online` and `revenue` on ad rows.
pub const SPLIT_TOLERANCE: f64 = 1e-2;

/// Checks the row-level invariants of the reporting schema.
///
/// Rows failing this check are never handed to a sink.
pub fn check_row(row: &CanonicalRow) -> Result<(), SyncError> {
    let fail = |msg: String| {
        Err(SyncError::InconsistentRecord(format!(
            "{} {} {}: {}",
            row.activity_date,
            row.campaign_key(),
            row.market,
            msg
        )))
    };

    let money = [
        ("cost", row.cost),
        ("revenue", row.revenue),
        ("in_store_attributed_sales", row.in_store_attributed_sales),
        ("online_attributed_sales", row.online_attributed_sales),
        ("new_to_brand_sales", row.new_to_brand_sales),
    ];
    for (name, value) in money {
        if !value.is_finite() || value < 0.0 {
            return fail(format!("{} must be a non-negative number, got {}", name, value));
        }
    }

    if row.currency_code != row.market.currency_code() {
        return fail(format!(
            "currency {} does not match market {}",
            row.currency_code, row.market
        ));
    }

    if row.is_drain == row.is_boost {
        return fail("is_drain and is_boost must differ".to_string());
    }
    if row.is_drain != row.channel_group.is_drain() {
        return fail(format!("drain flag disagrees with {}", row.channel_group));
    }

    if row.is_organic() {
        if row.campaign_id.is_some() || row.cost != 0.0 {
            return fail("organic row must have no campaign and zero cost".to_string());
        }
        return Ok(());
    }

    let split = row.in_store_attributed_sales + row.online_attributed_sales;
    if (split - row.revenue).abs() > SPLIT_TOLERANCE {
        return fail(format!(
            "in-store {} + online {} != revenue {}",
            row.in_store_attributed_sales, row.online_attributed_sales, row.revenue
        ));
    }
    if row.new_to_brand_sales > row.revenue + SPLIT_TOLERANCE {
        return fail("new-to-brand sales exceed revenue".to_string());
    }
    if row.new_to_brand_orders > row.conversions {
        return fail("new-to-brand orders exceed conversions".to_string());
    }

    Ok(())
}
