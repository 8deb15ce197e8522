use super::api::SaleRecord;
use crate::source::{RejectedRecord, TransformOutput};
use chrono::NaiveDate;
use retail_halo::row::round_cents;
use retail_halo::{DateRange, Market, MarketTotals, PartitionKey, SyncError};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

fn reject(output: &mut TransformOutput, reason: SyncError) {
    output.rejected.push(RejectedRecord {
        source: "sales".to_string(),
        reason,
    });
}

/// Checks one sales record against the requested market and range.
///
/// `Ok(None)` means the record belongs elsewhere and is skipped; `Err` means
/// it belongs to this market but its figures cannot be trusted.
fn check_sale(
    record: &SaleRecord,
    market: Market,
    range: DateRange,
) -> Result<Option<MarketTotals>, SyncError> {
    let record_market: Market = record.market.parse()?;
    if record_market != market || !range.contains(record.date) {
        return Ok(None);
    }
    if !record.total_sales.is_finite()
        || record.total_sales < 0.0
        || record.order_count < 0
        || record.units_sold < 0
    {
        return Err(SyncError::InconsistentRecord(format!(
            "{} {}: totalSales {} orderCount {} unitsSold {}",
            record.date, record.market, record.total_sales, record.order_count, record.units_sold
        )));
    }
    Ok(Some(MarketTotals::from_sales(
        PartitionKey::new(record.date, market),
        record.total_sales,
        record.order_count as u64,
        record.units_sold as u64,
    )))
}

/// Sums sales records into one [`MarketTotals`] per day, ordered by date.
///
/// Records for other markets or outside `range` are dropped. A day with an
/// invalid record gets no totals at all, so it surfaces as a data gap rather
/// than an understated total.
pub fn aggregate_daily_totals(
    records: &[SaleRecord],
    market: Market,
    range: DateRange,
) -> TransformOutput {
    let mut output = TransformOutput::default();
    let mut days: BTreeMap<NaiveDate, MarketTotals> = BTreeMap::new();
    let mut poisoned: BTreeSet<NaiveDate> = BTreeSet::new();

    for record in records {
        match check_sale(record, market, range) {
            Ok(Some(totals)) => {
                days.entry(record.date)
                    .and_modify(|day| day.merge_sales(&totals))
                    .or_insert(totals);
            }
            Ok(None) => {
                warn!(
                    market = %market,
                    date = %record.date,
                    record_market = %record.market,
                    "Dropping sales record outside the requested partition"
                );
                reject(
                    &mut output,
                    SyncError::InconsistentRecord(format!(
                        "{} {} outside {} {}",
                        record.date, record.market, market, range
                    )),
                );
            }
            Err(e) => {
                warn!(market = %market, date = %record.date, error = %e, "Dropping sales record");
                if !matches!(e, SyncError::UnknownMarket(_)) {
                    poisoned.insert(record.date);
                }
                reject(&mut output, e);
            }
        }
    }

    for (date, mut totals) in days {
        if poisoned.contains(&date) {
            continue;
        }
        totals.total_marketplace_sales = round_cents(totals.total_marketplace_sales);
        output.totals.push(totals);
    }
    output
}
