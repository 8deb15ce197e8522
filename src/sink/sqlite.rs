//! SQLite-backed [`RowSink`].

use super::RowSink;
use crate::attribution::{HaloMetrics, PartitionOutput};
use crate::error::SyncError;
use crate::row::{CanonicalRow, ChannelGroup, Market, PartitionKey};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, Row, Transaction};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Persists rows and halo metrics in two tables.
///
/// # Schema
/// ```sql
/// CREATE TABLE canonical_rows (
///     activity_date TEXT NOT NULL,
///     campaign_key TEXT NOT NULL,     -- campaign id or 'ORGANIC'
///     market TEXT NOT NULL,
///     ...
///     PRIMARY KEY (activity_date, campaign_key, market)
/// );
/// CREATE TABLE halo_metrics (
///     activity_date TEXT NOT NULL,
///     market TEXT NOT NULL,
///     ...
///     PRIMARY KEY (activity_date, market)
/// );
/// ```
pub struct SqliteRowSink {
    conn: Mutex<Connection>,
}

impl SqliteRowSink {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open sink database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS canonical_rows (
                activity_date TEXT NOT NULL,
                campaign_key TEXT NOT NULL,
                campaign_id TEXT,
                campaign_name TEXT NOT NULL,
                market TEXT NOT NULL,
                currency_code TEXT NOT NULL,
                cost REAL NOT NULL,
                impressions INTEGER NOT NULL,
                clicks INTEGER NOT NULL,
                revenue REAL NOT NULL,
                conversions INTEGER NOT NULL,
                in_store_attributed_sales REAL NOT NULL,
                online_attributed_sales REAL NOT NULL,
                new_to_brand_sales REAL NOT NULL,
                new_to_brand_orders INTEGER NOT NULL,
                channel_group TEXT NOT NULL,
                is_drain INTEGER NOT NULL,
                is_boost INTEGER NOT NULL,
                roas REAL,
                ctr REAL,
                cpc REAL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (activity_date, campaign_key, market)
            );
            CREATE TABLE IF NOT EXISTS halo_metrics (
                activity_date TEXT NOT NULL,
                market TEXT NOT NULL,
                currency_code TEXT NOT NULL,
                total_marketplace_sales REAL NOT NULL,
                total_orders INTEGER NOT NULL,
                total_units INTEGER NOT NULL,
                total_ad_attributed_revenue REAL NOT NULL,
                total_ad_attributed_conversions INTEGER NOT NULL,
                total_ad_spend REAL NOT NULL,
                organic_revenue REAL NOT NULL,
                organic_conversions INTEGER NOT NULL,
                external_dtc_spend REAL NOT NULL,
                external_dtc_revenue REAL NOT NULL,
                dtc_available INTEGER NOT NULL,
                platform_roas REAL,
                unified_roas REAL,
                halo_multiplier REAL,
                average_order_value REAL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (activity_date, market)
            );
            "#,
        )
        .context("Failed to create sink tables")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sink connection poisoned"))
    }

    /// Rows of one partition ordered by campaign key.
    pub fn load_rows(&self, partition: PartitionKey) -> Result<Vec<CanonicalRow>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT activity_date, campaign_id, campaign_name, market, currency_code,
                       cost, impressions, clicks, revenue, conversions,
                       in_store_attributed_sales, online_attributed_sales,
                       new_to_brand_sales, new_to_brand_orders, channel_group,
                       is_drain, is_boost, roas, ctr, cpc
                FROM canonical_rows
                WHERE activity_date = ?1 AND market = ?2
                ORDER BY campaign_key
                "#,
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(
                params![
                    partition.activity_date.format(DATE_FORMAT).to_string(),
                    partition.market.as_str()
                ],
                read_row,
            )
            .context("Failed to execute query")?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read canonical rows")
    }

    pub fn load_halo(&self, partition: PartitionKey) -> Result<Option<HaloMetrics>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT currency_code, total_marketplace_sales, total_orders,
                       total_ad_attributed_revenue, total_ad_attributed_conversions,
                       total_ad_spend, organic_revenue, organic_conversions,
                       external_dtc_spend, external_dtc_revenue, dtc_available,
                       platform_roas, unified_roas, halo_multiplier,
                       total_units, average_order_value
                FROM halo_metrics
                WHERE activity_date = ?1 AND market = ?2
                "#,
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![
                partition.activity_date.format(DATE_FORMAT).to_string(),
                partition.market.as_str()
            ])
            .context("Failed to execute query")?;

        let Some(row) = rows.next().context("Failed to read row")? else {
            return Ok(None);
        };

        Ok(Some(HaloMetrics {
            key: partition,
            currency_code: row.get(0)?,
            total_marketplace_sales: row.get(1)?,
            total_orders: row.get::<_, i64>(2)? as u64,
            total_ad_attributed_revenue: row.get(3)?,
            total_ad_attributed_conversions: row.get::<_, i64>(4)? as u64,
            total_ad_spend: row.get(5)?,
            organic_revenue: row.get(6)?,
            organic_conversions: row.get::<_, i64>(7)? as u64,
            external_dtc_spend: row.get(8)?,
            external_dtc_revenue: row.get(9)?,
            dtc_available: row.get(10)?,
            platform_roas: row.get(11)?,
            unified_roas: row.get(12)?,
            halo_multiplier: row.get(13)?,
            total_units: row.get::<_, i64>(14)? as u64,
            average_order_value: row.get(15)?,
        }))
    }

    pub fn count_rows(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM canonical_rows", [], |row| row.get(0))
            .context("Failed to count canonical rows")?;
        Ok(count as usize)
    }
}

/// Removes the partition's rows, and its halo metrics unless they are about to
/// be rewritten.
fn clear_partition(tx: &Transaction<'_>, output: &PartitionOutput) -> Result<usize> {
    let date = output.key.activity_date.format(DATE_FORMAT).to_string();
    let market = output.key.market.as_str();
    let removed = tx
        .execute(
            "DELETE FROM canonical_rows WHERE activity_date = ?1 AND market = ?2",
            params![date, market],
        )
        .with_context(|| format!("Failed to clear rows of {}", output.key))?;
    if output.halo.is_none() {
        tx.execute(
            "DELETE FROM halo_metrics WHERE activity_date = ?1 AND market = ?2",
            params![date, market],
        )
        .with_context(|| format!("Failed to clear halo metrics of {}", output.key))?;
    }
    Ok(removed)
}

fn upsert_row(tx: &Transaction<'_>, row: &CanonicalRow, now: &str) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO canonical_rows (
            activity_date, campaign_key, campaign_id, campaign_name, market, currency_code,
            cost, impressions, clicks, revenue, conversions,
            in_store_attributed_sales, online_attributed_sales,
            new_to_brand_sales, new_to_brand_orders, channel_group,
            is_drain, is_boost, roas, ctr, cpc, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22)
        ON CONFLICT(activity_date, campaign_key, market) DO UPDATE SET
            campaign_id = excluded.campaign_id,
            campaign_name = excluded.campaign_name,
            currency_code = excluded.currency_code,
            cost = excluded.cost,
            impressions = excluded.impressions,
            clicks = excluded.clicks,
            revenue = excluded.revenue,
            conversions = excluded.conversions,
            in_store_attributed_sales = excluded.in_store_attributed_sales,
            online_attributed_sales = excluded.online_attributed_sales,
            new_to_brand_sales = excluded.new_to_brand_sales,
            new_to_brand_orders = excluded.new_to_brand_orders,
            channel_group = excluded.channel_group,
            is_drain = excluded.is_drain,
            is_boost = excluded.is_boost,
            roas = excluded.roas,
            ctr = excluded.ctr,
            cpc = excluded.cpc,
            updated_at = excluded.updated_at
        "#,
        params![
            row.activity_date.format(DATE_FORMAT).to_string(),
            row.campaign_key(),
            row.campaign_id,
            row.campaign_name,
            row.market.as_str(),
            row.currency_code,
            row.cost,
            row.impressions as i64,
            row.clicks as i64,
            row.revenue,
            row.conversions as i64,
            row.in_store_attributed_sales,
            row.online_attributed_sales,
            row.new_to_brand_sales,
            row.new_to_brand_orders as i64,
            row.channel_group.as_str(),
            row.is_drain,
            row.is_boost,
            row.roas,
            row.ctr,
            row.cpc,
            now,
        ],
    )
    .with_context(|| format!("Failed to upsert row {} {}", row.partition(), row.campaign_key()))?;
    Ok(())
}

fn upsert_halo(tx: &Transaction<'_>, halo: &HaloMetrics, now: &str) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO halo_metrics (
            activity_date, market, currency_code, total_marketplace_sales, total_orders,
            total_ad_attributed_revenue, total_ad_attributed_conversions, total_ad_spend,
            organic_revenue, organic_conversions, external_dtc_spend, external_dtc_revenue,
            dtc_available, platform_roas, unified_roas, halo_multiplier,
            total_units, average_order_value, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19)
        ON CONFLICT(activity_date, market) DO UPDATE SET
            currency_code = excluded.currency_code,
            total_marketplace_sales = excluded.total_marketplace_sales,
            total_orders = excluded.total_orders,
            total_ad_attributed_revenue = excluded.total_ad_attributed_revenue,
            total_ad_attributed_conversions = excluded.total_ad_attributed_conversions,
            total_ad_spend = excluded.total_ad_spend,
            organic_revenue = excluded.organic_revenue,
            organic_conversions = excluded.organic_conversions,
            external_dtc_spend = excluded.external_dtc_spend,
            external_dtc_revenue = excluded.external_dtc_revenue,
            dtc_available = excluded.dtc_available,
            platform_roas = excluded.platform_roas,
            unified_roas = excluded.unified_roas,
            halo_multiplier = excluded.halo_multiplier,
            total_units = excluded.total_units,
            average_order_value = excluded.average_order_value,
            updated_at = excluded.updated_at
        "#,
        params![
            halo.key.activity_date.format(DATE_FORMAT).to_string(),
            halo.key.market.as_str(),
            halo.currency_code,
            halo.total_marketplace_sales,
            halo.total_orders as i64,
            halo.total_ad_attributed_revenue,
            halo.total_ad_attributed_conversions as i64,
            halo.total_ad_spend,
            halo.organic_revenue,
            halo.organic_conversions as i64,
            halo.external_dtc_spend,
            halo.external_dtc_revenue,
            halo.dtc_available,
            halo.platform_roas,
            halo.unified_roas,
            halo.halo_multiplier,
            halo.total_units as i64,
            halo.average_order_value,
            now,
        ],
    )
    .with_context(|| format!("Failed to upsert halo metrics {}", halo.key))?;
    Ok(())
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<CanonicalRow> {
    let text_error = |idx: usize, err: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            err.into(),
        )
    };

    let activity_date: String = row.get(0)?;
    let activity_date = NaiveDate::parse_from_str(&activity_date, DATE_FORMAT)
        .map_err(|e| text_error(0, e.to_string()))?;
    let market: String = row.get(3)?;
    let market: Market = market
        .parse()
        .map_err(|e: SyncError| text_error(3, e.to_string()))?;
    let channel: String = row.get(14)?;
    let channel_group: ChannelGroup = channel
        .parse()
        .map_err(|e: SyncError| text_error(14, e.to_string()))?;

    Ok(CanonicalRow {
        activity_date,
        campaign_id: row.get(1)?,
        campaign_name: row.get(2)?,
        market,
        currency_code: row.get(4)?,
        cost: row.get(5)?,
        impressions: row.get::<_, i64>(6)? as u64,
        clicks: row.get::<_, i64>(7)? as u64,
        revenue: row.get(8)?,
        conversions: row.get::<_, i64>(9)? as u64,
        in_store_attributed_sales: row.get(10)?,
        online_attributed_sales: row.get(11)?,
        new_to_brand_sales: row.get(12)?,
        new_to_brand_orders: row.get::<_, i64>(13)? as u64,
        channel_group,
        is_drain: row.get(15)?,
        is_boost: row.get(16)?,
        roas: row.get(17)?,
        ctr: row.get(18)?,
        cpc: row.get(19)?,
    })
}

impl RowSink for SqliteRowSink {
    fn upsert_partition(&self, output: &PartitionOutput) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let now = Utc::now().to_rfc3339();

        let replaced = clear_partition(&tx, output)?;
        for row in &output.rows {
            upsert_row(&tx, row, &now)?;
        }
        if let Some(halo) = &output.halo {
            upsert_halo(&tx, halo, &now)?;
        }
        tx.commit().context("Failed to commit partition")?;

        debug!(
            partition = %output.key,
            rows = output.rows.len(),
            replaced = replaced,
            "Upserted partition"
        );
        Ok(output.rows.len())
    }
}
