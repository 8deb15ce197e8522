use crate::error::SyncError;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod validation;

pub use validation::{check_row, SPLIT_TOLERANCE};

/// Campaign key used for the synthetic organic row.
pub const ORGANIC_CAMPAIGN_KEY: &str = "ORGANIC";

/// Display name of the synthetic organic row.
pub const ORGANIC_CAMPAIGN_NAME: &str = "Organic";

/// Marketplace a row belongs to. Closed set; drives the currency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Market {
    Us,
    Ca,
    Mx,
}

impl Market {
    pub const ALL: [Market; 3] = [Market::Us, Market::Ca, Market::Mx];

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Us => "US",
            Market::Ca => "CA",
            Market::Mx => "MX",
        }
    }

    /// ISO 4217 currency for this market.
    pub fn currency_code(&self) -> &'static str {
        match self {
            Market::Us => "USD",
            Market::Ca => "CAD",
            Market::Mx => "MXN",
        }
    }
}

impl FromStr for Market {
    type Err = SyncError;

    /// Parses a market code, case-insensitively. Never guesses.
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code.trim().to_ascii_uppercase().as_str() {
            "US" => Ok(Market::Us),
            "CA" => Ok(Market::Ca),
            "MX" => Ok(Market::Mx),
            _ => Err(SyncError::UnknownMarket(code.to_string())),
        }
    }
}

impl TryFrom<String> for Market {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Market> for String {
    fn from(market: Market) -> Self {
        market.as_str().to_string()
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reporting channel of a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelGroup {
    #[serde(rename = "Sponsored Products")]
    SponsoredProducts,
    #[serde(rename = "Sponsored Brands")]
    SponsoredBrands,
    #[serde(rename = "Sponsored Display")]
    SponsoredDisplay,
    #[serde(rename = "Organic")]
    Organic,
}

impl ChannelGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelGroup::SponsoredProducts => "Sponsored Products",
            ChannelGroup::SponsoredBrands => "Sponsored Brands",
            ChannelGroup::SponsoredDisplay => "Sponsored Display",
            ChannelGroup::Organic => "Organic",
        }
    }

    /// Unpaid revenue channel. Only the organic row drains.
    pub fn is_drain(&self) -> bool {
        matches!(self, ChannelGroup::Organic)
    }

    /// Paid-media channel.
    pub fn is_boost(&self) -> bool {
        !self.is_drain()
    }
}

impl FromStr for ChannelGroup {
    type Err = SyncError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "Sponsored Products" => Ok(ChannelGroup::SponsoredProducts),
            "Sponsored Brands" => Ok(ChannelGroup::SponsoredBrands),
            "Sponsored Display" => Ok(ChannelGroup::SponsoredDisplay),
            "Organic" => Ok(ChannelGroup::Organic),
            other => Err(SyncError::UnmappedChannel(other.to_string())),
        }
    }
}

impl fmt::Display for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (date, market) partition: the unit of fetching, computing and upserting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub activity_date: NaiveDate,
    pub market: Market,
}

impl PartitionKey {
    pub fn new(activity_date: NaiveDate, market: Market) -> Self {
        Self {
            activity_date,
            market,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.activity_date, self.market)
    }
}

/// Unique key of a persisted row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub activity_date: NaiveDate,
    /// Campaign id, or [`ORGANIC_CAMPAIGN_KEY`]
    pub campaign_key: String,
    pub market: Market,
}

/// One (date, campaign-or-organic, market) observation in reporting schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub activity_date: NaiveDate,
    /// `None` for the organic row
    pub campaign_id: Option<String>,
    pub campaign_name: String,
    pub market: Market,
    pub currency_code: String,
    pub cost: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub revenue: f64,
    pub conversions: u64,
    pub in_store_attributed_sales: f64,
    pub online_attributed_sales: f64,
    pub new_to_brand_sales: f64,
    pub new_to_brand_orders: u64,
    pub channel_group: ChannelGroup,
    pub is_drain: bool,
    pub is_boost: bool,
    pub roas: Option<f64>,
    pub ctr: Option<f64>,
    pub cpc: Option<f64>,
}

impl CanonicalRow {
    /// Builds the synthetic organic row for a partition.
    pub fn organic(key: PartitionKey, revenue: f64, conversions: u64) -> Self {
        let channel_group = ChannelGroup::Organic;
        Self {
            activity_date: key.activity_date,
            campaign_id: None,
            campaign_name: ORGANIC_CAMPAIGN_NAME.to_string(),
            market: key.market,
            currency_code: key.market.currency_code().to_string(),
            cost: 0.0,
            impressions: 0,
            clicks: 0,
            revenue: round_cents(revenue),
            conversions,
            in_store_attributed_sales: 0.0,
            online_attributed_sales: 0.0,
            new_to_brand_sales: 0.0,
            new_to_brand_orders: 0,
            channel_group,
            is_drain: channel_group.is_drain(),
            is_boost: channel_group.is_boost(),
            roas: None,
            ctr: None,
            cpc: None,
        }
    }

    pub fn key(&self) -> RowKey {
        RowKey {
            activity_date: self.activity_date,
            campaign_key: self.campaign_key().to_string(),
            market: self.market,
        }
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.activity_date, self.market)
    }

    pub fn campaign_key(&self) -> &str {
        self.campaign_id.as_deref().unwrap_or(ORGANIC_CAMPAIGN_KEY)
    }

    pub fn is_organic(&self) -> bool {
        self.channel_group == ChannelGroup::Organic
    }

    /// Recomputes `roas`, `ctr` and `cpc` from the raw figures.
    pub fn with_derived_metrics(mut self) -> Self {
        self.roas = ratio(self.revenue, self.cost);
        self.ctr = ratio(self.clicks as f64, self.impressions as f64).map(|r| r * 100.0);
        self.cpc = ratio(self.cost, self.clicks as f64);
        self
    }
}

/// Per (date, market) totals. Sales figures come from the marketplace API,
/// ad figures are summed over the partition's ad rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketTotals {
    pub activity_date: NaiveDate,
    pub market: Market,
    pub total_marketplace_sales: f64,
    pub total_orders: u64,
    pub total_units: u64,
    pub total_ad_attributed_revenue: f64,
    pub total_ad_attributed_conversions: u64,
    pub total_ad_spend: f64,
}

impl MarketTotals {
    /// Totals from marketplace sales only; ad figures start at zero.
    pub fn from_sales(
        key: PartitionKey,
        total_marketplace_sales: f64,
        total_orders: u64,
        total_units: u64,
    ) -> Self {
        Self {
            activity_date: key.activity_date,
            market: key.market,
            total_marketplace_sales,
            total_orders,
            total_units,
            total_ad_attributed_revenue: 0.0,
            total_ad_attributed_conversions: 0,
            total_ad_spend: 0.0,
        }
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey::new(self.activity_date, self.market)
    }

    /// Folds another sales total for the same partition into this one.
    pub fn merge_sales(&mut self, other: &MarketTotals) {
        self.total_marketplace_sales += other.total_marketplace_sales;
        self.total_orders += other.total_orders;
        self.total_units += other.total_units;
    }
}

/// Inclusive calendar date range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Range `[start, end]`. Fails if `end` precedes `start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, SyncError> {
        if end < start {
            return Err(SyncError::InvalidConfig(format!(
                "date range end {} precedes start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// `[sync_date - lookback_days, sync_date]`.
    pub fn lookback(sync_date: NaiveDate, lookback_days: u32) -> Self {
        Self {
            start: sync_date - Duration::days(i64::from(lookback_days)),
            end: sync_date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn len_days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Rounds a monetary value to cents.
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `numerator / denominator`, or `None` when the denominator is not positive.
pub fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator > 0.0 {
        Some(numerator / denominator)
    } else {
        None
    }
}
