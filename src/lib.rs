// Canonical reporting rows, markets and date ranges
pub mod row;

// Error taxonomy shared with the sync manager
pub mod error;

// TOML configuration and validation
pub mod config;

// Upstream client credentials and the encrypted token cache
pub mod credentials;

// External DTC spend feed
pub mod dtc;

// Organic and halo attribution per (date, market)
pub mod attribution;

// Idempotent row persistence
pub mod sink;

pub use attribution::{compute_partition, DataGapWarning, HaloMetrics, PartitionOutput};
pub use error::SyncError;
pub use row::{CanonicalRow, ChannelGroup, DateRange, Market, MarketTotals, PartitionKey, RowKey};
