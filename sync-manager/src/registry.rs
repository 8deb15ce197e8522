//! Source registry - the upstream reports a run pulls from.

use crate::connectors::advertising::AdvertisingSource;
use crate::connectors::sales::SalesSource;
use crate::source::DataSource;
use retail_halo::config::HaloConfig;
use retail_halo::SyncError;
use std::sync::Arc;

/// Returns every data source, configured from `config`.
pub fn get_all_sources(config: &HaloConfig) -> Result<Vec<Arc<dyn DataSource>>, SyncError> {
    Ok(vec![
        Arc::new(AdvertisingSource::new(&config.advertising)?),
        Arc::new(SalesSource::new(&config.sales)?),
    ])
}
