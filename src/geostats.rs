//! Geo-stats service (component G): a process-wide singleton tracking
//! request counts by date/country/city, in either realtime or batched
//! mode.
//!
//! The singleton is held behind a resettable `Mutex<Option<Arc<_>>>`
//! rather than a bare `OnceLock`, so tests can tear it down between runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::errors::CoreResult;
use crate::metadata::store::MetadataStore;

static INSTANCE: Mutex<Option<Arc<GeoStatsService>>> = Mutex::new(None);

/// How the service accumulates request counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoStatsMode {
    /// Every `record()` call immediately upserts into the catalog.
    Realtime,
    /// Counts accumulate in memory; a flush (by size or by ticker)
    /// upserts the whole buffer at once.
    Batch,
}

#[derive(Debug, Clone, Default)]
struct BufferedEntry {
    country: String,
    region: String,
    count: u64,
}

struct State {
    mode: GeoStatsMode,
    batch_size: usize,
    flush_interval: Duration,
    buffer: HashMap<(String, String, String), BufferedEntry>,
    pending: usize,
}

/// Process-wide singleton tracking geo request statistics.
pub struct GeoStatsService {
    store: Arc<dyn MetadataStore>,
    state: Mutex<State>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl GeoStatsService {
    fn new(store: Arc<dyn MetadataStore>, mode: GeoStatsMode, batch_size: usize, flush_interval: Duration) -> Self {
        Self {
            store,
            state: Mutex::new(State {
                mode,
                batch_size,
                flush_interval,
                buffer: HashMap::new(),
                pending: 0,
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Fetch the process-wide instance, constructing it on first use.
    pub fn instance(store: Arc<dyn MetadataStore>, mode: GeoStatsMode, batch_size: usize, flush_interval: Duration) -> Arc<Self> {
        let mut guard = INSTANCE.lock().expect("geo-stats singleton lock poisoned");
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }
        let service = Arc::new(Self::new(store, mode, batch_size, flush_interval));
        service.clone().start_ticker();
        *guard = Some(service.clone());
        service
    }

    /// Tear down the singleton. Flushes any buffered counts first.
    /// Intended for test teardown.
    pub fn reset_for_test() {
        let mut guard = INSTANCE.lock().expect("geo-stats singleton lock poisoned");
        if let Some(service) = guard.take() {
            let _ = service.flush();
            if let Some(handle) = service.ticker.lock().expect("ticker lock poisoned").take() {
                handle.abort();
            }
        }
    }

    fn start_ticker(self: Arc<Self>) {
        let interval = self.state.lock().expect("geo-stats state lock poisoned").flush_interval;
        let weak = Arc::downgrade(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else { break };
                let _ = service.flush();
            }
        });
        *self.ticker.lock().expect("ticker lock poisoned") = Some(handle);
    }

    /// Switch mode, flushing the buffer first so no counts are lost.
    pub fn set_mode(&self, mode: GeoStatsMode) -> CoreResult<()> {
        self.flush()?;
        self.state.lock().expect("geo-stats state lock poisoned").mode = mode;
        Ok(())
    }

    /// Record one request from `(country_code, country, city, region)`.
    pub fn record(&self, country_code: &str, country: &str, city: &str, region: &str) -> CoreResult<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let mut state = self.state.lock().expect("geo-stats state lock poisoned");
        match state.mode {
            GeoStatsMode::Realtime => {
                drop(state);
                self.store
                    .upsert_geo_stat(&today, country_code, city, country, region, 1)
            }
            GeoStatsMode::Batch => {
                let key = (today, country_code.to_string(), city.to_string());
                let entry = state.buffer.entry(key).or_insert_with(|| BufferedEntry {
                    country: country.to_string(),
                    region: region.to_string(),
                    count: 0,
                });
                entry.count += 1;
                state.pending += 1;
                let should_flush = state.pending >= state.batch_size;
                drop(state);
                if should_flush {
                    self.flush()?;
                }
                Ok(())
            }
        }
    }

    /// Empty the buffer, upserting each entry into the catalog.
    pub fn flush(&self) -> CoreResult<()> {
        let drained: Vec<((String, String, String), BufferedEntry)> = {
            let mut state = self.state.lock().expect("geo-stats state lock poisoned");
            state.pending = 0;
            state.buffer.drain().collect()
        };
        for ((date, country_code, city), entry) in drained {
            self.store
                .upsert_geo_stat(&date, &country_code, &city, &entry.country, &entry.region, entry.count)?;
        }
        Ok(())
    }

    /// Flush and cancel the background ticker.
    pub fn stop(&self) -> CoreResult<()> {
        self.flush()?;
        if let Some(handle) = self.ticker.lock().expect("ticker lock poisoned").take() {
            handle.abort();
        }
        Ok(())
    }

    pub fn by_country(&self, limit: u32) -> CoreResult<Vec<(String, u64)>> {
        self.store.geo_stats_by_country(limit)
    }

    pub fn by_country_city(&self, limit: u32) -> CoreResult<Vec<(String, String, u64)>> {
        self.store.geo_stats_by_country_city(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::sqlite::SqliteMetadataStore;

    fn store() -> Arc<dyn MetadataStore> {
        Arc::new(SqliteMetadataStore::new(":memory:").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_mode_writes_immediately() {
        GeoStatsService::reset_for_test();
        let store = store();
        let service = GeoStatsService::instance(store.clone(), GeoStatsMode::Realtime, 10, Duration::from_secs(60));
        service.record("US", "United States", "Seattle", "WA").unwrap();
        let stats = service.by_country(10).unwrap();
        assert_eq!(stats, vec![("US".to_string(), 1)]);
        GeoStatsService::reset_for_test();
    }

    #[tokio::test(start_paused = true)]
    async fn batch_mode_flushes_at_threshold() {
        GeoStatsService::reset_for_test();
        let store = store();
        let service = GeoStatsService::instance(store.clone(), GeoStatsMode::Batch, 2, Duration::from_secs(3600));
        service.record("US", "United States", "Seattle", "WA").unwrap();
        assert!(service.by_country(10).unwrap().is_empty());
        service.record("US", "United States", "Seattle", "WA").unwrap();
        assert_eq!(service.by_country(10).unwrap(), vec![("US".to_string(), 2)]);
        GeoStatsService::reset_for_test();
    }

    #[tokio::test(start_paused = true)]
    async fn mode_switch_flushes_pending_buffer() {
        GeoStatsService::reset_for_test();
        let store = store();
        let service = GeoStatsService::instance(store.clone(), GeoStatsMode::Batch, 100, Duration::from_secs(3600));
        service.record("FR", "France", "Paris", "IDF").unwrap();
        service.set_mode(GeoStatsMode::Realtime).unwrap();
        assert_eq!(service.by_country(10).unwrap(), vec![("FR".to_string(), 1)]);
        GeoStatsService::reset_for_test();
    }
}
