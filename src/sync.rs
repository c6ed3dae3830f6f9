use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::directory::DirectoryClient;
use crate::errors::AppResult;
use crate::grid::SearchPoint;
use crate::store::{CanonicalStore, PlaceCandidate};
use crate::tiles::TileCache;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub processed: usize,
    pub skipped: usize,
    pub found: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub type_filters: Vec<String>,
    pub point_limit: Option<usize>,
    pub per_tile_result_limit: Option<usize>,
    pub refresh_days: i64,
}

impl SyncOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            type_filters: config.search_types.clone(),
            point_limit: None,
            per_tile_result_limit: None,
            refresh_days: config.tile_refresh_days,
        }
    }

    fn search_terms(&self) -> String {
        self.type_filters.join(",")
    }
}

/// Drives one sweep: freshness check, directory query, canonical upsert,
/// freshness record. Holds the run lease that keeps cadences from
/// overlapping on the shared external quota.
pub struct SyncOrchestrator {
    store: CanonicalStore,
    tiles: TileCache,
    client: DirectoryClient,
    pacer: RateLimiter,
    lease: AsyncMutex<()>,
}

impl SyncOrchestrator {
    pub fn new(db: Arc<Mutex<Connection>>, client: DirectoryClient, config: &AppConfig) -> Self {
        Self {
            store: CanonicalStore::new(Arc::clone(&db)),
            tiles: TileCache::new(db),
            client,
            pacer: RateLimiter::new(config.inter_request_delay_ms),
            lease: AsyncMutex::new(()),
        }
    }

    pub fn store(&self) -> &CanonicalStore {
        &self.store
    }

    /// Runs a sweep over `points` unless another run holds the lease, in
    /// which case this is a logged no-op returning `None`.
    pub async fn try_run(
        &self,
        points: &[SearchPoint],
        options: &SyncOptions,
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<Option<SyncReport>> {
        let Ok(_lease) = self.lease.try_lock() else {
            info!("sync already running; skipping this invocation");
            return Ok(None);
        };

        // The one failure that aborts a whole run.
        self.store.check_connectivity()?;

        let limit = options.point_limit.unwrap_or(points.len());
        let mut report = SyncReport::default();

        for point in points.iter().take(limit) {
            if let Some(flag) = &cancel_flag {
                if flag.load(Ordering::SeqCst) {
                    info!(processed = report.processed, "sync cancelled between points");
                    break;
                }
            }

            report.processed += 1;
            let key = point.location_key();

            // Freshness is decided strictly before any network traffic.
            match self.tiles.is_fresh(&key) {
                Ok(true) => {
                    debug!(key = %key, "tile fresh; reusing cached results");
                    report.skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(?err, key = %key, "tile freshness lookup failed");
                    report.failed += 1;
                    continue;
                }
            }

            match self.sync_point(point, &key, options).await {
                Ok(found) => report.found += found,
                Err(err) => {
                    warn!(?err, key = %key, "tile sync failed; continuing");
                    report.failed += 1;
                }
            }
        }

        info!(
            processed = report.processed,
            skipped = report.skipped,
            found = report.found,
            failed = report.failed,
            "sync run complete"
        );
        Ok(Some(report))
    }

    async fn sync_point(
        &self,
        point: &SearchPoint,
        key: &str,
        options: &SyncOptions,
    ) -> AppResult<usize> {
        let mut external_ids = Vec::new();
        let mut seen = HashSet::new();

        'filters: for type_filter in &options.type_filters {
            self.pacer.wait().await;
            let entries = self
                .client
                .search(point, type_filter, options.per_tile_result_limit)
                .await?;

            for entry in &entries {
                // The same place often carries several of the queried tags.
                if !seen.insert(entry.external_id.clone()) {
                    continue;
                }

                if let Err(err) = self.store.record_raw(entry, key) {
                    warn!(?err, external_id = %entry.external_id, "raw cache write failed");
                }

                let candidate = PlaceCandidate::from_entry(entry, self.client_region());
                self.upsert_with_retry(&candidate)?;
                external_ids.push(entry.external_id.clone());

                if let Some(cap) = options.per_tile_result_limit {
                    if external_ids.len() >= cap {
                        break 'filters;
                    }
                }
            }
        }

        self.tiles.record(
            key,
            point.radius_meters,
            &options.search_terms(),
            &external_ids,
            options.refresh_days,
        )?;
        Ok(external_ids.len())
    }

    // Storage upserts get exactly one retry before the point is marked failed.
    fn upsert_with_retry(&self, candidate: &PlaceCandidate) -> AppResult<i64> {
        match self.store.upsert(candidate) {
            Ok(id) => Ok(id),
            Err(err) => {
                warn!(?err, external_id = %candidate.external_id, "upsert failed; retrying once");
                self.store.upsert(candidate)
            }
        }
    }

    fn client_region(&self) -> &str {
        self.client.target_city()
    }

    /// Daily incremental pass: refresh extended fields for places whose last
    /// sync is older than the window. Lease-guarded like a sweep.
    pub async fn try_refresh_stale(
        &self,
        older_than_hours: i64,
        limit: usize,
    ) -> AppResult<Option<usize>> {
        let Ok(_lease) = self.lease.try_lock() else {
            info!("sync already running; skipping stale refresh");
            return Ok(None);
        };
        self.store.check_connectivity()?;

        let stale = self.store.stale_places(older_than_hours, limit)?;
        let mut refreshed = 0;
        for (id, external_id) in stale {
            self.pacer.wait().await;
            match self.client.details(&external_id).await {
                Ok(details) => {
                    if let Err(err) = self.store.apply_details(id, &details) {
                        warn!(?err, id, "failed to persist place details");
                        continue;
                    }
                    refreshed += 1;
                }
                Err(err) => warn!(?err, id, external_id = %external_id, "details refresh failed"),
            }
        }
        info!(refreshed, "stale place refresh complete");
        Ok(Some(refreshed))
    }
}

/// Minimum-interval pacer between directory calls. An explicit limiter
/// rather than loose sleeps so cached tiles cost nothing while the request
/// rate ceiling stays identical.
pub struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(min_interval_ms),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn set_interval_ms(&self, interval_ms: u64) {
        self.min_interval_ms.store(interval_ms, Ordering::SeqCst);
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst))
    }

    pub async fn wait(&self) {
        let interval = self.interval();
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
