use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::grid::{generate, BoundingBox, SearchPoint};
use crate::sync::{SyncOptions, SyncOrchestrator, SyncReport};

const STALE_WINDOW_HOURS: i64 = 24;
const STALE_BATCH_LIMIT: usize = 200;

/// A named hotspot swept hourly with a hard cap on results per sweep.
#[derive(Debug, Clone)]
pub struct HighTrafficRegion {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub radius_meters: u32,
    pub result_cap: usize,
}

impl HighTrafficRegion {
    fn search_point(&self) -> SearchPoint {
        SearchPoint {
            lat: self.lat,
            lng: self.lng,
            radius_meters: self.radius_meters,
        }
    }
}

/// Dakar's densest nightlife and dining pockets.
pub fn default_high_traffic_regions() -> Vec<HighTrafficRegion> {
    [
        ("Plateau", 14.6708, -17.4381),
        ("Almadies", 14.7397, -17.5133),
        ("Ngor", 14.7539, -17.5158),
        ("Point E", 14.6937, -17.4624),
    ]
    .into_iter()
    .map(|(name, lat, lng)| HighTrafficRegion {
        name: name.to_string(),
        lat,
        lng,
        radius_meters: 1500,
        result_cap: 40,
    })
    .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerIntervals {
    pub full_sweep: Duration,
    pub incremental: Duration,
    pub high_traffic: Duration,
}

impl Default for SchedulerIntervals {
    fn default() -> Self {
        Self {
            full_sweep: Duration::from_secs(7 * 24 * 3600),
            incremental: Duration::from_secs(24 * 3600),
            high_traffic: Duration::from_secs(3600),
        }
    }
}

/// Three independent cadences over one orchestrator. The cadences share no
/// lock here; only the orchestrator's run lease serializes actual
/// external-API usage, and a cadence finding it held logs and returns.
pub struct Scheduler {
    orchestrator: Arc<SyncOrchestrator>,
    bounding_box: BoundingBox,
    spacing_km: f64,
    base_options: SyncOptions,
    regions: Vec<HighTrafficRegion>,
    intervals: SchedulerIntervals,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: &AppConfig) -> Self {
        Self {
            orchestrator,
            bounding_box: config.bounding_box,
            spacing_km: config.grid_spacing_km,
            base_options: SyncOptions::from_config(config),
            regions: default_high_traffic_regions(),
            intervals: SchedulerIntervals::default(),
        }
    }

    pub fn with_regions(mut self, regions: Vec<HighTrafficRegion>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_intervals(mut self, intervals: SchedulerIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Spawns the three cadence loops. They run until the cancel flag is
    /// raised; each tick that loses the lease race is a logged no-op.
    pub fn spawn(self: Arc<Self>, cancel_flag: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
        let full = {
            let scheduler = Arc::clone(&self);
            let cancel = Arc::clone(&cancel_flag);
            tokio::spawn(async move {
                let mut ticker = interval(scheduler.intervals.full_sweep);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(err) = scheduler.run_full_sweep_once().await {
                        warn!(?err, "weekly full sweep failed");
                    }
                }
            })
        };

        let incremental = {
            let scheduler = Arc::clone(&self);
            let cancel = Arc::clone(&cancel_flag);
            tokio::spawn(async move {
                let mut ticker = interval(scheduler.intervals.incremental);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(err) = scheduler.run_incremental_once().await {
                        warn!(?err, "daily incremental refresh failed");
                    }
                }
            })
        };

        let high_traffic = {
            let scheduler = Arc::clone(&self);
            let cancel = cancel_flag;
            tokio::spawn(async move {
                let mut ticker = interval(scheduler.intervals.high_traffic);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Err(err) = scheduler.run_high_traffic_once().await {
                        warn!(?err, "hourly high-traffic sweep failed");
                    }
                }
            })
        };

        vec![full, incremental, high_traffic]
    }

    pub async fn run_full_sweep_once(&self) -> AppResult<Option<SyncReport>> {
        let points = generate(&self.bounding_box, self.spacing_km);
        info!(points = points.len(), "starting full grid sweep");
        self.orchestrator
            .try_run(&points, &self.base_options, None)
            .await
    }

    pub async fn run_incremental_once(&self) -> AppResult<Option<usize>> {
        self.orchestrator
            .try_refresh_stale(STALE_WINDOW_HOURS, STALE_BATCH_LIMIT)
            .await
    }

    /// Sweeps every high-traffic region, capped per region. A region losing
    /// the lease ends the tick; the next hourly tick picks it back up.
    pub async fn run_high_traffic_once(&self) -> AppResult<SyncReport> {
        let mut combined = SyncReport::default();
        for region in &self.regions {
            let mut options = self.base_options.clone();
            options.per_tile_result_limit = Some(region.result_cap);
            // Hotspot tiles go stale immediately; the hourly ticker is the
            // only pacing, unlike grid tiles with their 30-day window.
            options.refresh_days = 0;

            let point = region.search_point();
            match self.orchestrator.try_run(&[point], &options, None).await? {
                Some(report) => {
                    combined.processed += report.processed;
                    combined.skipped += report.skipped;
                    combined.found += report.found;
                    combined.failed += report.failed;
                }
                None => {
                    info!(region = %region.name, "orchestrator busy; high-traffic tick skipped");
                    break;
                }
            }
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::db::bootstrap_in_memory;
    use crate::directory::{
        DirectoryApi, DirectoryClient, DirectoryDetails, DirectoryPage, RawDirectoryEntry,
    };
    use crate::grid::SearchPoint;

    use super::*;

    struct CountingApi {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DirectoryApi for CountingApi {
        async fn fetch_page(
            &self,
            point: &SearchPoint,
            _type_filter: &str,
            _page_token: Option<&str>,
        ) -> crate::errors::AppResult<DirectoryPage> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(DirectoryPage {
                entries: vec![RawDirectoryEntry {
                    external_id: format!("ext-{n}"),
                    name: format!("Spot {n}"),
                    vicinity: Some("Dakar".into()),
                    lat: point.lat,
                    lng: point.lng,
                    rating: None,
                    rating_count: None,
                    types: vec!["restaurant".into()],
                }],
                next_page_token: None,
            })
        }

        async fn fetch_details(
            &self,
            _external_id: &str,
        ) -> crate::errors::AppResult<DirectoryDetails> {
            Ok(DirectoryDetails::default())
        }
    }

    // Built directly; reading the environment here would race with the
    // config tests that mutate it.
    fn test_config() -> AppConfig {
        AppConfig {
            directory_api_key: None,
            nearby_endpoint: "http://localhost/nearby".into(),
            details_endpoint: "http://localhost/details".into(),
            target_city: "Dakar".into(),
            language: "fr".into(),
            bounding_box: BoundingBox {
                north: 14.83,
                south: 14.64,
                east: -17.26,
                west: -17.54,
            },
            grid_spacing_km: 2.0,
            tile_refresh_days: 30,
            inter_request_delay_ms: 0,
            search_types: vec!["restaurant".into()],
            database_file_name: "test.db".into(),
            data_dir: None,
        }
    }

    fn scheduler() -> Scheduler {
        let db = Arc::new(Mutex::new(bootstrap_in_memory().unwrap()));
        let api = Arc::new(CountingApi {
            calls: AtomicU32::new(0),
        });
        let client = DirectoryClient::from_api(api, "Dakar");
        let config = test_config();
        let orchestrator = Arc::new(SyncOrchestrator::new(db, client, &config));
        Scheduler::new(orchestrator, &config)
    }

    #[test]
    fn default_regions_cover_the_metro() {
        let regions = default_high_traffic_regions();
        assert_eq!(regions.len(), 4);
        assert!(regions.iter().all(|r| r.result_cap > 0));
    }

    #[tokio::test]
    async fn high_traffic_sweep_visits_every_region() {
        let scheduler = scheduler();
        let report = scheduler.run_high_traffic_once().await.unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.found, 4);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn high_traffic_sweep_requeries_on_the_next_tick() {
        let scheduler = scheduler();
        scheduler.run_high_traffic_once().await.unwrap();

        // Hotspot tiles must not inherit the grid's freshness window; a
        // second tick queries all four regions again instead of skipping.
        let second = scheduler.run_high_traffic_once().await.unwrap();
        assert_eq!(second.processed, 4);
        assert_eq!(second.skipped, 0);
        assert_eq!(second.found, 4);
    }

    #[tokio::test]
    async fn incremental_pass_runs_with_empty_store() {
        let scheduler = scheduler();
        let refreshed = scheduler.run_incremental_once().await.unwrap();
        assert_eq!(refreshed, Some(0));
    }

    #[tokio::test]
    async fn full_sweep_tiles_the_configured_box() {
        let scheduler = scheduler();
        let report = scheduler.run_full_sweep_once().await.unwrap().unwrap();
        assert!(report.processed > 0);
        assert_eq!(report.failed, 0);
    }
}
