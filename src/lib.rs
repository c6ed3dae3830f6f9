mod config;
mod db;
mod dedup;
mod directory;
mod errors;
mod grid;
mod scheduler;
mod store;
mod sync;
mod tiles;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{AppConfig, PublicAppConfig};
pub use db::{bootstrap, bootstrap_in_memory, DatabaseContext};
pub use dedup::{DedupEngine, MergeReport};
pub use directory::{
    DirectoryApi, DirectoryClient, DirectoryDetails, DirectoryPage, HttpDirectoryApi,
    RawDirectoryEntry, MAX_RETRIES, PAGE_SIZE,
};
pub use errors::{AppError, AppResult, DirectoryError};
pub use grid::{generate, haversine_km, BoundingBox, SearchPoint};
pub use scheduler::{
    default_high_traffic_regions, HighTrafficRegion, Scheduler, SchedulerIntervals,
};
pub use store::{CanonicalStore, PlaceCandidate, PlaceKind};
pub use sync::{SyncOptions, SyncOrchestrator, SyncReport};
pub use tiles::{TileCache, TileRecord};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,placesync=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
