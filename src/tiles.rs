use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::trace;

use crate::errors::{AppError, AppResult};

pub const DEFAULT_REFRESH_DAYS: i64 = 30;

/// Per-tile freshness tracker. A fresh tile short-circuits the network call
/// entirely; this is the dominant cost control, so freshness is always
/// evaluated before the client is touched.
#[derive(Clone)]
pub struct TileCache {
    db: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone)]
pub struct TileRecord {
    pub location_key: String,
    pub radius_meters: u32,
    pub search_terms: String,
    pub external_ids: Vec<String>,
    pub last_searched_at: DateTime<Utc>,
    pub refresh_interval_days: i64,
}

impl TileRecord {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.last_searched_at + Duration::days(self.refresh_interval_days) >= now
    }
}

impl TileCache {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn is_fresh(&self, location_key: &str) -> AppResult<bool> {
        Ok(self
            .load(location_key)?
            .map(|record| record.is_fresh_at(Utc::now()))
            .unwrap_or(false))
    }

    /// External IDs recorded the last time this tile was queried. Empty when
    /// the tile has never been searched.
    pub fn cached_ids(&self, location_key: &str) -> AppResult<Vec<String>> {
        Ok(self
            .load(location_key)?
            .map(|record| record.external_ids)
            .unwrap_or_default())
    }

    pub fn load(&self, location_key: &str) -> AppResult<Option<TileRecord>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT location_key, radius_meters, search_terms, external_ids,
                    last_searched_at, refresh_interval_days
             FROM search_tiles WHERE location_key = ?1",
            [location_key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?
        .map(|(key, radius, terms, ids, searched_at, refresh_days)| {
            let external_ids: Vec<String> = serde_json::from_str(&ids)?;
            let last_searched_at = DateTime::parse_from_rfc3339(&searched_at)
                .map_err(|err| {
                    AppError::Config(format!("corrupt tile timestamp for {key}: {err}"))
                })?
                .with_timezone(&Utc);
            Ok(TileRecord {
                location_key: key,
                radius_meters: radius,
                search_terms: terms,
                external_ids,
                last_searched_at,
                refresh_interval_days: refresh_days,
            })
        })
        .transpose()
    }

    /// Records a successful query. The row is overwritten, not appended: the
    /// cached ID set always reflects exactly the latest sweep of the tile.
    pub fn record(
        &self,
        location_key: &str,
        radius_meters: u32,
        search_terms: &str,
        external_ids: &[String],
        refresh_interval_days: i64,
    ) -> AppResult<()> {
        let ids = serde_json::to_string(external_ids)?;
        let now = crate::db::now_timestamp();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO search_tiles
                (location_key, radius_meters, search_terms, external_ids,
                 last_searched_at, refresh_interval_days)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(location_key) DO UPDATE SET
                radius_meters = excluded.radius_meters,
                search_terms = excluded.search_terms,
                external_ids = excluded.external_ids,
                last_searched_at = excluded.last_searched_at,
                refresh_interval_days = excluded.refresh_interval_days",
            (
                location_key,
                radius_meters,
                search_terms,
                ids,
                now,
                refresh_interval_days,
            ),
        )?;
        trace!(location_key, count = external_ids.len(), "tile recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap_in_memory;

    fn cache() -> TileCache {
        TileCache::new(Arc::new(Mutex::new(bootstrap_in_memory().unwrap())))
    }

    #[test]
    fn unknown_tile_is_stale() {
        let cache = cache();
        assert!(!cache.is_fresh("14.7000,-17.4700").unwrap());
        assert!(cache.cached_ids("14.7000,-17.4700").unwrap().is_empty());
    }

    #[test]
    fn freshly_recorded_tile_is_fresh() {
        let cache = cache();
        let ids = vec!["ext-1".to_string(), "ext-2".to_string()];
        cache
            .record("14.7000,-17.4700", 2000, "restaurant", &ids, 30)
            .unwrap();

        assert!(cache.is_fresh("14.7000,-17.4700").unwrap());
        assert_eq!(cache.cached_ids("14.7000,-17.4700").unwrap(), ids);
    }

    #[test]
    fn freshness_window_boundaries() {
        let record = TileRecord {
            location_key: "k".into(),
            radius_meters: 2000,
            search_terms: "restaurant".into(),
            external_ids: vec![],
            last_searched_at: Utc::now(),
            refresh_interval_days: 30,
        };
        let now = record.last_searched_at;
        assert!(record.is_fresh_at(now + Duration::days(29)));
        assert!(!record.is_fresh_at(now + Duration::days(31)));
    }

    #[test]
    fn requery_overwrites_the_cached_set() {
        let cache = cache();
        cache
            .record("k", 2000, "restaurant", &["old".to_string()], 30)
            .unwrap();
        cache
            .record("k", 2500, "restaurant,cafe", &["new".to_string()], 7)
            .unwrap();

        let record = cache.load("k").unwrap().unwrap();
        assert_eq!(record.external_ids, vec!["new".to_string()]);
        assert_eq!(record.radius_meters, 2500);
        assert_eq!(record.refresh_interval_days, 7);
    }
}
