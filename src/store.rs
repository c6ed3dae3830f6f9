use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::trace;

use crate::directory::{DirectoryDetails, RawDirectoryEntry};
use crate::errors::{AppError, AppResult};
use crate::grid::haversine_km;

/// Two rows closer than this (same name, same region) describe the same
/// physical place.
pub const MERGE_DISTANCE_KM: f64 = 0.1;

/// Category classification with an explicit precedence order: the first
/// matching tag in [`CLASSIFIER_PRECEDENCE`] wins, so multi-category entries
/// resolve deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceKind {
    Restaurant,
    Cafe,
    Bar,
    Bakery,
    NightClub,
    Lodging,
    Attraction,
    Shopping,
    Other,
}

const CLASSIFIER_PRECEDENCE: &[(&str, PlaceKind)] = &[
    ("restaurant", PlaceKind::Restaurant),
    ("meal_takeaway", PlaceKind::Restaurant),
    ("meal_delivery", PlaceKind::Restaurant),
    ("cafe", PlaceKind::Cafe),
    ("bakery", PlaceKind::Bakery),
    ("bar", PlaceKind::Bar),
    ("night_club", PlaceKind::NightClub),
    ("lodging", PlaceKind::Lodging),
    ("tourist_attraction", PlaceKind::Attraction),
    ("museum", PlaceKind::Attraction),
    ("park", PlaceKind::Attraction),
    ("shopping_mall", PlaceKind::Shopping),
    ("store", PlaceKind::Shopping),
];

impl PlaceKind {
    pub fn classify(tags: &[String]) -> Self {
        for (tag, kind) in CLASSIFIER_PRECEDENCE {
            if tags.iter().any(|t| t == tag) {
                return *kind;
            }
        }
        PlaceKind::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceKind::Restaurant => "restaurant",
            PlaceKind::Cafe => "cafe",
            PlaceKind::Bar => "bar",
            PlaceKind::Bakery => "bakery",
            PlaceKind::NightClub => "night_club",
            PlaceKind::Lodging => "lodging",
            PlaceKind::Attraction => "attraction",
            PlaceKind::Shopping => "shopping",
            PlaceKind::Other => "other",
        }
    }
}

/// A directory entry shaped for the canonical store.
#[derive(Debug, Clone)]
pub struct PlaceCandidate {
    pub external_id: String,
    pub name: String,
    pub kind: PlaceKind,
    pub street: Option<String>,
    pub city: String,
    pub region: String,
    pub lat: f64,
    pub lng: f64,
    pub external_rating: Option<f64>,
    pub review_count: i64,
}

impl PlaceCandidate {
    pub fn from_entry(entry: &RawDirectoryEntry, region: &str) -> Self {
        let street = entry.vicinity.as_deref().map(|v| {
            v.rsplit_once(',')
                .map(|(head, _)| head.trim().to_string())
                .unwrap_or_else(|| v.trim().to_string())
        });
        Self {
            external_id: entry.external_id.clone(),
            name: entry.name.clone(),
            kind: PlaceKind::classify(&entry.types),
            street,
            city: region.to_string(),
            region: region.to_string(),
            lat: entry.lat,
            lng: entry.lng,
            external_rating: entry.rating,
            review_count: entry.rating_count.unwrap_or(0),
        }
    }
}

/// Writer side of the canonical place collection. Upserts are keyed by
/// external id when present, falling back to (name, region) proximity. The
/// writer only ever touches the fields it originates; status progression and
/// admin-curated enrichment survive every re-sight.
#[derive(Clone)]
pub struct CanonicalStore {
    db: Arc<Mutex<Connection>>,
}

impl CanonicalStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn upsert(&self, candidate: &PlaceCandidate) -> AppResult<i64> {
        let conn = self.db.lock();

        if let Some(id) = existing_by_external_id(&conn, &candidate.external_id)? {
            update_sync_fields(&conn, id, candidate)?;
            trace!(id, external_id = %candidate.external_id, "place re-sighted");
            return Ok(id);
        }

        // A manual or admin row for the same physical place adopts the
        // external id instead of spawning a duplicate.
        if let Some(id) = nearby_same_name(&conn, candidate)? {
            conn.execute(
                "UPDATE places SET external_id = ?2, updated_at = DATETIME('now')
                 WHERE id = ?1",
                (id, candidate.external_id.as_str()),
            )?;
            update_sync_fields(&conn, id, candidate)?;
            trace!(id, external_id = %candidate.external_id, "place adopted external id");
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO places
                (external_id, name, kind, street, city, region, lat, lng,
                 external_rating, review_count, status, source, last_synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', 'directory', DATETIME('now'))",
            (
                candidate.external_id.as_str(),
                candidate.name.as_str(),
                candidate.kind.as_str(),
                candidate.street.as_deref(),
                candidate.city.as_str(),
                candidate.region.as_str(),
                candidate.lat,
                candidate.lng,
                candidate.external_rating,
                candidate.review_count,
            ),
        )?;
        let id = conn.last_insert_rowid();
        trace!(id, external_id = %candidate.external_id, "place inserted pending");
        Ok(id)
    }

    /// Write-once raw payload cache, keyed by external id. Re-sights are
    /// ignored so the first-seen payload and tile survive.
    pub fn record_raw(&self, entry: &RawDirectoryEntry, tile_key: &str) -> AppResult<()> {
        let payload = serde_json::to_string(entry)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT OR IGNORE INTO raw_entries (external_id, payload, tile_key)
             VALUES (?1, ?2, ?3)",
            (entry.external_id.as_str(), payload.as_str(), tile_key),
        )?;
        Ok(())
    }

    /// Directory-sourced places whose last sync is older than the given
    /// window (or that have never completed a details pass).
    pub fn stale_places(&self, older_than_hours: i64, limit: usize) -> AppResult<Vec<(i64, String)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, external_id FROM places
             WHERE external_id IS NOT NULL
               AND source = 'directory'
               AND (last_synced_at IS NULL
                    OR DATETIME(last_synced_at) < DATETIME('now', ?1))
             ORDER BY last_synced_at ASC
             LIMIT ?2",
        )?;
        let modifier = format!("-{older_than_hours} hours");
        let rows = stmt
            .query_map((modifier.as_str(), limit as i64), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Folds details-endpoint fields into a row. Fields the directory did not
    /// return keep their current value.
    pub fn apply_details(&self, id: i64, details: &DirectoryDetails) -> AppResult<()> {
        let images = if details.photos.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&details.photos)?)
        };
        let conn = self.db.lock();
        conn.execute(
            "UPDATE places SET
                phone = COALESCE(?2, phone),
                website = COALESCE(?3, website),
                images = COALESCE(?4, images),
                last_synced_at = DATETIME('now'),
                updated_at = DATETIME('now')
             WHERE id = ?1",
            (id, details.phone.as_deref(), details.website.as_deref(), images),
        )?;
        Ok(())
    }

    pub fn place_count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        conn.query_row("SELECT COUNT(*) FROM places", [], |row| row.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(AppError::from)
    }

    /// Connectivity probe run once at the start of a sync; the only error
    /// that is fatal to a whole run.
    pub fn check_connectivity(&self) -> AppResult<()> {
        let conn = self.db.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

fn existing_by_external_id(conn: &Connection, external_id: &str) -> AppResult<Option<i64>> {
    conn.query_row(
        "SELECT id FROM places WHERE external_id = ?1",
        [external_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(AppError::from)
}

fn nearby_same_name(conn: &Connection, candidate: &PlaceCandidate) -> AppResult<Option<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id, lat, lng FROM places
         WHERE external_id IS NULL AND name = ?1 AND region = ?2",
    )?;
    let rows = stmt
        .query_map((candidate.name.as_str(), candidate.region.as_str()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut best: Option<(i64, f64)> = None;
    for (id, lat, lng) in rows {
        let distance = haversine_km(candidate.lat, candidate.lng, lat, lng);
        if distance < MERGE_DISTANCE_KM && best.map(|(_, d)| distance < d).unwrap_or(true) {
            best = Some((id, distance));
        }
    }
    Ok(best.map(|(id, _)| id))
}

fn update_sync_fields(conn: &Connection, id: i64, candidate: &PlaceCandidate) -> AppResult<()> {
    conn.execute(
        "UPDATE places SET
            name = ?2,
            kind = ?3,
            street = COALESCE(?4, street),
            city = ?5,
            region = ?6,
            lat = ?7,
            lng = ?8,
            external_rating = COALESCE(?9, external_rating),
            review_count = MAX(review_count, ?10),
            last_synced_at = DATETIME('now'),
            updated_at = DATETIME('now')
         WHERE id = ?1",
        (
            id,
            candidate.name.as_str(),
            candidate.kind.as_str(),
            candidate.street.as_deref(),
            candidate.city.as_str(),
            candidate.region.as_str(),
            candidate.lat,
            candidate.lng,
            candidate.external_rating,
            candidate.review_count,
        ),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap_in_memory;

    fn store() -> (CanonicalStore, Arc<Mutex<Connection>>) {
        let db = Arc::new(Mutex::new(bootstrap_in_memory().unwrap()));
        (CanonicalStore::new(Arc::clone(&db)), db)
    }

    fn candidate(external_id: &str) -> PlaceCandidate {
        PlaceCandidate {
            external_id: external_id.to_string(),
            name: "Chez Fatou".to_string(),
            kind: PlaceKind::Restaurant,
            street: Some("Plateau".to_string()),
            city: "Dakar".to_string(),
            region: "Dakar".to_string(),
            lat: 14.7,
            lng: -17.47,
            external_rating: Some(4.2),
            review_count: 37,
        }
    }

    #[test]
    fn classifier_precedence_is_deterministic() {
        // "restaurant" outranks "bar" no matter the tag order.
        let tags = vec!["bar".to_string(), "restaurant".to_string()];
        assert_eq!(PlaceKind::classify(&tags), PlaceKind::Restaurant);
        let tags = vec!["point_of_interest".to_string(), "cafe".to_string()];
        assert_eq!(PlaceKind::classify(&tags), PlaceKind::Cafe);
        assert_eq!(PlaceKind::classify(&["gym".to_string()]), PlaceKind::Other);
    }

    #[test]
    fn first_sight_inserts_pending() {
        let (store, db) = store();
        let id = store.upsert(&candidate("ext-1")).unwrap();

        let conn = db.lock();
        let (status, source): (String, String) = conn
            .query_row(
                "SELECT status, source FROM places WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "pending");
        assert_eq!(source, "directory");
    }

    #[test]
    fn resight_updates_without_duplicating() {
        let (store, _) = store();
        let first = store.upsert(&candidate("ext-1")).unwrap();
        let mut updated = candidate("ext-1");
        updated.external_rating = Some(4.6);
        let second = store.upsert(&updated).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.place_count().unwrap(), 1);
    }

    #[test]
    fn resight_never_downgrades_status_or_curated_fields() {
        let (store, db) = store();
        let id = store.upsert(&candidate("ext-1")).unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "UPDATE places SET status = 'active', verified = 1,
                        description = 'curated copy' WHERE id = ?1",
                [id],
            )
            .unwrap();
        }

        store.upsert(&candidate("ext-1")).unwrap();

        let conn = db.lock();
        let (status, verified, description): (String, i64, String) = conn
            .query_row(
                "SELECT status, verified, description FROM places WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "active");
        assert_eq!(verified, 1);
        assert_eq!(description, "curated copy");
    }

    #[test]
    fn manual_row_adopts_external_id_by_proximity() {
        let (store, db) = store();
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO places (name, region, city, lat, lng, source)
                 VALUES ('Chez Fatou', 'Dakar', 'Dakar', 14.70005, -17.47, 'manual')",
                [],
            )
            .unwrap();
        }

        store.upsert(&candidate("ext-9")).unwrap();
        assert_eq!(store.place_count().unwrap(), 1);

        let conn = db.lock();
        let external: String = conn
            .query_row("SELECT external_id FROM places", [], |row| row.get(0))
            .unwrap();
        assert_eq!(external, "ext-9");
    }

    #[test]
    fn distant_same_name_row_stays_separate() {
        let (store, db) = store();
        {
            let conn = db.lock();
            // Same name and region but ~5 km away.
            conn.execute(
                "INSERT INTO places (name, region, city, lat, lng, source)
                 VALUES ('Chez Fatou', 'Dakar', 'Dakar', 14.745, -17.47, 'manual')",
                [],
            )
            .unwrap();
        }

        store.upsert(&candidate("ext-9")).unwrap();
        assert_eq!(store.place_count().unwrap(), 2);
    }

    #[test]
    fn raw_entries_are_write_once() {
        let (store, db) = store();
        let entry = RawDirectoryEntry {
            external_id: "ext-raw".into(),
            name: "First".into(),
            vicinity: Some("Dakar".into()),
            lat: 14.7,
            lng: -17.47,
            rating: None,
            rating_count: None,
            types: vec![],
        };
        store.record_raw(&entry, "tile-a").unwrap();

        let renamed = RawDirectoryEntry {
            name: "Second".into(),
            ..entry
        };
        store.record_raw(&renamed, "tile-b").unwrap();

        let conn = db.lock();
        let (payload, tile): (String, String) = conn
            .query_row(
                "SELECT payload, tile_key FROM raw_entries WHERE external_id = 'ext-raw'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(payload.contains("First"));
        assert_eq!(tile, "tile-a");
    }

    #[test]
    fn details_fill_only_missing_fields() {
        let (store, db) = store();
        let id = store.upsert(&candidate("ext-1")).unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "UPDATE places SET phone = '+221 33 000 00 00' WHERE id = ?1",
                [id],
            )
            .unwrap();
        }

        store
            .apply_details(
                id,
                &DirectoryDetails {
                    phone: None,
                    website: Some("https://chezfatou.sn".into()),
                    photos: vec!["ref-1".into()],
                },
            )
            .unwrap();

        let conn = db.lock();
        let (phone, website, images): (String, String, String) = conn
            .query_row(
                "SELECT phone, website, images FROM places WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(phone, "+221 33 000 00 00");
        assert_eq!(website, "https://chezfatou.sn");
        assert!(images.contains("ref-1"));
    }

    #[test]
    fn stale_listing_picks_never_synced_and_old_rows() {
        let (store, db) = store();
        store.upsert(&candidate("ext-fresh")).unwrap();
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO places (external_id, name, region, city, lat, lng, source, last_synced_at)
                 VALUES ('ext-old', 'Old Spot', 'Dakar', 'Dakar', 14.71, -17.46, 'directory',
                         DATETIME('now', '-3 days'))",
                [],
            )
            .unwrap();
        }

        let stale = store.stale_places(24, 10).unwrap();
        let ids: Vec<&str> = stale.iter().map(|(_, ext)| ext.as_str()).collect();
        assert!(ids.contains(&"ext-old"));
        assert!(!ids.contains(&"ext-fresh"));
    }
}
