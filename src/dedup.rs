use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::AppResult;
use crate::grid::haversine_km;
use crate::store::MERGE_DISTANCE_KM;

/// Relative weights for the data-richness score used to pick a fuzzy-merge
/// survivor. The ordering matters more than the exact constants.
const WEIGHT_EXTERNAL_RATING: i64 = 10;
const WEIGHT_IMAGE: i64 = 2;
const WEIGHT_PHONE: i64 = 5;
const WEIGHT_WEBSITE: i64 = 5;
const WEIGHT_DESCRIPTION: i64 = 3;
const WEIGHT_PRICE_RANGE: i64 = 2;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeReport {
    pub exact_merged: usize,
    pub fuzzy_merged: usize,
    pub kept_distinct: usize,
}

#[derive(Debug, Clone)]
struct PlaceRow {
    id: i64,
    lat: f64,
    lng: f64,
    created_at: String,
    external_rating: Option<f64>,
    review_count: i64,
    image_count: i64,
    has_phone: bool,
    has_website: bool,
    has_description: bool,
    has_price_range: bool,
    cuisine_count: i64,
}

impl PlaceRow {
    fn richness_score(&self) -> i64 {
        let mut score = 0;
        if self.external_rating.is_some() {
            score += WEIGHT_EXTERNAL_RATING;
        }
        score += self.review_count;
        score += WEIGHT_IMAGE * self.image_count;
        if self.has_phone {
            score += WEIGHT_PHONE;
        }
        if self.has_website {
            score += WEIGHT_WEBSITE;
        }
        if self.has_description {
            score += WEIGHT_DESCRIPTION;
        }
        if self.has_price_range {
            score += WEIGHT_PRICE_RANGE;
        }
        score += self.cuisine_count;
        score
    }
}

/// Reconciles duplicate canonical rows. The exact pass (same external id)
/// always runs before the fuzzy pass (same name + region within
/// [`MERGE_DISTANCE_KM`]); both are idempotent.
pub struct DedupEngine {
    db: Arc<Mutex<Connection>>,
}

impl DedupEngine {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn run(&self) -> AppResult<MergeReport> {
        let exact_merged = self.exact_pass()?;
        let (fuzzy_merged, kept_distinct) = self.fuzzy_pass()?;
        let report = MergeReport {
            exact_merged,
            fuzzy_merged,
            kept_distinct,
        };
        info!(
            exact = report.exact_merged,
            fuzzy = report.fuzzy_merged,
            distinct = report.kept_distinct,
            "dedup complete"
        );
        Ok(report)
    }

    /// Collapses rows sharing an external id down to the earliest-created
    /// one, migrating dependent references before deleting the rest.
    pub fn exact_pass(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let mut dup_stmt = conn.prepare(
            "SELECT external_id FROM places
             WHERE external_id IS NOT NULL
             GROUP BY external_id HAVING COUNT(*) > 1",
        )?;
        let duplicated_ids: Vec<String> = dup_stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut member_stmt = conn.prepare(
            "SELECT id FROM places WHERE external_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let mut merged = 0;
        for external_id in duplicated_ids {
            let members: Vec<i64> = member_stmt
                .query_map([external_id.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let Some((&survivor, losers)) = members.split_first() else {
                continue;
            };
            for &loser in losers {
                merge_into(&conn, loser, survivor)?;
                merged += 1;
            }
            debug!(external_id = %external_id, survivor, merged = losers.len(), "exact duplicates collapsed");
        }
        Ok(merged)
    }

    /// Merges same-name, same-region pairs closer than the merge distance,
    /// keeping the richer record. Pairs further apart are left alone.
    pub fn fuzzy_pass(&self) -> AppResult<(usize, usize)> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT name, region FROM places
             GROUP BY name, region HAVING COUNT(*) > 1",
        )?;
        let groups: Vec<(String, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut merged = 0;
        let mut kept_distinct = 0;
        for (name, region) in groups {
            let rows = load_group(&conn, &name, region.as_deref())?;
            let mut removed: HashSet<i64> = HashSet::new();

            for i in 0..rows.len() {
                if removed.contains(&rows[i].id) {
                    continue;
                }
                for j in (i + 1)..rows.len() {
                    if removed.contains(&rows[j].id) || removed.contains(&rows[i].id) {
                        continue;
                    }
                    let a = &rows[i];
                    let b = &rows[j];
                    let distance = haversine_km(a.lat, a.lng, b.lat, b.lng);
                    if distance >= MERGE_DISTANCE_KM {
                        debug!(
                            name = %name,
                            a = a.id,
                            b = b.id,
                            distance_km = distance,
                            "same-name places kept distinct"
                        );
                        kept_distinct += 1;
                        continue;
                    }

                    let (survivor, loser) = pick_survivor(a, b);
                    merge_into(&conn, loser.id, survivor.id)?;
                    removed.insert(loser.id);
                    merged += 1;
                    debug!(
                        name = %name,
                        survivor = survivor.id,
                        loser = loser.id,
                        distance_km = distance,
                        "fuzzy duplicates merged"
                    );
                }
            }
        }
        Ok((merged, kept_distinct))
    }
}

fn pick_survivor<'a>(a: &'a PlaceRow, b: &'a PlaceRow) -> (&'a PlaceRow, &'a PlaceRow) {
    let (sa, sb) = (a.richness_score(), b.richness_score());
    if sa > sb {
        (a, b)
    } else if sb > sa {
        (b, a)
    } else if a.created_at <= b.created_at {
        (a, b)
    } else {
        (b, a)
    }
}

/// Migrates reviews, hangouts, and advertisements off the losing row, then
/// deletes it. Reference migration must precede the delete so no dependent
/// row is ever orphaned.
fn merge_into(conn: &Connection, loser: i64, survivor: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE reviews SET place_id = ?2 WHERE place_id = ?1",
        (loser, survivor),
    )?;
    conn.execute(
        "UPDATE hangouts SET place_id = ?2 WHERE place_id = ?1",
        (loser, survivor),
    )?;
    conn.execute(
        "UPDATE advertisements SET place_id = ?2 WHERE place_id = ?1",
        (loser, survivor),
    )?;
    conn.execute("DELETE FROM places WHERE id = ?1", [loser])?;
    Ok(())
}

fn load_group(conn: &Connection, name: &str, region: Option<&str>) -> AppResult<Vec<PlaceRow>> {
    let sql = "SELECT id, lat, lng, created_at, external_rating, review_count,
                      images, phone, website, description, price_range, cuisines
               FROM places
               WHERE name = ?1 AND region IS ?2
               ORDER BY created_at ASC, id ASC";
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map((name, region), |row| parse_place_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_place_row(row: &Row<'_>) -> rusqlite::Result<PlaceRow> {
    let images: Option<String> = row.get(6)?;
    let cuisines: Option<String> = row.get(11)?;
    Ok(PlaceRow {
        id: row.get(0)?,
        lat: row.get(1)?,
        lng: row.get(2)?,
        created_at: row.get(3)?,
        external_rating: row.get(4)?,
        review_count: row.get(5)?,
        image_count: json_array_len(images.as_deref()),
        has_phone: row.get::<_, Option<String>>(7)?.is_some(),
        has_website: row.get::<_, Option<String>>(8)?.is_some(),
        has_description: row.get::<_, Option<String>>(9)?.is_some(),
        has_price_range: row.get::<_, Option<String>>(10)?.is_some(),
        cuisine_count: json_array_len(cuisines.as_deref()),
    })
}

fn json_array_len(value: Option<&str>) -> i64 {
    value
        .and_then(|text| serde_json::from_str::<Vec<serde_json::Value>>(text).ok())
        .map(|list| list.len() as i64)
        .unwrap_or(0)
}
