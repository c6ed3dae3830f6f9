use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

/// Opens (creating if needed) the canonical store and brings the schema up to
/// date. This is the only fatal failure point of a sync run: everything after
/// a successful bootstrap degrades per tile instead of aborting.
pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let connection = Connection::open(&db_path)?;
    apply_pragmas(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "canonical store ready"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

/// In-memory store for tests and dry runs.
pub fn bootstrap_in_memory() -> AppResult<Connection> {
    let connection = Connection::open_in_memory()?;
    apply_pragmas(&connection)?;
    run_migrations(&connection)?;
    Ok(connection)
}

fn apply_pragmas(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS places (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT,
            name TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'other',
            street TEXT,
            city TEXT,
            region TEXT,
            lat REAL NOT NULL,
            lng REAL NOT NULL,
            external_rating REAL,
            review_count INTEGER NOT NULL DEFAULT 0,
            app_rating REAL,
            images TEXT,
            phone TEXT,
            website TEXT,
            description TEXT,
            price_range TEXT,
            cuisines TEXT,
            verified INTEGER NOT NULL DEFAULT 0 CHECK (verified IN (0, 1)),
            status TEXT NOT NULL DEFAULT 'pending',
            source TEXT NOT NULL DEFAULT 'directory',
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            last_synced_at TEXT
        );

        CREATE TABLE IF NOT EXISTS search_tiles (
            location_key TEXT PRIMARY KEY,
            radius_meters INTEGER NOT NULL,
            search_terms TEXT NOT NULL,
            external_ids TEXT NOT NULL,
            last_searched_at TEXT NOT NULL,
            refresh_interval_days INTEGER NOT NULL DEFAULT 30
        );

        CREATE TABLE IF NOT EXISTS raw_entries (
            external_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            tile_key TEXT NOT NULL,
            found_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS reviews (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            place_id INTEGER NOT NULL REFERENCES places(id),
            rating REAL,
            body TEXT,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS hangouts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            place_id INTEGER NOT NULL REFERENCES places(id),
            title TEXT,
            scheduled_at TEXT
        );

        CREATE TABLE IF NOT EXISTS advertisements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            place_id INTEGER NOT NULL REFERENCES places(id),
            headline TEXT,
            active INTEGER NOT NULL DEFAULT 0
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_places_external_id
            ON places(external_id) WHERE external_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_places_name_region ON places(name, region);
        CREATE INDEX IF NOT EXISTS idx_places_last_synced ON places(last_synced_at);
        "#,
    )?;

    ensure_column(connection, "places", "last_synced_at TEXT")?;
    ensure_column(connection, "search_tiles", "search_terms TEXT NOT NULL DEFAULT ''")?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "test.db").unwrap();

        let mut stmt = ctx
            .connection
            .prepare(
                "SELECT name FROM sqlite_master WHERE type='table'
                 AND name IN ('places','search_tiles','raw_entries','reviews','hangouts','advertisements')",
            )
            .unwrap();
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .count();
        assert_eq!(rows, 6);
        assert!(ctx.path.ends_with("test.db"));
    }

    #[test]
    fn external_id_index_is_sparse() {
        let conn = bootstrap_in_memory().unwrap();
        // Two manual places without an external id must coexist.
        conn.execute(
            "INSERT INTO places (name, lat, lng, source) VALUES ('A', 1.0, 1.0, 'manual')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO places (name, lat, lng, source) VALUES ('B', 2.0, 2.0, 'manual')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO places (name, lat, lng, external_id) VALUES ('C', 3.0, 3.0, 'ext-1')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO places (name, lat, lng, external_id) VALUES ('D', 4.0, 4.0, 'ext-1')",
            [],
        );
        assert!(dup.is_err());
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempdir().unwrap();
        bootstrap(dir.path(), "again.db").unwrap();
        bootstrap(dir.path(), "again.db").unwrap();
    }
}
