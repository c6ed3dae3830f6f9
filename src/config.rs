use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::grid::BoundingBox;

const DEFAULT_NEARBY_ENDPOINT: &str =
    "https://maps.googleapis.com/maps/api/place/nearbysearch/json";
const DEFAULT_DETAILS_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/place/details/json";

// Dakar metro defaults; every value is overridable from the environment.
const DEFAULT_NORTH: f64 = 14.83;
const DEFAULT_SOUTH: f64 = 14.64;
const DEFAULT_WEST: f64 = -17.54;
const DEFAULT_EAST: f64 = -17.26;
const DEFAULT_SPACING_KM: f64 = 2.0;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub directory_api_key: Option<SecretString>,
    pub nearby_endpoint: String,
    pub details_endpoint: String,
    pub target_city: String,
    pub language: String,
    pub bounding_box: BoundingBox,
    pub grid_spacing_km: f64,
    pub tile_refresh_days: i64,
    pub inter_request_delay_ms: u64,
    pub search_types: Vec<String>,
    pub database_file_name: String,
    pub data_dir: Option<String>,
}

/// Loggable view of the config with the API key reduced to a presence flag.
#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub has_directory_api_key: bool,
    pub target_city: String,
    pub language: String,
    pub grid_spacing_km: f64,
    pub tile_refresh_days: i64,
    pub inter_request_delay_ms: u64,
    pub search_types: Vec<String>,
    pub database_file_name: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            directory_api_key: env::var("DIRECTORY_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            nearby_endpoint: env::var("DIRECTORY_NEARBY_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_NEARBY_ENDPOINT.to_string()),
            details_endpoint: env::var("DIRECTORY_DETAILS_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_DETAILS_ENDPOINT.to_string()),
            target_city: env::var("TARGET_CITY").unwrap_or_else(|_| "Dakar".to_string()),
            language: env::var("DIRECTORY_LANGUAGE").unwrap_or_else(|_| "fr".to_string()),
            bounding_box: BoundingBox {
                north: parse_f64("GRID_NORTH", DEFAULT_NORTH),
                south: parse_f64("GRID_SOUTH", DEFAULT_SOUTH),
                east: parse_f64("GRID_EAST", DEFAULT_EAST),
                west: parse_f64("GRID_WEST", DEFAULT_WEST),
            },
            grid_spacing_km: parse_f64("GRID_SPACING_KM", DEFAULT_SPACING_KM),
            tile_refresh_days: parse_i64("TILE_REFRESH_DAYS", 30),
            inter_request_delay_ms: parse_u64("SYNC_INTER_REQUEST_DELAY_MS", 2_000),
            search_types: parse_list("DIRECTORY_SEARCH_TYPES", &["restaurant"]),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "placesync.db".to_string()),
            data_dir: env::var("PLACESYNC_DATA_DIR").ok(),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            has_directory_api_key: self.directory_api_key.is_some(),
            target_city: self.target_city.clone(),
            language: self.language.clone(),
            grid_spacing_km: self.grid_spacing_km,
            tile_refresh_days: self.tile_refresh_days,
            inter_request_delay_ms: self.inter_request_delay_ms,
            search_types: self.search_types.clone(),
            database_file_name: self.database_file_name.clone(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn parse_list(key: &str, default: &[&str]) -> Vec<String> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|list: &Vec<String>| !list.is_empty())
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("DIRECTORY_API_KEY", "secret");
        env::set_var("TARGET_CITY", "Thies");
        env::set_var("DATABASE_FILE_NAME", "custom.db");
        env::set_var("DIRECTORY_SEARCH_TYPES", "restaurant, cafe");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert!(public.has_directory_api_key);
        assert_eq!(public.target_city, "Thies");
        assert_eq!(public.database_file_name, "custom.db");
        assert_eq!(public.search_types, vec!["restaurant", "cafe"]);
        assert!(config.directory_api_key.is_some());

        env::remove_var("DIRECTORY_API_KEY");
        env::remove_var("TARGET_CITY");
        env::remove_var("DATABASE_FILE_NAME");
        env::remove_var("DIRECTORY_SEARCH_TYPES");
    }

    #[test]
    fn falls_back_to_metro_defaults() {
        env::remove_var("GRID_NORTH");
        env::remove_var("GRID_SPACING_KM");
        let config = AppConfig::from_env();
        assert_eq!(config.bounding_box.north, DEFAULT_NORTH);
        assert_eq!(config.grid_spacing_km, DEFAULT_SPACING_KM);
        assert_eq!(config.tile_refresh_days, 30);
    }
}
