use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult, DirectoryError};
use crate::grid::SearchPoint;

pub const MAX_RETRIES: u32 = 3;
pub const PAGE_SIZE: usize = 20;
const RETRY_DELAY: Duration = Duration::from_secs(1);
// Directory pagination tokens need propagation time before they are valid.
const PAGE_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// One entry as returned by the nearby-search endpoint, before
/// canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDirectoryEntry {
    pub external_id: String,
    pub name: String,
    pub vicinity: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub rating: Option<f64>,
    pub rating_count: Option<i64>,
    pub types: Vec<String>,
}

/// Extended fields from the details endpoint, used by the incremental
/// refresh cadence.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryDetails {
    pub phone: Option<String>,
    pub website: Option<String>,
    pub photos: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DirectoryPage {
    pub entries: Vec<RawDirectoryEntry>,
    pub next_page_token: Option<String>,
}

/// Seam between the paging/retry policy and the wire. Tests script this;
/// production uses [`HttpDirectoryApi`].
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn fetch_page(
        &self,
        point: &SearchPoint,
        type_filter: &str,
        page_token: Option<&str>,
    ) -> AppResult<DirectoryPage>;

    async fn fetch_details(&self, external_id: &str) -> AppResult<DirectoryDetails>;
}

/// Rate-limit-aware wrapper that owns retries, pagination, and the metro
/// containment filter. One [`search`](Self::search) call is one logical tile
/// query regardless of how many pages it takes.
pub struct DirectoryClient {
    api: Arc<dyn DirectoryApi>,
    target_city: String,
    retry_delay: Duration,
    settle_delay: Duration,
}

impl DirectoryClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let key = config
            .directory_api_key
            .clone()
            .ok_or_else(|| AppError::Config("DIRECTORY_API_KEY is not set".into()))?;
        let api = HttpDirectoryApi::new(
            key,
            config.nearby_endpoint.clone(),
            config.details_endpoint.clone(),
            config.language.clone(),
        )?;
        Ok(Self::from_api(Arc::new(api), &config.target_city))
    }

    pub fn from_api(api: Arc<dyn DirectoryApi>, target_city: &str) -> Self {
        Self {
            api,
            target_city: target_city.to_string(),
            retry_delay: RETRY_DELAY,
            settle_delay: PAGE_SETTLE_DELAY,
        }
    }

    /// Shortens the fixed delays; tunable so tests do not sleep for real.
    pub fn with_delays(mut self, retry_delay: Duration, settle_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.settle_delay = settle_delay;
        self
    }

    pub fn target_city(&self) -> &str {
        &self.target_city
    }

    /// Queries one tile, following pagination until the directory stops
    /// handing out tokens or `limit` entries have been collected. Entries
    /// whose vicinity does not mention the target city are dropped silently.
    pub async fn search(
        &self,
        point: &SearchPoint,
        type_filter: &str,
        limit: Option<usize>,
    ) -> AppResult<Vec<RawDirectoryEntry>> {
        let mut collected = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .fetch_page_with_retry(point, type_filter, page_token.as_deref())
                .await?;
            let page_len = page.entries.len();

            for entry in page.entries {
                if !self.within_target_city(&entry) {
                    trace!(
                        external_id = %entry.external_id,
                        vicinity = ?entry.vicinity,
                        "dropping entry outside target metro"
                    );
                    continue;
                }
                collected.push(entry);
                if let Some(cap) = limit {
                    if collected.len() >= cap {
                        return Ok(collected);
                    }
                }
            }

            match page.next_page_token {
                // A short page means the directory has nothing further even
                // if it echoed a token.
                Some(token) if page_len == PAGE_SIZE => {
                    sleep(self.settle_delay).await;
                    page_token = Some(token);
                }
                _ => return Ok(collected),
            }
        }
    }

    pub async fn details(&self, external_id: &str) -> AppResult<DirectoryDetails> {
        self.api.fetch_details(external_id).await
    }

    async fn fetch_page_with_retry(
        &self,
        point: &SearchPoint,
        type_filter: &str,
        page_token: Option<&str>,
    ) -> AppResult<DirectoryPage> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.fetch_page(point, type_filter, page_token).await {
                Ok(page) => return Ok(page),
                Err(AppError::Directory(err)) if err.is_retryable() && attempt <= MAX_RETRIES => {
                    warn!(
                        attempt,
                        key = %point.location_key(),
                        "directory rate limited; retrying after {:?}",
                        self.retry_delay
                    );
                    sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn within_target_city(&self, entry: &RawDirectoryEntry) -> bool {
        match &entry.vicinity {
            Some(vicinity) => vicinity
                .to_lowercase()
                .contains(&self.target_city.to_lowercase()),
            None => false,
        }
    }
}

pub struct HttpDirectoryApi {
    http: reqwest::Client,
    api_key: SecretString,
    nearby_endpoint: String,
    details_endpoint: String,
    language: String,
}

impl HttpDirectoryApi {
    pub fn new(
        api_key: SecretString,
        nearby_endpoint: String,
        details_endpoint: String,
        language: String,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("placesync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            api_key,
            nearby_endpoint,
            details_endpoint,
            language,
        })
    }

    fn classify(status: StatusCode, body: &str) -> DirectoryError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => DirectoryError::RateLimited,
            StatusCode::BAD_REQUEST => DirectoryError::BadRequest(body.trim().to_string()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DirectoryError::Auth,
            status if status.is_server_error() => DirectoryError::Outage(status.as_u16()),
            status => DirectoryError::Unexpected(status.as_u16()),
        }
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectoryApi {
    async fn fetch_page(
        &self,
        point: &SearchPoint,
        type_filter: &str,
        page_token: Option<&str>,
    ) -> AppResult<DirectoryPage> {
        let location = format!("{},{}", point.lat, point.lng);
        let radius = point.radius_meters.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("location", location.as_str()),
            ("radius", radius.as_str()),
            ("type", type_filter),
            ("language", self.language.as_str()),
            ("key", self.api_key.expose_secret()),
        ];
        if let Some(token) = page_token {
            query.push(("pagetoken", token));
        }

        let response = self
            .http
            .get(&self.nearby_endpoint)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, &body).into());
        }

        let parsed: NearbyResponse = response.json().await?;
        let entries = parsed
            .results
            .into_iter()
            .filter_map(NearbyResult::into_entry)
            .collect();

        Ok(DirectoryPage {
            entries,
            next_page_token: parsed.next_page_token,
        })
    }

    async fn fetch_details(&self, external_id: &str) -> AppResult<DirectoryDetails> {
        let response = self
            .http
            .get(&self.details_endpoint)
            .query(&[
                ("place_id", external_id),
                ("fields", "formatted_phone_number,website,photos"),
                ("language", self.language.as_str()),
                ("key", self.api_key.expose_secret()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify(status, &body).into());
        }

        let parsed: DetailsResponse = response.json().await?;
        let result = parsed.result.unwrap_or_default();
        Ok(DirectoryDetails {
            phone: result.formatted_phone_number,
            website: result.website,
            photos: result
                .photos
                .into_iter()
                .filter_map(|p| p.photo_reference)
                .collect(),
        })
    }
}

#[derive(Deserialize)]
struct NearbyResponse {
    #[serde(default)]
    results: Vec<NearbyResult>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct NearbyResult {
    place_id: Option<String>,
    name: Option<String>,
    vicinity: Option<String>,
    geometry: Option<NearbyGeometry>,
    rating: Option<f64>,
    user_ratings_total: Option<i64>,
    #[serde(default)]
    types: Vec<String>,
}

#[derive(Deserialize)]
struct NearbyGeometry {
    location: Option<NearbyLocation>,
}

#[derive(Deserialize)]
struct NearbyLocation {
    lat: Option<f64>,
    lng: Option<f64>,
}

impl NearbyResult {
    fn into_entry(self) -> Option<RawDirectoryEntry> {
        let external_id = self.place_id?;
        let name = self.name?;
        let location = self.geometry.and_then(|g| g.location)?;
        Some(RawDirectoryEntry {
            external_id,
            name,
            vicinity: self.vicinity,
            lat: location.lat?,
            lng: location.lng?,
            rating: self.rating,
            rating_count: self.user_ratings_total,
            types: self.types,
        })
    }
}

#[derive(Deserialize)]
struct DetailsResponse {
    result: Option<DetailsResult>,
}

#[derive(Default, Deserialize)]
struct DetailsResult {
    formatted_phone_number: Option<String>,
    website: Option<String>,
    #[serde(default)]
    photos: Vec<DetailsPhoto>,
}

#[derive(Deserialize)]
struct DetailsPhoto {
    photo_reference: Option<String>,
}
