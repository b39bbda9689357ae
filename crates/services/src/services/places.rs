//! Google Places API client (Text Search, Place Details, photo URLs).

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

const PLACES_API_BASE: &str = "https://maps.googleapis.com/maps/api/place";
const DEFAULT_PHOTO_MAX_WIDTH: u32 = 800;

#[derive(Debug, Clone, Error)]
pub enum PlacesApiError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("rate limited (OVER_QUERY_LIMIT)")]
    RateLimited,
    #[error("request denied: invalid or unauthorized api key")]
    InvalidApiKey,
    #[error("places api status {0}")]
    Status(String),
    #[error("json error: {0}")]
    Serde(String),
    #[error("missing api key: GOOGLE_MAPS_API_KEY environment variable not set")]
    MissingApiKey,
}

impl PlacesApiError {
    /// Returns true if the error is transient and should be retried.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::RateLimited => true,
            Self::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

/// One result row from Text Search
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceSummary {
    pub place_id: String,
    pub name: String,
    pub formatted_address: Option<String>,
    pub rating: Option<f64>,
    pub user_ratings_total: Option<i64>,
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TextSearchResponse {
    status: String,
    #[serde(default)]
    results: Vec<PlaceSummary>,
    error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoRef {
    pub photo_reference: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpeningHours {
    pub weekday_text: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceReview {
    pub author_name: String,
    pub rating: Option<i64>,
    pub text: Option<String>,
    pub relative_time_description: Option<String>,
}

/// Full listing data from Place Details
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceDetails {
    pub place_id: String,
    pub name: String,
    pub formatted_address: Option<String>,
    pub formatted_phone_number: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub user_ratings_total: Option<i64>,
    #[serde(default)]
    pub types: Vec<String>,
    pub opening_hours: Option<OpeningHours>,
    pub photos: Option<Vec<PhotoRef>>,
    pub reviews: Option<Vec<PlaceReview>>,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    status: String,
    result: Option<PlaceDetails>,
    error_message: Option<String>,
}

/// Google Places API client
#[derive(Debug, Clone)]
pub struct PlacesClient {
    http: Client,
    api_key: String,
    photo_max_width: u32,
}

impl PlacesClient {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a new client using the GOOGLE_MAPS_API_KEY environment variable
    pub fn from_env() -> Result<Self, PlacesApiError> {
        let api_key =
            std::env::var("GOOGLE_MAPS_API_KEY").map_err(|_| PlacesApiError::MissingApiKey)?;
        Self::new(api_key, None)
    }

    pub fn new(api_key: String, photo_max_width: Option<u32>) -> Result<Self, PlacesApiError> {
        let http = Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(concat!("bizdir/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlacesApiError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            photo_max_width: photo_max_width.unwrap_or(DEFAULT_PHOTO_MAX_WIDTH),
        })
    }

    /// Text Search for businesses matching a query, optionally biased to a
    /// lat/lng and radius. `ZERO_RESULTS` is an empty vec, not an error.
    pub async fn text_search(
        &self,
        query: &str,
        location: Option<(f64, f64)>,
        radius_meters: Option<u32>,
    ) -> Result<Vec<PlaceSummary>, PlacesApiError> {
        let mut params: Vec<(&str, String)> = vec![
            ("query", query.to_string()),
            ("key", self.api_key.clone()),
        ];
        if let Some((lat, lng)) = location {
            params.push(("location", format!("{lat},{lng}")));
        }
        if let Some(radius) = radius_meters {
            params.push(("radius", radius.to_string()));
        }

        let response: TextSearchResponse = self
            .get_with_retry(&format!("{PLACES_API_BASE}/textsearch/json"), &params)
            .await?;
        check_places_status(&response.status, response.error_message.as_deref())?;
        Ok(response.results)
    }

    /// Place Details for one place_id.
    pub async fn details(&self, place_id: &str) -> Result<PlaceDetails, PlacesApiError> {
        let params: Vec<(&str, String)> = vec![
            ("place_id", place_id.to_string()),
            (
                "fields",
                "place_id,name,formatted_address,formatted_phone_number,website,rating,\
                 user_ratings_total,types,opening_hours,photos,reviews"
                    .to_string(),
            ),
            ("key", self.api_key.clone()),
        ];

        let response: DetailsResponse = self
            .get_with_retry(&format!("{PLACES_API_BASE}/details/json"), &params)
            .await?;
        check_places_status(&response.status, response.error_message.as_deref())?;
        response
            .result
            .ok_or_else(|| PlacesApiError::Serde("details response missing result".to_string()))
    }

    /// Resolvable URL for a photo reference. The Photo endpoint 302s to the
    /// actual image bytes, so this URL is fetchable directly.
    pub fn photo_url(&self, photo_reference: &str) -> String {
        format!(
            "{PLACES_API_BASE}/photo?maxwidth={}&photo_reference={}&key={}",
            self.photo_max_width, photo_reference, self.api_key
        )
    }

    async fn get_with_retry<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T, PlacesApiError> {
        (|| async { self.send_request(url, params).await })
            .retry(
                &ExponentialBuilder::default()
                    .with_min_delay(Duration::from_secs(1))
                    .with_max_delay(Duration::from_secs(30))
                    .with_max_times(3)
                    .with_jitter(),
            )
            .when(|e: &PlacesApiError| e.should_retry())
            .notify(|e, dur| {
                warn!(
                    "Places API call failed, retrying after {:.2}s: {}",
                    dur.as_secs_f64(),
                    e
                )
            })
            .await
    }

    async fn send_request<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T, PlacesApiError> {
        let res = self
            .http
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(PlacesApiError::Http {
                status: status.as_u16(),
                body,
            });
        }

        res.json::<T>()
            .await
            .map_err(|e| PlacesApiError::Serde(e.to_string()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> PlacesApiError {
    if e.is_timeout() {
        PlacesApiError::Timeout
    } else {
        PlacesApiError::Transport(e.to_string())
    }
}

/// Map the Places envelope `status` field into a typed error.
fn check_places_status(status: &str, error_message: Option<&str>) -> Result<(), PlacesApiError> {
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        "OVER_QUERY_LIMIT" => Err(PlacesApiError::RateLimited),
        "REQUEST_DENIED" => Err(PlacesApiError::InvalidApiKey),
        other => Err(PlacesApiError::Status(format!(
            "{other}{}",
            error_message
                .map(|m| format!(": {m}"))
                .unwrap_or_default()
        ))),
    }
}
