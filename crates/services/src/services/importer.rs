//! Imports businesses from the Places API into the directory.
//!
//! One Text Search drives the run: new places get a Place Details call and a
//! row upsert (plus their reviews), already-known places are refreshed or
//! skipped. Replaces per-category one-off fetch scripts with a single
//! parameterized service.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use db::models::{
    business::{Business, CreateBusiness},
    review::{CreateReview, Review},
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{error, info, warn};
use ts_rs::TS;

use super::places::{PlaceDetails, PlacesApiError, PlacesClient};

#[derive(Debug, Error)]
pub enum ImporterError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("places api error: {0}")]
    PlacesApi(#[from] PlacesApiError),
    #[error("an import is already running")]
    AlreadyRunning,
}

/// Parameters for one import run
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ImportRequest {
    pub query: String,
    pub location: Option<(f64, f64)>,
    pub radius_meters: Option<u32>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum ImportState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

/// Live counters for the current (or last) import run
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct ImportSummary {
    pub state: ImportState,
    pub query: Option<String>,
    pub found: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped_duplicates: u64,
    pub failed: u64,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct ImporterService {
    pool: SqlitePool,
    places: PlacesClient,
    summary: Arc<Mutex<ImportSummary>>,
}

impl ImporterService {
    pub fn new(pool: SqlitePool, places: PlacesClient) -> Self {
        Self {
            pool,
            places,
            summary: Arc::new(Mutex::new(ImportSummary::default())),
        }
    }

    pub fn status(&self) -> ImportSummary {
        self.summary.lock().expect("importer summary poisoned").clone()
    }

    /// Kick off a background import. Errors if one is already in flight.
    pub fn start(&self, request: ImportRequest) -> Result<(), ImporterError> {
        {
            let mut summary = self.summary.lock().expect("importer summary poisoned");
            if summary.state == ImportState::Running {
                return Err(ImporterError::AlreadyRunning);
            }
            *summary = ImportSummary {
                state: ImportState::Running,
                query: Some(request.query.clone()),
                started_at: Some(Utc::now()),
                ..ImportSummary::default()
            };
        }

        let pool = self.pool.clone();
        let places = self.places.clone();
        let summary = self.summary.clone();
        tokio::spawn(async move {
            let result = run_import(&pool, &places, &request, &summary).await;
            let mut summary = summary.lock().expect("importer summary poisoned");
            summary.finished_at = Some(Utc::now());
            match result {
                Ok(()) => {
                    summary.state = ImportState::Completed;
                    info!(
                        query = %request.query,
                        inserted = summary.inserted,
                        updated = summary.updated,
                        skipped = summary.skipped_duplicates,
                        failed = summary.failed,
                        "import finished"
                    );
                }
                Err(e) => {
                    error!(query = %request.query, error = %e, "import failed");
                    summary.state = ImportState::Failed;
                    summary.error = Some(e.to_string());
                }
            }
        });

        Ok(())
    }
}

async fn run_import(
    pool: &SqlitePool,
    places: &PlacesClient,
    request: &ImportRequest,
    summary: &Arc<Mutex<ImportSummary>>,
) -> Result<(), ImporterError> {
    let results = places
        .text_search(&request.query, request.location, request.radius_meters)
        .await?;

    {
        let mut s = summary.lock().expect("importer summary poisoned");
        s.found = results.len() as u64;
    }
    info!(query = %request.query, found = results.len(), "text search complete");

    for place in results {
        let outcome = import_place(pool, places, &place.place_id, &place.name, request).await;
        let mut s = summary.lock().expect("importer summary poisoned");
        match outcome {
            Ok(PlaceOutcome::Inserted) => s.inserted += 1,
            Ok(PlaceOutcome::Updated) => s.updated += 1,
            Ok(PlaceOutcome::SkippedDuplicate) => s.skipped_duplicates += 1,
            Err(e) => {
                warn!(place_id = %place.place_id, name = %place.name, error = %e, "place import failed");
                s.failed += 1;
            }
        }
    }

    Ok(())
}

enum PlaceOutcome {
    Inserted,
    Updated,
    SkippedDuplicate,
}

async fn import_place(
    pool: &SqlitePool,
    places: &PlacesClient,
    place_id: &str,
    name: &str,
    request: &ImportRequest,
) -> Result<PlaceOutcome, ImporterError> {
    let existing = Business::find_by_place_id(pool, place_id).await?;

    // A different place with the same normalized name ("Joe's Cafe" vs
    // "Joes Cafe") is treated as a duplicate listing and skipped.
    if existing.is_none()
        && Business::find_by_normalized_name(pool, name)
            .await?
            .is_some()
    {
        return Ok(PlaceOutcome::SkippedDuplicate);
    }

    let details = places.details(place_id).await?;
    let data = business_from_details(places, &details, request.category.as_deref());
    let business = Business::create_or_update(pool, &data).await?;

    if let Some(reviews) = &details.reviews {
        for review in reviews {
            Review::create(
                pool,
                business.id,
                &CreateReview {
                    author_name: review.author_name.clone(),
                    rating: review.rating,
                    text: review.text.clone(),
                    relative_time: review.relative_time_description.clone(),
                },
            )
            .await?;
        }
    }

    Ok(if existing.is_some() {
        PlaceOutcome::Updated
    } else {
        PlaceOutcome::Inserted
    })
}

fn business_from_details(
    places: &PlacesClient,
    details: &PlaceDetails,
    category_override: Option<&str>,
) -> CreateBusiness {
    let photos = details.photos.as_ref().map(|refs| {
        refs.iter()
            .map(|p| places.photo_url(&p.photo_reference))
            .collect::<Vec<_>>()
    });
    // The first photo doubles as the logo when the listing has no dedicated one
    let logo_url = photos.as_ref().and_then(|p| p.first().cloned());

    CreateBusiness {
        place_id: details.place_id.clone(),
        name: details.name.clone(),
        address: details.formatted_address.clone(),
        phone: details.formatted_phone_number.clone(),
        website: details.website.clone(),
        category: category_override
            .map(str::to_string)
            .or_else(|| details.types.first().cloned()),
        rating: details.rating,
        reviews_count: details.user_ratings_total.unwrap_or(0),
        hours: details
            .opening_hours
            .as_ref()
            .and_then(|h| h.weekday_text.clone()),
        photos,
        logo_url,
    }
}
