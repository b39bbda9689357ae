//! Bulk image-sync engine: walks businesses in pages, fetches their logo and
//! photo bytes from source URLs (or inline base64), uploads them to the
//! configured [`ImageStore`], and writes the resulting object URLs back onto
//! the rows. One run at a time; bounded concurrency; per-item failures are
//! counted, not fatal; progress streams over a watch channel and each page is
//! checkpointed to the `sync_jobs` table.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use db::models::{
    business::{Business, ImageSyncStatus},
    sync_job::{SyncJob, SyncJobState},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::{
    sync::{Mutex, Semaphore, watch},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ts_rs::TS;
use uuid::Uuid;

use super::storage::{ImageStore, StorageError, logo_key, photo_key};

const PAGE_SIZE: i64 = 50;
const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum ImageSyncError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("no sync run is in progress")]
    NotRunning,
}

#[derive(Debug, Clone, Error)]
enum ImageFetchError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("http {0}")]
    Http(u16),
    #[error("malformed data url")]
    InvalidDataUrl,
    #[error("base64 decode error: {0}")]
    Base64(String),
}

impl ImageFetchError {
    fn should_retry(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Http(status) => (500..=599).contains(status),
            _ => false,
        }
    }
}

/// Options for one sync run
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct SyncOptions {
    /// Max in-flight businesses
    pub concurrency: Option<usize>,
    /// Re-upload images even for rows already marked synced
    #[serde(default)]
    pub force: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SyncState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Progress snapshot published on the watch channel and streamed over SSE
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
pub struct SyncProgress {
    pub job_id: Option<Uuid>,
    pub state: SyncState,
    pub total: u64,
    pub processed: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub error: Option<String>,
}

#[derive(Default)]
struct SyncCounters {
    processed: AtomicU64,
    uploaded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl SyncCounters {
    fn snapshot(&self, job_id: Uuid, state: SyncState, total: u64) -> SyncProgress {
        SyncProgress {
            job_id: Some(job_id),
            state,
            total,
            processed: self.processed.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            error: None,
        }
    }
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The bulk image-sync service. Cheap to clone via `Arc` in app state.
pub struct ImageSyncService {
    pool: SqlitePool,
    store: Arc<dyn ImageStore>,
    http: Client,
    default_concurrency: usize,
    progress_tx: Arc<watch::Sender<SyncProgress>>,
    current: Mutex<Option<RunHandle>>,
}

impl ImageSyncService {
    const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(
        pool: SqlitePool,
        store: Arc<dyn ImageStore>,
        default_concurrency: Option<usize>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Self::FETCH_TIMEOUT)
            .user_agent(concat!("bizdir/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        let (progress_tx, _) = watch::channel(SyncProgress::default());
        Self {
            pool,
            store,
            http,
            default_concurrency: default_concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            progress_tx: Arc::new(progress_tx),
            current: Mutex::new(None),
        }
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> SyncProgress {
        self.progress_tx.borrow().clone()
    }

    /// Subscribe to live progress updates.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    /// Start a background sync run. Single-flight: errors if one is running.
    pub async fn start(&self, options: SyncOptions) -> Result<SyncJob, ImageSyncError> {
        let mut current = self.current.lock().await;
        if let Some(run) = current.as_mut()
            && !run.task.is_finished()
        {
            // The run loop publishes its terminal state just before the task
            // exits; treat that window as finished rather than racing it.
            if self.progress_tx.borrow().state.is_terminal() {
                let _ = (&mut run.task).await;
            } else {
                return Err(ImageSyncError::AlreadyRunning);
            }
        }

        let total = Business::count_for_sync(&self.pool, options.force).await? as u64;
        let job = SyncJob::create(&self.pool, total as i64).await?;
        info!(job_id = %job.id, total, force = options.force, "starting image sync");

        let cancel = CancellationToken::new();
        let concurrency = options
            .concurrency
            .unwrap_or(self.default_concurrency)
            .max(1);

        self.progress_tx.send_replace(SyncProgress {
            job_id: Some(job.id),
            state: SyncState::Running,
            total,
            ..SyncProgress::default()
        });

        let task = tokio::spawn(run_sync(
            self.pool.clone(),
            self.store.clone(),
            self.http.clone(),
            self.progress_tx.clone(),
            job.id,
            total,
            concurrency,
            options.force,
            cancel.clone(),
        ));
        *current = Some(RunHandle { cancel, task });

        Ok(job)
    }

    /// Request cancellation of the running sync. In-flight items finish, the
    /// job row is marked `cancelled`.
    pub async fn cancel(&self) -> Result<(), ImageSyncError> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(run) if !run.task.is_finished() => {
                info!("image sync cancellation requested");
                run.cancel.cancel();
                Ok(())
            }
            _ => Err(ImageSyncError::NotRunning),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sync(
    pool: SqlitePool,
    store: Arc<dyn ImageStore>,
    http: Client,
    progress_tx: Arc<watch::Sender<SyncProgress>>,
    job_id: Uuid,
    total: u64,
    concurrency: usize,
    force: bool,
    cancel: CancellationToken,
) {
    let counters = Arc::new(SyncCounters::default());
    let result = sync_all(
        &pool,
        &store,
        &http,
        &progress_tx,
        job_id,
        total,
        concurrency,
        force,
        &cancel,
        &counters,
    )
    .await;

    let (state, job_state, err) = match result {
        Ok(()) if cancel.is_cancelled() => (SyncState::Cancelled, SyncJobState::Cancelled, None),
        Ok(()) => (SyncState::Completed, SyncJobState::Completed, None),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "image sync run failed");
            (SyncState::Failed, SyncJobState::Failed, Some(e.to_string()))
        }
    };

    if let Err(e) = SyncJob::finish(&pool, job_id, job_state, err.as_deref()).await {
        error!(job_id = %job_id, error = %e, "failed to finalize sync job row");
    }

    let mut final_progress = counters.snapshot(job_id, state.clone(), total);
    final_progress.error = err;
    progress_tx.send_replace(final_progress);

    info!(
        job_id = %job_id,
        state = ?state,
        processed = counters.processed.load(Ordering::Relaxed),
        uploaded = counters.uploaded.load(Ordering::Relaxed),
        skipped = counters.skipped.load(Ordering::Relaxed),
        failed = counters.failed.load(Ordering::Relaxed),
        "image sync finished"
    );
}

#[allow(clippy::too_many_arguments)]
async fn sync_all(
    pool: &SqlitePool,
    store: &Arc<dyn ImageStore>,
    http: &Client,
    progress_tx: &Arc<watch::Sender<SyncProgress>>,
    job_id: Uuid,
    total: u64,
    concurrency: usize,
    force: bool,
    cancel: &CancellationToken,
    counters: &Arc<SyncCounters>,
) -> Result<(), sqlx::Error> {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut cursor: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let page = Business::find_page_for_sync(pool, cursor.as_deref(), PAGE_SIZE, force).await?;
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|b| b.place_id.clone());

        let mut set = JoinSet::new();
        for business in page {
            if cancel.is_cancelled() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let pool = pool.clone();
            let store = store.clone();
            let http = http.clone();
            let progress_tx = progress_tx.clone();
            let counters = counters.clone();
            set.spawn(async move {
                let outcome = sync_business_images(&pool, &store, &http, &business, force).await;
                match outcome {
                    ItemOutcome::Uploaded => counters.uploaded.fetch_add(1, Ordering::Relaxed),
                    ItemOutcome::Skipped => counters.skipped.fetch_add(1, Ordering::Relaxed),
                    ItemOutcome::Failed => counters.failed.fetch_add(1, Ordering::Relaxed),
                };
                counters.processed.fetch_add(1, Ordering::Relaxed);
                progress_tx.send_replace(counters.snapshot(job_id, SyncState::Running, total));
                drop(permit);
            });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                // A crashed worker still counts against the run
                error!(job_id = %job_id, error = %e, "sync worker crashed");
                counters.failed.fetch_add(1, Ordering::Relaxed);
                counters.processed.fetch_add(1, Ordering::Relaxed);
                progress_tx.send_replace(counters.snapshot(job_id, SyncState::Running, total));
            }
        }

        SyncJob::update_progress(
            pool,
            job_id,
            counters.processed.load(Ordering::Relaxed) as i64,
            counters.uploaded.load(Ordering::Relaxed) as i64,
            counters.skipped.load(Ordering::Relaxed) as i64,
            counters.failed.load(Ordering::Relaxed) as i64,
            cursor.as_deref(),
        )
        .await?;
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
enum ItemOutcome {
    Uploaded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
enum PendingImage {
    Logo { source_url: String },
    Photo { index: usize, source_url: String },
}

/// Which of a row's images still need uploading. Photos count as synced only
/// when every source photo has a recorded object URL, so a row left with a
/// partial list by an earlier failure gets re-fetched on the next run.
fn pending_images(business: &Business, force: bool) -> Vec<PendingImage> {
    let mut pending = Vec::new();
    if let Some(logo_url) = &business.logo_url
        && (force || business.logo_object_url.is_none())
    {
        pending.push(PendingImage::Logo {
            source_url: logo_url.clone(),
        });
    }

    if let Some(photos) = &business.photos {
        let synced_count = business
            .photo_object_urls
            .as_ref()
            .map_or(0, |urls| urls.0.len());
        if force || synced_count != photos.0.len() {
            for (index, source_url) in photos.0.iter().enumerate() {
                pending.push(PendingImage::Photo {
                    index,
                    source_url: source_url.clone(),
                });
            }
        }
    }
    pending
}

async fn sync_business_images(
    pool: &SqlitePool,
    store: &Arc<dyn ImageStore>,
    http: &Client,
    business: &Business,
    force: bool,
) -> ItemOutcome {
    let pending = pending_images(business, force);
    if pending.is_empty() {
        return ItemOutcome::Skipped;
    }

    // One slot per source photo. Pre-filled from the stored list when it
    // lines up with the photo set, so a failed re-fetch under force keeps the
    // previously recorded URL for that position instead of dropping it.
    let photo_count = business.photos.as_ref().map_or(0, |p| p.0.len());
    let mut photo_slots: Vec<Option<String>> = match &business.photo_object_urls {
        Some(urls) if urls.0.len() == photo_count => {
            urls.0.iter().cloned().map(Some).collect()
        }
        _ => vec![None; photo_count],
    };
    let mut logo_object_url: Option<String> = None;

    for image in pending {
        let (source_url, key_for) = match &image {
            PendingImage::Logo { source_url } => (source_url.clone(), None),
            PendingImage::Photo { index, source_url } => (source_url.clone(), Some(*index)),
        };

        match transfer_image(store, http, &business.place_id, &source_url, key_for).await {
            Ok(object_url) => match key_for {
                None => logo_object_url = Some(object_url),
                Some(index) => photo_slots[index] = Some(object_url),
            },
            Err(e) => {
                warn!(
                    place_id = %business.place_id,
                    source_url = %truncate_url(&source_url),
                    error = %e,
                    "image transfer failed"
                );
            }
        }
    }

    // The row is synced once every wanted image has an object URL, whether
    // from this pass or a previous one.
    let logo_complete = business.logo_url.is_none()
        || logo_object_url.is_some()
        || business.logo_object_url.is_some();
    let photos_complete = photo_slots.iter().all(Option::is_some);
    let photo_urls: Vec<String> = photo_slots.into_iter().flatten().collect();

    let status = if logo_complete && photos_complete {
        ImageSyncStatus::Synced
    } else {
        ImageSyncStatus::Failed
    };
    if let Err(e) = Business::update_image_sync(
        pool,
        business.id,
        logo_object_url.as_deref(),
        &photo_urls,
        status.clone(),
    )
    .await
    {
        error!(place_id = %business.place_id, error = %e, "failed to record image sync result");
        return ItemOutcome::Failed;
    }

    if status == ImageSyncStatus::Synced {
        ItemOutcome::Uploaded
    } else {
        ItemOutcome::Failed
    }
}

/// Fetch one image and upload it, returning the stored object URL.
async fn transfer_image(
    store: &Arc<dyn ImageStore>,
    http: &Client,
    place_id: &str,
    source_url: &str,
    photo_index: Option<usize>,
) -> Result<String, anyhow::Error> {
    let (bytes, content_type) = fetch_image(http, source_url).await?;
    let key = match photo_index {
        None => logo_key(place_id, &content_type),
        Some(index) => photo_key(place_id, index, &content_type),
    };

    let upload = || async {
        store
            .put(&key, bytes.clone(), &content_type)
            .await
    };
    let object_url = upload
        .retry(
            &ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(500))
                .with_max_times(2)
                .with_jitter(),
        )
        .when(|e: &StorageError| matches!(e, StorageError::S3(_)))
        .notify(|e, dur| warn!("upload failed, retrying after {:.2}s: {}", dur.as_secs_f64(), e))
        .await?;
    Ok(object_url)
}

/// Resolve image bytes from an http(s) URL or an inline `data:` blob.
async fn fetch_image(http: &Client, url: &str) -> Result<(Vec<u8>, String), ImageFetchError> {
    if url.starts_with("data:") {
        return parse_data_url(url);
    }

    let fetch = || async {
        let res = http.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ImageFetchError::Timeout
            } else {
                ImageFetchError::Transport(e.to_string())
            }
        })?;
        let status = res.status();
        if !status.is_success() {
            return Err(ImageFetchError::Http(status.as_u16()));
        }
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| ImageFetchError::Transport(e.to_string()))?;
        Ok((bytes.to_vec(), content_type))
    };

    fetch
        .retry(
            &ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(500))
                .with_max_times(2)
                .with_jitter(),
        )
        .when(|e: &ImageFetchError| e.should_retry())
        .await
}

/// `data:image/png;base64,<payload>` → decoded bytes + content type.
fn parse_data_url(url: &str) -> Result<(Vec<u8>, String), ImageFetchError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or(ImageFetchError::InvalidDataUrl)?;
    let (meta, payload) = rest.split_once(',').ok_or(ImageFetchError::InvalidDataUrl)?;
    if !meta.ends_with(";base64") {
        return Err(ImageFetchError::InvalidDataUrl);
    }
    let content_type = meta.trim_end_matches(";base64");
    let content_type = if content_type.is_empty() {
        "application/octet-stream"
    } else {
        content_type
    };
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| ImageFetchError::Base64(e.to_string()))?;
    Ok((bytes, content_type.to_string()))
}

/// Cap a URL for log output, never splitting a multibyte character.
fn truncate_url(url: &str) -> &str {
    match url.char_indices().nth(80) {
        Some((idx, _)) => &url[..idx],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use db::{
        DBService,
        models::business::{Business, CreateBusiness},
    };

    use super::*;
    use crate::services::storage::LocalImageStore;

    #[test]
    fn test_parse_data_url() {
        let (bytes, ct) = parse_data_url("data:image/png;base64,AQID").unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(ct, "image/png");

        assert!(matches!(
            parse_data_url("data:image/png,AQID"),
            Err(ImageFetchError::InvalidDataUrl)
        ));
        assert!(matches!(
            parse_data_url("data:image/png;base64,!!!"),
            Err(ImageFetchError::Base64(_))
        ));
    }

    fn business_row(
        logo_url: Option<&str>,
        logo_object_url: Option<&str>,
        photos: Vec<&str>,
        photo_object_urls: Vec<&str>,
    ) -> Business {
        Business {
            id: Uuid::new_v4(),
            place_id: "p".to_string(),
            name: "b".to_string(),
            address: None,
            phone: None,
            website: None,
            category: None,
            rating: None,
            reviews_count: 0,
            hours: None,
            photos: if photos.is_empty() {
                None
            } else {
                Some(sqlx::types::Json(
                    photos.iter().map(|s| s.to_string()).collect(),
                ))
            },
            logo_url: logo_url.map(str::to_string),
            logo_object_url: logo_object_url.map(str::to_string),
            photo_object_urls: if photo_object_urls.is_empty() {
                None
            } else {
                Some(sqlx::types::Json(
                    photo_object_urls.iter().map(|s| s.to_string()).collect(),
                ))
            },
            image_sync_status: Default::default(),
            image_synced_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_truncate_url_respects_char_boundaries() {
        // Multibyte char straddling the cap must not split
        let url = format!("{}é-and-more-trailing-text", "a".repeat(79));
        let truncated = truncate_url(&url);
        assert_eq!(truncated.chars().count(), 80);
        assert!(url.starts_with(truncated));

        let exact = format!("{}é", "a".repeat(79));
        assert_eq!(truncate_url(&exact), exact);
        assert_eq!(truncate_url("héllo"), "héllo");
    }

    #[test]
    fn test_pending_images_skips_already_synced() {
        let row = business_row(Some("http://x/logo.png"), None, vec!["http://x/p0"], vec![]);
        assert_eq!(pending_images(&row, false).len(), 2);

        // Logo already uploaded, photos too
        let row = business_row(
            Some("http://x/logo.png"),
            Some("https://bucket/logo.png"),
            vec!["http://x/p0"],
            vec!["https://bucket/photo-0.jpg"],
        );
        assert!(pending_images(&row, false).is_empty());
        // force revisits everything
        assert_eq!(pending_images(&row, true).len(), 2);
    }

    #[test]
    fn test_pending_images_refetches_partial_photo_list() {
        // Two photos but only one recorded object URL: both go back on the list
        let row = business_row(
            None,
            None,
            vec!["http://x/p0", "http://x/p1"],
            vec!["https://bucket/photo-0.jpg"],
        );
        let pending = pending_images(&row, false);
        assert_eq!(pending.len(), 2);
        assert!(
            pending
                .iter()
                .all(|p| matches!(p, PendingImage::Photo { .. }))
        );
    }

    async fn seed(pool: &SqlitePool, place_id: &str, logo_url: Option<&str>) -> Business {
        seed_with_photos(pool, place_id, logo_url, vec![]).await
    }

    async fn seed_with_photos(
        pool: &SqlitePool,
        place_id: &str,
        logo_url: Option<&str>,
        photos: Vec<&str>,
    ) -> Business {
        Business::create_or_update(
            pool,
            &CreateBusiness {
                place_id: place_id.to_string(),
                name: format!("biz {place_id}"),
                address: None,
                phone: None,
                website: None,
                category: None,
                rating: None,
                reviews_count: 0,
                hours: None,
                photos: if photos.is_empty() {
                    None
                } else {
                    Some(photos.iter().map(|s| s.to_string()).collect())
                },
                logo_url: logo_url.map(str::to_string),
            },
        )
        .await
        .unwrap()
    }

    async fn wait_for_terminal(service: &ImageSyncService) -> SyncProgress {
        let mut rx = service.subscribe();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if rx.borrow().state.is_terminal() {
                    return rx.borrow().clone();
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("sync did not finish in time")
    }

    #[tokio::test]
    async fn test_sync_run_uploads_skips_and_fails() {
        let db = DBService::new_in_memory().await.unwrap();
        // inline base64 logos keep the test off the network
        seed(&db.pool, "p1", Some("data:image/png;base64,AQID")).await;
        seed(&db.pool, "p2", Some("data:image/png;base64,!bad!")).await;
        let no_images = seed(&db.pool, "p3", None).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalImageStore::new(dir.path(), "http://localhost/media"));
        let service = ImageSyncService::new(db.pool.clone(), store, Some(4));

        let job = service.start(SyncOptions::default()).await.unwrap();
        let progress = wait_for_terminal(&service).await;

        assert_eq!(progress.state, SyncState::Completed);
        assert_eq!(progress.job_id, Some(job.id));
        assert_eq!(progress.processed, 3);
        assert_eq!(progress.uploaded, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.skipped, 1);

        let synced = Business::find_by_place_id(&db.pool, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(synced.image_sync_status, ImageSyncStatus::Synced);
        assert_eq!(
            synced.logo_object_url.as_deref(),
            Some("http://localhost/media/businesses/p1/logo.png")
        );
        assert!(dir.path().join("businesses/p1/logo.png").exists());

        let failed = Business::find_by_place_id(&db.pool, "p2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.image_sync_status, ImageSyncStatus::Failed);

        let untouched = Business::find_by_id(&db.pool, no_images.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.image_sync_status, ImageSyncStatus::Pending);

        // Job row finalized with matching counters
        let job_row = SyncJob::find_latest(&db.pool).await.unwrap().unwrap();
        assert_eq!(job_row.id, job.id);
        assert_eq!(job_row.state, SyncJobState::Completed);
        assert_eq!(job_row.processed, 3);
        assert_eq!(job_row.uploaded, 1);

        // A second run has nothing pending for the synced row
        let job2 = service.start(SyncOptions::default()).await.unwrap();
        let progress = wait_for_terminal(&service).await;
        assert_eq!(progress.job_id, Some(job2.id));
        assert_eq!(progress.uploaded, 0);
        assert_eq!(progress.processed, 2); // failed + skipped rows revisited
    }

    #[tokio::test]
    async fn test_partially_synced_photos_are_refetched() {
        let db = DBService::new_in_memory().await.unwrap();
        // An earlier run got photo-0 up but failed on photo-1
        let business = seed_with_photos(
            &db.pool,
            "p1",
            None,
            vec!["data:image/png;base64,AQID", "data:image/png;base64,BAUG"],
        )
        .await;
        Business::update_image_sync(
            &db.pool,
            business.id,
            None,
            &["http://localhost/media/businesses/p1/photo-0.png".to_string()],
            ImageSyncStatus::Failed,
        )
        .await
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalImageStore::new(dir.path(), "http://localhost/media"));
        let service = ImageSyncService::new(db.pool.clone(), store, None);

        service.start(SyncOptions::default()).await.unwrap();
        let progress = wait_for_terminal(&service).await;
        assert_eq!(progress.state, SyncState::Completed);
        assert_eq!(progress.uploaded, 1);
        assert_eq!(progress.skipped, 0);

        let row = Business::find_by_place_id(&db.pool, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.image_sync_status, ImageSyncStatus::Synced);
        assert_eq!(row.photo_object_urls.unwrap().0.len(), 2);
        assert!(row.image_synced_at.is_some());
        assert!(dir.path().join("businesses/p1/photo-1.png").exists());
    }

    #[tokio::test]
    async fn test_force_refetch_failure_keeps_recorded_photo_url() {
        let db = DBService::new_in_memory().await.unwrap();
        // Fully synced row whose second photo source has since gone bad
        let business = seed_with_photos(
            &db.pool,
            "p1",
            None,
            vec!["data:image/png;base64,AQID", "data:image/png;base64,!bad!"],
        )
        .await;
        Business::update_image_sync(
            &db.pool,
            business.id,
            None,
            &[
                "https://old-bucket/photo-0.png".to_string(),
                "https://old-bucket/photo-1.png".to_string(),
            ],
            ImageSyncStatus::Synced,
        )
        .await
        .unwrap();
        let row = Business::find_by_place_id(&db.pool, "p1")
            .await
            .unwrap()
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ImageStore> =
            Arc::new(LocalImageStore::new(dir.path(), "http://localhost/media"));
        let http = Client::new();

        let outcome = sync_business_images(&db.pool, &store, &http, &row, true).await;
        assert_eq!(outcome, ItemOutcome::Uploaded);

        let row = Business::find_by_place_id(&db.pool, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.image_sync_status, ImageSyncStatus::Synced);
        let urls = row.photo_object_urls.unwrap().0;
        assert_eq!(
            urls,
            vec![
                "http://localhost/media/businesses/p1/photo-0.png".to_string(),
                // Re-fetch failed, so the previously recorded URL survives
                "https://old-bucket/photo-1.png".to_string(),
            ]
        );
    }

    struct SlowStore(LocalImageStore);

    #[async_trait::async_trait]
    impl ImageStore for SlowStore {
        async fn put(
            &self,
            key: &str,
            bytes: Vec<u8>,
            content_type: &str,
        ) -> Result<String, StorageError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.put(key, bytes, content_type).await
        }

        async fn exists(&self, key: &str) -> Result<bool, StorageError> {
            self.0.exists(key).await
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_records_cancelled_job() {
        let db = DBService::new_in_memory().await.unwrap();
        for i in 0..10 {
            seed(
                &db.pool,
                &format!("p{i:02}"),
                Some("data:image/png;base64,AQID"),
            )
            .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SlowStore(LocalImageStore::new(
            dir.path(),
            "http://localhost/media",
        )));
        let service = ImageSyncService::new(db.pool.clone(), store, Some(1));

        let job = service.start(SyncOptions::default()).await.unwrap();

        // Cancel once the first item lands; in-flight work drains
        let mut rx = service.subscribe();
        tokio::time::timeout(Duration::from_secs(10), async {
            while rx.borrow_and_update().processed == 0 {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("no progress before cancel");
        service.cancel().await.unwrap();

        let progress = wait_for_terminal(&service).await;
        assert_eq!(progress.state, SyncState::Cancelled);
        assert!(progress.processed >= 1);
        assert!(progress.processed < 10);

        let job_row = SyncJob::find_latest(&db.pool).await.unwrap().unwrap();
        assert_eq!(job_row.id, job.id);
        assert_eq!(job_row.state, SyncJobState::Cancelled);
        assert!(job_row.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_without_run_errors() {
        let db = DBService::new_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalImageStore::new(dir.path(), "http://localhost/media"));
        let service = ImageSyncService::new(db.pool.clone(), store, None);
        assert!(matches!(
            service.cancel().await,
            Err(ImageSyncError::NotRunning)
        ));
        assert_eq!(service.progress().state, SyncState::Idle);
    }
}
