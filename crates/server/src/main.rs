use std::sync::Arc;

use anyhow::Context;
use db::DBService;
use server::{
    AppState,
    config::{Config, StorageConfig},
    routes,
};
use services::services::{
    image_sync::ImageSyncService,
    importer::ImporterService,
    places::PlacesClient,
    storage::{ImageStore, LocalImageStore, S3ImageStore},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env()?);

    if let Some(parent) = config.database_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let db = DBService::new(&config.database_path).await?;

    let store: Arc<dyn ImageStore> = match &config.storage {
        StorageConfig::Local {
            media_root,
            public_base_url,
        } => {
            info!(root = %media_root.display(), "using local image store");
            Arc::new(LocalImageStore::new(media_root.clone(), public_base_url))
        }
        StorageConfig::S3 {
            bucket,
            region,
            access_key_id,
            secret_access_key,
            public_base_url,
        } => {
            info!(bucket = %bucket, region = %region, "using s3 image store");
            Arc::new(S3ImageStore::new(
                bucket,
                region,
                access_key_id,
                secret_access_key,
                public_base_url.clone(),
            ))
        }
    };

    let places = PlacesClient::new(
        config.google_maps_api_key.clone(),
        Some(config.photo_max_width),
    )?;
    let importer = Arc::new(ImporterService::new(db.pool.clone(), places));
    let image_sync = Arc::new(ImageSyncService::new(
        db.pool.clone(),
        store,
        Some(config.sync_concurrency),
    ));

    let state = AppState {
        db,
        config: config.clone(),
        importer,
        image_sync,
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}
