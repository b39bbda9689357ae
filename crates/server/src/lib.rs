pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use db::DBService;
use services::services::{image_sync::ImageSyncService, importer::ImporterService};

use crate::config::Config;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub db: DBService,
    pub config: Arc<Config>,
    pub importer: Arc<ImporterService>,
    pub image_sync: Arc<ImageSyncService>,
}
