pub mod image_sync;
pub mod importer;
pub mod places;
pub mod storage;
