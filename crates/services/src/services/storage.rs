//! Image storage backends: local media directory or an S3 bucket.

use std::path::PathBuf;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{BehaviorVersion, Region},
    primitives::ByteStream,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("s3 error: {0}")]
    S3(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
}

/// Destination for synced images. `put` returns the public URL that gets
/// written back onto the business row.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Writes under a media root served as static files (also covers a static-host
/// publish directory).
pub struct LocalImageStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        // Object keys are forward-slash paths; reject anything that could
        // escape the media root.
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|seg| seg == "..") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!(key, size = bytes.len(), "wrote image to media root");
        Ok(format!(
            "{}/{}",
            self.public_base_url.trim_end_matches('/'),
            key
        ))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// Uploads into an S3 bucket via the AWS SDK.
pub struct S3ImageStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    region: String,
    public_base_url: Option<String>,
}

impl S3ImageStore {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        access_key_id: &str,
        secret_access_key: &str,
        public_base_url: Option<String>,
    ) -> Self {
        let region = region.into();
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "config");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(credentials)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: bucket.into(),
            region,
            public_base_url,
        }
    }

    fn object_url(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

#[async_trait]
impl ImageStore for S3ImageStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        debug!(key, bucket = %self.bucket, "uploaded image to s3");
        Ok(self.object_url(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Ok(false)
                } else {
                    Err(StorageError::S3(e.to_string()))
                }
            }
        }
    }
}

/// Object key for a business logo.
pub fn logo_key(place_id: &str, content_type: &str) -> String {
    format!(
        "businesses/{place_id}/logo.{}",
        extension_for(content_type)
    )
}

/// Object key for the n-th business photo.
pub fn photo_key(place_id: &str, index: usize, content_type: &str) -> String {
    format!(
        "businesses/{place_id}/photo-{index}.{}",
        extension_for(content_type)
    )
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or("").trim() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "img",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys() {
        assert_eq!(logo_key("abc", "image/png"), "businesses/abc/logo.png");
        assert_eq!(
            photo_key("abc", 2, "image/jpeg; charset=binary"),
            "businesses/abc/photo-2.jpg"
        );
        assert_eq!(logo_key("abc", "application/pdf"), "businesses/abc/logo.img");
    }

    #[test]
    fn test_local_store_rejects_traversal() {
        let store = LocalImageStore::new("/tmp/media", "http://localhost/media");
        assert!(store.resolve("../etc/passwd").is_err());
        assert!(store.resolve("/abs").is_err());
        assert!(store.resolve("businesses/p/logo.png").is_ok());
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalImageStore::new(dir.path(), "http://localhost:8080/media/");

        assert!(!store.exists("businesses/p1/logo.png").await.unwrap());
        let url = store
            .put("businesses/p1/logo.png", vec![1, 2, 3], "image/png")
            .await
            .unwrap();
        assert_eq!(url, "http://localhost:8080/media/businesses/p1/logo.png");
        assert!(store.exists("businesses/p1/logo.png").await.unwrap());

        let on_disk = tokio::fs::read(dir.path().join("businesses/p1/logo.png"))
            .await
            .unwrap();
        assert_eq!(on_disk, vec![1, 2, 3]);
    }
}
