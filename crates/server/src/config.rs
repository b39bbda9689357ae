//! Environment-driven configuration, loaded once at startup.

use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use anyhow::{Context, bail};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub google_maps_api_key: String,
    pub photo_max_width: u32,
    pub sync_concurrency: usize,
    pub storage: StorageConfig,
}

/// Which backend synced images land in.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local {
        media_root: PathBuf,
        public_base_url: String,
    },
    S3 {
        bucket: String,
        region: String,
        access_key_id: String,
        secret_access_key: String,
        public_base_url: Option<String>,
    },
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env_or("HOST", "127.0.0.1");
        let port: u16 = env_parse("PORT", "8080")?;

        let storage = match env_or("STORAGE_BACKEND", "local").as_str() {
            "local" => StorageConfig::Local {
                media_root: PathBuf::from(env_or("MEDIA_ROOT", "media")),
                public_base_url: env_or(
                    "MEDIA_PUBLIC_BASE_URL",
                    &format!("http://{host}:{port}/media"),
                ),
            },
            "s3" => StorageConfig::S3 {
                bucket: required("S3_BUCKET")?,
                region: env_or("AWS_REGION", "us-east-1"),
                access_key_id: required("AWS_ACCESS_KEY_ID")?,
                secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
                public_base_url: env::var("S3_PUBLIC_BASE_URL").ok(),
            },
            other => bail!("unknown STORAGE_BACKEND {other:?} (expected \"local\" or \"s3\")"),
        };

        Ok(Self {
            host,
            port,
            database_path: PathBuf::from(env_or("DATABASE_PATH", "data/bizdir.sqlite")),
            google_maps_api_key: required("GOOGLE_MAPS_API_KEY")?,
            photo_max_width: env_parse("PHOTO_MAX_WIDTH", "800")?,
            sync_concurrency: env_parse("SYNC_CONCURRENCY", "8")?,
            storage,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = env_or(key, default);
    raw.parse()
        .map_err(|e| anyhow::anyhow!("invalid {key} value {raw:?}: {e}"))
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).with_context(|| format!("{key} environment variable not set"))
}
