use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

/// Where a row stands in the image migration pipeline
#[derive(
    Debug, Clone, Type, Serialize, Deserialize, PartialEq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "image_sync_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageSyncStatus {
    #[default]
    Pending,
    Synced,
    Failed,
}

/// A directory listing, keyed by Google Place ID.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Business {
    pub id: Uuid,
    pub place_id: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub category: Option<String>,
    pub rating: Option<f64>,
    pub reviews_count: i64,
    #[ts(type = "Array<string> | null")]
    pub hours: Option<Json<Vec<String>>>,
    #[ts(type = "Array<string> | null")]
    pub photos: Option<Json<Vec<String>>>,
    pub logo_url: Option<String>,
    pub logo_object_url: Option<String>,
    #[ts(type = "Array<string> | null")]
    pub photo_object_urls: Option<Json<Vec<String>>>,
    pub image_sync_status: ImageSyncStatus,
    pub image_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields captured from Place Details when inserting or refreshing a row
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateBusiness {
    pub place_id: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub category: Option<String>,
    pub rating: Option<f64>,
    pub reviews_count: i64,
    pub hours: Option<Vec<String>>,
    pub photos: Option<Vec<String>>,
    pub logo_url: Option<String>,
}

/// Editable fields exposed to the admin API
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct UpdateBusiness {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub category: Option<String>,
    pub hours: Option<Vec<String>>,
    pub logo_url: Option<String>,
}

const SELECT_COLUMNS: &str = r#"id, place_id, name, address, phone, website, category,
    rating, reviews_count, hours, photos, logo_url, logo_object_url, photo_object_urls,
    image_sync_status, image_synced_at, created_at, updated_at"#;

/// Normalization used for name de-duplication: lowercase, alphanumeric only,
/// so "Joe's Cafe" and "Joes Cafe" collapse to the same key.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

impl Business {
    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {SELECT_COLUMNS} FROM businesses WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_place_id(
        pool: &SqlitePool,
        place_id: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {SELECT_COLUMNS} FROM businesses WHERE place_id = $1"
        ))
        .bind(place_id)
        .fetch_optional(pool)
        .await
    }

    /// Lookup against the persisted `name_normalized` column, so punctuation
    /// and spacing variants of the same name match. Used for import
    /// de-duplication.
    pub async fn find_by_normalized_name(
        pool: &SqlitePool,
        name: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {SELECT_COLUMNS} FROM businesses WHERE name_normalized = $1 LIMIT 1"
        ))
        .bind(normalize_name(name))
        .fetch_optional(pool)
        .await
    }

    pub async fn list(
        pool: &SqlitePool,
        category: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        match category {
            Some(cat) => {
                sqlx::query_as::<_, Self>(&format!(
                    "SELECT {SELECT_COLUMNS} FROM businesses WHERE category = $1
                     ORDER BY name LIMIT $2 OFFSET $3"
                ))
                .bind(cat)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Self>(&format!(
                    "SELECT {SELECT_COLUMNS} FROM businesses ORDER BY name LIMIT $1 OFFSET $2"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
            }
        }
    }

    pub async fn count(pool: &SqlitePool, category: Option<&str>) -> Result<i64, sqlx::Error> {
        match category {
            Some(cat) => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM businesses WHERE category = $1")
                    .bind(cat)
                    .fetch_one(pool)
                    .await
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM businesses")
                    .fetch_one(pool)
                    .await
            }
        }
    }

    /// Upsert on `place_id`. A re-imported place refreshes its listing data
    /// but keeps its image-sync columns untouched.
    pub async fn create_or_update(
        pool: &SqlitePool,
        data: &CreateBusiness,
    ) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let hours = data.hours.clone().map(Json);
        let photos = data.photos.clone().map(Json);
        sqlx::query_as::<_, Self>(&format!(
            r#"INSERT INTO businesses
                (id, place_id, name, name_normalized, address, phone, website, category,
                 rating, reviews_count, hours, photos, logo_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT(place_id) DO UPDATE SET
                name = excluded.name,
                name_normalized = excluded.name_normalized,
                address = excluded.address,
                phone = excluded.phone,
                website = excluded.website,
                category = excluded.category,
                rating = excluded.rating,
                reviews_count = excluded.reviews_count,
                hours = excluded.hours,
                photos = excluded.photos,
                logo_url = COALESCE(excluded.logo_url, businesses.logo_url),
                updated_at = datetime('now', 'subsec')
            RETURNING {SELECT_COLUMNS}"#
        ))
        .bind(id)
        .bind(&data.place_id)
        .bind(&data.name)
        .bind(normalize_name(&data.name))
        .bind(&data.address)
        .bind(&data.phone)
        .bind(&data.website)
        .bind(&data.category)
        .bind(data.rating)
        .bind(data.reviews_count)
        .bind(hours)
        .bind(photos)
        .bind(&data.logo_url)
        .fetch_one(pool)
        .await
    }

    pub async fn update_details(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateBusiness,
    ) -> Result<Option<Self>, sqlx::Error> {
        let hours = data.hours.clone().map(Json);
        sqlx::query_as::<_, Self>(&format!(
            r#"UPDATE businesses SET
                name = COALESCE($2, name),
                name_normalized = COALESCE($9, name_normalized),
                address = COALESCE($3, address),
                phone = COALESCE($4, phone),
                website = COALESCE($5, website),
                category = COALESCE($6, category),
                hours = COALESCE($7, hours),
                logo_url = COALESCE($8, logo_url),
                updated_at = datetime('now', 'subsec')
            WHERE id = $1
            RETURNING {SELECT_COLUMNS}"#
        ))
        .bind(id)
        .bind(&data.name)
        .bind(&data.address)
        .bind(&data.phone)
        .bind(&data.website)
        .bind(&data.category)
        .bind(hours)
        .bind(&data.logo_url)
        .bind(data.name.as_deref().map(normalize_name))
        .fetch_optional(pool)
        .await
    }

    pub async fn delete(pool: &SqlitePool, id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM businesses WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Keyset page of rows the sync engine still has to visit, ordered by
    /// `place_id` so an interrupted run resumes past its checkpoint cursor.
    pub async fn find_page_for_sync(
        pool: &SqlitePool,
        after_place_id: Option<&str>,
        limit: i64,
        include_synced: bool,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let status_clause = if include_synced {
            ""
        } else {
            "AND image_sync_status != 'synced'"
        };
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {SELECT_COLUMNS} FROM businesses
             WHERE place_id > $1 {status_clause}
             ORDER BY place_id LIMIT $2"
        ))
        .bind(after_place_id.unwrap_or(""))
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    pub async fn count_for_sync(
        pool: &SqlitePool,
        include_synced: bool,
    ) -> Result<i64, sqlx::Error> {
        let sql = if include_synced {
            "SELECT COUNT(*) FROM businesses"
        } else {
            "SELECT COUNT(*) FROM businesses WHERE image_sync_status != 'synced'"
        };
        sqlx::query_scalar::<_, i64>(sql).fetch_one(pool).await
    }

    /// Record the outcome of an image-sync pass over one row.
    /// `image_synced_at` only moves when the row actually reaches `synced`.
    pub async fn update_image_sync(
        pool: &SqlitePool,
        id: Uuid,
        logo_object_url: Option<&str>,
        photo_object_urls: &[String],
        status: ImageSyncStatus,
    ) -> Result<(), sqlx::Error> {
        let photo_urls = Json(photo_object_urls.to_vec());
        sqlx::query(
            r#"UPDATE businesses SET
                logo_object_url = COALESCE($2, logo_object_url),
                photo_object_urls = $3,
                image_sync_status = $4,
                image_synced_at = CASE WHEN $4 = 'synced'
                    THEN datetime('now', 'subsec') ELSE image_synced_at END,
                updated_at = datetime('now', 'subsec')
            WHERE id = $1"#,
        )
        .bind(id)
        .bind(logo_object_url)
        .bind(photo_urls)
        .bind(status)
        .execute(pool)
        .await?;
        Ok(())
    }
}
