use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// A review captured from Place Details during import.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Review {
    pub id: Uuid,
    pub business_id: Uuid,
    pub author_name: String,
    pub rating: Option<i64>,
    pub text: Option<String>,
    pub relative_time: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateReview {
    pub author_name: String,
    pub rating: Option<i64>,
    pub text: Option<String>,
    pub relative_time: Option<String>,
}

impl Review {
    /// Idempotent per (business, author, relative_time): re-importing a place
    /// does not duplicate its reviews.
    pub async fn create(
        pool: &SqlitePool,
        business_id: Uuid,
        data: &CreateReview,
    ) -> Result<Option<Self>, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, Self>(
            r#"INSERT INTO reviews (id, business_id, author_name, rating, text, relative_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT(business_id, author_name, relative_time) DO NOTHING
            RETURNING id, business_id, author_name, rating, text, relative_time, created_at"#,
        )
        .bind(id)
        .bind(business_id)
        .bind(&data.author_name)
        .bind(data.rating)
        .bind(&data.text)
        .bind(&data.relative_time)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_business_id(
        pool: &SqlitePool,
        business_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"SELECT id, business_id, author_name, rating, text, relative_time, created_at
            FROM reviews
            WHERE business_id = $1
            ORDER BY created_at DESC"#,
        )
        .bind(business_id)
        .fetch_all(pool)
        .await
    }
}
