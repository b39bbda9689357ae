use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use ts_rs::TS;
use uuid::Uuid;

#[derive(
    Debug, Clone, Type, Serialize, Deserialize, PartialEq, TS, EnumString, Display, Default,
)]
#[sqlx(type_name = "sync_job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncJobState {
    #[default]
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Persisted record of one bulk image-sync run. Counters and the keyset
/// cursor are checkpointed while the run is in flight, so an interrupted run
/// leaves an inspectable trail.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct SyncJob {
    pub id: Uuid,
    pub state: SyncJobState,
    pub total: i64,
    pub processed: i64,
    pub uploaded: i64,
    pub skipped: i64,
    pub failed: i64,
    pub cursor: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

const SELECT_COLUMNS: &str = r#"id, state, total, processed, uploaded, skipped, failed,
    cursor, error, started_at, finished_at"#;

impl SyncJob {
    pub async fn create(pool: &SqlitePool, total: i64) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        sqlx::query_as::<_, Self>(&format!(
            r#"INSERT INTO sync_jobs (id, state, total)
            VALUES ($1, 'running', $2)
            RETURNING {SELECT_COLUMNS}"#
        ))
        .bind(id)
        .bind(total)
        .fetch_one(pool)
        .await
    }

    /// Periodic checkpoint while the run is in flight.
    pub async fn update_progress(
        pool: &SqlitePool,
        id: Uuid,
        processed: i64,
        uploaded: i64,
        skipped: i64,
        failed: i64,
        cursor: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_jobs SET
                processed = $2, uploaded = $3, skipped = $4, failed = $5,
                cursor = COALESCE($6, cursor)
            WHERE id = $1"#,
        )
        .bind(id)
        .bind(processed)
        .bind(uploaded)
        .bind(skipped)
        .bind(failed)
        .bind(cursor)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn finish(
        pool: &SqlitePool,
        id: Uuid,
        state: SyncJobState,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE sync_jobs SET
                state = $2, error = $3, finished_at = datetime('now', 'subsec')
            WHERE id = $1"#,
        )
        .bind(id)
        .bind(state)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_latest(pool: &SqlitePool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_jobs ORDER BY started_at DESC LIMIT 1"
        ))
        .fetch_optional(pool)
        .await
    }

    pub async fn find_running(pool: &SqlitePool) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {SELECT_COLUMNS} FROM sync_jobs WHERE state = 'running'
             ORDER BY started_at DESC LIMIT 1"
        ))
        .fetch_optional(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    #[tokio::test]
    async fn test_job_lifecycle() {
        let db = DBService::new_in_memory().await.unwrap();
        let job = SyncJob::create(&db.pool, 100).await.unwrap();
        assert_eq!(job.state, SyncJobState::Running);
        assert!(SyncJob::find_running(&db.pool).await.unwrap().is_some());

        SyncJob::update_progress(&db.pool, job.id, 40, 30, 8, 2, Some("p40"))
            .await
            .unwrap();
        SyncJob::finish(&db.pool, job.id, SyncJobState::Completed, None)
            .await
            .unwrap();

        let latest = SyncJob::find_latest(&db.pool).await.unwrap().unwrap();
        assert_eq!(latest.state, SyncJobState::Completed);
        assert_eq!(latest.processed, 40);
        assert_eq!(latest.cursor.as_deref(), Some("p40"));
        assert!(latest.finished_at.is_some());
        assert!(SyncJob::find_running(&db.pool).await.unwrap().is_none());
    }
}
