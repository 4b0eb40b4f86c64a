use crate::error::DbError;
use crate::models::{SchedulerJob, SchedulerJobRow};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct SchedulerJobRepository {
    pool: SqlitePool,
}

impl SchedulerJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores the job, replacing any job with the same id.
    pub async fn upsert(&self, job: &SchedulerJob) -> Result<(), DbError> {
        let row = SchedulerJobRow::from(job);

        sqlx::query(
            r#"
            INSERT INTO scheduler_jobs (id, callable, args, next_run_at, interval_ms, paused, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                callable = excluded.callable,
                args = excluded.args,
                next_run_at = excluded.next_run_at,
                interval_ms = excluded.interval_ms,
                paused = excluded.paused
            "#,
        )
        .bind(&row.id)
        .bind(&row.callable)
        .bind(&row.args)
        .bind(row.next_run_at)
        .bind(row.interval_ms)
        .bind(row.paused)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<SchedulerJob>, DbError> {
        let row: Option<SchedulerJobRow> = sqlx::query_as(
            r#"
            SELECT id, callable, args, next_run_at, interval_ms, paused, created_at
            FROM scheduler_jobs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_all(&self) -> Result<Vec<SchedulerJob>, DbError> {
        let rows: Vec<SchedulerJobRow> = sqlx::query_as(
            r#"
            SELECT id, callable, args, next_run_at, interval_ms, paused, created_at
            FROM scheduler_jobs
            ORDER BY next_run_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    /// Jobs that are not paused and due at or before `now`, earliest first.
    pub async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<SchedulerJob>, DbError> {
        let rows: Vec<SchedulerJobRow> = sqlx::query_as(
            r#"
            SELECT id, callable, args, next_run_at, interval_ms, paused, created_at
            FROM scheduler_jobs
            WHERE paused = 0 AND next_run_at <= ?
            ORDER BY next_run_at
            LIMIT ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    pub async fn reschedule(&self, id: &str, next_run_at: DateTime<Utc>) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE scheduler_jobs SET next_run_at = ? WHERE id = ?")
            .bind(next_run_at.timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_paused(&self, id: &str, paused: bool) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE scheduler_jobs SET paused = ? WHERE id = ?")
            .bind(paused)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_all_paused(&self, paused: bool) -> Result<u64, DbError> {
        let result = sqlx::query("UPDATE scheduler_jobs SET paused = ? WHERE paused != ?")
            .bind(paused)
            .bind(paused)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM scheduler_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_db;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_find_due_skips_paused_and_future_jobs() {
        let (_dir, pool) = setup_test_db().await;
        let repo = SchedulerJobRepository::new(pool);
        let now = Utc::now();

        let due = SchedulerJob::once("due", "run.execute", json!({"run_id": "r"}), now);
        let later = SchedulerJob::once("later", "run.execute", json!({}), now + Duration::hours(1));
        let paused = SchedulerJob::once("paused", "run.execute", json!({}), now);
        repo.upsert(&due).await.unwrap();
        repo.upsert(&later).await.unwrap();
        repo.upsert(&paused).await.unwrap();
        repo.set_paused("paused", true).await.unwrap();

        let found = repo.find_due(now, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "due");
        assert_eq!(found[0].args["run_id"], "r");

        repo.reschedule("due", now + Duration::minutes(5)).await.unwrap();
        assert!(repo.find_due(now, 10).await.unwrap().is_empty());

        repo.set_all_paused(false).await.unwrap();
        assert_eq!(repo.find_due(now, 10).await.unwrap().len(), 1);

        assert!(repo.delete("paused").await.unwrap());
        assert_eq!(repo.find_all().await.unwrap().len(), 2);
    }
}
