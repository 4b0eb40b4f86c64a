use crate::error::DbError;
use crate::models::CorrelationEventRow;
use cryton_core::CorrelationEvent;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct CorrelationRepository {
    pool: SqlitePool,
}

impl CorrelationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, event: &CorrelationEvent) -> Result<CorrelationEvent, DbError> {
        let row = CorrelationEventRow::from(event);

        sqlx::query(
            r#"
            INSERT INTO correlation_events (correlation_id, step_execution_id, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&row.correlation_id)
        .bind(&row.step_execution_id)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;

        Ok(event.clone())
    }

    pub async fn find(&self, correlation_id: &str) -> Result<Option<CorrelationEvent>, DbError> {
        let row: Option<CorrelationEventRow> = sqlx::query_as(
            r#"
            SELECT correlation_id, step_execution_id, created_at
            FROM correlation_events
            WHERE correlation_id = ?
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_by_step_execution(
        &self,
        step_execution_id: Uuid,
    ) -> Result<Vec<CorrelationEvent>, DbError> {
        let rows: Vec<CorrelationEventRow> = sqlx::query_as(
            r#"
            SELECT correlation_id, step_execution_id, created_at
            FROM correlation_events
            WHERE step_execution_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(step_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    /// Deletes the event. Returns `false` when another consumer already took it.
    pub async fn delete(&self, correlation_id: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM correlation_events WHERE correlation_id = ?")
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64, DbError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM correlation_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_plan_execution, setup_test_db};
    use crate::{StageExecutionRepository, StepExecutionRepository};
    use cryton_core::{StageExecution, StepExecution};

    #[tokio::test]
    async fn test_delete_happens_once() {
        let (_dir, pool) = setup_test_db().await;
        let plan_execution = sample_plan_execution(&pool).await;
        let stage = StageExecution::new(plan_execution.id, "s1");
        StageExecutionRepository::new(pool.clone())
            .create(&stage)
            .await
            .unwrap();
        let step = StepExecution::new(stage.id, "a");
        StepExecutionRepository::new(pool.clone())
            .create(&step)
            .await
            .unwrap();

        let repo = CorrelationRepository::new(pool);
        repo.create(&CorrelationEvent::new("corr-1", step.id))
            .await
            .unwrap();

        let found = repo.find("corr-1").await.unwrap().unwrap();
        assert_eq!(found.step_execution_id, step.id);
        assert_eq!(repo.find_by_step_execution(step.id).await.unwrap().len(), 1);

        assert!(repo.delete("corr-1").await.unwrap());
        assert!(!repo.delete("corr-1").await.unwrap());
        assert_eq!(repo.count().await.unwrap(), 0);
    }
}
