use crate::error::DbError;
use crate::models::{times_to_columns, StepExecutionRow};
use cryton_core::{StepExecution, StepState};
use sqlx::SqlitePool;
use uuid::Uuid;

const COLUMNS: &str = "id, stage_execution_id, step_name, state, schedule_time, start_time, pause_time, finish_time, result, output, serialized_output, parent_id, valid, created_at";

#[derive(Clone)]
pub struct StepExecutionRepository {
    pool: SqlitePool,
}

impl StepExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, execution: &StepExecution) -> Result<StepExecution, DbError> {
        let (schedule_time, start_time, pause_time, finish_time) =
            times_to_columns(&execution.times);

        sqlx::query(&format!(
            "INSERT INTO step_executions ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(execution.id.to_string())
        .bind(execution.stage_execution_id.to_string())
        .bind(&execution.step_name)
        .bind(execution.state.as_str())
        .bind(schedule_time)
        .bind(start_time)
        .bind(pause_time)
        .bind(finish_time)
        .bind(execution.result.as_str())
        .bind(&execution.output)
        .bind(execution.serialized_output.to_string())
        .bind(execution.parent_id.map(|id| id.to_string()))
        .bind(execution.valid)
        .bind(execution.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(execution.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<StepExecution>, DbError> {
        let row: Option<StepExecutionRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM step_executions WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_by_stage_execution(
        &self,
        stage_execution_id: Uuid,
    ) -> Result<Vec<StepExecution>, DbError> {
        let rows: Vec<StepExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM step_executions WHERE stage_execution_id = ? ORDER BY created_at"
        ))
        .bind(stage_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    pub async fn find_by_name(
        &self,
        stage_execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepExecution>, DbError> {
        let row: Option<StepExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM step_executions WHERE stage_execution_id = ? AND step_name = ?"
        ))
        .bind(stage_execution_id.to_string())
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn compare_and_set_state(
        &self,
        id: Uuid,
        from: StepState,
        to: StepState,
    ) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE step_executions SET state = ? WHERE id = ? AND state = ?")
            .bind(to.as_str())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persists every field except `state`.
    pub async fn save(&self, execution: &StepExecution) -> Result<(), DbError> {
        let (schedule_time, start_time, pause_time, finish_time) =
            times_to_columns(&execution.times);

        sqlx::query(
            r#"
            UPDATE step_executions
            SET schedule_time = ?, start_time = ?, pause_time = ?, finish_time = ?,
                result = ?, output = ?, serialized_output = ?, parent_id = ?, valid = ?
            WHERE id = ?
            "#,
        )
        .bind(schedule_time)
        .bind(start_time)
        .bind(pause_time)
        .bind(finish_time)
        .bind(execution.result.as_str())
        .bind(&execution.output)
        .bind(execution.serialized_output.to_string())
        .bind(execution.parent_id.map(|id| id.to_string()))
        .bind(execution.valid)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_valid(&self, id: Uuid, valid: bool) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE step_executions SET valid = ? WHERE id = ?")
            .bind(valid)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns a step in a final state to PENDING and clears its execution data.
    /// Steps that are not in a final state are left untouched.
    pub async fn reset(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET state = 'PENDING', schedule_time = NULL, start_time = NULL, pause_time = NULL,
                finish_time = NULL, result = '', output = '', serialized_output = '{}', parent_id = NULL
            WHERE id = ? AND state IN ('FINISHED', 'TERMINATED', 'ERROR', 'IGNORED')
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_plan_execution, setup_test_db};
    use crate::StageExecutionRepository;
    use cryton_core::{StageExecution, StepResult};
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_reset() {
        let (_dir, pool) = setup_test_db().await;
        let plan_execution = sample_plan_execution(&pool).await;
        let stage = StageExecution::new(plan_execution.id, "s1");
        StageExecutionRepository::new(pool.clone())
            .create(&stage)
            .await
            .unwrap();
        let repo = StepExecutionRepository::new(pool);

        let mut step = StepExecution::new(stage.id, "a");
        repo.create(&step).await.unwrap();

        // Not final yet.
        assert!(!repo.reset(step.id).await.unwrap());

        step.result = StepResult::Ok;
        step.output = "hi".to_string();
        step.serialized_output = json!({"username": "u"});
        repo.save(&step).await.unwrap();
        assert!(repo
            .compare_and_set_state(step.id, StepState::Pending, StepState::Starting)
            .await
            .unwrap());
        assert!(repo
            .compare_and_set_state(step.id, StepState::Starting, StepState::Finished)
            .await
            .unwrap());

        let found = repo.find_by_name(stage.id, "a").await.unwrap().unwrap();
        assert_eq!(found.serialized_output["username"], "u");
        assert_eq!(found.result, StepResult::Ok);

        assert!(repo.reset(step.id).await.unwrap());
        let found = repo.find_by_id(step.id).await.unwrap().unwrap();
        assert_eq!(found.state, StepState::Pending);
        assert_eq!(found.result, StepResult::None);
        assert!(found.output.is_empty());
        assert_eq!(found.serialized_output, json!({}));
    }
}
