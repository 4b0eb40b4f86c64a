use crate::error::DbError;
use crate::models::{times_to_columns, StageExecutionRow};
use cryton_core::{StageExecution, StageState};
use sqlx::SqlitePool;
use uuid::Uuid;

const COLUMNS: &str = "id, plan_execution_id, stage_name, state, schedule_time, start_time, pause_time, finish_time, aps_job_id, trigger_id, created_at";

#[derive(Clone)]
pub struct StageExecutionRepository {
    pool: SqlitePool,
}

impl StageExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, execution: &StageExecution) -> Result<StageExecution, DbError> {
        let (schedule_time, start_time, pause_time, finish_time) =
            times_to_columns(&execution.times);

        sqlx::query(&format!(
            "INSERT INTO stage_executions ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(execution.id.to_string())
        .bind(execution.plan_execution_id.to_string())
        .bind(&execution.stage_name)
        .bind(execution.state.as_str())
        .bind(schedule_time)
        .bind(start_time)
        .bind(pause_time)
        .bind(finish_time)
        .bind(&execution.aps_job_id)
        .bind(&execution.trigger_id)
        .bind(execution.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(execution.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<StageExecution>, DbError> {
        let row: Option<StageExecutionRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM stage_executions WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_by_plan_execution(
        &self,
        plan_execution_id: Uuid,
    ) -> Result<Vec<StageExecution>, DbError> {
        let rows: Vec<StageExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM stage_executions WHERE plan_execution_id = ? ORDER BY created_at"
        ))
        .bind(plan_execution_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    pub async fn find_by_name(
        &self,
        plan_execution_id: Uuid,
        stage_name: &str,
    ) -> Result<Option<StageExecution>, DbError> {
        let row: Option<StageExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM stage_executions WHERE plan_execution_id = ? AND stage_name = ?"
        ))
        .bind(plan_execution_id.to_string())
        .bind(stage_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    /// Looks up the stage armed with a worker-hosted trigger.
    pub async fn find_by_trigger_id(
        &self,
        trigger_id: &str,
    ) -> Result<Option<StageExecution>, DbError> {
        let row: Option<StageExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM stage_executions WHERE trigger_id = ?"
        ))
        .bind(trigger_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn compare_and_set_state(
        &self,
        id: Uuid,
        from: StageState,
        to: StageState,
    ) -> Result<bool, DbError> {
        let result =
            sqlx::query("UPDATE stage_executions SET state = ? WHERE id = ? AND state = ?")
                .bind(to.as_str())
                .bind(id.to_string())
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns a stage in a final state to PENDING and clears its execution data.
    pub async fn reset(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE stage_executions
            SET state = 'PENDING', schedule_time = NULL, start_time = NULL, pause_time = NULL,
                finish_time = NULL, aps_job_id = NULL, trigger_id = NULL
            WHERE id = ? AND state IN ('FINISHED', 'TERMINATED', 'ERROR')
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persists every field except `state`.
    pub async fn save(&self, execution: &StageExecution) -> Result<(), DbError> {
        let (schedule_time, start_time, pause_time, finish_time) =
            times_to_columns(&execution.times);

        sqlx::query(
            r#"
            UPDATE stage_executions
            SET schedule_time = ?, start_time = ?, pause_time = ?, finish_time = ?,
                aps_job_id = ?, trigger_id = ?
            WHERE id = ?
            "#,
        )
        .bind(schedule_time)
        .bind(start_time)
        .bind(pause_time)
        .bind(finish_time)
        .bind(&execution.aps_job_id)
        .bind(&execution.trigger_id)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
