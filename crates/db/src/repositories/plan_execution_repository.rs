use crate::error::DbError;
use crate::models::{times_to_columns, PlanExecutionRow};
use cryton_core::{PlanExecution, PlanState};
use sqlx::SqlitePool;
use uuid::Uuid;

const COLUMNS: &str = "id, run_id, plan_id, worker_id, state, schedule_time, start_time, pause_time, finish_time, aps_job_id, evidence_directory, paused_ms, created_at";

#[derive(Clone)]
pub struct PlanExecutionRepository {
    pool: SqlitePool,
}

impl PlanExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, execution: &PlanExecution) -> Result<PlanExecution, DbError> {
        let (schedule_time, start_time, pause_time, finish_time) =
            times_to_columns(&execution.times);

        sqlx::query(&format!(
            "INSERT INTO plan_executions ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(execution.id.to_string())
        .bind(execution.run_id.to_string())
        .bind(execution.plan_id.to_string())
        .bind(execution.worker_id.to_string())
        .bind(execution.state.as_str())
        .bind(schedule_time)
        .bind(start_time)
        .bind(pause_time)
        .bind(finish_time)
        .bind(&execution.aps_job_id)
        .bind(&execution.evidence_directory)
        .bind(execution.paused_ms)
        .bind(execution.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(execution.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<PlanExecution>, DbError> {
        let row: Option<PlanExecutionRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM plan_executions WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_by_run(&self, run_id: Uuid) -> Result<Vec<PlanExecution>, DbError> {
        let rows: Vec<PlanExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM plan_executions WHERE run_id = ? ORDER BY created_at"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    pub async fn find_by_plan(&self, plan_id: Uuid) -> Result<Vec<PlanExecution>, DbError> {
        let rows: Vec<PlanExecutionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM plan_executions WHERE plan_id = ? ORDER BY created_at"
        ))
        .bind(plan_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    pub async fn compare_and_set_state(
        &self,
        id: Uuid,
        from: PlanState,
        to: PlanState,
    ) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE plan_executions SET state = ? WHERE id = ? AND state = ?")
            .bind(to.as_str())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persists every field except `state`.
    pub async fn save(&self, execution: &PlanExecution) -> Result<(), DbError> {
        let (schedule_time, start_time, pause_time, finish_time) =
            times_to_columns(&execution.times);

        sqlx::query(
            r#"
            UPDATE plan_executions
            SET schedule_time = ?, start_time = ?, pause_time = ?, finish_time = ?,
                aps_job_id = ?, evidence_directory = ?, paused_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(schedule_time)
        .bind(start_time)
        .bind(pause_time)
        .bind(finish_time)
        .bind(&execution.aps_job_id)
        .bind(&execution.evidence_directory)
        .bind(execution.paused_ms)
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_plan, setup_test_db};
    use crate::{PlanRepository, RunRepository, WorkerRepository};
    use cryton_core::{Run, Worker};

    #[tokio::test]
    async fn test_plan_execution_roundtrip() {
        let (_dir, pool) = setup_test_db().await;
        let plan = sample_plan();
        PlanRepository::new(pool.clone()).create(&plan).await.unwrap();
        let run = Run::new(plan.id);
        RunRepository::new(pool.clone()).create(&run).await.unwrap();
        let worker = Worker::new("alpha", "");
        WorkerRepository::new(pool.clone()).create(&worker).await.unwrap();

        let repo = PlanExecutionRepository::new(pool);
        let mut execution = PlanExecution::new(run.id, plan.id, worker.id);
        repo.create(&execution).await.unwrap();

        execution.paused_ms = 1500;
        execution.evidence_directory = Some("/tmp/evidence/run".to_string());
        repo.save(&execution).await.unwrap();
        assert!(repo
            .compare_and_set_state(execution.id, PlanState::Pending, PlanState::Running)
            .await
            .unwrap());

        let all = repo.find_by_run(run.id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].paused_ms, 1500);
        assert_eq!(all[0].state, PlanState::Running);
        assert_eq!(repo.find_by_plan(plan.id).await.unwrap().len(), 1);
    }
}
