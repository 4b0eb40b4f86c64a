use crate::error::DbError;
use crate::models::{times_to_columns, RunRow};
use cryton_core::{Run, RunState};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, run: &Run) -> Result<Run, DbError> {
        let (schedule_time, start_time, pause_time, finish_time) = times_to_columns(&run.times);

        sqlx::query(
            r#"
            INSERT INTO runs (id, plan_id, state, schedule_time, start_time, pause_time, finish_time, aps_job_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.plan_id.to_string())
        .bind(run.state.as_str())
        .bind(schedule_time)
        .bind(start_time)
        .bind(pause_time)
        .bind(finish_time)
        .bind(&run.aps_job_id)
        .bind(run.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(run.clone())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Run>, DbError> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT id, plan_id, state, schedule_time, start_time, pause_time, finish_time, aps_job_id, created_at
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_domain()))
    }

    pub async fn find_all(&self) -> Result<Vec<Run>, DbError> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT id, plan_id, state, schedule_time, start_time, pause_time, finish_time, aps_job_id, created_at
            FROM runs
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_domain()).collect())
    }

    /// Moves the run from `from` to `to` only if it is still in `from`.
    pub async fn compare_and_set_state(
        &self,
        id: Uuid,
        from: RunState,
        to: RunState,
    ) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE runs SET state = ? WHERE id = ? AND state = ?")
            .bind(to.as_str())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persists times and the scheduler handle. State is only written through
    /// [`Self::compare_and_set_state`].
    pub async fn save(&self, run: &Run) -> Result<(), DbError> {
        let (schedule_time, start_time, pause_time, finish_time) = times_to_columns(&run.times);

        sqlx::query(
            r#"
            UPDATE runs
            SET schedule_time = ?, start_time = ?, pause_time = ?, finish_time = ?, aps_job_id = ?
            WHERE id = ?
            "#,
        )
        .bind(schedule_time)
        .bind(start_time)
        .bind(pause_time)
        .bind(finish_time)
        .bind(&run.aps_job_id)
        .bind(run.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_plan, setup_test_db};
    use crate::PlanRepository;
    use chrono::Utc;

    #[tokio::test]
    async fn test_compare_and_set_state() {
        let (_dir, pool) = setup_test_db().await;
        let plan = sample_plan();
        PlanRepository::new(pool.clone()).create(&plan).await.unwrap();
        let repo = RunRepository::new(pool);

        let run = Run::new(plan.id);
        repo.create(&run).await.unwrap();

        assert!(repo
            .compare_and_set_state(run.id, RunState::Pending, RunState::Running)
            .await
            .unwrap());
        // Lost race: the run is no longer PENDING.
        assert!(!repo
            .compare_and_set_state(run.id, RunState::Pending, RunState::Scheduled)
            .await
            .unwrap());

        let found = repo.find_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(found.state, RunState::Running);
    }

    #[tokio::test]
    async fn test_save_keeps_state() {
        let (_dir, pool) = setup_test_db().await;
        let plan = sample_plan();
        PlanRepository::new(pool.clone()).create(&plan).await.unwrap();
        let repo = RunRepository::new(pool);

        let mut run = Run::new(plan.id);
        repo.create(&run).await.unwrap();

        run.state = RunState::Finished;
        run.times.start_time = Some(Utc::now());
        run.aps_job_id = Some("job-1".to_string());
        repo.save(&run).await.unwrap();

        let found = repo.find_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(found.state, RunState::Pending);
        assert!(found.times.start_time.is_some());
        assert_eq!(found.aps_job_id.as_deref(), Some("job-1"));
    }
}
