use sqlx::SqlitePool;

use crate::error::DbError;
use crate::pool::{create_pool, run_migrations};
use crate::repositories::*;

/// All repositories over one pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    pub plans: PlanRepository,
    pub workers: WorkerRepository,
    pub runs: RunRepository,
    pub plan_executions: PlanExecutionRepository,
    pub stage_executions: StageExecutionRepository,
    pub step_executions: StepExecutionRepository,
    pub correlations: CorrelationRepository,
    pub sessions: SessionRepository,
    pub variables: ExecutionVariableRepository,
    pub jobs: SchedulerJobRepository,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            plans: PlanRepository::new(pool.clone()),
            workers: WorkerRepository::new(pool.clone()),
            runs: RunRepository::new(pool.clone()),
            plan_executions: PlanExecutionRepository::new(pool.clone()),
            stage_executions: StageExecutionRepository::new(pool.clone()),
            step_executions: StepExecutionRepository::new(pool.clone()),
            correlations: CorrelationRepository::new(pool.clone()),
            sessions: SessionRepository::new(pool.clone()),
            variables: ExecutionVariableRepository::new(pool.clone()),
            jobs: SchedulerJobRepository::new(pool.clone()),
            pool,
        }
    }

    /// Opens the database at `database_url` and applies pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let pool = create_pool(database_url).await?;
        run_migrations(&pool).await?;
        tracing::debug!(database_url, "Database ready");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
