use cryton_core::{parse_plan_document, Plan, PlanExecution, Run, Worker};
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::{create_pool, run_migrations, PlanExecutionRepository, PlanRepository, RunRepository, WorkerRepository};

pub async fn setup_test_db() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("test.db").display());
    let pool = create_pool(&url).await.unwrap();
    run_migrations(&pool).await.unwrap();
    (dir, pool)
}

pub fn sample_plan() -> Plan {
    let template = parse_plan_document(&json!({
        "name": "sample",
        "stages": [{
            "name": "s1",
            "trigger_type": "delta",
            "trigger_args": {"seconds": 0},
            "steps": [{
                "name": "a",
                "step_type": "worker-execute",
                "is_init": true,
                "arguments": {"module": "cmd"}
            }]
        }]
    }))
    .unwrap();
    Plan::new(template)
}

/// Persists a plan, run, worker and plan execution and returns the latter.
pub async fn sample_plan_execution(pool: &SqlitePool) -> PlanExecution {
    let plan = sample_plan();
    PlanRepository::new(pool.clone()).create(&plan).await.unwrap();
    let run = Run::new(plan.id);
    RunRepository::new(pool.clone()).create(&run).await.unwrap();
    let worker = Worker::new("alpha", "");
    WorkerRepository::new(pool.clone()).create(&worker).await.unwrap();

    let execution = PlanExecution::new(run.id, plan.id, worker.id);
    PlanExecutionRepository::new(pool.clone())
        .create(&execution)
        .await
        .unwrap()
}
