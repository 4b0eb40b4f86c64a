//! Nested run reports and their export.

use std::path::Path;

use cryton_core::{
    PlanExecution, PlanExecutionReport, RunReport, StageExecutionReport, StepExecutionReport,
};
use uuid::Uuid;

use crate::context::HiveContext;
use crate::error::Result;

pub async fn run_report(ctx: &HiveContext, run_id: Uuid) -> Result<RunReport> {
    let run = ctx.load_run(run_id).await?;
    let plan = ctx.load_plan(run.plan_id).await?;

    let mut plan_executions = Vec::new();
    for execution in ctx.store.plan_executions.find_by_run(run.id).await? {
        plan_executions.push(plan_execution_report(ctx, &execution).await?);
    }

    Ok(RunReport {
        id: run.id,
        plan_id: plan.id,
        plan_name: plan.name,
        state: run.state,
        times: run.times,
        plan_executions,
    })
}

pub async fn plan_execution_report(
    ctx: &HiveContext,
    execution: &PlanExecution,
) -> Result<PlanExecutionReport> {
    let plan = ctx.load_plan(execution.plan_id).await?;
    let worker = ctx.load_worker(execution.worker_id).await?;

    let mut stage_executions = Vec::new();
    for stage in ctx
        .store
        .stage_executions
        .find_by_plan_execution(execution.id)
        .await?
    {
        let steps = ctx
            .store
            .step_executions
            .find_by_stage_execution(stage.id)
            .await?;
        let steps = steps.iter().map(StepExecutionReport::from).collect();
        stage_executions.push(StageExecutionReport::new(&stage, steps));
    }

    Ok(PlanExecutionReport {
        id: execution.id,
        plan_name: plan.name,
        worker_id: worker.id,
        worker_name: worker.name,
        state: execution.state,
        times: execution.times.clone(),
        evidence_directory: execution.evidence_directory.clone(),
        stage_executions,
    })
}

/// Pretty JSON of `report`, also written to `path` when one is given.
pub async fn export(report: &RunReport, path: Option<&Path>) -> Result<String> {
    let json = serde_json::to_string_pretty(report)?;
    if let Some(path) = path {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &json).await?;
        tracing::info!(run_id = %report.id, path = %path.display(), "Report exported");
    }
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cryton_core::{ExecutionTimes, RunState};

    #[tokio::test]
    async fn test_export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("run.json");
        let report = RunReport {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            plan_name: "basic".to_string(),
            state: RunState::Finished,
            times: ExecutionTimes::default(),
            plan_executions: Vec::new(),
        };

        let json = export(&report, Some(&path)).await.unwrap();
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(json, written);

        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["plan_name"], "basic");
        assert_eq!(value["state"], "FINISHED");
    }
}
