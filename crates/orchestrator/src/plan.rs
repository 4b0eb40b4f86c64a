use std::sync::Arc;

use chrono::Utc;
use cryton_core::{PlanExecution, PlanExecutionReport, PlanState, StageState, StepType};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::HiveContext;
use crate::error::Result;
use crate::progress::Progress;
use crate::report;
use crate::stage::StageExecutor;
use crate::state_machine::{PlanStateMachine, StageStateMachine, StateMachine};
use crate::worker::WorkerClient;

/// Worker verdict on one worker-execute step's module arguments.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleValidation {
    pub step_execution_id: Uuid,
    pub stage_name: String,
    pub step_name: String,
    pub valid: bool,
    pub output: String,
}

#[derive(Clone)]
pub struct PlanExecutor {
    ctx: Arc<HiveContext>,
    stages: StageExecutor,
    progress: Progress,
}

impl PlanExecutor {
    pub fn new(ctx: Arc<HiveContext>, stages: StageExecutor, progress: Progress) -> Self {
        Self {
            ctx,
            stages,
            progress,
        }
    }

    async fn worker_for(&self, execution: &PlanExecution) -> Result<WorkerClient> {
        let worker = self.ctx.load_worker(execution.worker_id).await?;
        Ok(WorkerClient::new(self.ctx.bus.clone(), &worker))
    }

    /// Starts the plan execution: prepares the evidence directory and the
    /// worker's queues, then arms every stage trigger.
    pub async fn execute(&self, id: Uuid) -> Result<()> {
        let mut execution = self.ctx.load_plan_execution(id).await?;
        PlanStateMachine::validate_state(execution.id, execution.state, PlanStateMachine::EXECUTE_STATES)?;
        let worker = self.ctx.load_worker(execution.worker_id).await?;

        let evidence = self
            .ctx
            .config
            .evidence_root
            .join(format!("run_{}", execution.run_id))
            .join(format!("worker_{}", worker.name));
        tokio::fs::create_dir_all(&evidence).await?;
        execution.evidence_directory = Some(evidence.display().to_string());

        WorkerClient::new(self.ctx.bus.clone(), &worker)
            .declare_queues()
            .await?;

        execution.times.start_time = Some(Utc::now());
        execution.aps_job_id = None;
        self.ctx.store.plan_executions.save(&execution).await?;
        self.ctx.set_plan_state(&mut execution, PlanState::Running).await?;
        info!(plan_execution_id = %execution.id, worker = %worker.name, "Plan execution started");

        let stages = self
            .ctx
            .store
            .stage_executions
            .find_by_plan_execution(execution.id)
            .await?;
        let results = futures::future::join_all(
            stages.iter().map(|stage| self.stages.start_trigger(stage.id)),
        )
        .await;
        for (stage, result) in stages.iter().zip(results) {
            if let Err(e) = result {
                error!(
                    stage_execution_id = %stage.id,
                    stage = %stage.stage_name,
                    error = %e,
                    "Failed to start stage trigger"
                );
            }
        }

        self.progress.check_plan_execution(execution.id).await
    }

    /// Stops further dispatch. Running steps finish; the execution becomes
    /// PAUSED once nothing is active. Pausing twice is a no-op.
    pub async fn pause(&self, id: Uuid) -> Result<()> {
        let mut execution = self.ctx.load_plan_execution(id).await?;
        if matches!(execution.state, PlanState::Pausing | PlanState::Paused) {
            return Ok(());
        }
        PlanStateMachine::validate_state(execution.id, execution.state, PlanStateMachine::PAUSE_STATES)?;

        execution.times.pause_time = Some(Utc::now());
        self.ctx.store.plan_executions.save(&execution).await?;
        self.ctx.set_plan_state(&mut execution, PlanState::Pausing).await?;

        for stage in self
            .ctx
            .store
            .stage_executions
            .find_by_plan_execution(execution.id)
            .await?
        {
            if !StageStateMachine::PAUSE_STATES.contains(&stage.state) {
                continue;
            }
            if let Err(e) = self.stages.pause(stage.id).await {
                warn!(stage_execution_id = %stage.id, error = %e, "Failed to pause stage execution");
            }
        }

        self.progress.check_plan_execution(execution.id).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<()> {
        let mut execution = self.ctx.load_plan_execution(id).await?;
        PlanStateMachine::validate_state(execution.id, execution.state, PlanStateMachine::RESUME_STATES)?;

        if let Some(paused_at) = execution.times.pause_time.take() {
            execution.paused_ms += (Utc::now() - paused_at).num_milliseconds().max(0);
        }
        self.ctx.store.plan_executions.save(&execution).await?;
        self.ctx.set_plan_state(&mut execution, PlanState::Running).await?;
        info!(plan_execution_id = %execution.id, paused_ms = execution.paused_ms, "Plan execution resumed");

        for stage in self
            .ctx
            .store
            .stage_executions
            .find_by_plan_execution(execution.id)
            .await?
        {
            if stage.state != StageState::Paused {
                continue;
            }
            if let Err(e) = self.stages.resume(stage.id).await {
                warn!(stage_execution_id = %stage.id, error = %e, "Failed to resume stage execution");
            }
        }

        self.progress.check_plan_execution(execution.id).await
    }

    pub async fn kill(&self, id: Uuid) -> Result<()> {
        let mut execution = self.ctx.load_plan_execution(id).await?;
        PlanStateMachine::validate_state(execution.id, execution.state, PlanStateMachine::KILL_STATES)?;
        self.ctx.set_plan_state(&mut execution, PlanState::Terminating).await?;

        let stages: Vec<Uuid> = self
            .ctx
            .store
            .stage_executions
            .find_by_plan_execution(execution.id)
            .await?
            .into_iter()
            .filter(|s| StageStateMachine::KILL_STATES.contains(&s.state))
            .map(|s| s.id)
            .collect();
        let results = futures::future::join_all(stages.iter().map(|&stage_id| self.stages.kill(stage_id))).await;
        for (stage_id, result) in stages.iter().zip(results) {
            if let Err(e) = result {
                warn!(stage_execution_id = %stage_id, error = %e, "Failed to kill stage execution");
            }
        }

        execution.times.finish_time = Some(Utc::now());
        self.ctx.store.plan_executions.save(&execution).await?;
        self.ctx.set_plan_state(&mut execution, PlanState::Terminated).await?;
        info!(plan_execution_id = %execution.id, "Plan execution killed");

        self.progress.check_run(execution.run_id).await
    }

    /// Asks the worker to validate every worker-execute step's module and
    /// stores the verdict on the step execution.
    pub async fn validate_modules(&self, id: Uuid) -> Result<Vec<ModuleValidation>> {
        let execution = self.ctx.load_plan_execution(id).await?;
        let plan = self.ctx.load_plan(execution.plan_id).await?;
        let worker = self.worker_for(&execution).await?;

        let mut validations = Vec::new();
        for stage in self
            .ctx
            .store
            .stage_executions
            .find_by_plan_execution(execution.id)
            .await?
        {
            let stage_template = self.ctx.stage_template(&plan, &stage)?;
            for step in self
                .ctx
                .store
                .step_executions
                .find_by_stage_execution(stage.id)
                .await?
            {
                let template = self.ctx.step_template(stage_template, &step)?;
                if template.step_type != StepType::WorkerExecute {
                    continue;
                }
                let module = template.argument_str("module").unwrap_or_default();
                let module_arguments = template
                    .arguments
                    .get("module_arguments")
                    .cloned()
                    .unwrap_or(Value::Null);

                let (valid, output) = worker.validate_module(module, &module_arguments).await?;
                self.ctx.store.step_executions.set_valid(step.id, valid).await?;
                if !valid {
                    warn!(step_execution_id = %step.id, module, output = %output, "Module validation failed");
                }
                validations.push(ModuleValidation {
                    step_execution_id: step.id,
                    stage_name: stage.stage_name.clone(),
                    step_name: step.step_name.clone(),
                    valid,
                    output,
                });
            }
        }
        Ok(validations)
    }

    pub async fn report(&self, id: Uuid) -> Result<PlanExecutionReport> {
        let execution = self.ctx.load_plan_execution(id).await?;
        report::plan_execution_report(&self.ctx, &execution).await
    }
}
