use bus::BusClient;
use cryton_core::{
    EntityKind, Plan, PlanExecution, PlanState, Run, RunState, StageExecution, StageState,
    StageTemplate, StepExecution, StepState, StepTemplate, Worker,
};
use db::Store;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatch::DispatchQueue;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::SchedulerHandle;
use crate::state_machine::{
    PlanStateMachine, RunStateMachine, StageStateMachine, StateMachine, StepStateMachine,
};

/// Services shared by every executor.
pub struct HiveContext {
    pub store: Store,
    pub bus: BusClient,
    pub config: EngineConfig,
    pub scheduler: SchedulerHandle,
    pub dispatch: DispatchQueue,
}

impl HiveContext {
    pub async fn load_plan(&self, id: Uuid) -> Result<Plan> {
        self.store
            .plans
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Plan, id))
    }

    pub async fn load_worker(&self, id: Uuid) -> Result<Worker> {
        self.store
            .workers
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Worker, id))
    }

    pub async fn load_run(&self, id: Uuid) -> Result<Run> {
        self.store
            .runs
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Run, id))
    }

    pub async fn load_plan_execution(&self, id: Uuid) -> Result<PlanExecution> {
        self.store
            .plan_executions
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::PlanExecution, id))
    }

    pub async fn load_stage(&self, id: Uuid) -> Result<StageExecution> {
        self.store
            .stage_executions
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::StageExecution, id))
    }

    pub async fn load_step(&self, id: Uuid) -> Result<StepExecution> {
        self.store
            .step_executions
            .find_by_id(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::StepExecution, id))
    }

    /// Template of the stage `stage` executes.
    pub fn stage_template<'a>(
        &self,
        plan: &'a Plan,
        stage: &StageExecution,
    ) -> Result<&'a StageTemplate> {
        plan.template.stage(&stage.stage_name).ok_or_else(|| {
            OrchestratorError::not_found(
                EntityKind::StageExecution,
                format!("{}/{}", plan.name, stage.stage_name),
            )
        })
    }

    pub fn step_template<'a>(
        &self,
        stage_template: &'a StageTemplate,
        step: &StepExecution,
    ) -> Result<&'a StepTemplate> {
        stage_template.step(&step.step_name).ok_or_else(|| {
            OrchestratorError::not_found(
                EntityKind::StepExecution,
                format!("{}/{}", stage_template.name, step.step_name),
            )
        })
    }

    pub async fn set_run_state(&self, run: &mut Run, to: RunState) -> Result<bool> {
        let from = run.state;
        if !RunStateMachine::validate_transition(run.id, from, to)? {
            return Ok(false);
        }
        if !self.store.runs.compare_and_set_state(run.id, from, to).await? {
            let current = self.load_run(run.id).await?;
            run.state = current.state;
            return Err(OrchestratorError::invalid_state(EntityKind::Run, run.id, current.state));
        }
        info!(run_id = %run.id, from = %from, to = %to, "Run state transition");
        run.state = to;
        Ok(true)
    }

    pub async fn set_plan_state(&self, execution: &mut PlanExecution, to: PlanState) -> Result<bool> {
        let from = execution.state;
        if !PlanStateMachine::validate_transition(execution.id, from, to)? {
            return Ok(false);
        }
        if !self
            .store
            .plan_executions
            .compare_and_set_state(execution.id, from, to)
            .await?
        {
            let current = self.load_plan_execution(execution.id).await?;
            execution.state = current.state;
            return Err(OrchestratorError::invalid_state(
                EntityKind::PlanExecution,
                execution.id,
                current.state,
            ));
        }
        info!(plan_execution_id = %execution.id, from = %from, to = %to, "Plan execution state transition");
        execution.state = to;
        Ok(true)
    }

    pub async fn set_stage_state(&self, stage: &mut StageExecution, to: StageState) -> Result<bool> {
        let from = stage.state;
        if !StageStateMachine::validate_transition(stage.id, from, to)? {
            return Ok(false);
        }
        if !self
            .store
            .stage_executions
            .compare_and_set_state(stage.id, from, to)
            .await?
        {
            let current = self.load_stage(stage.id).await?;
            stage.state = current.state;
            return Err(OrchestratorError::invalid_state(
                EntityKind::StageExecution,
                stage.id,
                current.state,
            ));
        }
        info!(
            stage_execution_id = %stage.id,
            stage = %stage.stage_name,
            from = %from,
            to = %to,
            "Stage execution state transition"
        );
        stage.state = to;
        Ok(true)
    }

    pub async fn set_step_state(&self, step: &mut StepExecution, to: StepState) -> Result<bool> {
        let from = step.state;
        if !StepStateMachine::validate_transition(step.id, from, to)? {
            return Ok(false);
        }
        if !self
            .store
            .step_executions
            .compare_and_set_state(step.id, from, to)
            .await?
        {
            let current = self.load_step(step.id).await?;
            step.state = current.state;
            return Err(OrchestratorError::invalid_state(
                EntityKind::StepExecution,
                step.id,
                current.state,
            ));
        }
        info!(
            step_execution_id = %step.id,
            step = %step.step_name,
            from = %from,
            to = %to,
            "Step execution state transition"
        );
        step.state = to;
        Ok(true)
    }
}
