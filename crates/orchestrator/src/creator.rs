//! Creation of plans, runs and their execution trees.

use std::sync::Arc;

use cryton_core::{
    parse_plan_document, validate_plan, EntityKind, ExecutionVariable, Plan, PlanExecution,
    PlanTemplate, Run, StageExecution, StageTemplate, StepExecution, StepTemplate,
    ValidationError, Worker,
};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::context::HiveContext;
use crate::error::{OrchestratorError, Result};

#[derive(Clone)]
pub struct Creator {
    ctx: Arc<HiveContext>,
}

impl Creator {
    pub fn new(ctx: Arc<HiveContext>) -> Self {
        Self { ctx }
    }

    /// Validates a plan document and stores it as a new plan.
    pub async fn create_plan(&self, document: &Value) -> Result<Plan> {
        let template = parse_plan_document(document)?;
        let plan = self.ctx.store.plans.create(&Plan::new(template)).await?;
        info!(plan_id = %plan.id, plan = %plan.name, dynamic = plan.dynamic, "Plan created");
        Ok(plan)
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>> {
        Ok(self.ctx.store.plans.find_all().await?)
    }

    pub async fn delete_plan(&self, id: Uuid) -> Result<()> {
        if !self.ctx.store.plans.delete(id).await? {
            return Err(OrchestratorError::not_found(EntityKind::Plan, id));
        }
        info!(plan_id = %id, "Plan deleted");
        Ok(())
    }

    /// Creates a run of `plan_id` with one plan execution per worker and the
    /// full stage and step execution tree under each.
    pub async fn create_run(&self, plan_id: Uuid, worker_ids: &[Uuid]) -> Result<Run> {
        if worker_ids.is_empty() {
            return Err(OrchestratorError::UnexpectedValue(
                "a run needs at least one worker".to_string(),
            ));
        }
        let plan = self.ctx.load_plan(plan_id).await?;
        let mut workers: Vec<Worker> = Vec::with_capacity(worker_ids.len());
        for &worker_id in worker_ids {
            if workers.iter().any(|w| w.id == worker_id) {
                return Err(OrchestratorError::UnexpectedValue(format!(
                    "worker {worker_id} is listed more than once"
                )));
            }
            workers.push(self.ctx.load_worker(worker_id).await?);
        }

        let run = self.ctx.store.runs.create(&Run::new(plan.id)).await?;
        for worker in &workers {
            let execution = self
                .ctx
                .store
                .plan_executions
                .create(&PlanExecution::new(run.id, plan.id, worker.id))
                .await?;
            for stage in &plan.template.stages {
                self.create_stage_execution(execution.id, stage).await?;
            }
        }

        info!(
            run_id = %run.id,
            plan = %plan.name,
            workers = workers.len(),
            "Run created"
        );
        Ok(run)
    }

    async fn create_stage_execution(
        &self,
        plan_execution_id: Uuid,
        template: &StageTemplate,
    ) -> Result<StageExecution> {
        let stage = self
            .ctx
            .store
            .stage_executions
            .create(&StageExecution::new(plan_execution_id, &template.name))
            .await?;
        for step in &template.steps {
            self.ctx
                .store
                .step_executions
                .create(&StepExecution::new(stage.id, &step.name))
                .await?;
        }
        Ok(stage)
    }

    /// Inserts or replaces variables of a plan execution that has not ended.
    pub async fn add_execution_variables(
        &self,
        plan_execution_id: Uuid,
        variables: &Map<String, Value>,
    ) -> Result<()> {
        let execution = self.ctx.load_plan_execution(plan_execution_id).await?;
        if execution.state.is_final() {
            return Err(OrchestratorError::invalid_state(
                EntityKind::PlanExecution,
                execution.id,
                execution.state,
            ));
        }
        for (name, value) in variables {
            self.ctx
                .store
                .variables
                .upsert(&ExecutionVariable::new(execution.id, name, value.clone()))
                .await?;
        }
        info!(
            plan_execution_id = %execution.id,
            count = variables.len(),
            "Execution variables stored"
        );
        Ok(())
    }

    pub async fn list_execution_variables(&self, plan_execution_id: Uuid) -> Result<Vec<ExecutionVariable>> {
        self.ctx.load_plan_execution(plan_execution_id).await?;
        Ok(self
            .ctx
            .store
            .variables
            .find_by_plan_execution(plan_execution_id)
            .await?)
    }

    /// Adds a stage to a dynamic plan and to each of its plan executions.
    pub async fn add_stage(&self, plan_id: Uuid, stage: StageTemplate) -> Result<StageTemplate> {
        let plan = self.dynamic_plan(plan_id).await?;
        let mut template = plan.template.clone();
        template.stages.push(stage.clone());
        self.store_template(&plan, &template).await?;

        for execution in self.ctx.store.plan_executions.find_by_plan(plan.id).await? {
            self.create_stage_execution(execution.id, &stage).await?;
        }
        info!(plan_id = %plan.id, stage = %stage.name, "Stage added to dynamic plan");
        Ok(stage)
    }

    /// Adds a step to a stage of a dynamic plan and to each matching stage execution.
    pub async fn add_step(
        &self,
        plan_id: Uuid,
        stage_name: &str,
        step: StepTemplate,
    ) -> Result<StepTemplate> {
        let plan = self.dynamic_plan(plan_id).await?;
        let mut template = plan.template.clone();
        template
            .stages
            .iter_mut()
            .find(|s| s.name == stage_name)
            .ok_or_else(|| {
                OrchestratorError::not_found(EntityKind::StageExecution, format!("{}/{}", plan.name, stage_name))
            })?
            .steps
            .push(step.clone());
        self.store_template(&plan, &template).await?;

        for execution in self.ctx.store.plan_executions.find_by_plan(plan.id).await? {
            if let Some(stage) = self
                .ctx
                .store
                .stage_executions
                .find_by_name(execution.id, stage_name)
                .await?
            {
                self.ctx
                    .store
                    .step_executions
                    .create(&StepExecution::new(stage.id, &step.name))
                    .await?;
            }
        }
        info!(plan_id = %plan.id, stage = stage_name, step = %step.name, "Step added to dynamic plan");
        Ok(step)
    }

    async fn dynamic_plan(&self, plan_id: Uuid) -> Result<Plan> {
        let plan = self.ctx.load_plan(plan_id).await?;
        if !plan.dynamic {
            return Err(ValidationError::PlanNotDynamic(plan.name).into());
        }
        Ok(plan)
    }

    async fn store_template(&self, plan: &Plan, template: &PlanTemplate) -> Result<()> {
        validate_plan(template)?;
        if !self.ctx.store.plans.update_template(plan.id, template).await? {
            return Err(OrchestratorError::not_found(EntityKind::Plan, plan.id));
        }
        Ok(())
    }
}
