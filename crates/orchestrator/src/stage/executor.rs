use std::sync::Arc;

use chrono::Utc;
use cryton_core::{
    EntityKind, PlanExecution, PlanState, StageExecution, StageState, StageTemplate, StepState,
    TriggerSpec,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::triggers::delta_fire_time;
use crate::context::HiveContext;
use crate::error::{OrchestratorError, Result};
use crate::progress::Progress;
use crate::state_machine::{StageStateMachine, StateMachine};
use crate::step::StepExecutor;
use crate::worker::WorkerClient;

#[derive(Clone)]
pub struct StageExecutor {
    pub(super) ctx: Arc<HiveContext>,
    steps: StepExecutor,
    progress: Progress,
}

impl StageExecutor {
    pub fn new(ctx: Arc<HiveContext>, steps: StepExecutor, progress: Progress) -> Self {
        Self {
            ctx,
            steps,
            progress,
        }
    }

    pub(super) async fn worker_for(&self, execution: &PlanExecution) -> Result<WorkerClient> {
        let worker = self.ctx.load_worker(execution.worker_id).await?;
        Ok(WorkerClient::new(self.ctx.bus.clone(), &worker))
    }

    async fn template_for(&self, stage: &StageExecution) -> Result<(PlanExecution, StageTemplate)> {
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
        let plan = self.ctx.load_plan(execution.plan_id).await?;
        let template = self.ctx.stage_template(&plan, stage)?.clone();
        Ok((execution, template))
    }

    /// Runs the stage once its trigger fired: waits for dependencies, holds
    /// back while the plan execution pauses, otherwise dispatches init steps.
    pub async fn execute(&self, id: Uuid) -> Result<()> {
        let stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, StageStateMachine::EXECUTE_STATES)?;
        self.start(stage).await
    }

    /// Trigger event from a worker. A stage paused while awaiting forgets its
    /// trigger and executes on resume.
    pub async fn on_trigger_fired(&self, id: Uuid) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        if stage.state == StageState::Paused && stage.trigger_id.is_some() {
            self.disarm(&mut stage).await?;
            info!(stage_execution_id = %stage.id, "Trigger fired while paused, stage executes on resume");
            return Ok(());
        }
        self.execute(id).await
    }

    async fn start(&self, mut stage: StageExecution) -> Result<()> {
        let (execution, template) = self.template_for(&stage).await?;

        if !self.dependencies_finished(&execution, &template).await? {
            // The trigger has fired; only dependency release may start it now.
            self.disarm(&mut stage).await?;
            if self.ctx.set_stage_state(&mut stage, StageState::Waiting).await? {
                info!(
                    stage_execution_id = %stage.id,
                    depends_on = ?template.depends_on,
                    "Stage execution waiting for dependencies"
                );
            }
            return Ok(());
        }

        if execution.state.withholds_dispatch() {
            return self.hold(&mut stage).await;
        }
        if execution.state != PlanState::Running {
            return Err(OrchestratorError::invalid_state(
                EntityKind::PlanExecution,
                execution.id,
                execution.state,
            ));
        }

        self.disarm(&mut stage).await?;
        if stage.times.start_time.is_none() {
            stage.times.start_time = Some(Utc::now());
        }
        stage.times.pause_time = None;
        self.ctx.store.stage_executions.save(&stage).await?;
        self.ctx.set_stage_state(&mut stage, StageState::Running).await?;

        for step_template in template.init_steps() {
            if let Some(step) = self
                .ctx
                .store
                .step_executions
                .find_by_name(stage.id, &step_template.name)
                .await?
            {
                self.ctx.dispatch.submit_step(step.id, None).await?;
            }
        }
        Ok(())
    }

    async fn dependencies_finished(
        &self,
        execution: &PlanExecution,
        template: &StageTemplate,
    ) -> Result<bool> {
        for dependency in &template.depends_on {
            let finished = self
                .ctx
                .store
                .stage_executions
                .find_by_name(execution.id, dependency)
                .await?
                .is_some_and(|s| s.state == StageState::Finished);
            if !finished {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Trigger fired while the plan execution pauses: the stage and its
    /// pending steps go to PAUSED.
    async fn hold(&self, stage: &mut StageExecution) -> Result<()> {
        self.disarm(stage).await?;
        stage.times.pause_time = Some(Utc::now());
        self.ctx.store.stage_executions.save(stage).await?;
        self.ctx.set_stage_state(stage, StageState::Paused).await?;
        self.pause_pending_steps(stage.id).await?;
        info!(stage_execution_id = %stage.id, "Stage execution held back while pausing");
        self.progress.check_plan_execution(stage.plan_execution_id).await
    }

    async fn pause_pending_steps(&self, stage_execution_id: Uuid) -> Result<()> {
        let steps = self
            .ctx
            .store
            .step_executions
            .find_by_stage_execution(stage_execution_id)
            .await?;
        for mut step in steps.into_iter().filter(|s| s.state == StepState::Pending) {
            if let Err(e) = self.ctx.set_step_state(&mut step, StepState::Paused).await {
                debug!(step_execution_id = %step.id, error = %e, "Step left pending");
            }
        }
        Ok(())
    }

    pub async fn pause(&self, id: Uuid) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, StageStateMachine::PAUSE_STATES)?;

        match stage.state {
            StageState::Scheduled => {
                if let Some(job_id) = &stage.aps_job_id {
                    self.ctx.scheduler.pause(job_id).await?;
                }
                stage.times.pause_time = Some(Utc::now());
                self.ctx.store.stage_executions.save(&stage).await?;
                self.ctx.set_stage_state(&mut stage, StageState::Paused).await?;
            }
            StageState::Awaiting | StageState::Waiting => {
                stage.times.pause_time = Some(Utc::now());
                self.ctx.store.stage_executions.save(&stage).await?;
                self.ctx.set_stage_state(&mut stage, StageState::Paused).await?;
            }
            _ => {
                self.ctx.set_stage_state(&mut stage, StageState::Pausing).await?;
                self.progress.check_stage(stage.id).await?;
            }
        }
        info!(stage_execution_id = %stage.id, stage = %stage.stage_name, "Stage execution pause requested");
        Ok(())
    }

    /// Continues a PAUSED stage from wherever it was paused.
    pub async fn resume(&self, id: Uuid) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, &[StageState::Paused])?;
        let (execution, template) = self.template_for(&stage).await?;
        stage.times.pause_time = None;

        if stage.times.start_time.is_some() {
            self.ctx.store.stage_executions.save(&stage).await?;
            self.ctx.set_stage_state(&mut stage, StageState::Running).await?;
            self.resubmit_paused_steps(&stage, &template).await?;
            return self.progress.check_stage(stage.id).await;
        }

        if let Some(job_id) = stage.aps_job_id.clone() {
            match TriggerSpec::parse(&template.name, template.trigger_type, &template.trigger_args)? {
                TriggerSpec::Delta(delta) => {
                    let at = delta_fire_time(&execution, &delta);
                    self.replace_job(&mut stage, at).await?;
                }
                _ => {
                    self.ctx.scheduler.resume(&job_id).await?;
                    self.ctx.store.stage_executions.save(&stage).await?;
                }
            }
            self.ctx.set_stage_state(&mut stage, StageState::Scheduled).await?;
            return Ok(());
        }

        if stage.trigger_id.is_some() {
            self.ctx.store.stage_executions.save(&stage).await?;
            self.ctx.set_stage_state(&mut stage, StageState::Awaiting).await?;
            return Ok(());
        }

        self.start(stage).await
    }

    /// Dispatches steps that were released (or are init steps) but held back.
    async fn resubmit_paused_steps(&self, stage: &StageExecution, template: &StageTemplate) -> Result<()> {
        let steps = self
            .ctx
            .store
            .step_executions
            .find_by_stage_execution(stage.id)
            .await?;
        for step in steps.into_iter().filter(|s| s.state == StepState::Paused) {
            let is_init = template.step(&step.step_name).is_some_and(|t| t.is_init);
            if step.parent_id.is_some() || is_init {
                self.ctx.dispatch.submit_step(step.id, step.parent_id).await?;
            }
        }
        Ok(())
    }

    /// Stops the trigger, kills running steps and terminates the stage.
    pub async fn kill(&self, id: Uuid) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, StageStateMachine::KILL_STATES)?;
        self.ctx.set_stage_state(&mut stage, StageState::Terminating).await?;
        self.disarm(&mut stage).await?;

        let running: Vec<Uuid> = self
            .ctx
            .store
            .step_executions
            .find_by_stage_execution(stage.id)
            .await?
            .into_iter()
            .filter(|s| s.state == StepState::Running)
            .map(|s| s.id)
            .collect();
        let results = futures::future::join_all(running.iter().map(|&step_id| self.steps.kill(step_id))).await;
        for (step_id, result) in running.iter().zip(results) {
            if let Err(e) = result {
                warn!(step_execution_id = %step_id, error = %e, "Failed to kill step execution");
            }
        }

        stage.times.finish_time = Some(Utc::now());
        self.ctx.store.stage_executions.save(&stage).await?;
        self.ctx.set_stage_state(&mut stage, StageState::Terminated).await?;
        info!(stage_execution_id = %stage.id, stage = %stage.stage_name, "Stage execution killed");
        Ok(())
    }

    /// Resets a finished stage and all of its steps, then executes it again.
    pub async fn re_execute(&self, id: Uuid) -> Result<()> {
        let stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, StageStateMachine::RE_EXECUTE_STATES)?;
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
        if execution.state != PlanState::Running {
            return Err(OrchestratorError::invalid_state(
                EntityKind::PlanExecution,
                execution.id,
                execution.state,
            ));
        }

        for step in self
            .ctx
            .store
            .step_executions
            .find_by_stage_execution(stage.id)
            .await?
        {
            self.ctx.store.step_executions.reset(step.id).await?;
        }
        if !self.ctx.store.stage_executions.reset(stage.id).await? {
            let current = self.ctx.load_stage(stage.id).await?;
            return Err(OrchestratorError::invalid_state(
                EntityKind::StageExecution,
                stage.id,
                current.state,
            ));
        }
        info!(stage_execution_id = %stage.id, stage = %stage.stage_name, "Stage execution reset");
        self.execute(stage.id).await
    }
}
