//! Completion cascade: a finished step releases its successors, a stage whose
//! steps are all final finishes and wakes its dependents, and plan executions
//! and runs follow their children.

use std::sync::Arc;

use chrono::Utc;
use cryton_core::{
    PlanState, RunState, StageExecution, StageState, StageTemplate, StepExecution, StepState,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::HiveContext;
use crate::dispatch::DispatchRequest;
use crate::error::{OrchestratorError, Result};
use crate::step::successors::{is_completed, leads_to};

#[derive(Clone)]
pub struct Progress {
    ctx: Arc<HiveContext>,
}

/// A lost compare-and-set means another task already moved the entity on.
fn settled(result: Result<bool>) -> Result<bool> {
    match result {
        Err(OrchestratorError::InvalidState { kind, id, state }) => {
            debug!(kind = %kind, id = %id, state = %state, "State already advanced elsewhere");
            Ok(false)
        }
        other => other,
    }
}

/// Steps that nothing has dispatched yet. A PAUSED step with a parent was
/// already released and only waits for resume.
fn is_dormant(step: &StepExecution) -> bool {
    match step.state {
        StepState::Pending => true,
        StepState::Paused => step.parent_id.is_none(),
        _ => false,
    }
}

impl Progress {
    pub fn new(ctx: Arc<HiveContext>) -> Self {
        Self { ctx }
    }

    /// Called once a step reached a final state.
    pub async fn on_step_finished(&self, step_execution_id: Uuid) -> Result<()> {
        let step = self.ctx.load_step(step_execution_id).await?;
        let stage = self.ctx.load_stage(step.stage_execution_id).await?;

        if is_completed(step.state) && matches!(stage.state, StageState::Running | StageState::Pausing) {
            self.release_successors(&stage, &step).await?;
        }
        self.check_stage(stage.id).await
    }

    /// Propagates an IGNORED step to successors that can no longer run.
    pub async fn after_ignored(&self, step: &StepExecution) -> Result<()> {
        let stage = self.ctx.load_stage(step.stage_execution_id).await?;
        let stage_template = self.stage_template(&stage).await?;
        if let Some(template) = stage_template.step(&step.step_name) {
            let targets = template
                .successor_names()
                .into_iter()
                .map(str::to_string)
                .collect();
            self.ignore_unreachable(&stage, &stage_template, targets).await?;
        }
        self.check_stage(stage.id).await
    }

    async fn stage_template(&self, stage: &StageExecution) -> Result<StageTemplate> {
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
        let plan = self.ctx.load_plan(execution.plan_id).await?;
        Ok(self.ctx.stage_template(&plan, stage)?.clone())
    }

    async fn release_successors(&self, stage: &StageExecution, step: &StepExecution) -> Result<()> {
        let stage_template = self.stage_template(stage).await?;
        let Some(template) = stage_template.step(&step.step_name) else {
            return Ok(());
        };

        let mut unmatched = Vec::new();
        for name in template.successor_names() {
            let Some(target) = self
                .ctx
                .store
                .step_executions
                .find_by_name(stage.id, name)
                .await?
            else {
                continue;
            };

            if leads_to(template, step, name) {
                if is_dormant(&target) {
                    debug!(
                        step_execution_id = %target.id,
                        parent_id = %step.id,
                        step = %target.step_name,
                        "Releasing successor"
                    );
                    self.ctx.dispatch.submit_step(target.id, Some(step.id)).await?;
                }
            } else {
                unmatched.push(name.to_string());
            }
        }

        self.ignore_unreachable(stage, &stage_template, unmatched).await
    }

    /// Ignores dormant steps whose parents are all final without any of them
    /// leading here, then revisits their successors.
    async fn ignore_unreachable(
        &self,
        stage: &StageExecution,
        stage_template: &StageTemplate,
        mut worklist: Vec<String>,
    ) -> Result<()> {
        while let Some(name) = worklist.pop() {
            let Some(mut target) = self
                .ctx
                .store
                .step_executions
                .find_by_name(stage.id, &name)
                .await?
            else {
                continue;
            };
            if !is_dormant(&target) {
                continue;
            }

            let mut reachable = false;
            for parent_template in stage_template.parents_of(&name) {
                let parent = self
                    .ctx
                    .store
                    .step_executions
                    .find_by_name(stage.id, &parent_template.name)
                    .await?;
                if let Some(parent) = parent {
                    if !parent.state.is_final() || leads_to(parent_template, &parent, &name) {
                        reachable = true;
                        break;
                    }
                }
            }
            if reachable {
                continue;
            }

            if !settled(self.ctx.set_step_state(&mut target, StepState::Ignored).await)? {
                continue;
            }
            if let Some(template) = stage_template.step(&name) {
                worklist.extend(template.successor_names().into_iter().map(str::to_string));
            }
        }
        Ok(())
    }

    /// Finishes or pauses the stage once its steps allow it.
    pub async fn check_stage(&self, stage_execution_id: Uuid) -> Result<()> {
        let mut stage = self.ctx.load_stage(stage_execution_id).await?;
        if !matches!(stage.state, StageState::Running | StageState::Pausing) {
            return Ok(());
        }

        let steps = self
            .ctx
            .store
            .step_executions
            .find_by_stage_execution(stage.id)
            .await?;

        if !steps.is_empty() && steps.iter().all(|s| s.state.is_final()) {
            stage.times.finish_time = Some(Utc::now());
            self.ctx.store.stage_executions.save(&stage).await?;
            if !settled(self.ctx.set_stage_state(&mut stage, StageState::Finished).await)? {
                return Ok(());
            }
            info!(stage_execution_id = %stage.id, stage = %stage.stage_name, "Stage execution finished");
            self.release_dependents(&stage).await?;
            return self.check_plan_execution(stage.plan_execution_id).await;
        }

        if stage.state == StageState::Pausing && !steps.iter().any(|s| s.state.is_active()) {
            stage.times.pause_time = Some(Utc::now());
            self.ctx.store.stage_executions.save(&stage).await?;
            if settled(self.ctx.set_stage_state(&mut stage, StageState::Paused).await)? {
                return self.check_plan_execution(stage.plan_execution_id).await;
            }
        }
        Ok(())
    }

    /// Re-evaluates WAITING stages that depend on the finished `stage`.
    async fn release_dependents(&self, stage: &StageExecution) -> Result<()> {
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
        let plan = self.ctx.load_plan(execution.plan_id).await?;

        for dependent in plan.template.dependents_of(&stage.stage_name) {
            let Some(waiting) = self
                .ctx
                .store
                .stage_executions
                .find_by_name(execution.id, &dependent.name)
                .await?
            else {
                continue;
            };
            if waiting.state == StageState::Waiting {
                self.ctx
                    .dispatch
                    .submit(DispatchRequest::Stage {
                        stage_execution_id: waiting.id,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn check_plan_execution(&self, plan_execution_id: Uuid) -> Result<()> {
        let mut execution = self.ctx.load_plan_execution(plan_execution_id).await?;
        if !matches!(execution.state, PlanState::Running | PlanState::Pausing) {
            return Ok(());
        }

        let stages = self
            .ctx
            .store
            .stage_executions
            .find_by_plan_execution(execution.id)
            .await?;

        if !stages.is_empty() && stages.iter().all(|s| s.state.is_final()) {
            execution.times.finish_time = Some(Utc::now());
            self.ctx.store.plan_executions.save(&execution).await?;
            if settled(self.ctx.set_plan_state(&mut execution, PlanState::Finished).await)? {
                info!(plan_execution_id = %execution.id, "Plan execution finished");
                return self.check_run(execution.run_id).await;
            }
            return Ok(());
        }

        let busy = stages.iter().any(|s| {
            matches!(
                s.state,
                StageState::Starting | StageState::Running | StageState::Pausing
            )
        });
        if execution.state == PlanState::Pausing && !busy {
            if settled(self.ctx.set_plan_state(&mut execution, PlanState::Paused).await)? {
                return self.check_run(execution.run_id).await;
            }
        }
        Ok(())
    }

    pub async fn check_run(&self, run_id: Uuid) -> Result<()> {
        let mut run = self.ctx.load_run(run_id).await?;
        if !matches!(run.state, RunState::Running | RunState::Pausing) {
            return Ok(());
        }

        let executions = self.ctx.store.plan_executions.find_by_run(run.id).await?;
        if !executions.is_empty() && executions.iter().all(|e| e.state.is_final()) {
            run.times.finish_time = Some(Utc::now());
            self.ctx.store.runs.save(&run).await?;
            if settled(self.ctx.set_run_state(&mut run, RunState::Finished).await)? {
                info!(run_id = %run.id, "Run finished");
            }
            return Ok(());
        }

        let paused = executions
            .iter()
            .all(|e| e.state == PlanState::Paused || e.state.is_final());
        if run.state == RunState::Pausing && paused {
            run.times.pause_time = Some(Utc::now());
            self.ctx.store.runs.save(&run).await?;
            settled(self.ctx.set_run_state(&mut run, RunState::Paused).await)?;
        }
        Ok(())
    }
}
