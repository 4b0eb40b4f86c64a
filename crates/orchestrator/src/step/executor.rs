use std::sync::Arc;

use bus::{StepDispatch, StepReply, RETURN_CODE_ERROR, RETURN_CODE_TERMINATED};
use chrono::Utc;
use cryton_core::{
    CorrelationEvent, EntityKind, PlanExecution, PlanState, StageExecution, StageState,
    StepExecution, StepResult, StepState,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::kind::{kind_of, StepKind};
use super::{output_mapping, session};
use crate::context::HiveContext;
use crate::error::{OrchestratorError, Result};
use crate::progress::Progress;
use crate::resolver::resolve_arguments;
use crate::state_machine::{StateMachine, StepStateMachine};
use crate::worker::WorkerClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Published to the worker; the reply arrives through the listener.
    Sent,
    /// Held back because the plan execution or stage is pausing.
    Paused,
    /// Marked ERROR before anything reached the worker.
    Failed,
}

#[derive(Clone)]
pub struct StepExecutor {
    ctx: Arc<HiveContext>,
    progress: Progress,
}

impl StepExecutor {
    pub fn new(ctx: Arc<HiveContext>, progress: Progress) -> Self {
        Self { ctx, progress }
    }

    /// Dispatches a PENDING (or held back PAUSED) step to its worker.
    pub async fn execute(&self, id: Uuid, parent_id: Option<Uuid>) -> Result<DispatchOutcome> {
        let mut step = self.ctx.load_step(id).await?;
        StepStateMachine::validate_state(step.id, step.state, StepStateMachine::EXECUTE_STATES)?;
        let stage = self.ctx.load_stage(step.stage_execution_id).await?;
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;

        if parent_id.is_some() {
            step.parent_id = parent_id;
        }

        if execution.state.withholds_dispatch()
            || matches!(stage.state, StageState::Pausing | StageState::Paused)
        {
            if step.state == StepState::Pending {
                self.ctx.store.step_executions.save(&step).await?;
                self.ctx.set_step_state(&mut step, StepState::Paused).await?;
            }
            info!(step_execution_id = %step.id, step = %step.step_name, "Dispatch held back while pausing");
            return Ok(DispatchOutcome::Paused);
        }
        if execution.state != PlanState::Running {
            return Err(OrchestratorError::invalid_state(
                EntityKind::PlanExecution,
                execution.id,
                execution.state,
            ));
        }

        self.ctx.set_step_state(&mut step, StepState::Starting).await?;
        step.times.start_time = Some(Utc::now());
        self.ctx.store.step_executions.save(&step).await?;

        match self.dispatch(&mut step, &stage, &execution).await {
            Ok(()) => Ok(DispatchOutcome::Sent),
            Err(e) => {
                warn!(step_execution_id = %step.id, step = %step.step_name, error = %e, "Step dispatch failed");
                self.fail(&mut step, &e.to_string()).await?;
                Ok(DispatchOutcome::Failed)
            }
        }
    }

    async fn dispatch(
        &self,
        step: &mut StepExecution,
        stage: &StageExecution,
        execution: &PlanExecution,
    ) -> Result<()> {
        let plan = self.ctx.load_plan(execution.plan_id).await?;
        let stage_template = self.ctx.stage_template(&plan, stage)?;
        let template = self.ctx.step_template(stage_template, step)?;
        let kind = kind_of(template.step_type);
        kind.validate(template)?;

        let worker = WorkerClient::new(
            self.ctx.bus.clone(),
            &self.ctx.load_worker(execution.worker_id).await?,
        );
        let arguments = resolve_arguments(&self.ctx, &plan, stage, step, &template.arguments).await?;
        let session_id =
            session::resolve_session(&self.ctx, &worker, execution.id, &arguments).await?;
        let body = kind.build_dispatch(&arguments, session_id.as_deref(), &self.ctx.config.queues)?;

        let correlation_id = Uuid::new_v4().to_string();
        self.ctx
            .store
            .correlations
            .create(&CorrelationEvent::new(&correlation_id, step.id))
            .await?;

        if let Err(e) = self.send(step, kind, &worker, &body, &correlation_id).await {
            self.ctx.store.correlations.delete(&correlation_id).await?;
            return Err(e);
        }

        info!(
            step_execution_id = %step.id,
            step = %step.step_name,
            step_type = template.step_type.as_str(),
            correlation_id = %correlation_id,
            "Step dispatched"
        );
        Ok(())
    }

    async fn send(
        &self,
        step: &mut StepExecution,
        kind: &dyn StepKind,
        worker: &WorkerClient,
        body: &StepDispatch,
        correlation_id: &str,
    ) -> Result<()> {
        self.ctx.set_step_state(step, StepState::Running).await?;
        self.ctx
            .bus
            .rpc_send(
                kind.request_queue(worker.queues()),
                body,
                kind.reply_queue(&self.ctx.config.queues),
                correlation_id,
            )
            .await?;
        Ok(())
    }

    async fn fail(&self, step: &mut StepExecution, message: &str) -> Result<()> {
        step.result = StepResult::Fail;
        step.output = message.to_string();
        step.times.finish_time = Some(Utc::now());
        self.ctx.store.step_executions.save(step).await?;
        self.ctx.set_step_state(step, StepState::Error).await?;
        Ok(())
    }

    /// Marks a RUNNING step ERROR after the worker reported an engine failure.
    pub async fn fail_running(&self, id: Uuid, message: &str) -> Result<StepExecution> {
        let mut step = self.ctx.load_step(id).await?;
        StepStateMachine::validate_state(step.id, step.state, StepStateMachine::POSTPROCESS_STATES)?;
        self.fail(&mut step, message).await?;
        Ok(step)
    }

    /// Records a worker reply. A body that is not a reply is kept as raw
    /// output with a `fail` result.
    pub async fn postprocess(&self, id: Uuid, body: &[u8]) -> Result<StepExecution> {
        let mut step = self.ctx.load_step(id).await?;
        StepStateMachine::validate_state(step.id, step.state, StepStateMachine::POSTPROCESS_STATES)?;
        let killed = step.state == StepState::Terminating;

        let reply = match serde_json::from_slice::<StepReply>(body) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(step_execution_id = %step.id, error = %e, "Unparseable step reply");
                step.result = StepResult::Fail;
                step.output = String::from_utf8_lossy(body).into_owned();
                step.times.finish_time = Some(Utc::now());
                self.ctx.store.step_executions.save(&step).await?;
                let to = if killed { StepState::Terminated } else { StepState::Finished };
                self.ctx.set_step_state(&mut step, to).await?;
                return Ok(step);
            }
        };

        let stage = self.ctx.load_stage(step.stage_execution_id).await?;
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
        let plan = self.ctx.load_plan(execution.plan_id).await?;
        let template = self
            .ctx
            .step_template(self.ctx.stage_template(&plan, &stage)?, &step)?;

        step.result = if reply.return_code == 0 {
            StepResult::Ok
        } else {
            StepResult::Fail
        };
        step.output = reply.combined_output();
        step.serialized_output =
            output_mapping::apply(&template.output_mapping, reply.serialized_output.clone());
        step.times.finish_time = Some(Utc::now());
        self.ctx.store.step_executions.save(&step).await?;

        let to = if killed || reply.return_code == RETURN_CODE_TERMINATED {
            StepState::Terminated
        } else if reply.return_code == RETURN_CODE_ERROR {
            StepState::Error
        } else {
            StepState::Finished
        };
        self.ctx.set_step_state(&mut step, to).await?;

        if let Some(name) = template.argument_str("create_named_session") {
            session::register_named_session(&self.ctx, execution.id, name, &step.serialized_output)
                .await?;
        }

        info!(
            step_execution_id = %step.id,
            step = %step.step_name,
            return_code = reply.return_code,
            result = step.result.as_str(),
            "Step reply processed"
        );
        Ok(step)
    }

    /// Asks the worker to interrupt a RUNNING step. The step is TERMINATED
    /// once the worker confirms, otherwise it stays TERMINATING until its
    /// reply arrives.
    pub async fn kill(&self, id: Uuid) -> Result<()> {
        let mut step = self.ctx.load_step(id).await?;
        StepStateMachine::validate_state(step.id, step.state, StepStateMachine::KILL_STATES)?;

        let Some(correlation) = self
            .ctx
            .store
            .correlations
            .find_by_step_execution(step.id)
            .await?
            .into_iter()
            .next()
        else {
            return Err(OrchestratorError::UnexpectedValue(format!(
                "step execution {} has no outstanding request",
                step.id
            )));
        };

        let stage = self.ctx.load_stage(step.stage_execution_id).await?;
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
        let worker = WorkerClient::new(
            self.ctx.bus.clone(),
            &self.ctx.load_worker(execution.worker_id).await?,
        );

        self.ctx.set_step_state(&mut step, StepState::Terminating).await?;
        let reply = worker
            .kill_step_execution(&correlation.correlation_id)
            .await?;
        if !reply.is_ok() {
            warn!(
                step_execution_id = %step.id,
                return_code = ?reply.return_code(),
                "Worker did not confirm the kill"
            );
            return Ok(());
        }

        if self
            .ctx
            .store
            .correlations
            .delete(&correlation.correlation_id)
            .await?
        {
            step.times.finish_time = Some(Utc::now());
            self.ctx.store.step_executions.save(&step).await?;
            self.ctx.set_step_state(&mut step, StepState::Terminated).await?;
            self.progress.check_stage(step.stage_execution_id).await?;
        } else {
            debug!(step_execution_id = %step.id, "Reply consumed the correlation before the kill completed");
        }
        Ok(())
    }

    /// Clears a finished step and dispatches it again with its previous parent.
    pub async fn re_execute(&self, id: Uuid) -> Result<()> {
        let step = self.ctx.load_step(id).await?;
        StepStateMachine::validate_state(step.id, step.state, StepStateMachine::RE_EXECUTE_STATES)?;
        let stage = self.ctx.load_stage(step.stage_execution_id).await?;
        if stage.state != StageState::Running {
            return Err(OrchestratorError::invalid_state(
                EntityKind::StageExecution,
                stage.id,
                stage.state,
            ));
        }

        if !self.ctx.store.step_executions.reset(step.id).await? {
            let current = self.ctx.load_step(step.id).await?;
            return Err(OrchestratorError::invalid_state(
                EntityKind::StepExecution,
                step.id,
                current.state,
            ));
        }
        info!(step_execution_id = %step.id, step = %step.step_name, "Step execution reset");
        self.ctx.dispatch.submit_step(step.id, step.parent_id).await
    }

    /// Skips a step that has not run, along with every successor this leaves
    /// unreachable.
    pub async fn ignore(&self, id: Uuid) -> Result<()> {
        let mut step = self.ctx.load_step(id).await?;
        StepStateMachine::validate_state(
            step.id,
            step.state,
            &[StepState::Pending, StepState::Paused],
        )?;
        self.ctx.set_step_state(&mut step, StepState::Ignored).await?;
        self.progress.after_ignored(&step).await
    }
}
