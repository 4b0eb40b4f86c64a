use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cryton_core::{PlanState, Run, RunReport, RunState};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::HiveContext;
use crate::creator::Creator;
use crate::error::{OrchestratorError, Result};
use crate::plan::PlanExecutor;
use crate::progress::Progress;
use crate::report;
use crate::scheduler::RUN_EXECUTE;
use crate::state_machine::{PlanStateMachine, RunStateMachine, StateMachine};

/// Operator-facing run operations. Each fans out to the run's plan executions.
#[derive(Clone)]
pub struct RunCoordinator {
    ctx: Arc<HiveContext>,
    plans: PlanExecutor,
    progress: Progress,
}

impl RunCoordinator {
    pub fn new(ctx: Arc<HiveContext>, plans: PlanExecutor, progress: Progress) -> Self {
        Self {
            ctx,
            plans,
            progress,
        }
    }

    /// Creates a run of `plan_id` with one plan execution per worker.
    pub async fn create(&self, plan_id: Uuid, worker_ids: &[Uuid]) -> Result<Run> {
        Creator::new(Arc::clone(&self.ctx))
            .create_run(plan_id, worker_ids)
            .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Run> {
        self.ctx.load_run(id).await
    }

    pub async fn list(&self) -> Result<Vec<Run>> {
        Ok(self.ctx.store.runs.find_all().await?)
    }

    pub async fn execute(&self, id: Uuid) -> Result<()> {
        let mut run = self.ctx.load_run(id).await?;
        RunStateMachine::validate_state(run.id, run.state, RunStateMachine::EXECUTE_STATES)?;

        run.times.start_time = Some(Utc::now());
        run.aps_job_id = None;
        self.ctx.store.runs.save(&run).await?;
        self.ctx.set_run_state(&mut run, RunState::Running).await?;
        info!(run_id = %run.id, "Run started");

        let executions = self.ctx.store.plan_executions.find_by_run(run.id).await?;
        let results =
            futures::future::join_all(executions.iter().map(|e| self.plans.execute(e.id))).await;
        for (execution, result) in executions.iter().zip(results) {
            if let Err(e) = result {
                warn!(plan_execution_id = %execution.id, error = %e, "Failed to execute plan execution");
            }
        }
        Ok(())
    }

    /// Schedules a PENDING run to execute at `at`.
    pub async fn schedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut run = self.ctx.load_run(id).await?;
        RunStateMachine::validate_state(run.id, run.state, RunStateMachine::SCHEDULE_STATES)?;

        let job_id = self
            .ctx
            .scheduler
            .schedule_at(RUN_EXECUTE, json!({"run_id": run.id}), at)
            .await?;
        run.aps_job_id = Some(job_id.clone());
        run.times.schedule_time = Some(at);
        self.ctx.store.runs.save(&run).await?;
        if let Err(e) = self.ctx.set_run_state(&mut run, RunState::Scheduled).await {
            self.ctx.scheduler.remove(&job_id).await?;
            return Err(e);
        }

        for mut execution in self.ctx.store.plan_executions.find_by_run(run.id).await? {
            execution.times.schedule_time = Some(at);
            self.ctx.store.plan_executions.save(&execution).await?;
            self.ctx.set_plan_state(&mut execution, PlanState::Scheduled).await?;
        }
        info!(run_id = %run.id, job_id = %job_id, at = %at, "Run scheduled");
        Ok(())
    }

    pub async fn unschedule(&self, id: Uuid) -> Result<()> {
        let mut run = self.ctx.load_run(id).await?;
        RunStateMachine::validate_state(run.id, run.state, RunStateMachine::UNSCHEDULE_STATES)?;

        if let Some(job_id) = run.aps_job_id.take() {
            self.ctx.scheduler.remove(&job_id).await?;
        }
        run.times.schedule_time = None;
        self.ctx.store.runs.save(&run).await?;
        self.ctx.set_run_state(&mut run, RunState::Pending).await?;

        for mut execution in self.ctx.store.plan_executions.find_by_run(run.id).await? {
            execution.times.schedule_time = None;
            self.ctx.store.plan_executions.save(&execution).await?;
            self.ctx.set_plan_state(&mut execution, PlanState::Pending).await?;
        }
        info!(run_id = %run.id, "Run unscheduled");
        Ok(())
    }

    pub async fn reschedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.unschedule(id).await?;
        self.schedule(id, at).await
    }

    /// Moves a scheduled run's start later by `delta`.
    pub async fn postpone(&self, id: Uuid, delta: Duration) -> Result<()> {
        let run = self.ctx.load_run(id).await?;
        RunStateMachine::validate_state(run.id, run.state, RunStateMachine::UNSCHEDULE_STATES)?;
        let current = run.times.schedule_time.ok_or_else(|| {
            OrchestratorError::UnexpectedValue(format!("run {} has no schedule time", run.id))
        })?;
        self.reschedule(id, current + delta).await
    }

    /// Idempotent: pausing a PAUSING or PAUSED run does nothing.
    pub async fn pause(&self, id: Uuid) -> Result<()> {
        let mut run = self.ctx.load_run(id).await?;
        if matches!(run.state, RunState::Pausing | RunState::Paused) {
            return Ok(());
        }
        RunStateMachine::validate_state(run.id, run.state, RunStateMachine::PAUSE_STATES)?;

        self.ctx.set_run_state(&mut run, RunState::Pausing).await?;
        info!(run_id = %run.id, "Run pause requested");

        for execution in self.ctx.store.plan_executions.find_by_run(run.id).await? {
            if !PlanStateMachine::PAUSE_STATES.contains(&execution.state) {
                continue;
            }
            if let Err(e) = self.plans.pause(execution.id).await {
                warn!(plan_execution_id = %execution.id, error = %e, "Failed to pause plan execution");
            }
        }
        self.progress.check_run(run.id).await
    }

    pub async fn resume(&self, id: Uuid) -> Result<()> {
        let mut run = self.ctx.load_run(id).await?;
        RunStateMachine::validate_state(run.id, run.state, RunStateMachine::RESUME_STATES)?;

        run.times.pause_time = None;
        self.ctx.store.runs.save(&run).await?;
        self.ctx.set_run_state(&mut run, RunState::Running).await?;
        info!(run_id = %run.id, "Run resumed");

        for execution in self.ctx.store.plan_executions.find_by_run(run.id).await? {
            if execution.state != PlanState::Paused {
                continue;
            }
            if let Err(e) = self.plans.resume(execution.id).await {
                warn!(plan_execution_id = %execution.id, error = %e, "Failed to resume plan execution");
            }
        }
        self.progress.check_run(run.id).await
    }

    pub async fn kill(&self, id: Uuid) -> Result<()> {
        let mut run = self.ctx.load_run(id).await?;
        RunStateMachine::validate_state(run.id, run.state, RunStateMachine::KILL_STATES)?;
        self.ctx.set_run_state(&mut run, RunState::Terminating).await?;

        let executions: Vec<Uuid> = self
            .ctx
            .store
            .plan_executions
            .find_by_run(run.id)
            .await?
            .into_iter()
            .filter(|e| PlanStateMachine::KILL_STATES.contains(&e.state))
            .map(|e| e.id)
            .collect();
        let results =
            futures::future::join_all(executions.iter().map(|&execution_id| self.plans.kill(execution_id)))
                .await;
        for (execution_id, result) in executions.iter().zip(results) {
            if let Err(e) = result {
                warn!(plan_execution_id = %execution_id, error = %e, "Failed to kill plan execution");
            }
        }

        run.times.finish_time = Some(Utc::now());
        self.ctx.store.runs.save(&run).await?;
        self.ctx.set_run_state(&mut run, RunState::Terminated).await?;
        info!(run_id = %run.id, "Run killed");
        Ok(())
    }

    pub async fn report(&self, id: Uuid) -> Result<RunReport> {
        report::run_report(&self.ctx, id).await
    }

    /// Deletes a run that is not in progress, along with its executions.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let run = self.ctx.load_run(id).await?;
        RunStateMachine::validate_state(run.id, run.state, RunStateMachine::DELETE_STATES)?;
        if let Some(job_id) = &run.aps_job_id {
            self.ctx.scheduler.remove(job_id).await?;
        }
        self.ctx.store.runs.delete(run.id).await?;
        info!(run_id = %run.id, "Run deleted");
        Ok(())
    }
}
