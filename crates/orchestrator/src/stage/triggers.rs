use bus::EventEnvelope;
use chrono::{DateTime, Duration, Utc};
use cryton_core::{
    DeltaArgs, EntityKind, PlanExecution, StageExecution, StageState, StageTemplate, TriggerSpec,
};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::executor::StageExecutor;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::STAGE_EXECUTE;
use crate::state_machine::{StageStateMachine, StateMachine};

/// Fire time of a delta trigger. Time the plan execution spent paused does
/// not count towards the delta.
pub fn delta_fire_time(execution: &PlanExecution, delta: &DeltaArgs) -> DateTime<Utc> {
    let start = execution.times.start_time.unwrap_or_else(Utc::now);
    start + Duration::milliseconds(execution.paused_ms) + delta.duration()
}

/// `add_trigger` body for a worker-hosted trigger.
pub fn worker_trigger_arguments(
    template: &StageTemplate,
    stage_execution_id: Uuid,
    reply_to: &str,
) -> Value {
    let mut arguments = match &template.trigger_args {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    arguments.insert(
        "trigger_type".to_string(),
        json!(template.trigger_type.as_str()),
    );
    arguments.insert("reply_to".to_string(), json!(reply_to));
    arguments.insert(
        "stage_execution_id".to_string(),
        json!(stage_execution_id.to_string()),
    );
    Value::Object(arguments)
}

fn trigger_id_of(reply: &EventEnvelope) -> Option<String> {
    match reply.event_v.get("trigger_id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl StageExecutor {
    /// Arms the stage's trigger: scheduler job for delta and datetime,
    /// worker listener for HTTP and MSF.
    pub async fn start_trigger(&self, id: Uuid) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, StageStateMachine::TRIGGER_START_STATES)?;
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
        let plan = self.ctx.load_plan(execution.plan_id).await?;
        let template = self.ctx.stage_template(&plan, &stage)?;

        match TriggerSpec::parse(&template.name, template.trigger_type, &template.trigger_args)? {
            TriggerSpec::Delta(delta) => {
                let at = delta_fire_time(&execution, &delta);
                self.schedule_job(&mut stage, at).await
            }
            TriggerSpec::Datetime(datetime) => {
                let now = Utc::now();
                let at = datetime
                    .resolve(now, self.ctx.config.default_timezone)
                    .map_err(OrchestratorError::UnexpectedValue)?;
                let threshold = Duration::from_std(self.ctx.config.inline_threshold)
                    .unwrap_or_else(|_| Duration::seconds(1));
                if at - now <= threshold {
                    info!(stage_execution_id = %stage.id, "Datetime trigger is due, executing inline");
                    self.execute(stage.id).await
                } else {
                    self.schedule_job(&mut stage, at).await
                }
            }
            TriggerSpec::HttpListener(_) | TriggerSpec::MsfListener(_) => {
                let template = template.clone();
                self.arm_worker_trigger(&mut stage, &execution, &template).await
            }
        }
    }

    async fn arm_worker_trigger(
        &self,
        stage: &mut StageExecution,
        execution: &PlanExecution,
        template: &StageTemplate,
    ) -> Result<()> {
        self.ctx.set_stage_state(stage, StageState::Starting).await?;
        let worker = self.worker_for(execution).await?;
        let arguments = worker_trigger_arguments(
            template,
            stage.id,
            &self.ctx.config.queues.event_response,
        );

        let armed = match worker.add_trigger(arguments).await {
            Ok(reply) if reply.is_ok() => trigger_id_of(&reply).ok_or_else(|| {
                OrchestratorError::UnexpectedValue("worker returned no trigger id".to_string())
            }),
            Ok(reply) => Err(OrchestratorError::UnexpectedValue(format!(
                "worker refused trigger: {}",
                reply.value_str("output").unwrap_or_default()
            ))),
            Err(e) => Err(e),
        };

        match armed {
            Ok(trigger_id) => {
                info!(
                    stage_execution_id = %stage.id,
                    trigger_type = template.trigger_type.as_str(),
                    trigger_id = %trigger_id,
                    "Worker trigger armed"
                );
                stage.trigger_id = Some(trigger_id);
                self.ctx.store.stage_executions.save(stage).await?;
                self.ctx.set_stage_state(stage, StageState::Awaiting).await?;
                Ok(())
            }
            Err(e) => {
                warn!(stage_execution_id = %stage.id, error = %e, "Failed to arm worker trigger");
                stage.times.finish_time = Some(Utc::now());
                self.ctx.store.stage_executions.save(stage).await?;
                self.ctx.set_stage_state(stage, StageState::Error).await?;
                Err(e)
            }
        }
    }

    /// Schedules a PENDING delta or datetime stage to execute at `at`.
    pub async fn schedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, &[StageState::Pending])?;
        self.ensure_schedulable(&stage).await?;
        self.schedule_job(&mut stage, at).await
    }

    async fn schedule_job(&self, stage: &mut StageExecution, at: DateTime<Utc>) -> Result<()> {
        let job_id = self
            .ctx
            .scheduler
            .schedule_at(
                STAGE_EXECUTE,
                json!({"stage_execution_id": stage.id}),
                at,
            )
            .await?;
        stage.aps_job_id = Some(job_id.clone());
        stage.times.schedule_time = Some(at);
        self.ctx.store.stage_executions.save(stage).await?;

        if let Err(e) = self.ctx.set_stage_state(stage, StageState::Scheduled).await {
            self.ctx.scheduler.remove(&job_id).await?;
            return Err(e);
        }
        info!(stage_execution_id = %stage.id, job_id = %job_id, at = %at, "Stage execution scheduled");
        Ok(())
    }

    pub async fn unschedule(&self, id: Uuid) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, &[StageState::Scheduled])?;
        self.ensure_schedulable(&stage).await?;

        if let Some(job_id) = stage.aps_job_id.take() {
            self.ctx.scheduler.remove(&job_id).await?;
        }
        stage.times.schedule_time = None;
        self.ctx.store.stage_executions.save(&stage).await?;
        self.ctx.set_stage_state(&mut stage, StageState::Pending).await?;
        info!(stage_execution_id = %stage.id, "Stage execution unscheduled");
        Ok(())
    }

    pub async fn reschedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, &[StageState::Scheduled])?;
        self.ensure_schedulable(&stage).await?;
        self.replace_job(&mut stage, at).await?;
        info!(stage_execution_id = %stage.id, at = %at, "Stage execution rescheduled");
        Ok(())
    }

    /// Swaps the stage's job for one firing at `at`, leaving the state as is.
    pub(super) async fn replace_job(&self, stage: &mut StageExecution, at: DateTime<Utc>) -> Result<()> {
        if let Some(job_id) = stage.aps_job_id.take() {
            self.ctx.scheduler.remove(&job_id).await?;
        }
        let job_id = self
            .ctx
            .scheduler
            .schedule_at(
                STAGE_EXECUTE,
                json!({"stage_execution_id": stage.id}),
                at,
            )
            .await?;
        stage.aps_job_id = Some(job_id);
        stage.times.schedule_time = Some(at);
        self.ctx.store.stage_executions.save(stage).await?;
        Ok(())
    }

    /// Disarms a SCHEDULED or AWAITING stage and returns it to PENDING.
    pub async fn stop_trigger(&self, id: Uuid) -> Result<()> {
        let mut stage = self.ctx.load_stage(id).await?;
        StageStateMachine::validate_state(stage.id, stage.state, StageStateMachine::TRIGGER_STOP_STATES)?;
        self.disarm(&mut stage).await?;
        stage.times.schedule_time = None;
        self.ctx.store.stage_executions.save(&stage).await?;
        self.ctx.set_stage_state(&mut stage, StageState::Pending).await?;
        Ok(())
    }

    /// Removes the stage's scheduler job and worker listener, if any. Worker
    /// failures are logged, the trigger id is dropped either way.
    pub(super) async fn disarm(&self, stage: &mut StageExecution) -> Result<()> {
        if let Some(job_id) = stage.aps_job_id.take() {
            self.ctx.scheduler.remove(&job_id).await?;
        }
        if let Some(trigger_id) = stage.trigger_id.take() {
            let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
            let worker = self.worker_for(&execution).await?;
            match worker.remove_trigger(&trigger_id).await {
                Ok(reply) if reply.is_ok() => {
                    info!(stage_execution_id = %stage.id, trigger_id = %trigger_id, "Worker trigger removed");
                }
                Ok(reply) => warn!(
                    stage_execution_id = %stage.id,
                    trigger_id = %trigger_id,
                    return_code = ?reply.return_code(),
                    "Worker refused to remove trigger"
                ),
                Err(e) => warn!(
                    stage_execution_id = %stage.id,
                    trigger_id = %trigger_id,
                    error = %e,
                    "Failed to remove worker trigger"
                ),
            }
        }
        self.ctx.store.stage_executions.save(stage).await?;
        Ok(())
    }

    async fn ensure_schedulable(&self, stage: &StageExecution) -> Result<()> {
        let execution = self.ctx.load_plan_execution(stage.plan_execution_id).await?;
        let plan = self.ctx.load_plan(execution.plan_id).await?;
        let template = self.ctx.stage_template(&plan, stage)?;
        if template.trigger_type.is_worker_hosted() {
            return Err(OrchestratorError::UnexpectedValue(format!(
                "{} {} uses a {} trigger and cannot be scheduled",
                EntityKind::StageExecution,
                stage.id,
                template.trigger_type.as_str()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn template(trigger_args: Value) -> StageTemplate {
        serde_json::from_value(json!({
            "name": "listen",
            "trigger_type": "HTTPListener",
            "trigger_args": trigger_args,
            "steps": []
        }))
        .unwrap()
    }

    #[test]
    fn test_delta_skips_paused_time() {
        let mut execution = PlanExecution::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        execution.times.start_time = Some(start);
        execution.paused_ms = 30_000;

        let delta = DeltaArgs {
            minutes: 1,
            ..Default::default()
        };
        assert_eq!(
            delta_fire_time(&execution, &delta),
            start + Duration::seconds(90)
        );
    }

    #[test]
    fn test_worker_trigger_arguments() {
        let id = Uuid::new_v4();
        let stage = template(json!({
            "host": "0.0.0.0",
            "port": 8082,
            "routes": [{"path": "/t", "method": "GET", "parameters": [{"name": "k", "value": "v"}]}]
        }));
        let args = worker_trigger_arguments(&stage, id, "cryton_hive.event.response");

        assert_eq!(args["trigger_type"], "HTTPListener");
        assert_eq!(args["reply_to"], "cryton_hive.event.response");
        assert_eq!(args["stage_execution_id"], id.to_string());
        assert_eq!(args["port"], 8082);
        assert_eq!(args["routes"][0]["parameters"][0]["name"], "k");
    }

    #[test]
    fn test_trigger_id_accepts_numbers() {
        let reply = EventEnvelope::new("add_trigger", json!({"return_code": 0, "trigger_id": 7}));
        assert_eq!(trigger_id_of(&reply).as_deref(), Some("7"));

        let empty = EventEnvelope::new("add_trigger", json!({"return_code": 0, "trigger_id": ""}));
        assert!(trigger_id_of(&empty).is_none());
    }
}
