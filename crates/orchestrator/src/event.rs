//! Handlers for events workers publish on the hive's event queue.

use std::collections::HashMap;
use std::sync::Arc;

use bus::EventEnvelope;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::HiveContext;
use crate::error::{OrchestratorError, Result};
use crate::plan::PlanExecutor;
use crate::progress::Progress;
use crate::stage::StageExecutor;
use crate::step::StepExecutor;

pub const TRIGGER_STAGE: &str = "trigger_stage";
pub const STEP_EXECUTION_ERROR: &str = "step_execution_error";
pub const PAUSE: &str = "pause";

pub type EventFuture = BoxFuture<'static, Result<()>>;
pub type EventHandler = Arc<dyn Fn(Value) -> EventFuture + Send + Sync>;

/// Routes `event_t` to a registered handler. Names match case-insensitively.
#[derive(Clone, Default)]
pub struct EventRouter {
    handlers: HashMap<String, EventHandler>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_t: &str, handler: EventHandler) {
        self.handlers.insert(event_t.to_lowercase(), handler);
    }

    pub fn contains(&self, event_t: &str) -> bool {
        self.handlers.contains_key(&event_t.to_lowercase())
    }

    /// Runs the handler for `envelope`. Returns false for unknown events.
    pub async fn handle(&self, envelope: &EventEnvelope) -> Result<bool> {
        let Some(handler) = self.handlers.get(&envelope.event_t.to_lowercase()) else {
            warn!(event = %envelope.event_t, "Unknown worker event");
            return Ok(false);
        };
        handler(envelope.event_v.clone()).await?;
        Ok(true)
    }

    /// Router with the hive's built-in handlers.
    pub fn with_defaults(
        ctx: Arc<HiveContext>,
        steps: StepExecutor,
        stages: StageExecutor,
        plans: PlanExecutor,
        progress: Progress,
    ) -> Self {
        let mut router = Self::new();

        let trigger_ctx = Arc::clone(&ctx);
        router.register(
            TRIGGER_STAGE,
            Arc::new(move |event_v| {
                let ctx = Arc::clone(&trigger_ctx);
                let stages = stages.clone();
                async move { trigger_stage(&ctx, &stages, &event_v).await }.boxed()
            }),
        );

        router.register(
            STEP_EXECUTION_ERROR,
            Arc::new(move |event_v| {
                let ctx = Arc::clone(&ctx);
                let steps = steps.clone();
                let progress = progress.clone();
                async move { step_execution_error(&ctx, &steps, &progress, &event_v).await }.boxed()
            }),
        );

        router.register(
            PAUSE,
            Arc::new(move |event_v| {
                let plans = plans.clone();
                async move {
                    let id = uuid_field(&event_v, "plan_execution_id")?;
                    plans.pause(id).await
                }
                .boxed()
            }),
        );

        router
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("EventRouter").field("events", &names).finish()
    }
}

pub(crate) fn uuid_field(event_v: &Value, key: &str) -> Result<Uuid> {
    event_v
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| OrchestratorError::UnexpectedValue(format!("missing or invalid '{key}'")))
}

async fn trigger_stage(ctx: &HiveContext, stages: &StageExecutor, event_v: &Value) -> Result<()> {
    let trigger_id = event_v
        .get("trigger_id")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| OrchestratorError::UnexpectedValue("event is missing 'trigger_id'".to_string()))?;

    let Some(stage) = ctx
        .store
        .stage_executions
        .find_by_trigger_id(&trigger_id)
        .await?
    else {
        warn!(trigger_id = %trigger_id, "Trigger event for unknown trigger");
        return Ok(());
    };
    info!(stage_execution_id = %stage.id, trigger_id = %trigger_id, "Trigger fired");
    stages.on_trigger_fired(stage.id).await
}

async fn step_execution_error(
    ctx: &HiveContext,
    steps: &StepExecutor,
    progress: &Progress,
    event_v: &Value,
) -> Result<()> {
    let correlation_id = event_v
        .get("correlation_id")
        .and_then(Value::as_str)
        .ok_or_else(|| OrchestratorError::UnexpectedValue("event is missing 'correlation_id'".to_string()))?;

    let Some(correlation) = ctx.store.correlations.find(correlation_id).await? else {
        warn!(correlation_id, "Step error for unknown correlation id");
        return Ok(());
    };
    if !ctx.store.correlations.delete(correlation_id).await? {
        return Ok(());
    }

    let output = event_v
        .get("output")
        .and_then(Value::as_str)
        .unwrap_or("worker reported an execution error");
    let step = steps.fail_running(correlation.step_execution_id, output).await?;
    warn!(step_execution_id = %step.id, step = %step.step_name, output, "Worker reported step error");
    progress.on_step_finished(step.id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_routing_is_case_insensitive() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = EventRouter::new();
        let counter = Arc::clone(&hits);
        router.register(
            "trigger_stage",
            Arc::new(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
        );

        let handled = router
            .handle(&EventEnvelope::new("TRIGGER_STAGE", json!({})))
            .await
            .unwrap();
        assert!(handled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_is_not_an_error() {
        let router = EventRouter::new();
        let handled = router
            .handle(&EventEnvelope::new("solar_flare", json!({})))
            .await
            .unwrap();
        assert!(!handled);
    }

    #[test]
    fn test_uuid_field() {
        let id = Uuid::new_v4();
        assert_eq!(
            uuid_field(&json!({"plan_execution_id": id.to_string()}), "plan_execution_id").unwrap(),
            id
        );
        assert!(uuid_field(&json!({"plan_execution_id": 5}), "plan_execution_id").is_err());
    }
}
