//! Consumers on the hive's response queues.
//!
//! Step replies are matched to their step execution through the stored
//! correlation event; everything on the event queue goes to the
//! [`EventRouter`].

use std::sync::Arc;

use bus::{Delivery, EventEnvelope, MessageProperties, Subscription, RETURN_CODE_ERROR, RETURN_CODE_OK};
use cryton_core::CorrelationEvent;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::context::HiveContext;
use crate::error::Result;
use crate::event::EventRouter;
use crate::progress::Progress;
use crate::step::StepExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueRole {
    Reply,
    Event,
}

#[derive(Clone)]
pub struct Listener {
    ctx: Arc<HiveContext>,
    steps: StepExecutor,
    progress: Progress,
    events: Arc<EventRouter>,
}

impl Listener {
    pub fn new(ctx: Arc<HiveContext>, steps: StepExecutor, progress: Progress, events: EventRouter) -> Self {
        Self {
            ctx,
            steps,
            progress,
            events: Arc::new(events),
        }
    }

    /// Subscribes to all hive queues and consumes until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let queues = self.ctx.config.queues.clone();
        let roles = [
            (queues.attack_response, QueueRole::Reply),
            (queues.agent_response, QueueRole::Reply),
            (queues.event_response, QueueRole::Event),
        ];

        let mut consumers = Vec::with_capacity(roles.len());
        for (queue, role) in roles {
            let subscription = self.ctx.bus.broker().consume(&queue).await?;
            info!(queue = %queue, "Listening");
            let listener = self.clone();
            let shutdown = shutdown.clone();
            consumers.push(tokio::spawn(async move {
                listener.consume(queue, role, subscription, shutdown).await
            }));
        }
        futures::future::join_all(consumers).await;

        info!("Listener stopped");
        Ok(())
    }

    async fn consume(
        self,
        queue: String,
        role: QueueRole,
        mut subscription: Box<dyn Subscription>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                delivery = subscription.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let listener = self.clone();
                        tokio::spawn(async move {
                            match role {
                                QueueRole::Reply => listener.handle_reply(delivery).await,
                                QueueRole::Event => listener.handle_event(delivery).await,
                            }
                        });
                    }
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "Consumer error");
                    }
                    None => {
                        warn!(queue = %queue, "Consumer cancelled");
                        break;
                    }
                },
            }
        }
    }

    /// Looks the correlation id up for a bounded window; a reply can arrive
    /// before the dispatching task has stored its correlation event.
    async fn wait_for_correlation(&self, correlation_id: &str) -> Result<Option<CorrelationEvent>> {
        let deadline = Instant::now() + self.ctx.config.correlation_window;
        loop {
            if let Some(event) = self.ctx.store.correlations.find(correlation_id).await? {
                return Ok(Some(event));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.ctx.config.correlation_tick).await;
        }
    }

    async fn handle_reply(&self, delivery: Delivery) {
        if let Err(e) = self.process_reply(&delivery).await {
            error!(
                correlation_id = ?delivery.correlation_id(),
                error = %e,
                "Failed to process step reply"
            );
        }
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to acknowledge reply");
        }
    }

    async fn process_reply(&self, delivery: &Delivery) -> Result<()> {
        let Some(correlation_id) = delivery.correlation_id() else {
            warn!("Reply without correlation id dropped");
            return Ok(());
        };

        let Some(correlation) = self.wait_for_correlation(correlation_id).await? else {
            warn!(correlation_id, "Orphan reply, no step execution awaits it");
            return Ok(());
        };
        if !self.ctx.store.correlations.delete(correlation_id).await? {
            debug!(correlation_id, "Duplicate reply dropped");
            return Ok(());
        }

        let step = self
            .steps
            .postprocess(correlation.step_execution_id, &delivery.message.body)
            .await?;
        self.progress.on_step_finished(step.id).await
    }

    async fn handle_event(&self, delivery: Delivery) {
        let return_code = match delivery.json::<EventEnvelope>() {
            Ok(envelope) => match self.events.handle(&envelope).await {
                Ok(_) => RETURN_CODE_OK,
                Err(e) => {
                    error!(event = %envelope.event_t, error = %e, "Event handler failed");
                    RETURN_CODE_ERROR
                }
            },
            Err(e) => {
                warn!(error = %e, "Malformed worker event dropped");
                RETURN_CODE_ERROR
            }
        };

        if let Some(reply_to) = delivery.reply_to() {
            let event_t = delivery
                .json::<EventEnvelope>()
                .map(|e| e.event_t)
                .unwrap_or_default();
            let mut properties = MessageProperties::json();
            if let Some(correlation_id) = delivery.correlation_id() {
                properties = properties.with_correlation_id(correlation_id);
            }
            let answer = json!({"event_t": event_t, "event_v": {"return_code": return_code}});
            if let Err(e) = self.ctx.bus.publish(reply_to, &answer, properties).await {
                warn!(reply_to, error = %e, "Failed to answer worker event");
            }
        }

        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to acknowledge event");
        }
    }
}
