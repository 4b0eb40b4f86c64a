//! Bounded queue of dispatch work and the pool draining it.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::progress::Progress;
use crate::stage::StageExecutor;
use crate::step::{DispatchOutcome, StepExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRequest {
    /// Dispatch a step execution; `parent_id` is the step whose completion caused it.
    Step {
        step_execution_id: Uuid,
        parent_id: Option<Uuid>,
    },
    /// Execute a stage whose dependencies may have cleared.
    Stage { stage_execution_id: Uuid },
}

#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchRequest>,
}

impl DispatchQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DispatchRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn submit(&self, request: DispatchRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| OrchestratorError::DispatchClosed)
    }

    pub async fn submit_step(&self, step_execution_id: Uuid, parent_id: Option<Uuid>) -> Result<()> {
        self.submit(DispatchRequest::Step {
            step_execution_id,
            parent_id,
        })
        .await
    }
}

/// Workers sharing one receiver; each handles one request at a time.
#[derive(Clone)]
pub struct DispatchPool {
    steps: StepExecutor,
    stages: StageExecutor,
    progress: Progress,
    workers: usize,
}

impl DispatchPool {
    pub fn new(steps: StepExecutor, stages: StageExecutor, progress: Progress, workers: usize) -> Self {
        Self {
            steps,
            stages,
            progress,
            workers: workers.max(1),
        }
    }

    pub async fn run(self, rx: mpsc::Receiver<DispatchRequest>, shutdown: watch::Receiver<bool>) {
        info!(workers = self.workers, "Dispatch pool started");
        let rx = Arc::new(Mutex::new(rx));

        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                let pool = self.clone();
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(rx, shutdown).await })
            })
            .collect();
        futures::future::join_all(handles).await;

        info!("Dispatch pool stopped");
    }

    async fn worker_loop(
        &self,
        rx: Arc<Mutex<mpsc::Receiver<DispatchRequest>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let request = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    request = rx.recv() => request,
                }
            };
            let Some(request) = request else {
                break;
            };
            self.handle(request).await;
        }
    }

    async fn handle(&self, request: DispatchRequest) {
        match request {
            DispatchRequest::Step {
                step_execution_id,
                parent_id,
            } => match self.steps.execute(step_execution_id, parent_id).await {
                Ok(DispatchOutcome::Failed) => {
                    let progress = self.progress.clone();
                    tokio::spawn(async move {
                        if let Err(e) = progress.on_step_finished(step_execution_id).await {
                            error!(step_execution_id = %step_execution_id, error = %e, "Failed to process step completion");
                        }
                    });
                }
                Ok(_) => {}
                Err(e @ OrchestratorError::InvalidState { .. }) => {
                    debug!(step_execution_id = %step_execution_id, error = %e, "Step was not dispatchable");
                }
                Err(e) => {
                    error!(step_execution_id = %step_execution_id, error = %e, "Step dispatch failed");
                }
            },
            DispatchRequest::Stage { stage_execution_id } => {
                let stages = self.stages.clone();
                tokio::spawn(async move {
                    if let Err(e) = stages.execute(stage_execution_id).await {
                        error!(stage_execution_id = %stage_execution_id, error = %e, "Stage execution failed");
                    }
                });
            }
        }
    }
}
