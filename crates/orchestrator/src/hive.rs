//! Engine root: wires the shared context and components together and owns
//! the background tasks.

use std::sync::Arc;

use bus::{Broker, BusClient};
use db::Store;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::context::HiveContext;
use crate::creator::Creator;
use crate::dispatch::{DispatchPool, DispatchQueue, DispatchRequest};
use crate::error::{OrchestratorError, Result};
use crate::event::{uuid_field, EventRouter};
use crate::listener::Listener;
use crate::plan::PlanExecutor;
use crate::progress::Progress;
use crate::run::RunCoordinator;
use crate::scheduler::{CallableRegistry, SchedulerHandle, SchedulerService, RUN_EXECUTE, STAGE_EXECUTE};
use crate::stage::StageExecutor;
use crate::step::StepExecutor;
use crate::worker::WorkerService;

/// Pieces consumed by [`Hive::start`].
struct Pending {
    scheduler: SchedulerService,
    dispatch_rx: mpsc::Receiver<DispatchRequest>,
}

pub struct Hive {
    ctx: Arc<HiveContext>,
    registry: CallableRegistry,
    progress: Progress,
    steps: StepExecutor,
    stages: StageExecutor,
    plans: PlanExecutor,
    runs: RunCoordinator,
    creator: Creator,
    workers: WorkerService,
    pending: Mutex<Option<Pending>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hive {
    pub fn new(store: Store, broker: Arc<dyn Broker>, config: EngineConfig) -> Self {
        let registry = CallableRegistry::new();
        let (scheduler, scheduler_service) =
            SchedulerHandle::channel(store.clone(), registry.clone(), &config);
        let (dispatch, dispatch_rx) = DispatchQueue::channel(config.command_queue_capacity);
        let bus = BusClient::new(broker, config.bus.clone());

        let ctx = Arc::new(HiveContext {
            store,
            bus,
            config,
            scheduler,
            dispatch,
        });
        let progress = Progress::new(Arc::clone(&ctx));
        let steps = StepExecutor::new(Arc::clone(&ctx), progress.clone());
        let stages = StageExecutor::new(Arc::clone(&ctx), steps.clone(), progress.clone());
        let plans = PlanExecutor::new(Arc::clone(&ctx), stages.clone(), progress.clone());
        let runs = RunCoordinator::new(Arc::clone(&ctx), plans.clone(), progress.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            creator: Creator::new(Arc::clone(&ctx)),
            workers: WorkerService::new(Arc::clone(&ctx)),
            ctx,
            registry,
            progress,
            steps,
            stages,
            plans,
            runs,
            pending: Mutex::new(Some(Pending {
                scheduler: scheduler_service,
                dispatch_rx,
            })),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers scheduler callables, declares the hive queues and spawns the
    /// scheduler, listener, dispatch pool and redelivery loop.
    pub async fn start(&self) -> Result<()> {
        let Some(pending) = self.pending.lock().await.take() else {
            return Err(OrchestratorError::UnexpectedValue(
                "hive is already started".to_string(),
            ));
        };

        let runs = self.runs.clone();
        self.registry
            .register(
                RUN_EXECUTE,
                Arc::new(move |args| {
                    let runs = runs.clone();
                    async move { runs.execute(uuid_field(&args, "run_id")?).await }.boxed()
                }),
            )
            .await;
        let stages = self.stages.clone();
        self.registry
            .register(
                STAGE_EXECUTE,
                Arc::new(move |args| {
                    let stages = stages.clone();
                    async move { stages.execute(uuid_field(&args, "stage_execution_id")?).await }
                        .boxed()
                }),
            )
            .await;

        for queue in self.ctx.config.queues.all() {
            self.ctx.bus.broker().declare_queue(queue).await?;
        }

        let listener = Listener::new(
            Arc::clone(&self.ctx),
            self.steps.clone(),
            self.progress.clone(),
            EventRouter::with_defaults(
                Arc::clone(&self.ctx),
                self.steps.clone(),
                self.stages.clone(),
                self.plans.clone(),
                self.progress.clone(),
            ),
        );
        let pool = DispatchPool::new(
            self.steps.clone(),
            self.stages.clone(),
            self.progress.clone(),
            self.ctx.config.dispatch_workers(),
        );
        let bus = self.ctx.bus.clone();

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(pending.scheduler.run(self.shutdown.subscribe())));
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(shutdown).await {
                error!(error = %e, "Listener failed");
            }
        }));
        tasks.push(tokio::spawn(pool.run(pending.dispatch_rx, self.shutdown.subscribe())));
        let shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move { bus.run_redelivery(shutdown).await }));

        info!(
            dispatch_workers = self.ctx.config.dispatch_workers(),
            "Hive started"
        );
        Ok(())
    }

    /// Signals every background task to stop and waits for them.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task panicked");
            }
        }
        info!("Hive stopped");
    }

    pub fn context(&self) -> &Arc<HiveContext> {
        &self.ctx
    }

    pub fn store(&self) -> &Store {
        &self.ctx.store
    }

    pub fn runs(&self) -> &RunCoordinator {
        &self.runs
    }

    pub fn plans(&self) -> &PlanExecutor {
        &self.plans
    }

    pub fn stages(&self) -> &StageExecutor {
        &self.stages
    }

    pub fn steps(&self) -> &StepExecutor {
        &self.steps
    }

    pub fn creator(&self) -> &Creator {
        &self.creator
    }

    pub fn workers(&self) -> &WorkerService {
        &self.workers
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }
}
