//! Persistent job scheduler.
//!
//! Jobs live in the `scheduler_jobs` table and refer to their work by the name
//! of a callable registered in a [`CallableRegistry`], so pending jobs resolve
//! again after a restart. Commands reach the service through a bounded queue.

mod registry;
mod service;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use db::SchedulerJob;

use crate::error::{OrchestratorError, Result};

pub use registry::{CallableRegistry, JobCallable, JobFuture};
pub use service::SchedulerService;

/// Callable executing a run.
pub const RUN_EXECUTE: &str = "run.execute";
/// Callable executing a stage execution.
pub const STAGE_EXECUTE: &str = "stage_execution.execute";

#[derive(Debug)]
pub(crate) enum SchedulerCommand {
    Add {
        job: SchedulerJob,
        reply: oneshot::Sender<Result<String>>,
    },
    Remove {
        job_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Pause {
        job_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Resume {
        job_id: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    PauseAll {
        reply: oneshot::Sender<Result<u64>>,
    },
    ResumeAll {
        reply: oneshot::Sender<Result<u64>>,
    },
}

/// Cheap handle for submitting scheduler commands.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Creates the handle and the service that processes its commands.
    pub fn channel(
        store: db::Store,
        registry: CallableRegistry,
        config: &crate::config::EngineConfig,
    ) -> (Self, SchedulerService) {
        let (tx, rx) = mpsc::channel(config.command_queue_capacity.max(1));
        (Self { tx }, SchedulerService::new(store, registry, config, rx))
    }

    async fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> SchedulerCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| OrchestratorError::Scheduler("scheduler is not running".to_string()))?;
        rx.await
            .map_err(|_| OrchestratorError::Scheduler("scheduler dropped the command".to_string()))?
    }

    /// One-shot job firing at `when`. Returns the job id.
    pub async fn schedule_at(
        &self,
        callable: &str,
        args: Value,
        when: DateTime<Utc>,
    ) -> Result<String> {
        let job = SchedulerJob::once(uuid::Uuid::new_v4().to_string(), callable, args, when);
        self.submit(|reply| SchedulerCommand::Add { job, reply }).await
    }

    /// Recurring job, first firing one `interval` from now.
    pub async fn schedule_every(
        &self,
        callable: &str,
        args: Value,
        interval: Duration,
    ) -> Result<String> {
        if interval.is_zero() {
            return Err(OrchestratorError::Scheduler(
                "interval must be positive".to_string(),
            ));
        }
        let job = SchedulerJob::every(uuid::Uuid::new_v4().to_string(), callable, args, interval);
        self.submit(|reply| SchedulerCommand::Add { job, reply }).await
    }

    pub async fn remove(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.submit(|reply| SchedulerCommand::Remove { job_id, reply })
            .await
    }

    pub async fn pause(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.submit(|reply| SchedulerCommand::Pause { job_id, reply })
            .await
    }

    /// Resumes a paused job. A job whose fire time passed while paused fires
    /// on the next poll.
    pub async fn resume(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.submit(|reply| SchedulerCommand::Resume { job_id, reply })
            .await
    }

    pub async fn pause_all(&self) -> Result<u64> {
        self.submit(|reply| SchedulerCommand::PauseAll { reply }).await
    }

    pub async fn resume_all(&self) -> Result<u64> {
        self.submit(|reply| SchedulerCommand::ResumeAll { reply }).await
    }
}
