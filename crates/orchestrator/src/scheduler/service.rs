use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::{SchedulerJob, Store};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::registry::CallableRegistry;
use super::SchedulerCommand;
use crate::config::EngineConfig;
use crate::error::{OrchestratorError, Result};

const DUE_BATCH: i64 = 100;

/// Background task owning the job store: applies queued commands and fires
/// due jobs on a bounded pool.
pub struct SchedulerService {
    store: Store,
    registry: CallableRegistry,
    commands: mpsc::Receiver<SchedulerCommand>,
    poll_interval: Duration,
    misfire_grace: chrono::Duration,
    max_instances: usize,
    pool: Arc<Semaphore>,
    running: HashMap<String, Arc<AtomicUsize>>,
}

impl SchedulerService {
    pub(crate) fn new(
        store: Store,
        registry: CallableRegistry,
        config: &EngineConfig,
        commands: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        let misfire_grace = chrono::Duration::from_std(config.misfire_grace_time())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            store,
            registry,
            commands,
            poll_interval: config.scheduler_poll_interval,
            misfire_grace,
            max_instances: config.scheduler_max_instances.max(1),
            pool: Arc::new(Semaphore::new(config.scheduler_pool_size.max(1))),
            running: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            misfire_grace_secs = self.misfire_grace.num_seconds(),
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

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
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_and_fire().await {
                        error!(error = %e, "Scheduler poll failed");
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Add { job, reply } => {
                let _ = reply.send(self.add(job).await);
            }
            SchedulerCommand::Remove { job_id, reply } => {
                let result = self.store.jobs.delete(&job_id).await.map_err(Into::into);
                debug!(job_id = %job_id, "Removed job");
                let _ = reply.send(result);
            }
            SchedulerCommand::Pause { job_id, reply } => {
                let result = self.store.jobs.set_paused(&job_id, true).await.map_err(Into::into);
                debug!(job_id = %job_id, "Paused job");
                let _ = reply.send(result);
            }
            SchedulerCommand::Resume { job_id, reply } => {
                let _ = reply.send(self.resume(&job_id).await);
            }
            SchedulerCommand::PauseAll { reply } => {
                let result = self.store.jobs.set_all_paused(true).await.map_err(Into::into);
                let _ = reply.send(result);
            }
            SchedulerCommand::ResumeAll { reply } => {
                let _ = reply.send(self.resume_all().await);
            }
        }
    }

    async fn add(&self, job: SchedulerJob) -> Result<String> {
        if !self.registry.contains(&job.callable).await {
            return Err(OrchestratorError::Scheduler(format!(
                "unknown callable '{}'",
                job.callable
            )));
        }
        self.store.jobs.upsert(&job).await?;
        info!(
            job_id = %job.id,
            callable = %job.callable,
            next_run_at = %job.next_run_at,
            "Scheduled job"
        );
        Ok(job.id)
    }

    async fn resume(&self, job_id: &str) -> Result<bool> {
        let Some(job) = self.store.jobs.find_by_id(job_id).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        if job.next_run_at < now {
            self.store.jobs.reschedule(job_id, now).await?;
        }
        debug!(job_id, "Resumed job");
        Ok(self.store.jobs.set_paused(job_id, false).await?)
    }

    async fn resume_all(&self) -> Result<u64> {
        let now = Utc::now();
        let mut resumed = 0;
        for job in self.store.jobs.find_all().await? {
            if !job.paused {
                continue;
            }
            if job.next_run_at < now {
                self.store.jobs.reschedule(&job.id, now).await?;
            }
            if self.store.jobs.set_paused(&job.id, false).await? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    async fn poll_and_fire(&mut self) -> Result<()> {
        self.running.retain(|_, count| count.load(Ordering::SeqCst) > 0);

        let now = Utc::now();
        let due = self.store.jobs.find_due(now, DUE_BATCH).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "Found due jobs");

        for job in due {
            let job_id = job.id.clone();
            if let Err(e) = self.fire(job, now).await {
                error!(job_id = %job_id, error = %e, "Failed to fire job");
            }
        }
        Ok(())
    }

    async fn fire(&mut self, job: SchedulerJob, now: DateTime<Utc>) -> Result<()> {
        let lateness = now - job.next_run_at;
        if lateness > self.misfire_grace {
            warn!(
                job_id = %job.id,
                lateness_secs = lateness.num_seconds(),
                "Job missed its fire time by more than the grace period, skipping"
            );
            self.advance(&job, now).await?;
            return Ok(());
        }

        let Some(callable) = self.registry.get(&job.callable).await else {
            error!(job_id = %job.id, callable = %job.callable, "Job refers to an unknown callable");
            self.advance(&job, now).await?;
            return Ok(());
        };

        let instances = Arc::clone(self.running.entry(job.id.clone()).or_default());
        if instances.load(Ordering::SeqCst) >= self.max_instances {
            warn!(
                job_id = %job.id,
                max_instances = self.max_instances,
                "Job is still running, skipping this fire"
            );
            self.advance(&job, now).await?;
            return Ok(());
        }

        let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
            debug!(job_id = %job.id, "Scheduler pool is saturated, deferring job");
            return Ok(());
        };

        if !self.advance(&job, now).await? {
            return Ok(());
        }

        info!(job_id = %job.id, callable = %job.callable, "Firing job");
        instances.fetch_add(1, Ordering::SeqCst);
        let job_id = job.id;
        tokio::spawn(async move {
            if let Err(e) = callable(job.args).await {
                error!(job_id = %job_id, error = %e, "Scheduled job failed");
            }
            instances.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
        Ok(())
    }

    /// Deletes a one-shot job or moves an interval job past `now`.
    /// Returns false when the job no longer exists.
    async fn advance(&self, job: &SchedulerJob, now: DateTime<Utc>) -> Result<bool> {
        match job.interval_ms {
            None => Ok(self.store.jobs.delete(&job.id).await?),
            Some(interval_ms) => {
                let interval = chrono::Duration::milliseconds(interval_ms.max(1));
                let mut next = job.next_run_at + interval;
                while next <= now {
                    next += interval;
                }
                Ok(self.store.jobs.reschedule(&job.id, next).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CallableRegistry, SchedulerHandle};
    use super::*;
    use crate::test_support::setup_store;
    use futures::FutureExt;
    use serde_json::json;

    fn config() -> EngineConfig {
        EngineConfig::default().with_scheduler(2, 1, Duration::from_millis(20))
    }

    fn counting_callable(counter: Arc<AtomicUsize>) -> super::super::JobCallable {
        Arc::new(move |_args| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    async fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_one_shot_job_fires_once() {
        let (_dir, store) = setup_store().await;
        let registry = CallableRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        registry.register("count", counting_callable(Arc::clone(&fired))).await;

        let (handle, service) = SchedulerHandle::channel(store.clone(), registry, &config());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(service.run(shutdown_rx));

        let job_id = handle
            .schedule_at("count", json!({}), Utc::now())
            .await
            .unwrap();
        wait_for(&fired, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.jobs.find_by_id(&job_id).await.unwrap().is_none());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_callable_is_rejected() {
        let (_dir, store) = setup_store().await;
        let (handle, service) = SchedulerHandle::channel(store, CallableRegistry::new(), &config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(service.run(shutdown_rx));

        let err = handle
            .schedule_at("missing", json!({}), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Scheduler(_)));
    }

    #[tokio::test]
    async fn test_paused_job_does_not_fire_until_resumed() {
        let (_dir, store) = setup_store().await;
        let registry = CallableRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        registry.register("count", counting_callable(Arc::clone(&fired))).await;

        let (handle, service) = SchedulerHandle::channel(store.clone(), registry, &config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(service.run(shutdown_rx));

        let at = Utc::now() + chrono::Duration::milliseconds(100);
        let job_id = handle.schedule_at("count", json!({}), at).await.unwrap();
        assert!(handle.pause(&job_id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert!(handle.resume(&job_id).await.unwrap());
        wait_for(&fired, 1).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_all_holds_every_job() {
        let (_dir, store) = setup_store().await;
        let registry = CallableRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        registry.register("count", counting_callable(Arc::clone(&fired))).await;

        let (handle, service) = SchedulerHandle::channel(store.clone(), registry, &config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(service.run(shutdown_rx));

        let at = Utc::now() + chrono::Duration::milliseconds(100);
        let first = handle.schedule_at("count", json!({}), at).await.unwrap();
        let second = handle.schedule_at("count", json!({}), at).await.unwrap();
        assert!(handle.pause(&first).await.unwrap());
        // Only the job that was still active changes.
        assert_eq!(handle.pause_all().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(store.jobs.find_by_id(&second).await.unwrap().unwrap().paused);

        // Both fire times have passed; they fire on the next poll.
        assert_eq!(handle.resume_all().await.unwrap(), 2);
        wait_for(&fired, 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(handle.resume_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_misfired_job_is_skipped() {
        let (_dir, store) = setup_store().await;
        let registry = CallableRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        registry.register("count", counting_callable(Arc::clone(&fired))).await;

        // Written while the engine was down, far beyond the grace period.
        let stale = SchedulerJob::once(
            "stale",
            "count",
            json!({}),
            Utc::now() - chrono::Duration::hours(2),
        );
        store.jobs.upsert(&stale).await.unwrap();

        let (_handle, service) = SchedulerHandle::channel(store.clone(), registry, &config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(service.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(store.jobs.find_by_id("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_within_grace_survives_restart() {
        let (_dir, store) = setup_store().await;
        let late = SchedulerJob::once(
            "late",
            "count",
            json!({}),
            Utc::now() - chrono::Duration::seconds(30),
        );
        store.jobs.upsert(&late).await.unwrap();

        let registry = CallableRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        registry.register("count", counting_callable(Arc::clone(&fired))).await;
        let (_handle, service) = SchedulerHandle::channel(store, registry, &config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(service.run(shutdown_rx));

        wait_for(&fired, 1).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interval_job_respects_max_instances() {
        let (_dir, store) = setup_store().await;
        let registry = CallableRegistry::new();
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        registry
            .register(
                "slow",
                Arc::new(move |_args| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(())
                    }
                    .boxed()
                }),
            )
            .await;

        let (handle, service) = SchedulerHandle::channel(store.clone(), registry, &config());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(service.run(shutdown_rx));

        let job_id = handle
            .schedule_every("slow", json!({}), Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The first instance is still sleeping, later fires were skipped.
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(store.jobs.find_by_id(&job_id).await.unwrap().is_some());
        assert!(handle.remove(&job_id).await.unwrap());
    }
}
