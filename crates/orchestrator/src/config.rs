use std::path::PathBuf;
use std::time::Duration;

use bus::{BusConfig, HiveQueues};
use chrono_tz::Tz;

/// Slack added to the message timeout to obtain the minimum misfire grace.
const MISFIRE_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bus: BusConfig,
    misfire_grace_time: Duration,
    /// How long a reply waits for its correlation event to become visible.
    pub correlation_window: Duration,
    pub correlation_tick: Duration,
    pub cpu_cores: usize,
    pub threads_per_process: usize,
    pub scheduler_pool_size: usize,
    pub scheduler_max_instances: usize,
    pub scheduler_poll_interval: Duration,
    pub command_queue_capacity: usize,
    pub evidence_root: PathBuf,
    pub default_timezone: Tz,
    /// Datetime triggers closer than this run immediately.
    pub inline_threshold: Duration,
    pub queues: HiveQueues,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let bus = BusConfig::default();
        let misfire_grace_time = bus.message_timeout + MISFIRE_SLACK;
        Self {
            bus,
            misfire_grace_time,
            correlation_window: Duration::from_secs(3),
            correlation_tick: Duration::from_millis(100),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            threads_per_process: 8,
            scheduler_pool_size: 10,
            scheduler_max_instances: 1,
            scheduler_poll_interval: Duration::from_millis(250),
            command_queue_capacity: 256,
            evidence_root: std::env::temp_dir().join("cryton").join("evidence"),
            default_timezone: Tz::UTC,
            inline_threshold: Duration::from_secs(1),
            queues: HiveQueues::default(),
        }
    }
}

impl EngineConfig {
    pub fn message_timeout(&self) -> Duration {
        self.bus.message_timeout
    }

    /// Never below `message_timeout + 60s`.
    pub fn misfire_grace_time(&self) -> Duration {
        self.misfire_grace_time
            .max(self.bus.message_timeout + MISFIRE_SLACK)
    }

    /// Number of dispatch workers.
    pub fn dispatch_workers(&self) -> usize {
        (self.cpu_cores * self.threads_per_process).max(1)
    }

    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.bus.message_timeout = timeout;
        self
    }

    pub fn with_misfire_grace_time(mut self, grace: Duration) -> Self {
        self.misfire_grace_time = grace;
        self
    }

    pub fn with_correlation_window(mut self, window: Duration, tick: Duration) -> Self {
        self.correlation_window = window;
        self.correlation_tick = tick;
        self
    }

    pub fn with_parallelism(mut self, cpu_cores: usize, threads_per_process: usize) -> Self {
        self.cpu_cores = cpu_cores;
        self.threads_per_process = threads_per_process;
        self
    }

    pub fn with_scheduler(
        mut self,
        pool_size: usize,
        max_instances: usize,
        poll_interval: Duration,
    ) -> Self {
        self.scheduler_pool_size = pool_size;
        self.scheduler_max_instances = max_instances;
        self.scheduler_poll_interval = poll_interval;
        self
    }

    pub fn with_evidence_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.evidence_root = root.into();
        self
    }

    pub fn with_default_timezone(mut self, tz: Tz) -> Self {
        self.default_timezone = tz;
        self
    }

    pub fn with_queues(mut self, queues: HiveQueues) -> Self {
        self.queues = queues;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misfire_grace_is_clamped() {
        let config = EngineConfig::default();
        assert_eq!(config.message_timeout(), Duration::from_secs(180));
        assert_eq!(config.misfire_grace_time(), Duration::from_secs(240));

        let config = EngineConfig::default().with_misfire_grace_time(Duration::from_secs(5));
        assert_eq!(config.misfire_grace_time(), Duration::from_secs(240));

        let config = EngineConfig::default().with_misfire_grace_time(Duration::from_secs(600));
        assert_eq!(config.misfire_grace_time(), Duration::from_secs(600));

        let config = EngineConfig::default().with_message_timeout(Duration::from_secs(10));
        assert_eq!(config.misfire_grace_time(), Duration::from_secs(240));
    }

    #[test]
    fn test_dispatch_workers() {
        let config = EngineConfig::default().with_parallelism(4, 8);
        assert_eq!(config.dispatch_workers(), 32);
        let config = EngineConfig::default().with_parallelism(0, 8);
        assert_eq!(config.dispatch_workers(), 1);
    }
}
