use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{datetime_to_millis, millis_to_datetime};

/// A persisted scheduler job. `callable` names a function registered with the
/// scheduler so the job can be resolved again after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerJob {
    pub id: String,
    pub callable: String,
    pub args: Value,
    pub next_run_at: DateTime<Utc>,
    pub interval_ms: Option<i64>,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
}

impl SchedulerJob {
    pub fn once(
        id: impl Into<String>,
        callable: impl Into<String>,
        args: Value,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            callable: callable.into(),
            args,
            next_run_at: at,
            interval_ms: None,
            paused: false,
            created_at: Utc::now(),
        }
    }

    pub fn every(
        id: impl Into<String>,
        callable: impl Into<String>,
        args: Value,
        interval: std::time::Duration,
    ) -> Self {
        let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
        let now = Utc::now();
        Self {
            id: id.into(),
            callable: callable.into(),
            args,
            next_run_at: now + chrono::Duration::milliseconds(interval_ms),
            interval_ms: Some(interval_ms),
            paused: false,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SchedulerJobRow {
    pub id: String,
    pub callable: String,
    pub args: String,
    pub next_run_at: i64,
    pub interval_ms: Option<i64>,
    pub paused: bool,
    pub created_at: i64,
}

impl SchedulerJobRow {
    pub fn into_domain(self) -> SchedulerJob {
        SchedulerJob {
            id: self.id,
            callable: self.callable,
            args: serde_json::from_str(&self.args).unwrap_or(Value::Null),
            next_run_at: millis_to_datetime(self.next_run_at),
            interval_ms: self.interval_ms,
            paused: self.paused,
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

impl From<&SchedulerJob> for SchedulerJobRow {
    fn from(job: &SchedulerJob) -> Self {
        Self {
            id: job.id.clone(),
            callable: job.callable.clone(),
            args: job.args.to_string(),
            next_run_at: datetime_to_millis(job.next_run_at),
            interval_ms: job.interval_ms,
            paused: job.paused,
            created_at: datetime_to_millis(job.created_at),
        }
    }
}
