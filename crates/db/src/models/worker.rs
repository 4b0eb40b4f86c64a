use cryton_core::{Worker, WorkerState};

use super::{datetime_to_millis, millis_to_datetime, parse_id};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: String,
    pub created_at: i64,
}

impl WorkerRow {
    pub fn into_domain(self) -> Worker {
        Worker {
            id: parse_id(&self.id),
            name: self.name,
            description: self.description,
            state: WorkerState::parse(&self.state).unwrap_or_default(),
            created_at: millis_to_datetime(self.created_at),
        }
    }
}

impl From<&Worker> for WorkerRow {
    fn from(worker: &Worker) -> Self {
        Self {
            id: worker.id.to_string(),
            name: worker.name.clone(),
            description: worker.description.clone(),
            state: worker.state.as_str().to_string(),
            created_at: datetime_to_millis(worker.created_at),
        }
    }
}
