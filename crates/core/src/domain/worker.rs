use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Up,
    Down,
    #[default]
    Unknown,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UP" => Some(Self::Up),
            "DOWN" => Some(Self::Down),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// A remote process executing attack modules, addressed by its name on the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub state: WorkerState,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            state: WorkerState::default(),
            created_at: Utc::now(),
        }
    }
}
