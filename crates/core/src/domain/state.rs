use serde::{Deserialize, Serialize};

/// Lifecycle state of a Run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Pending,
    Scheduled,
    Running,
    Pausing,
    Paused,
    Terminating,
    Terminated,
    Finished,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Finished => "FINISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SCHEDULED" => Some(Self::Scheduled),
            "RUNNING" => Some(Self::Running),
            "PAUSING" => Some(Self::Pausing),
            "PAUSED" => Some(Self::Paused),
            "TERMINATING" => Some(Self::Terminating),
            "TERMINATED" => Some(Self::Terminated),
            "FINISHED" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Finished | Self::Terminated)
    }
}

/// Lifecycle state of a PlanExecution. Shares the Run vocabulary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanState {
    #[default]
    Pending,
    Scheduled,
    Running,
    Pausing,
    Paused,
    Terminating,
    Terminated,
    Finished,
}

impl PlanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Finished => "FINISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SCHEDULED" => Some(Self::Scheduled),
            "RUNNING" => Some(Self::Running),
            "PAUSING" => Some(Self::Pausing),
            "PAUSED" => Some(Self::Paused),
            "TERMINATING" => Some(Self::Terminating),
            "TERMINATED" => Some(Self::Terminated),
            "FINISHED" => Some(Self::Finished),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Finished | Self::Terminated)
    }

    /// Further dispatch is withheld while the plan is in one of these states.
    pub fn withholds_dispatch(&self) -> bool {
        matches!(self, Self::Pausing | Self::Paused)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    #[default]
    Pending,
    Starting,
    Scheduled,
    Waiting,
    Awaiting,
    Running,
    Pausing,
    Paused,
    Terminating,
    Terminated,
    Finished,
    Error,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Scheduled => "SCHEDULED",
            Self::Waiting => "WAITING",
            Self::Awaiting => "AWAITING",
            Self::Running => "RUNNING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "STARTING" => Some(Self::Starting),
            "SCHEDULED" => Some(Self::Scheduled),
            "WAITING" => Some(Self::Waiting),
            "AWAITING" => Some(Self::Awaiting),
            "RUNNING" => Some(Self::Running),
            "PAUSING" => Some(Self::Pausing),
            "PAUSED" => Some(Self::Paused),
            "TERMINATING" => Some(Self::Terminating),
            "TERMINATED" => Some(Self::Terminated),
            "FINISHED" => Some(Self::Finished),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Finished | Self::Terminated | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    #[default]
    Pending,
    Starting,
    Running,
    Paused,
    Terminating,
    Terminated,
    Finished,
    Error,
    Ignored,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
            Self::Ignored => "IGNORED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "PAUSED" => Some(Self::Paused),
            "TERMINATING" => Some(Self::Terminating),
            "TERMINATED" => Some(Self::Terminated),
            "FINISHED" => Some(Self::Finished),
            "ERROR" => Some(Self::Error),
            "IGNORED" => Some(Self::Ignored),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Terminated | Self::Error | Self::Ignored
        )
    }

    /// In flight on a worker: a reply is still expected.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Terminating)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        assert_eq!(RunState::parse("PAUSING"), Some(RunState::Pausing));
        assert_eq!(StageState::parse("AWAITING"), Some(StageState::Awaiting));
        assert_eq!(StepState::parse("IGNORED"), Some(StepState::Ignored));
        assert_eq!(PlanState::parse("running"), None);
    }

    #[test]
    fn test_final_states() {
        assert!(StepState::Ignored.is_final());
        assert!(StepState::Error.is_final());
        assert!(!StepState::Paused.is_final());
        assert!(StageState::Error.is_final());
        assert!(!StageState::Waiting.is_final());
        assert!(RunState::Terminated.is_final());
        assert!(!RunState::Paused.is_final());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&StageState::Awaiting).unwrap();
        assert_eq!(json, "\"AWAITING\"");
        let parsed: StepState = serde_json::from_str("\"TERMINATING\"").unwrap();
        assert_eq!(parsed, StepState::Terminating);
    }
}
