use thiserror::Error;

/// Kinds of persisted entities, used to tag errors so each kind maps distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Plan,
    Worker,
    Run,
    PlanExecution,
    StageExecution,
    StepExecution,
    Session,
    ExecutionVariable,
    CorrelationEvent,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Worker => "worker",
            Self::Run => "run",
            Self::PlanExecution => "plan execution",
            Self::StageExecution => "stage execution",
            Self::StepExecution => "step execution",
            Self::Session => "session",
            Self::ExecutionVariable => "execution variable",
            Self::CorrelationEvent => "correlation event",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plan document failed schema or graph validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid plan document: {0}")]
    InvalidDocument(String),

    #[error("Plan name must not be empty")]
    EmptyPlanName,

    #[error("Trigger type does not exist: {0}")]
    TriggerTypeDoesNotExist(String),

    #[error("Step type does not exist: {0}")]
    StepTypeDoesNotExist(String),

    #[error("Successor type does not exist: {0}")]
    SuccessorTypeDoesNotExist(String),

    #[error("Invalid trigger arguments for stage '{stage}': {reason}")]
    InvalidTriggerArgs { stage: String, reason: String },

    #[error("Invalid arguments for step '{step}': {reason}")]
    InvalidStepArguments { step: String, reason: String },

    #[error("Invalid successor on step '{step}': {reason}")]
    InvalidSuccessor { step: String, reason: String },

    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Duplicate step name '{step}' in stage '{stage}'")]
    DuplicateStep { stage: String, step: String },

    #[error("Output prefix '{0}' is used by more than one step")]
    DuplicateOutputPrefix(String),

    #[error("Output prefix '{0}' is reserved")]
    ReservedOutputPrefix(String),

    #[error("Stage '{0}' has no initial step")]
    MissingInitStep(String),

    #[error("Step '{step}' in stage '{stage}' references unknown successor '{successor}'")]
    UnknownSuccessor {
        stage: String,
        step: String,
        successor: String,
    },

    #[error("Initial step '{step}' in stage '{stage}' is a successor of another step")]
    InitStepIsSuccessor { stage: String, step: String },

    #[error("Successor graph of stage '{stage}' contains a cycle through '{step}'")]
    CycleDetected { stage: String, step: String },

    #[error("Step '{step}' in stage '{stage}' is unreachable from the initial steps")]
    UnreachableStep { stage: String, step: String },

    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Stage dependencies contain a cycle through '{0}'")]
    DependencyCycle(String),

    #[error("Invalid key path '{path}': {reason}")]
    InvalidKeyPath { path: String, reason: String },

    #[error("Plan '{0}' is not dynamic")]
    PlanNotDynamic(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ValidationError::TriggerTypeDoesNotExist("cron".to_string());
        assert!(error.to_string().contains("cron"));

        let error = ValidationError::CycleDetected {
            stage: "s1".to_string(),
            step: "a".to_string(),
        };
        assert!(error.to_string().contains("s1"));
        assert_eq!(EntityKind::StageExecution.to_string(), "stage execution");
    }
}
