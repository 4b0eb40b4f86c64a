//! Legal state transitions of runs, plan executions, stage executions and
//! step executions.

use std::fmt::Display;

use cryton_core::{EntityKind, PlanState, RunState, StageState, StepState};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

pub trait StateMachine {
    type State: Copy + PartialEq + Display + 'static;

    const KIND: EntityKind;

    fn allowed_transitions(from: Self::State) -> &'static [Self::State];

    /// `Ok(false)` for the no-op `x -> x`, `Ok(true)` for a legal move.
    fn validate_transition(id: Uuid, from: Self::State, to: Self::State) -> Result<bool> {
        if from == to {
            return Ok(false);
        }
        if Self::allowed_transitions(from).contains(&to) {
            Ok(true)
        } else {
            Err(OrchestratorError::InvalidTransition {
                kind: Self::KIND,
                id,
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn validate_state(id: Uuid, current: Self::State, allowed: &[Self::State]) -> Result<()> {
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(OrchestratorError::invalid_state(Self::KIND, id, current))
        }
    }

    fn can_transition(from: Self::State, to: Self::State) -> bool {
        Self::allowed_transitions(from).contains(&to)
    }
}

pub struct RunStateMachine;

impl RunStateMachine {
    pub const EXECUTE_STATES: &'static [RunState] = &[RunState::Pending, RunState::Scheduled];
    pub const SCHEDULE_STATES: &'static [RunState] = &[RunState::Pending];
    pub const UNSCHEDULE_STATES: &'static [RunState] = &[RunState::Scheduled];
    pub const PAUSE_STATES: &'static [RunState] = &[RunState::Running];
    pub const RESUME_STATES: &'static [RunState] = &[RunState::Paused];
    pub const KILL_STATES: &'static [RunState] =
        &[RunState::Running, RunState::Pausing, RunState::Paused];
    pub const DELETE_STATES: &'static [RunState] = &[
        RunState::Pending,
        RunState::Scheduled,
        RunState::Finished,
        RunState::Terminated,
    ];
}

impl StateMachine for RunStateMachine {
    type State = RunState;

    const KIND: EntityKind = EntityKind::Run;

    fn allowed_transitions(from: RunState) -> &'static [RunState] {
        use RunState::*;
        match from {
            Pending => &[Scheduled, Running],
            Scheduled => &[Pending, Running],
            Running => &[Pausing, Finished, Terminating],
            Pausing => &[Paused, Finished, Terminating],
            Paused => &[Running, Terminating],
            Terminating => &[Terminated],
            Terminated | Finished => &[],
        }
    }
}

pub struct PlanStateMachine;

impl PlanStateMachine {
    pub const EXECUTE_STATES: &'static [PlanState] = &[PlanState::Pending, PlanState::Scheduled];
    pub const PAUSE_STATES: &'static [PlanState] = &[PlanState::Running];
    pub const RESUME_STATES: &'static [PlanState] = &[PlanState::Paused];
    pub const KILL_STATES: &'static [PlanState] =
        &[PlanState::Running, PlanState::Pausing, PlanState::Paused];
}

impl StateMachine for PlanStateMachine {
    type State = PlanState;

    const KIND: EntityKind = EntityKind::PlanExecution;

    fn allowed_transitions(from: PlanState) -> &'static [PlanState] {
        use PlanState::*;
        match from {
            Pending => &[Scheduled, Running],
            Scheduled => &[Pending, Running],
            Running => &[Pausing, Finished, Terminating],
            Pausing => &[Paused, Finished, Terminating],
            Paused => &[Running, Terminating],
            Terminating => &[Terminated],
            Terminated | Finished => &[],
        }
    }
}

pub struct StageStateMachine;

impl StageStateMachine {
    pub const EXECUTE_STATES: &'static [StageState] = &[
        StageState::Pending,
        StageState::Scheduled,
        StageState::Awaiting,
        StageState::Waiting,
    ];
    pub const TRIGGER_START_STATES: &'static [StageState] = &[StageState::Pending];
    pub const TRIGGER_STOP_STATES: &'static [StageState] =
        &[StageState::Scheduled, StageState::Awaiting];
    pub const PAUSE_STATES: &'static [StageState] = &[
        StageState::Scheduled,
        StageState::Awaiting,
        StageState::Waiting,
        StageState::Running,
    ];
    pub const KILL_STATES: &'static [StageState] = &[
        StageState::Scheduled,
        StageState::Awaiting,
        StageState::Waiting,
        StageState::Running,
        StageState::Pausing,
        StageState::Paused,
    ];
    pub const RE_EXECUTE_STATES: &'static [StageState] = &[
        StageState::Finished,
        StageState::Terminated,
        StageState::Error,
    ];
}

impl StateMachine for StageStateMachine {
    type State = StageState;

    const KIND: EntityKind = EntityKind::StageExecution;

    fn allowed_transitions(from: StageState) -> &'static [StageState] {
        use StageState::*;
        match from {
            Pending => &[Starting, Scheduled, Awaiting, Waiting, Running, Paused],
            Starting => &[Scheduled, Awaiting, Waiting, Running, Paused, Error],
            Scheduled => &[Pending, Waiting, Running, Paused, Terminating],
            Awaiting => &[Pending, Waiting, Running, Paused, Terminating],
            Waiting => &[Running, Paused, Terminating],
            Running => &[Pausing, Finished, Terminating, Error],
            Pausing => &[Paused, Finished, Terminating],
            Paused => &[Scheduled, Awaiting, Waiting, Running, Terminating],
            Terminating => &[Terminated],
            Terminated | Finished | Error => &[],
        }
    }
}

pub struct StepStateMachine;

impl StepStateMachine {
    /// States a step may be dispatched from; PAUSED steps are resumed.
    pub const EXECUTE_STATES: &'static [StepState] = &[StepState::Pending, StepState::Paused];
    pub const KILL_STATES: &'static [StepState] = &[StepState::Running];
    pub const POSTPROCESS_STATES: &'static [StepState] =
        &[StepState::Running, StepState::Terminating];
    pub const RE_EXECUTE_STATES: &'static [StepState] = &[
        StepState::Finished,
        StepState::Terminated,
        StepState::Error,
        StepState::Ignored,
    ];
}

impl StateMachine for StepStateMachine {
    type State = StepState;

    const KIND: EntityKind = EntityKind::StepExecution;

    fn allowed_transitions(from: StepState) -> &'static [StepState] {
        use StepState::*;
        match from {
            Pending => &[Starting, Paused, Ignored],
            Starting => &[Running, Error],
            Running => &[Finished, Error, Terminating, Terminated],
            Paused => &[Starting, Ignored],
            Terminating => &[Terminated],
            Terminated | Finished | Error | Ignored => &[],
        }
    }
}
