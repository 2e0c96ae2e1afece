//! Domain error types.
//!
//! Errors are split by who has to react to them: configuration and data
//! errors are fatal at setup, lifecycle errors go back to the caller of a
//! position operation, and [`UnsupportedExecution`] ends the simulation.

use chrono::NaiveDateTime;

use super::order::OrderRef;
use super::position::PositionId;

/// Failures raised while validating or resampling a bar series.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregateError {
    #[error("frequency must be positive, got {0}")]
    InvalidFrequency(String),

    #[error("invalid session window {window}: {reason}")]
    InvalidSession { window: String, reason: String },

    #[error("frequency {frequency} does not evenly divide session {session}")]
    NonDividingSession { session: String, frequency: String },

    #[error("cannot resample {from} to {to}: target must be a positive integer multiple")]
    InvalidFrequencyRatio { from: String, to: String },

    #[error("bar grid mismatch at {frequency}: missing {missing:?}, extra {extra:?}")]
    GridMismatch {
        frequency: String,
        missing: Vec<NaiveDateTime>,
        extra: Vec<NaiveDateTime>,
    },

    #[error("timestamps out of order at {0}")]
    Unordered(NaiveDateTime),

    #[error("duplicate timestamp {0}")]
    Duplicate(NaiveDateTime),

    #[error("invalid bar at {timestamp}: {reason}")]
    InvalidBar {
        timestamp: NaiveDateTime,
        reason: String,
    },

    #[error("missing field {field} at row {row}")]
    MissingField { field: String, row: usize },

    #[error("series {name} is not aligned with {reference}")]
    MisalignedSeries { name: String, reference: String },
}

impl AggregateError {
    /// True for errors caused by calendar/frequency setup rather than the data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AggregateError::InvalidFrequency(_)
                | AggregateError::InvalidSession { .. }
                | AggregateError::NonDividingSession { .. }
                | AggregateError::InvalidFrequencyRatio { .. }
        )
    }
}

/// Typed failures of the position lifecycle operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("no such position {0}")]
    NoSuchPosition(PositionId),

    #[error("position {0} is already finished")]
    PositionFinished(PositionId),

    #[error("entry order of position {0} is not filled")]
    EntryNotFilled(PositionId),

    #[error("position {0} is already closing")]
    AlreadyClosing(PositionId),

    #[error("position {0} was entered today and cannot exit before the next session")]
    T1Restricted(PositionId),

    #[error("risk sizing needs a stop price")]
    SizingUndefined,

    #[error("exit order for position {position} rejected: {reason}")]
    ExitRejected { position: PositionId, reason: String },
}

/// Execution conditions the position model cannot represent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnsupportedExecution {
    #[error("order {0} was partially filled; partial fills are not supported")]
    PartialFill(OrderRef),
}

/// Failures of the step controller handoff.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("simulation has ended")]
    SimulationEnded,

    #[error("simulation aborted: {reason}")]
    SimulationAborted { reason: String },

    #[error("failed to start simulation thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Top-level error type for steptrader.
#[derive(Debug, thiserror::Error)]
pub enum StepTraderError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("session store error: {reason}")]
    SessionStore { reason: String },

    #[error("session {0} not found")]
    SessionNotFound(i64),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&StepTraderError> for std::process::ExitCode {
    fn from(err: &StepTraderError) -> Self {
        let code: u8 = match err {
            StepTraderError::Io(_) | StepTraderError::Controller(_) => 1,
            StepTraderError::ConfigParse { .. }
            | StepTraderError::ConfigMissing { .. }
            | StepTraderError::ConfigInvalid { .. } => 2,
            StepTraderError::SessionStore { .. } | StepTraderError::SessionNotFound(_) => 3,
            StepTraderError::Aggregate(e) if e.is_configuration() => 2,
            StepTraderError::Data { .. } | StepTraderError::Aggregate(_) => 5,
        };
        std::process::ExitCode::from(code)
    }
}
