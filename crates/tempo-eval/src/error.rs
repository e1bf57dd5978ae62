//! Evaluation outcomes other than a value.

use std::fmt;
use tempo_types::{ErrorCode, Location, Value};
use thiserror::Error;

/// A value raised by `exit`, travelling outward until a `trap`/`tixe`
/// accepts it or it reaches the top of the thread.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    pub value: Value,
    pub location: Location,
}

impl fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit {} at {}", self.value, self.location)
    }
}

/// A numbered, fatal evaluation failure.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
    pub location: Location,
    /// Title of the context the failure happened in (operation name, etc.).
    pub context: String,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} at {} in '{}'",
            self.code, self.message, self.location, self.context
        )
    }
}

/// Everything that can end an evaluation early.
///
/// Only [`EvalError::Exit`] is visible to `trap`/`tixe`. Cancellation and
/// thread stop always unwind to the top of the thread.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    #[error("{0}")]
    Exit(Box<ExitSignal>),
    #[error("{0}")]
    Runtime(Box<RuntimeError>),
    #[error("execution cancelled at {location}")]
    Cancelled { location: Location },
    #[error("thread stopped at {location}")]
    Stopped { location: Location },
}

/// Result alias for evaluator operations.
pub type EvalResult<T> = Result<T, EvalError>;

impl EvalError {
    pub fn exit(value: Value, location: &Location) -> Self {
        Self::Exit(Box::new(ExitSignal {
            value,
            location: location.clone(),
        }))
    }

    pub fn runtime(
        code: ErrorCode,
        message: impl Into<String>,
        location: &Location,
        context: impl Into<String>,
    ) -> Self {
        Self::Runtime(Box::new(RuntimeError {
            code,
            message: message.into(),
            location: location.clone(),
            context: context.into(),
        }))
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Runtime(e) => Some(e.code),
            _ => None,
        }
    }

    pub fn exit_value(&self) -> Option<&Value> {
        match self {
            Self::Exit(signal) => Some(&signal.value),
            _ => None,
        }
    }

    pub fn location(&self) -> &Location {
        match self {
            Self::Exit(signal) => &signal.location,
            Self::Runtime(e) => &e.location,
            Self::Cancelled { location } | Self::Stopped { location } => location,
        }
    }
}
