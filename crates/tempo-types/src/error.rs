use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Runtime error category, determined by error code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Value,
    Scope,
    Statement,
    Thread,
}

/// Numeric runtime error number (4000–4199).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    // ── Value errors (4000–4049) ──
    pub const WRONG_DYNAMIC_TYPE: Self = Self(4000);
    pub const CONVERSION_FAILED: Self = Self(4001);
    pub const NO_SUCH_FIELD: Self = Self(4002);
    pub const INDEX_OUT_OF_RANGE: Self = Self(4003);
    pub const DIVISION_BY_ZERO: Self = Self(4004);
    pub const EMPTY_SEQUENCE: Self = Self(4005);
    pub const NOT_UPDATABLE: Self = Self(4006);
    pub const RANGE_TOO_LARGE: Self = Self(4007);

    // ── Scope and call errors (4050–4099) ──
    pub const NAME_NOT_FOUND: Self = Self(4050);
    pub const NOT_CALLABLE: Self = Self(4051);
    pub const UNRESOLVED_CALL: Self = Self(4052);
    pub const ARGUMENT_MISMATCH: Self = Self(4053);
    pub const PRECONDITION_FAILED: Self = Self(4054);
    pub const NOT_YET_SPECIFIED: Self = Self(4055);
    pub const NO_SUCH_CLASS: Self = Self(4056);

    // ── Statement errors (4100–4149) ──
    pub const LOOP_NEVER_TERMINATES: Self = Self(4100);
    pub const BIND_MEMBERSHIP_FAILED: Self = Self(4101);
    pub const LET_BE_EXHAUSTED: Self = Self(4102);
    pub const PATTERN_MISMATCH: Self = Self(4103);
    pub const TRAP_BIND_FAILED: Self = Self(4104);
    pub const TYPE_NOT_ENUMERABLE: Self = Self(4105);
    pub const INVARIANT_VIOLATED: Self = Self(4106);

    // ── Thread errors (4150–4199) ──
    pub const ALREADY_STARTED: Self = Self(4150);
    pub const NO_THREAD_DEFINED: Self = Self(4151);
    pub const NEGATIVE_DURATION: Self = Self(4152);
    pub const SPAWN_FAILED: Self = Self(4153);
    pub const NO_TIME_LIMIT: Self = Self(4154);

    /// Get the category for this error code.
    pub fn category(self) -> ErrorCategory {
        match self.0 {
            4000..=4049 => ErrorCategory::Value,
            4050..=4099 => ErrorCategory::Scope,
            4100..=4149 => ErrorCategory::Statement,
            _ => ErrorCategory::Thread,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error {}", self.0)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value => write!(f, "value"),
            Self::Scope => write!(f, "scope"),
            Self::Statement => write!(f, "statement"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

/// A failure inside the value system: extraction, conversion, field access.
///
/// These carry no location; the evaluator attaches one when it lifts them
/// into runtime errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("expecting {expected}, got {actual}")]
    WrongType {
        expected: &'static str,
        actual: String,
    },
    #[error("cannot convert {value} to {target}")]
    Conversion { value: String, target: String },
    #[error("no such field: {0}")]
    NoSuchField(String),
    #[error("index {index} out of range 1..{len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("{0} applied to empty sequence")]
    EmptySequence(&'static str),
    #[error("value is not updatable")]
    NotUpdatable,
}

impl ValueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::WrongType { .. } => ErrorCode::WRONG_DYNAMIC_TYPE,
            Self::Conversion { .. } => ErrorCode::CONVERSION_FAILED,
            Self::NoSuchField(_) => ErrorCode::NO_SUCH_FIELD,
            Self::IndexOutOfRange { .. } => ErrorCode::INDEX_OUT_OF_RANGE,
            Self::DivisionByZero => ErrorCode::DIVISION_BY_ZERO,
            Self::EmptySequence(_) => ErrorCode::EMPTY_SEQUENCE,
            Self::NotUpdatable => ErrorCode::NOT_UPDATABLE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_category() {
        assert_eq!(
            ErrorCode::WRONG_DYNAMIC_TYPE.category(),
            ErrorCategory::Value
        );
        assert_eq!(ErrorCode::UNRESOLVED_CALL.category(), ErrorCategory::Scope);
        assert_eq!(
            ErrorCode::LOOP_NEVER_TERMINATES.category(),
            ErrorCategory::Statement
        );
        assert_eq!(ErrorCode::ALREADY_STARTED.category(), ErrorCategory::Thread);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::LET_BE_EXHAUSTED), "Error 4102");
    }

    #[test]
    fn test_value_error_codes() {
        assert_eq!(
            ValueError::NoSuchField("x".into()).code(),
            ErrorCode::NO_SUCH_FIELD
        );
        assert_eq!(ValueError::DivisionByZero.code(), ErrorCode::DIVISION_BY_ZERO);
    }

    #[test]
    fn test_value_error_message() {
        let err = ValueError::WrongType {
            expected: "bool",
            actual: "3".into(),
        };
        assert_eq!(err.to_string(), "expecting bool, got 3");
    }
}
