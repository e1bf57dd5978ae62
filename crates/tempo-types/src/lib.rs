//! Shared types for the tempo evaluator.
//!
//! This crate defines the executable tree handed over by the front end,
//! source locations with their hit counters, the runtime value system and
//! the numbered runtime error codes.

mod error;
mod span;
pub mod ast;
pub mod value;
pub mod visit;

pub use error::{ErrorCategory, ErrorCode, ValueError};
pub use span::{HitCounter, Location, NodeId, Span};
pub use value::{Bindings, Cell, CellOwner, ObjectRef, ObjectValue, Value};
