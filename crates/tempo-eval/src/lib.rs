//! tempo tree-walking evaluator.
//!
//! Executes a resolved model directly from its executable tree, in either the
//! plain or the real-time dialect. Threads are run through a [`Scheduler`];
//! a debugger attaches through [`DebugControl`].

mod context;
mod coverage;
mod debug;
mod delegate;
mod error;
mod evaluator;
mod expr;
mod log;
mod pattern;
mod realtime;
mod runtime;
mod scheduler;
mod settings;

pub use context::{
    ClassScope, Context, ContextId, Frame, Globals, RootKind, Routine, StateScope, StepState, ThreadId,
    ThreadState,
};
pub use coverage::{Coverage, CoverageEntry};
pub use debug::{
    Breakpoint, BreakpointKind, ChannelLink, DebugControl, DebugEvent, DebugLink, DebugRequest, DebugSession,
    HitCondition, ResumeCommand, Stop, StopCondition, StopEvent, StopReason,
};
pub use delegate::{CpuDelegate, Delegate, DelegateCall, DelegateRegistry, CPU_CLASS};
pub use error::{EvalError, EvalResult, ExitSignal, RuntimeError};
pub use evaluator::Evaluator;
pub use log::{LogRecord, LogSink, MemorySink, TracingSink};
pub use pattern::{match_pattern, Matched};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{
    Interrupt, InterruptLevel, LocalScheduler, Scheduler, SpawnRequest, ThreadBody, ThreadInfo, ThreadKind,
    ThreadOutcome, TimedStepGuard,
};
pub use settings::{Dialect, Settings};
