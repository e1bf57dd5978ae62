//! Breakpoint and stepping control plane.
//!
//! Every statement and expression visit goes through
//! [`Evaluator::check`]: it counts the location hit, acts on a pending
//! interrupt, applies any breakpoint attached to the node and finally decides
//! whether a stepping thread should stop. Stops are reported to the attached
//! [`DebugLink`], which answers with a [`ResumeCommand`] while the thread
//! stays suspended.

use crate::context::{Context, Frame};
use crate::error::{EvalError, EvalResult};
use crate::evaluator::Evaluator;
use crate::log::LogRecord;
use crate::scheduler::InterruptLevel;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tempo_types::ast::Expr;
use tempo_types::{Bindings, Location, NodeId, Value};

// ══════════════════════════════════════════════════════════════════════════════
// Breakpoints
// ══════════════════════════════════════════════════════════════════════════════

/// Hit-count test of a stoppoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitCondition {
    /// `= n`
    Eq(u64),
    /// `>= n`
    Ge(u64),
    /// `> n`
    Gt(u64),
    /// `mod n`
    Modulo(u64),
}

impl HitCondition {
    pub fn holds(&self, hits: u64) -> bool {
        match *self {
            Self::Eq(n) => hits == n,
            Self::Ge(n) => hits >= n,
            Self::Gt(n) => hits > n,
            Self::Modulo(n) => n > 0 && hits % n == 0,
        }
    }
}

impl fmt::Display for HitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq(n) => write!(f, "= {n}"),
            Self::Ge(n) => write!(f, ">= {n}"),
            Self::Gt(n) => write!(f, "> {n}"),
            Self::Modulo(n) => write!(f, "mod {n}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StopCondition {
    Always,
    Hits(HitCondition),
    /// Boolean expression evaluated in the context of the hit.
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum BreakpointKind {
    Stop(StopCondition),
    /// Expressions logged on every hit.
    Trace(Vec<Expr>),
    /// Matches raised values by class name or display text; `None` matches
    /// everything.
    Catch(Option<String>),
}

#[derive(Debug)]
pub struct Breakpoint {
    pub number: u32,
    /// Absent for catchpoints, which are not tied to a node.
    pub location: Option<Location>,
    pub node: Option<NodeId>,
    pub kind: BreakpointKind,
    hits: AtomicU64,
}

impl Breakpoint {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Whether a catchpoint accepts a raised value.
    pub fn catches(&self, value: &Value) -> bool {
        match &self.kind {
            BreakpointKind::Catch(None) => true,
            BreakpointKind::Catch(Some(filter)) => match value.deref() {
                Value::Object(obj) => obj.class() == filter,
                Value::Quote(q) if q.as_str() == filter.as_str() => true,
                other => {
                    other.to_string() == *filter
                        || other.as_text().as_deref() == Some(filter.as_str())
                }
            },
            _ => false,
        }
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self
            .location
            .as_ref()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "any location".into());
        match &self.kind {
            BreakpointKind::Stop(StopCondition::Always) => write!(f, "break [{}] at {at}", self.number),
            BreakpointKind::Stop(StopCondition::Hits(c)) => {
                write!(f, "break [{}] at {at} when hits {c}", self.number)
            }
            BreakpointKind::Stop(StopCondition::Expr(_)) => {
                write!(f, "break [{}] at {at} when <condition>", self.number)
            }
            BreakpointKind::Trace(exprs) => {
                write!(f, "trace [{}] at {at} ({} expressions)", self.number, exprs.len())
            }
            BreakpointKind::Catch(Some(filter)) => write!(f, "catch [{}] {filter}", self.number),
            BreakpointKind::Catch(None) => write!(f, "catch [{}] any", self.number),
        }
    }
}

/// Breakpoint table plus the attached debugger link.
#[derive(Default)]
pub struct DebugControl {
    next_number: AtomicU32,
    points: DashMap<NodeId, Arc<Breakpoint>>,
    catchpoints: RwLock<Vec<Arc<Breakpoint>>>,
    link: RwLock<Option<Arc<dyn DebugLink>>>,
}

impl DebugControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_number(&self) -> u32 {
        self.next_number.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn attach_point(&self, node: NodeId, location: &Location, kind: BreakpointKind) -> u32 {
        let number = self.next_number();
        let bp = Arc::new(Breakpoint {
            number,
            location: Some(location.clone()),
            node: Some(node),
            kind,
            hits: AtomicU64::new(0),
        });
        tracing::debug!(%bp, "breakpoint set");
        self.points.insert(node, bp);
        number
    }

    /// Replaces any breakpoint already attached to `node`.
    pub fn set_stoppoint(&self, node: NodeId, location: &Location, condition: StopCondition) -> u32 {
        self.attach_point(node, location, BreakpointKind::Stop(condition))
    }

    pub fn set_tracepoint(&self, node: NodeId, location: &Location, exprs: Vec<Expr>) -> u32 {
        self.attach_point(node, location, BreakpointKind::Trace(exprs))
    }

    pub fn set_catchpoint(&self, filter: Option<String>) -> u32 {
        let number = self.next_number();
        let bp = Arc::new(Breakpoint {
            number,
            location: None,
            node: None,
            kind: BreakpointKind::Catch(filter),
            hits: AtomicU64::new(0),
        });
        tracing::debug!(%bp, "catchpoint set");
        self.catchpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bp);
        number
    }

    /// Remove a breakpoint by number. False if there was none.
    pub fn clear(&self, number: u32) -> bool {
        let node = self
            .points
            .iter()
            .find(|e| e.value().number == number)
            .map(|e| *e.key());
        if let Some(node) = node {
            return self.points.remove(&node).is_some();
        }
        let mut catches = self.catchpoints.write().unwrap_or_else(PoisonError::into_inner);
        let before = catches.len();
        catches.retain(|c| c.number != number);
        catches.len() != before
    }

    /// All breakpoints, ordered by number.
    pub fn list(&self) -> Vec<Arc<Breakpoint>> {
        let mut all: Vec<Arc<Breakpoint>> = self.points.iter().map(|e| e.value().clone()).collect();
        all.extend(self.catchpoints());
        all.sort_by_key(|b| b.number);
        all
    }

    pub fn breakpoint_at(&self, node: NodeId) -> Option<Arc<Breakpoint>> {
        self.points.get(&node).map(|e| e.value().clone())
    }

    pub fn catchpoints(&self) -> Vec<Arc<Breakpoint>> {
        self.catchpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn attach(&self, link: Arc<dyn DebugLink>) {
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    pub fn detach(&self) {
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn link(&self) -> Option<Arc<dyn DebugLink>> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for DebugControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugControl")
            .field("points", &self.points.len())
            .field("catchpoints", &self.catchpoints().len())
            .finish()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Stops
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCommand {
    Continue,
    StepIn,
    StepOver,
    StepOut,
    Terminate,
}

#[derive(Debug, Clone)]
pub enum StopReason {
    Breakpoint(u32),
    Step,
    Pause,
    Catch { number: u32, value: Value },
    Fatal { message: String },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Breakpoint(n) => write!(f, "breakpoint [{n}]"),
            Self::Step => write!(f, "step"),
            Self::Pause => write!(f, "pause"),
            Self::Catch { number, value } => write!(f, "catchpoint [{number}] caught {value}"),
            Self::Fatal { message } => write!(f, "fatal: {message}"),
        }
    }
}

/// A suspended thread, as seen by the debugger.
pub struct Stop<'s> {
    pub reason: StopReason,
    pub location: Location,
    ctx: &'s Context<'s>,
    evaluator: &'s Evaluator,
}

impl<'s> Stop<'s> {
    pub fn thread_id(&self) -> u64 {
        self.ctx.thread().id()
    }

    pub fn thread_name(&self) -> &str {
        self.ctx.thread().name()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.ctx.frames()
    }

    pub fn bindings(&self) -> Bindings {
        self.ctx.visible_bindings()
    }

    /// Evaluate an expression in the suspended context. Breakpoints are not
    /// re-entered while it runs.
    pub fn evaluate(&self, expr: &Expr) -> EvalResult<Value> {
        let thread = self.ctx.thread();
        let _debugging = thread.debugging();
        self.evaluator.eval_expr(expr, self.ctx)
    }
}

/// The debugger front end.
pub trait DebugLink: Send + Sync {
    /// Called on the suspended thread; the thread resumes when this returns.
    fn stopped(&self, stop: &Stop<'_>) -> ResumeCommand;

    /// Called where a fatal error is raised, before it unwinds.
    fn fatal(&self, stop: &Stop<'_>) {
        let _ = self.stopped(stop);
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Check
// ══════════════════════════════════════════════════════════════════════════════

impl Evaluator {
    /// Run before every statement and expression.
    pub(crate) fn check(&self, node: NodeId, location: &Location, ctx: &Context<'_>) -> EvalResult<()> {
        location.hit();
        let thread = ctx.thread();
        if thread.is_debugging() {
            return Ok(());
        }
        if thread.stop_requested() {
            return Err(EvalError::Stopped {
                location: location.clone(),
            });
        }

        let scheduler = self.scheduler();
        match scheduler.interrupt().take() {
            InterruptLevel::None => {}
            InterruptLevel::Pause => return self.suspend(StopReason::Pause, location, ctx),
            InterruptLevel::Terminate => {
                tracing::info!(thread = thread.id(), %location, "execution terminated");
                return Err(EvalError::Cancelled {
                    location: location.clone(),
                });
            }
        }

        let stopped = match self.debug().breakpoint_at(node) {
            Some(bp) => self.apply_breakpoint(&bp, location, ctx)?,
            None => false,
        };

        if self.settings().is_real_time() {
            if !thread.is_atomic() {
                scheduler.yield_point(thread);
            }
        } else if !stopped && self.should_step(Some(location.line()), ctx) {
            return self.suspend(StopReason::Step, location, ctx);
        }
        Ok(())
    }

    /// True when the breakpoint suspended the thread.
    fn apply_breakpoint(&self, bp: &Breakpoint, location: &Location, ctx: &Context<'_>) -> EvalResult<bool> {
        let hits = bp.hit();
        match &bp.kind {
            BreakpointKind::Stop(condition) => {
                let stop = match condition {
                    StopCondition::Always => true,
                    StopCondition::Hits(c) => c.holds(hits),
                    StopCondition::Expr(expr) => {
                        let _debugging = ctx.thread().debugging();
                        match self.eval_expr(expr, ctx).and_then(|v| {
                            v.bool_value().map_err(|e| self.lift(e, location, ctx))
                        }) {
                            Ok(b) => b,
                            Err(e) => {
                                tracing::warn!(number = bp.number, error = %e, "breakpoint condition failed");
                                true
                            }
                        }
                    }
                };
                if stop {
                    self.suspend(StopReason::Breakpoint(bp.number), location, ctx)?;
                }
                Ok(stop)
            }
            BreakpointKind::Trace(exprs) => {
                let parts: Vec<String> = {
                    let _debugging = ctx.thread().debugging();
                    exprs
                        .iter()
                        .map(|e| match self.eval_expr(e, ctx) {
                            Ok(v) => v.to_string(),
                            Err(err) => err.to_string(),
                        })
                        .collect()
                };
                self.log(ctx, format!("trace [{}] at {location}: {}", bp.number, parts.join(", ")));
                Ok(false)
            }
            BreakpointKind::Catch(_) => Ok(false),
        }
    }

    /// The stepping predicate. `line` of `None` ignores the line test.
    pub(crate) fn should_step(&self, line: Option<u32>, ctx: &Context<'_>) -> bool {
        let step = ctx.thread().step_state();
        let Some(target) = step.line else {
            return false;
        };
        if line == Some(target) {
            return false;
        }
        let root = ctx.root_of();
        match (step.next, step.out) {
            (None, None) => true,
            (Some(next), _) if !root.has_ancestor(next) => true,
            (_, Some(out)) => !root.has_ancestor(out),
            _ => false,
        }
    }

    /// Offer raised values to the catchpoints.
    pub(crate) fn check_catchpoints(&self, value: &Value, location: &Location, ctx: &Context<'_>) -> EvalResult<()> {
        if ctx.thread().is_debugging() {
            return Ok(());
        }
        for cp in self.debug().catchpoints() {
            if cp.catches(value) {
                cp.hit();
                return self.suspend(
                    StopReason::Catch {
                        number: cp.number,
                        value: value.clone(),
                    },
                    location,
                    ctx,
                );
            }
        }
        Ok(())
    }

    /// Suspend the thread and hand control to the debugger link, if any.
    pub(crate) fn suspend(&self, reason: StopReason, location: &Location, ctx: &Context<'_>) -> EvalResult<()> {
        let Some(link) = self.debug().link() else {
            tracing::info!(%reason, %location, "stop ignored, no debugger attached");
            return Ok(());
        };
        let thread = ctx.thread();
        let scheduler = self.scheduler();
        scheduler.debugger_suspend(thread);
        tracing::info!(thread = thread.id(), %reason, %location, "thread stopped");
        let command = link.stopped(&Stop {
            reason,
            location: location.clone(),
            ctx,
            evaluator: self,
        });
        scheduler.debugger_resume(thread);
        self.resume(command, location, ctx)
    }

    fn resume(&self, command: ResumeCommand, location: &Location, ctx: &Context<'_>) -> EvalResult<()> {
        let thread = ctx.thread();
        let line = Some(location.line());
        let root = ctx.root_of();
        match command {
            ResumeCommand::Continue => thread.clear_breaks(),
            ResumeCommand::StepIn => thread.set_breaks(line, None, None),
            ResumeCommand::StepOver => thread.set_breaks(line, Some(root.id()), None),
            ResumeCommand::StepOut => match root.outer() {
                Some(caller) => thread.set_breaks(line, None, Some(caller.root_of().id())),
                None => thread.clear_breaks(),
            },
            ResumeCommand::Terminate => {
                thread.clear_breaks();
                return Err(EvalError::Cancelled {
                    location: location.clone(),
                });
            }
        }
        Ok(())
    }

    /// Let the debugger look at a fatal error before it unwinds.
    pub(crate) fn report_fatal(&self, message: &str, location: &Location, ctx: &Context<'_>) {
        let thread = ctx.thread();
        if thread.is_debugging() {
            return;
        }
        if let Some(link) = self.debug().link() {
            let scheduler = self.scheduler();
            scheduler.debugger_suspend(thread);
            link.fatal(&Stop {
                reason: StopReason::Fatal {
                    message: message.to_string(),
                },
                location: location.clone(),
                ctx,
                evaluator: self,
            });
            scheduler.debugger_resume(thread);
        }
    }

    pub(crate) fn log(&self, ctx: &Context<'_>, text: String) {
        let thread = ctx.thread();
        self.log_sink().record(LogRecord {
            time: self.scheduler().time(thread),
            thread: thread.id(),
            text,
        });
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Channel link
// ══════════════════════════════════════════════════════════════════════════════

/// What a front end sees of a stop.
#[derive(Debug, Clone)]
pub struct StopEvent {
    pub thread: u64,
    pub reason: StopReason,
    pub location: Location,
    pub frames: Vec<Frame>,
    pub bindings: Bindings,
}

#[derive(Debug)]
pub enum DebugRequest {
    Evaluate(Expr),
    Resume(ResumeCommand),
}

#[derive(Debug)]
pub enum DebugEvent {
    Stopped(StopEvent),
    Evaluated(Result<Value, String>),
}

/// A [`DebugLink`] driven over channels from another OS thread.
pub struct ChannelLink {
    events: Sender<DebugEvent>,
    requests: Mutex<Receiver<DebugRequest>>,
}

impl ChannelLink {
    /// A link and the session that drives it.
    pub fn pair() -> (Arc<Self>, DebugSession) {
        let (event_tx, event_rx) = mpsc::channel();
        let (request_tx, request_rx) = mpsc::channel();
        (
            Arc::new(Self {
                events: event_tx,
                requests: Mutex::new(request_rx),
            }),
            DebugSession {
                events: event_rx,
                requests: request_tx,
            },
        )
    }
}

impl DebugLink for ChannelLink {
    fn stopped(&self, stop: &Stop<'_>) -> ResumeCommand {
        let event = StopEvent {
            thread: stop.thread_id(),
            reason: stop.reason.clone(),
            location: stop.location.clone(),
            frames: stop.frames(),
            bindings: stop.bindings(),
        };
        if self.events.send(DebugEvent::Stopped(event)).is_err() {
            return ResumeCommand::Continue;
        }
        let requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match requests.recv() {
                Ok(DebugRequest::Evaluate(expr)) => {
                    let result = stop.evaluate(&expr).map_err(|e| e.to_string());
                    if self.events.send(DebugEvent::Evaluated(result)).is_err() {
                        return ResumeCommand::Continue;
                    }
                }
                Ok(DebugRequest::Resume(command)) => return command,
                Err(_) => return ResumeCommand::Continue,
            }
        }
    }
}

/// Front-end side of a [`ChannelLink`].
pub struct DebugSession {
    events: Receiver<DebugEvent>,
    requests: Sender<DebugRequest>,
}

impl DebugSession {
    /// Wait for the next stop.
    pub fn wait_stop(&self, timeout: Duration) -> Option<StopEvent> {
        loop {
            match self.events.recv_timeout(timeout) {
                Ok(DebugEvent::Stopped(stop)) => return Some(stop),
                Ok(DebugEvent::Evaluated(_)) => continue,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub fn evaluate(&self, expr: Expr, timeout: Duration) -> Option<Result<Value, String>> {
        self.requests.send(DebugRequest::Evaluate(expr)).ok()?;
        match self.events.recv_timeout(timeout) {
            Ok(DebugEvent::Evaluated(result)) => Some(result),
            _ => None,
        }
    }

    pub fn resume(&self, command: ResumeCommand) -> bool {
        self.requests.send(DebugRequest::Resume(command)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempo_types::{ObjectValue, Span};

    fn loc(line: u32) -> Location {
        Location::new("bp.rt", Span::point(line, 1))
    }

    #[test]
    fn test_hit_conditions() {
        assert!(HitCondition::Eq(3).holds(3));
        assert!(!HitCondition::Eq(3).holds(4));
        assert!(HitCondition::Ge(3).holds(4));
        assert!(!HitCondition::Gt(3).holds(3));
        assert!(HitCondition::Modulo(2).holds(4));
        assert!(!HitCondition::Modulo(0).holds(4));
    }

    #[test]
    fn test_numbers_are_unique_and_clear_works() {
        let debug = DebugControl::new();
        let a = debug.set_stoppoint(NodeId::fresh(), &loc(1), StopCondition::Always);
        let b = debug.set_catchpoint(Some("Overflow".into()));
        assert_ne!(a, b);
        assert_eq!(debug.list().len(), 2);
        assert!(debug.clear(a));
        assert!(debug.clear(b));
        assert!(!debug.clear(a));
        assert!(debug.list().is_empty());
    }

    #[test]
    fn test_setting_twice_replaces() {
        let debug = DebugControl::new();
        let node = NodeId::fresh();
        debug.set_stoppoint(node, &loc(1), StopCondition::Always);
        let second = debug.set_tracepoint(node, &loc(1), vec![]);
        assert_eq!(debug.breakpoint_at(node).map(|b| b.number), Some(second));
    }

    #[test]
    fn test_catch_matching() {
        let debug = DebugControl::new();
        debug.set_catchpoint(Some("Overflow".into()));
        debug.set_catchpoint(Some("Fault".into()));
        let cps = debug.catchpoints();
        assert!(cps[0].catches(&Value::Quote("Overflow".into())));
        assert!(cps[0].catches(&Value::text("Overflow")));
        assert!(!cps[0].catches(&Value::Int(1)));
        assert!(cps[1].catches(&Value::Object(ObjectValue::new("Fault"))));
    }

    #[test]
    fn test_display() {
        let debug = DebugControl::new();
        debug.set_stoppoint(NodeId::fresh(), &loc(7), StopCondition::Hits(HitCondition::Eq(3)));
        assert_eq!(debug.list()[0].to_string(), "break [1] at bp.rt:7:1 when hits = 3");
    }
}
