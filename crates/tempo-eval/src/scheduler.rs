//! The scheduling service seam.
//!
//! The evaluator never multiplexes threads itself: it registers them with a
//! [`Scheduler`], asks it to convert and charge simulated time, and offers it
//! preemption points. [`LocalScheduler`] is an in-process implementation that
//! runs every simulated thread on its own OS thread with a private virtual
//! clock.

use crate::context::{ThreadId, ThreadState};
use crate::error::{EvalError, EvalResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tempo_types::{ObjectRef, Value};

// ══════════════════════════════════════════════════════════════════════════════
// Interrupt level
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterruptLevel {
    None = 0,
    Pause = 1,
    Terminate = 2,
}

impl InterruptLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Pause,
            2 => Self::Terminate,
            _ => Self::None,
        }
    }
}

/// One-shot, process-wide interrupt request.
#[derive(Debug, Default)]
pub struct Interrupt(AtomicU8);

impl Interrupt {
    pub fn set(&self, level: InterruptLevel) {
        self.0.store(level as u8, Ordering::SeqCst);
    }

    /// Read and reset to [`InterruptLevel::None`].
    pub fn take(&self) -> InterruptLevel {
        if self.0.load(Ordering::Relaxed) == 0 {
            return InterruptLevel::None;
        }
        InterruptLevel::from_u8(self.0.swap(0, Ordering::SeqCst))
    }

    pub fn peek(&self) -> InterruptLevel {
        InterruptLevel::from_u8(self.0.load(Ordering::SeqCst))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Service trait
// ══════════════════════════════════════════════════════════════════════════════

/// Timing of a new simulated thread, all values in virtual nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Plain,
    Periodic {
        period: u64,
        jitter: u64,
        delay: u64,
        offset: u64,
    },
    Sporadic {
        min_delay: u64,
        max_delay: u64,
        offset: u64,
    },
}

/// Runs one activation of a thread body on the given thread.
pub type ThreadBody = Arc<dyn Fn(&Arc<ThreadState>) -> EvalResult<Value> + Send + Sync>;

pub struct SpawnRequest {
    pub kind: ThreadKind,
    pub name: String,
    pub object: Option<ObjectRef>,
    /// Virtual time of the spawning thread.
    pub start_time: u64,
    pub body: ThreadBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: String,
    pub object: Option<u64>,
    pub cpu: u32,
    pub time: u64,
    /// Preemption points offered so far.
    pub yields: u64,
    pub running: bool,
}

/// Final result of a simulated thread.
#[derive(Debug)]
pub struct ThreadOutcome {
    pub id: ThreadId,
    pub name: String,
    pub result: EvalResult<Value>,
}

pub trait Scheduler: Send + Sync {
    /// Register the calling OS thread as a simulated thread.
    fn attach(&self, name: &str, cpu: u32) -> Arc<ThreadState>;
    fn spawn(&self, request: SpawnRequest) -> std::io::Result<ThreadId>;
    fn define_cpu(&self, cpu: u32, hz: u64);
    fn deploy(&self, object: &ObjectRef, cpu: u32);
    fn cycles_to_duration(&self, thread: &ThreadState, cycles: u64) -> u64;
    fn charge(&self, thread: &ThreadState, duration: u64);
    fn time(&self, thread: &ThreadState) -> u64;
    fn in_timed_step(&self, thread: &ThreadState) -> bool;
    fn set_timed_step(&self, thread: &ThreadState, on: bool);
    /// Statement boundary offered for preemption.
    fn yield_point(&self, thread: &ThreadState);
    fn debugger_suspend(&self, thread: &ThreadState);
    fn debugger_resume(&self, thread: &ThreadState);
    fn threads(&self) -> Vec<ThreadInfo>;
    /// Virtual time at which periodic threads end; `None` runs them forever.
    fn time_limit(&self) -> Option<u64>;
    fn interrupt(&self) -> &Interrupt;
    /// Ask the thread running `object` to stop. False if none is running.
    fn stop(&self, object: &ObjectRef) -> bool;
}

/// Restores the scheduler's timed-step flag when dropped.
#[must_use]
pub struct TimedStepGuard<'s> {
    scheduler: &'s dyn Scheduler,
    thread: &'s ThreadState,
}

impl<'s> TimedStepGuard<'s> {
    pub fn enter(scheduler: &'s dyn Scheduler, thread: &'s ThreadState) -> Self {
        scheduler.set_timed_step(thread, true);
        Self { scheduler, thread }
    }
}

impl Drop for TimedStepGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.set_timed_step(self.thread, false);
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// LocalScheduler
// ══════════════════════════════════════════════════════════════════════════════

struct ThreadRecord {
    state: Arc<ThreadState>,
    object: Option<ObjectRef>,
    clock: u64,
    yields: u64,
    timed_step: bool,
    running: bool,
    outcome: Option<EvalResult<Value>>,
}

#[derive(Default)]
struct Gate {
    holder: Option<ThreadId>,
}

struct Inner {
    next_id: AtomicU64,
    default_hz: u64,
    time_limit: Option<u64>,
    cpus: Mutex<HashMap<u32, u64>>,
    threads: Mutex<HashMap<ThreadId, ThreadRecord>>,
    handles: Mutex<Vec<(ThreadId, JoinHandle<()>)>>,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
    interrupt: Interrupt,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn with_record<R>(&self, id: ThreadId, f: impl FnOnce(&mut ThreadRecord) -> R) -> Option<R> {
        lock(&self.threads).get_mut(&id).map(f)
    }

    fn set_clock_at_least(&self, id: ThreadId, at: u64) -> u64 {
        self.with_record(id, |r| {
            r.clock = r.clock.max(at);
            r.clock
        })
        .unwrap_or(at)
    }

    fn finish(&self, id: ThreadId, result: EvalResult<Value>) {
        let result = match result {
            Err(EvalError::Stopped { .. }) => Ok(Value::Void),
            other => other,
        };
        match &result {
            Ok(v) => tracing::debug!(thread = id, result = %v, "thread finished"),
            Err(e) => tracing::warn!(thread = id, error = %e, "thread failed"),
        }
        self.with_record(id, |r| {
            r.running = false;
            if let Some(obj) = &r.object {
                obj.set_thread(None);
            }
            r.outcome = Some(result);
        });
    }

    fn run(&self, kind: ThreadKind, state: &Arc<ThreadState>, body: &ThreadBody) -> EvalResult<Value> {
        match kind {
            ThreadKind::Plain => body(state),
            ThreadKind::Periodic { period, offset, .. } => self.run_periodic(state, body, period, offset),
            ThreadKind::Sporadic {
                min_delay, offset, ..
            } => self.run_periodic(state, body, min_delay, offset),
        }
    }

    /// Activations start at `base + offset + k * period`; an activation that
    /// overruns its period delays the next one.
    fn run_periodic(
        &self,
        state: &Arc<ThreadState>,
        body: &ThreadBody,
        period: u64,
        offset: u64,
    ) -> EvalResult<Value> {
        let base = self.with_record(state.id(), |r| r.clock).unwrap_or(0);
        let mut activation = 0u64;
        loop {
            if state.stop_requested() {
                return Ok(Value::Void);
            }
            let release = base + offset + activation.saturating_mul(period.max(1));
            let now = self.set_clock_at_least(state.id(), release);
            if self.time_limit.is_some_and(|limit| now >= limit) {
                return Ok(Value::Void);
            }
            body(state)?;
            activation += 1;
        }
    }
}

/// Runs each simulated thread on its own OS thread with a private virtual
/// clock.
#[derive(Clone)]
pub struct LocalScheduler {
    inner: Arc<Inner>,
}

impl LocalScheduler {
    pub fn new(default_hz: u64, time_limit: Option<u64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                default_hz: default_hz.max(1),
                time_limit,
                cpus: Mutex::new(HashMap::new()),
                threads: Mutex::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                gate: Mutex::new(Gate::default()),
                gate_changed: Condvar::new(),
                interrupt: Interrupt::default(),
            }),
        }
    }

    /// Wait for every spawned thread, including threads spawned while
    /// waiting, and collect their outcomes.
    pub fn join_all(&self) -> Vec<ThreadOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let batch: Vec<_> = lock(&self.inner.handles).drain(..).collect();
            if batch.is_empty() {
                break;
            }
            for (id, handle) in batch {
                if handle.join().is_err() {
                    tracing::error!(thread = id, "thread panicked");
                }
                let taken = self.inner.with_record(id, |r| {
                    r.outcome.take().map(|res| (r.state.name().to_string(), res))
                });
                if let Some(Some((name, result))) = taken {
                    outcomes.push(ThreadOutcome { id, name, result });
                }
            }
        }
        outcomes.sort_by_key(|o| o.id);
        outcomes
    }
}

impl Scheduler for LocalScheduler {
    fn attach(&self, name: &str, cpu: u32) -> Arc<ThreadState> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = ThreadState::new(id, name, cpu);
        lock(&self.inner.threads).insert(
            id,
            ThreadRecord {
                state: state.clone(),
                object: None,
                clock: 0,
                yields: 0,
                timed_step: false,
                running: true,
                outcome: None,
            },
        );
        state
    }

    fn spawn(&self, request: SpawnRequest) -> std::io::Result<ThreadId> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cpu = request.object.as_ref().and_then(|o| o.cpu()).unwrap_or(0);
        let state = ThreadState::new(id, request.name.clone(), cpu);
        if let Some(obj) = &request.object {
            obj.set_thread(Some(id));
        }
        lock(&self.inner.threads).insert(
            id,
            ThreadRecord {
                state: state.clone(),
                object: request.object.clone(),
                clock: request.start_time,
                yields: 0,
                timed_step: false,
                running: true,
                outcome: None,
            },
        );
        tracing::debug!(thread = id, name = %request.name, kind = ?request.kind, "spawning thread");

        let inner = self.inner.clone();
        let kind = request.kind;
        let body = request.body;
        let spawned = std::thread::Builder::new()
            .name(request.name.clone())
            .spawn(move || {
                let result = inner.run(kind, &state, &body);
                inner.finish(state.id(), result);
            });
        match spawned {
            Ok(handle) => {
                lock(&self.inner.handles).push((id, handle));
                Ok(id)
            }
            Err(e) => {
                if let Some(obj) = &request.object {
                    obj.set_thread(None);
                }
                lock(&self.inner.threads).remove(&id);
                Err(e)
            }
        }
    }

    fn define_cpu(&self, cpu: u32, hz: u64) {
        lock(&self.inner.cpus).insert(cpu, hz.max(1));
    }

    fn deploy(&self, object: &ObjectRef, cpu: u32) {
        tracing::debug!(object = object.id(), cpu, "deploying object");
        object.deploy(cpu);
    }

    fn cycles_to_duration(&self, thread: &ThreadState, cycles: u64) -> u64 {
        let hz = lock(&self.inner.cpus)
            .get(&thread.cpu())
            .copied()
            .unwrap_or(self.inner.default_hz);
        ((cycles as u128 * 1_000_000_000) / hz as u128) as u64
    }

    fn charge(&self, thread: &ThreadState, duration: u64) {
        self.inner.with_record(thread.id(), |r| r.clock += duration);
    }

    fn time(&self, thread: &ThreadState) -> u64 {
        self.inner
            .with_record(thread.id(), |r| r.clock)
            .unwrap_or(0)
    }

    fn in_timed_step(&self, thread: &ThreadState) -> bool {
        self.inner
            .with_record(thread.id(), |r| r.timed_step)
            .unwrap_or(false)
    }

    fn set_timed_step(&self, thread: &ThreadState, on: bool) {
        self.inner.with_record(thread.id(), |r| r.timed_step = on);
    }

    fn yield_point(&self, thread: &ThreadState) {
        self.inner.with_record(thread.id(), |r| r.yields += 1);
        let mut gate = lock(&self.inner.gate);
        while gate.holder.is_some_and(|h| h != thread.id()) {
            gate = self
                .inner
                .gate_changed
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(gate);
        if !thread.is_atomic() {
            std::thread::yield_now();
        }
    }

    fn debugger_suspend(&self, thread: &ThreadState) {
        let mut gate = lock(&self.inner.gate);
        while gate.holder.is_some_and(|h| h != thread.id()) {
            gate = self
                .inner
                .gate_changed
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
        gate.holder = Some(thread.id());
    }

    fn debugger_resume(&self, thread: &ThreadState) {
        let mut gate = lock(&self.inner.gate);
        if gate.holder == Some(thread.id()) {
            gate.holder = None;
        }
        self.inner.gate_changed.notify_all();
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        let mut out: Vec<ThreadInfo> = lock(&self.inner.threads)
            .iter()
            .map(|(id, r)| ThreadInfo {
                id: *id,
                name: r.state.name().to_string(),
                object: r.object.as_ref().map(|o| o.id()),
                cpu: r.state.cpu(),
                time: r.clock,
                yields: r.yields,
                running: r.running,
            })
            .collect();
        out.sort_by_key(|t| t.id);
        out
    }

    fn time_limit(&self) -> Option<u64> {
        self.inner.time_limit
    }

    fn interrupt(&self) -> &Interrupt {
        &self.inner.interrupt
    }

    fn stop(&self, object: &ObjectRef) -> bool {
        let threads = lock(&self.inner.threads);
        let target = threads.values().find(|r| {
            r.running
                && r
                    .object
                    .as_ref()
                    .is_some_and(|o| Arc::ptr_eq(o, object))
        });
        match target {
            Some(r) => {
                r.state.request_stop();
                true
            }
            None => false,
        }
    }
}
