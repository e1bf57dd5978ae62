//! Scoped name resolution.
//!
//! A [`Context`] is one scope level with a single borrowed outer link. Root
//! contexts start a new frame (an operation or function call, a thread body)
//! and stop ordinary lookup: from a root, resolution escalates through the
//! root's overlay (free variables, then statics / self members / state
//! record) straight to the [`Globals`], never further along the chain. The
//! outer link of a root is still kept so that stepping and stack display can
//! see the caller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tempo_types::ast::{ClassDef, Name};
use tempo_types::{Bindings, Cell, Location, ObjectRef, Value};

// ══════════════════════════════════════════════════════════════════════════════
// Global scope
// ══════════════════════════════════════════════════════════════════════════════

/// Static members of one class.
#[derive(Debug)]
pub struct ClassScope {
    pub def: Arc<ClassDef>,
    statics: RwLock<BTreeMap<Name, Value>>,
}

impl ClassScope {
    pub fn new(def: Arc<ClassDef>) -> Self {
        Self {
            def,
            statics: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn define(&self, name: Name, value: Value) {
        self.statics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
    }

    pub fn lookup(&self, name: &Name) -> Option<Value> {
        self.statics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// The state record of a module, one cell per field.
#[derive(Debug)]
pub struct StateScope {
    pub module: String,
    fields: Vec<(Name, Cell)>,
}

impl StateScope {
    pub fn new(module: impl Into<String>, fields: Vec<(Name, Cell)>) -> Self {
        Self {
            module: module.into(),
            fields,
        }
    }

    pub fn lookup(&self, name: &Name) -> Option<Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cell)| Value::Updatable(cell.clone()))
    }

    pub fn fields(&self) -> &[(Name, Cell)] {
        &self.fields
    }
}

/// The single global root: module level definitions, class statics and
/// module state records.
#[derive(Debug, Default)]
pub struct Globals {
    values: RwLock<BTreeMap<Name, Value>>,
    classes: BTreeMap<String, Arc<ClassScope>>,
    states: BTreeMap<String, Arc<StateScope>>,
}

impl Globals {
    pub fn new(
        classes: impl IntoIterator<Item = Arc<ClassScope>>,
        states: impl IntoIterator<Item = Arc<StateScope>>,
    ) -> Self {
        Self {
            values: RwLock::new(BTreeMap::new()),
            classes: classes
                .into_iter()
                .map(|c| (c.name().to_string(), c))
                .collect(),
            states: states.into_iter().map(|s| (s.module.clone(), s)).collect(),
        }
    }

    pub fn define(&self, name: Name, value: Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
    }

    /// Module level names, then the statics of the class the name is
    /// qualified with.
    pub fn lookup(&self, name: &Name) -> Option<Value> {
        let found = self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        found.or_else(|| self.class(&name.module).and_then(|c| c.lookup(name)))
    }

    pub fn class(&self, name: &str) -> Option<&Arc<ClassScope>> {
        self.classes.get(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassScope>> {
        self.classes.values()
    }

    pub fn state(&self, module: &str) -> Option<&Arc<StateScope>> {
        self.states.get(module)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Thread state
// ══════════════════════════════════════════════════════════════════════════════

pub type ThreadId = u64;

/// Stepping target of a thread: stop when execution reaches a line other
/// than `line`, subject to the next/out context markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepState {
    pub line: Option<u32>,
    pub next: Option<ContextId>,
    pub out: Option<ContextId>,
}

/// Per simulated thread bookkeeping shared by every context of that thread.
#[derive(Debug)]
pub struct ThreadState {
    id: ThreadId,
    name: String,
    cpu: u32,
    atomic_depth: AtomicU32,
    pure_depth: AtomicU32,
    debugging: AtomicU32,
    stop_requested: AtomicBool,
    step: Mutex<StepState>,
}

impl ThreadState {
    pub fn new(id: ThreadId, name: impl Into<String>, cpu: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            cpu,
            atomic_depth: AtomicU32::new(0),
            pure_depth: AtomicU32::new(0),
            debugging: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            step: Mutex::new(StepState::default()),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Virtual CPU the thread is bound to; 0 is the default CPU.
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Suppress time accounting and preemption until the guard drops.
    pub fn atomic(&self) -> DepthGuard<'_> {
        DepthGuard::enter(&self.atomic_depth)
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic_depth.load(Ordering::Relaxed) > 0
    }

    /// Suppress side-effect tracking until the guard drops.
    pub fn pure(&self) -> DepthGuard<'_> {
        DepthGuard::enter(&self.pure_depth)
    }

    pub fn is_pure(&self) -> bool {
        self.pure_depth.load(Ordering::Relaxed) > 0
    }

    /// Mark the thread as evaluating on behalf of the debugger.
    pub fn debugging(&self) -> DepthGuard<'_> {
        DepthGuard::enter(&self.debugging)
    }

    pub fn is_debugging(&self) -> bool {
        self.debugging.load(Ordering::Relaxed) > 0
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn step_state(&self) -> StepState {
        *self.step.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_breaks(&self, line: Option<u32>, next: Option<ContextId>, out: Option<ContextId>) {
        *self.step.lock().unwrap_or_else(PoisonError::into_inner) = StepState { line, next, out };
    }

    pub fn clear_breaks(&self) {
        self.set_breaks(None, None, None);
    }

    pub fn is_stepping(&self) -> bool {
        self.step_state().line.is_some()
    }
}

/// Increments a nesting counter; decrements it again on drop.
#[must_use]
pub struct DepthGuard<'t>(&'t AtomicU32);

impl<'t> DepthGuard<'t> {
    fn enter(counter: &'t AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Contexts
// ══════════════════════════════════════════════════════════════════════════════

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn fresh() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The overlay a root context adds before escalating to the globals.
#[derive(Debug, Clone)]
pub enum RootKind {
    Global,
    ClassStatic(Arc<ClassScope>),
    Object(ObjectRef),
    State(Arc<StateScope>),
}

/// The operation or function a root context was created to run.
#[derive(Debug, Clone)]
pub struct Routine {
    pub name: Name,
    pub args: Vec<Value>,
}

#[derive(Debug)]
struct Root {
    kind: RootKind,
    free_vars: Option<Arc<Bindings>>,
    routine: Option<Routine>,
}

/// One call-stack frame as shown to a debugger.
#[derive(Debug, Clone)]
pub struct Frame {
    pub title: String,
    pub location: Location,
}

#[derive(Debug)]
pub struct Context<'a> {
    id: ContextId,
    title: String,
    location: Location,
    bindings: BTreeMap<Name, Value>,
    outer: Option<&'a Context<'a>>,
    root: Option<Root>,
    thread: Arc<ThreadState>,
    globals: Arc<Globals>,
}

impl<'a> Context<'a> {
    /// A root context.
    pub fn root(
        kind: RootKind,
        title: impl Into<String>,
        location: &Location,
        outer: Option<&'a Context<'a>>,
        thread: Arc<ThreadState>,
        globals: Arc<Globals>,
    ) -> Self {
        Self {
            id: ContextId::fresh(),
            title: title.into(),
            location: location.clone(),
            bindings: BTreeMap::new(),
            outer,
            root: Some(Root {
                kind,
                free_vars: None,
                routine: None,
            }),
            thread,
            globals,
        }
    }

    /// A root context for a call made from `caller`.
    pub fn call(
        caller: &'a Context<'a>,
        kind: RootKind,
        free_vars: Option<Arc<Bindings>>,
        title: impl Into<String>,
        location: &Location,
    ) -> Self {
        let mut ctx = Self::root(
            kind,
            title,
            location,
            Some(caller),
            caller.thread.clone(),
            caller.globals.clone(),
        );
        if let Some(root) = ctx.root.as_mut() {
            root.free_vars = free_vars;
        }
        ctx
    }

    /// Record which routine this root context runs.
    pub fn with_routine(mut self, routine: Routine) -> Self {
        if let Some(root) = self.root.as_mut() {
            root.routine = Some(routine);
        }
        self
    }

    /// The routine of the nearest root context.
    pub fn routine(&self) -> Option<&Routine> {
        self.root_of().root.as_ref().and_then(|r| r.routine.as_ref())
    }

    /// A child scope inheriting the outer's thread state.
    pub fn derive(outer: &'a Context<'a>, title: impl Into<String>, location: &Location) -> Self {
        Self {
            id: ContextId::fresh(),
            title: title.into(),
            location: location.clone(),
            bindings: BTreeMap::new(),
            outer: Some(outer),
            root: None,
            thread: outer.thread.clone(),
            globals: outer.globals.clone(),
        }
    }

    pub fn bind(&mut self, name: Name, value: Value) {
        self.bindings.insert(name, value);
    }

    pub fn bind_all(&mut self, bindings: impl IntoIterator<Item = (Name, Value)>) {
        self.bindings.extend(bindings);
    }

    /// Resolve a name: local scopes up to the nearest root, then that root's
    /// overlay, then the globals.
    pub fn lookup(&self, name: &Name) -> Option<Value> {
        let mut ctx = self;
        loop {
            if let Some(v) = ctx.bindings.get(name) {
                return Some(v.clone());
            }
            match (&ctx.root, ctx.outer) {
                (Some(root), _) => return ctx.lookup_overlay(root, name),
                (None, Some(outer)) => ctx = outer,
                (None, None) => return self.globals.lookup(name),
            }
        }
    }

    fn lookup_overlay(&self, root: &Root, name: &Name) -> Option<Value> {
        if let Some(v) = root.free_vars.as_ref().and_then(|f| f.get(name)) {
            return Some(v.clone());
        }
        let overlay = match &root.kind {
            RootKind::Global => None,
            RootKind::ClassStatic(class) => class.lookup(name),
            RootKind::Object(obj) => obj.member(name).or_else(|| {
                self.globals
                    .class(obj.class())
                    .and_then(|class| class.lookup(name))
            }),
            RootKind::State(state) => state.lookup(name),
        };
        overlay.or_else(|| self.globals.lookup(name))
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn thread(&self) -> &Arc<ThreadState> {
        &self.thread
    }

    pub fn globals(&self) -> &Arc<Globals> {
        &self.globals
    }

    pub fn outer(&self) -> Option<&'a Context<'a>> {
        self.outer
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    /// The nearest root context at or above this one.
    pub fn root_of(&self) -> &Context<'a> {
        let mut ctx = self;
        while ctx.root.is_none() {
            match ctx.outer {
                Some(outer) => ctx = outer,
                None => break,
            }
        }
        ctx
    }

    pub fn root_kind(&self) -> Option<&RootKind> {
        self.root_of().root.as_ref().map(|r| &r.kind)
    }

    /// The object `self` refers to in this frame, if any.
    pub fn self_object(&self) -> Option<ObjectRef> {
        match self.root_kind() {
            Some(RootKind::Object(obj)) => Some(obj.clone()),
            _ => None,
        }
    }

    /// Whether `id` names a strict ancestor of this context.
    pub fn has_ancestor(&self, id: ContextId) -> bool {
        let mut ctx = self.outer;
        while let Some(c) = ctx {
            if c.id == id {
                return true;
            }
            ctx = c.outer;
        }
        false
    }

    /// Number of contexts in the chain, this one included.
    pub fn depth(&self) -> usize {
        let mut n = 1;
        let mut ctx = self.outer;
        while let Some(c) = ctx {
            n += 1;
            ctx = c.outer;
        }
        n
    }

    /// Root contexts from innermost outwards.
    pub fn frames(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut ctx = Some(self);
        while let Some(c) = ctx {
            if c.root.is_some() {
                frames.push(Frame {
                    title: c.title.clone(),
                    location: c.location.clone(),
                });
            }
            ctx = c.outer;
        }
        frames
    }

    /// All bindings visible without escalating past the nearest root,
    /// innermost shadowing outermost. Local function values capture these.
    pub fn visible_bindings(&self) -> Bindings {
        let mut out = Bindings::new();
        let mut ctx = self;
        loop {
            for (k, v) in &ctx.bindings {
                out.entry(k.clone()).or_insert_with(|| v.clone());
            }
            if let Some(root) = &ctx.root {
                if let Some(free) = &root.free_vars {
                    for (k, v) in free.iter() {
                        out.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                return out;
            }
            match ctx.outer {
                Some(outer) => ctx = outer,
                None => return out,
            }
        }
    }
}
