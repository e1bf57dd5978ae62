//! Runtime assembly and the embedding API.
//!
//! [`Runtime::builder`] wires a model to its collaborators (scheduler,
//! debugger control, delegates, log sink), initialises module and class
//! level state, and hands back an [`Evaluator`] that drives everything else.

use crate::context::{ClassScope, Context, Globals, RootKind, StateScope, ThreadState};
use crate::coverage::Coverage;
use crate::debug::{DebugControl, StopCondition};
use crate::delegate::DelegateRegistry;
use crate::error::{EvalError, EvalResult};
use crate::evaluator::Evaluator;
use crate::log::{LogSink, TracingSink};
use crate::scheduler::{InterruptLevel, LocalScheduler, Scheduler};
use crate::settings::Settings;
use std::sync::Arc;
use tempo_types::ast::{ClassDef, Definition, DefinitionKind, Expr, Model, Name, Stmt};
use tempo_types::value::{FunctionValue, OperationValue};
use tempo_types::{Cell, ErrorCode, Location, ObjectRef, Value};

/// Everything an evaluator shares across threads.
pub struct Runtime {
    pub(crate) model: Arc<Model>,
    pub(crate) settings: Settings,
    pub(crate) globals: Arc<Globals>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) debug: Arc<DebugControl>,
    pub(crate) delegates: Arc<DelegateRegistry>,
    pub(crate) log: Arc<dyn LogSink>,
    pub(crate) main: Arc<ThreadState>,
}

impl Runtime {
    pub fn builder(model: Model) -> RuntimeBuilder {
        RuntimeBuilder::new(model)
    }
}

pub struct RuntimeBuilder {
    model: Arc<Model>,
    settings: Settings,
    scheduler: Option<Arc<dyn Scheduler>>,
    debug: Option<Arc<DebugControl>>,
    delegates: Option<Arc<DelegateRegistry>>,
    log: Option<Arc<dyn LogSink>>,
}

impl RuntimeBuilder {
    pub fn new(model: Model) -> Self {
        Self {
            model: Arc::new(model),
            settings: Settings::default(),
            scheduler: None,
            debug: None,
            delegates: None,
            log: None,
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Defaults to a [`LocalScheduler`] built from the settings.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn debug(mut self, debug: Arc<DebugControl>) -> Self {
        self.debug = Some(debug);
        self
    }

    pub fn delegates(mut self, delegates: Arc<DelegateRegistry>) -> Self {
        self.delegates = Some(delegates);
        self
    }

    /// Defaults to [`TracingSink`].
    pub fn log(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = Some(log);
        self
    }

    /// Build the runtime and initialise module values, state records and
    /// class statics, in definition order.
    pub fn build(self) -> EvalResult<Evaluator> {
        let settings = self.settings;
        let scheduler = self.scheduler.unwrap_or_else(|| {
            Arc::new(LocalScheduler::new(settings.default_cpu_hz, settings.time_limit))
        });
        let classes = self
            .model
            .classes
            .iter()
            .map(|c| Arc::new(ClassScope::new(Arc::new(c.clone()))));
        let states = self.model.modules.iter().filter_map(|m| {
            let state = m.state.as_ref()?;
            let cells = state
                .fields
                .iter()
                .map(|f| (f.name.clone(), Cell::new(Value::Nil, f.ty.clone())))
                .collect();
            Some(Arc::new(StateScope::new(&m.name, cells)))
        });
        let globals = Arc::new(Globals::new(classes, states));
        let main = scheduler.attach("main", 0);

        let evaluator = Evaluator {
            rt: Arc::new(Runtime {
                model: self.model,
                settings,
                globals,
                scheduler,
                debug: self.debug.unwrap_or_default(),
                delegates: self.delegates.unwrap_or_default(),
                log: self.log.unwrap_or_else(|| Arc::new(TracingSink)),
                main,
            }),
        };
        evaluator.initialise()?;
        tracing::debug!(
            modules = evaluator.model().modules.len(),
            classes = evaluator.model().classes.len(),
            dialect = ?evaluator.settings().dialect,
            "runtime initialised"
        );
        Ok(evaluator)
    }
}

impl Evaluator {
    // ── Accessors ────────────────────────────────────────────────────────

    pub fn settings(&self) -> &Settings {
        &self.rt.settings
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.rt.scheduler
    }

    pub fn debug(&self) -> &Arc<DebugControl> {
        &self.rt.debug
    }

    pub fn globals(&self) -> &Arc<Globals> {
        &self.rt.globals
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.rt.model
    }

    /// The thread that runs entry calls.
    pub fn main_thread(&self) -> &Arc<ThreadState> {
        &self.rt.main
    }

    pub(crate) fn delegates(&self) -> &DelegateRegistry {
        &self.rt.delegates
    }

    pub(crate) fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.rt.log
    }

    fn global_context(&self, title: &str) -> Context<'static> {
        Context::root(
            RootKind::Global,
            title,
            &Location::internal("<global>"),
            None,
            self.rt.main.clone(),
            self.rt.globals.clone(),
        )
    }

    // ── Initialisation ───────────────────────────────────────────────────

    fn initialise(&self) -> EvalResult<()> {
        let model = self.model().clone();
        let globals = self.globals();

        for module in &model.modules {
            for func in &module.functions {
                globals.define(func.name.clone(), function_value(func, None));
            }
            for op in &module.operations {
                globals.define(op.name.clone(), operation_value(op, None));
            }
        }
        for scope in globals.classes() {
            let class = Some(scope.name());
            for func in &scope.def.functions {
                scope.define(func.name.clone(), function_value(func, class));
            }
            for op in scope.def.operations.iter().filter(|op| op.is_static) {
                scope.define(op.name.clone(), operation_value(op, class));
            }
        }

        let root = self.global_context("initialisation");
        for module in &model.modules {
            for (name, value) in self.eval_values(&module.values, &root)? {
                globals.define(name, value);
            }
            let (Some(state_def), Some(state)) = (&module.state, globals.state(&module.name)) else {
                continue;
            };
            let ctx = Context::call(&root, RootKind::State(state.clone()), None, &state_def.name, &state_def.location);
            for (field, (_, cell)) in state_def.fields.iter().zip(state.fields()) {
                let Some(init) = &field.init else { continue };
                let value = self.eval_expr(init, &ctx)?;
                cell.assign(&value).map_err(|e| self.lift(e, &init.location, &ctx))?;
            }
        }
        for scope in globals.classes() {
            self.initialise_class(scope, &root)?;
        }
        Ok(())
    }

    fn initialise_class(&self, scope: &Arc<ClassScope>, root: &Context<'_>) -> EvalResult<()> {
        let def: &ClassDef = &scope.def;
        let ctx = Context::call(root, RootKind::ClassStatic(scope.clone()), None, &def.name, &def.location);
        for (name, value) in self.eval_values(&def.values, &ctx)? {
            scope.define(name, value);
        }
        for var in def.instance_vars.iter().filter(|v| v.is_static) {
            let value = match &var.init {
                Some(init) => self
                    .eval_expr(init, &ctx)?
                    .convert_to(&var.ty)
                    .map_err(|e| self.lift(e, &var.location, &ctx))?,
                None => Value::Nil,
            };
            scope.define(var.name.clone(), Value::Updatable(Cell::new(value, var.ty.clone())));
        }
        Ok(())
    }

    /// Evaluate a value definition list, each definition seeing the ones
    /// before it.
    fn eval_values(&self, defs: &[Definition], ctx: &Context<'_>) -> EvalResult<Vec<(Name, Value)>> {
        if defs.is_empty() {
            return Ok(Vec::new());
        }
        let location = &defs[0].location;
        let child = self.eval_definitions(defs, location, ctx)?;
        let mut out = Vec::new();
        for def in defs {
            match &def.kind {
                DefinitionKind::Value { pattern, .. } => {
                    for name in pattern_names(pattern) {
                        if let Some(value) = child.lookup(&name) {
                            out.push((name, value));
                        }
                    }
                }
                DefinitionKind::Function(func) => {
                    if let Some(value) = child.lookup(&func.name) {
                        out.push((func.name.clone(), value));
                    }
                }
            }
        }
        Ok(out)
    }

    // ── Entry points ─────────────────────────────────────────────────────

    /// Call a module routine, or a static routine of a class, on the main
    /// thread.
    pub fn call(&self, owner: &str, operation: &str, args: Vec<Value>) -> EvalResult<Value> {
        let root = self.global_context("entry");
        let Some(callee) = self.resolve_entry(owner, operation, args.len()) else {
            return Err(EvalError::runtime(
                ErrorCode::UNRESOLVED_CALL,
                format!("{owner}`{operation} not found"),
                root.location(),
                root.title(),
            ));
        };
        let location = root.location().clone();
        let result = self.apply(callee, args, &location, &root);
        if let Err(e) = &result {
            tracing::debug!(owner, operation, error = %e, "entry call failed");
        }
        result
    }

    fn resolve_entry(&self, owner: &str, operation: &str, arity: usize) -> Option<Value> {
        let model = self.model();
        if let Some(module) = model.module(owner) {
            let name = module
                .operations
                .iter()
                .filter(|op| op.name.text == operation && op.params.len() == arity)
                .map(|op| &op.name)
                .chain(
                    module
                        .functions
                        .iter()
                        .filter(|f| f.name.text == operation && f.params.len() == arity)
                        .map(|f| &f.name),
                )
                .next()?;
            return self.globals().lookup(name);
        }
        let scope = self.globals().class(owner)?;
        let def = &scope.def;
        let name = def
            .operations
            .iter()
            .filter(|op| op.is_static && op.name.text == operation && op.params.len() == arity)
            .map(|op| &op.name)
            .chain(
                def.functions
                    .iter()
                    .filter(|f| f.name.text == operation && f.params.len() == arity)
                    .map(|f| &f.name),
            )
            .next()?;
        scope.lookup(name)
    }

    /// Invoke an operation on an existing object from the main thread.
    pub fn call_method(&self, object: &ObjectRef, operation: &str, args: Vec<Value>) -> EvalResult<Value> {
        let root = self.global_context("entry");
        let member = object
            .member_names()
            .into_iter()
            .filter(|n| n.text == operation)
            .filter_map(|n| object.member(&n))
            .find(|m| match m {
                Value::Operation(op) => op.def.params.len() == args.len(),
                Value::Function(f) => f.def.params.len() == args.len(),
                _ => false,
            });
        let Some(member) = member else {
            return Err(EvalError::runtime(
                ErrorCode::UNRESOLVED_CALL,
                format!("{} has no operation {operation}", Value::Object(object.clone())),
                root.location(),
                root.title(),
            ));
        };
        let location = root.location().clone();
        self.apply(member, args, &location, &root)
    }

    /// `new class(args)` on the main thread.
    pub fn new_instance(&self, class: &str, args: Vec<Value>) -> EvalResult<ObjectRef> {
        let root = self.global_context("entry");
        let location = root.location().clone();
        self.new_object(class, args, &location, &root)
    }

    /// Evaluate a free-standing expression in the global context.
    pub fn evaluate(&self, expr: &Expr) -> EvalResult<Value> {
        let root = self.global_context("evaluate");
        self.eval_expr(expr, &root)
    }

    /// Execute a free-standing statement in the global context.
    pub fn execute(&self, stmt: &Stmt) -> EvalResult<Value> {
        let root = self.global_context("execute");
        self.eval_stmt(stmt, &root)
    }

    /// Raise a one-shot interrupt, picked up by the next checked node of
    /// whichever thread gets there first.
    pub fn set_interrupt(&self, level: InterruptLevel) {
        tracing::debug!(?level, "interrupt requested");
        self.scheduler().interrupt().set(level);
    }

    /// Set a stoppoint on the first statement of `file` at `line`.
    pub fn break_at(&self, file: &str, line: u32, condition: StopCondition) -> Option<u32> {
        let stmt = self.model().find_statement(file, line)?;
        Some(self.debug().set_stoppoint(stmt.id, &stmt.location, condition))
    }

    /// Set a tracepoint on the first statement of `file` at `line`.
    pub fn trace_at(&self, file: &str, line: u32, exprs: Vec<Expr>) -> Option<u32> {
        let stmt = self.model().find_statement(file, line)?;
        Some(self.debug().set_tracepoint(stmt.id, &stmt.location, exprs))
    }

    pub fn coverage(&self) -> Coverage {
        Coverage::collect(self.model())
    }
}

fn function_value(def: &Arc<tempo_types::ast::FunctionDef>, class: Option<&str>) -> Value {
    Value::Function(Arc::new(FunctionValue {
        def: def.clone(),
        free_vars: None,
        class: class.map(str::to_string),
        self_obj: None,
    }))
}

fn operation_value(def: &Arc<tempo_types::ast::OperationDef>, class: Option<&str>) -> Value {
    Value::Operation(Arc::new(OperationValue {
        def: def.clone(),
        class: class.map(str::to_string),
        self_obj: None,
    }))
}

fn pattern_names(pattern: &tempo_types::ast::Pattern) -> Vec<Name> {
    use tempo_types::ast::PatternKind;
    match &pattern.kind {
        PatternKind::Ident(name) => vec![name.clone()],
        PatternKind::Ignore | PatternKind::Literal(_) => Vec::new(),
        PatternKind::Tuple(ps) | PatternKind::Seq(ps) | PatternKind::Record { fields: ps, .. } => {
            ps.iter().flat_map(pattern_names).collect()
        }
    }
}
