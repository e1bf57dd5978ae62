//! Statement evaluation.
//!
//! [`Evaluator::eval_stmt`] is the single entry point for statements. It runs
//! the breakpoint check for the node, then dispatches on the statement kind.
//! Non-local control flow travels as [`EvalError`]: `exit` as
//! [`EvalError::Exit`], fatal failures as [`EvalError::Runtime`]. `return`
//! is an ordinary non-void result that blocks and loops stop at.

use crate::context::{Context, RootKind, Routine, ThreadState};
use crate::debug::StopReason;
use crate::delegate::{DelegateCall, CPU_CLASS};
use crate::error::{EvalError, EvalResult};
use crate::pattern::{self, Matched};
use crate::realtime::Cost;
use crate::runtime::Runtime;
use crate::scheduler::{SpawnRequest, ThreadBody, ThreadKind};
use std::sync::Arc;
use tempo_types::ast::*;
use tempo_types::value::{FunctionValue, OperationValue};
use tempo_types::{Cell, CellOwner, ErrorCode, Location, ObjectRef, ObjectValue, Value, ValueError};

/// Walks the executable tree. Cheap to clone; clones share one runtime.
#[derive(Clone)]
pub struct Evaluator {
    pub(crate) rt: Arc<Runtime>,
}

/// One step of an assignment target below its root cell.
#[derive(Debug, Clone)]
enum Segment {
    Field(Name),
    Index(i64),
}

impl Evaluator {
    // ══════════════════════════════════════════════════════════════════════
    // Errors
    // ══════════════════════════════════════════════════════════════════════

    /// Build a fatal error at `location`.
    ///
    /// With exceptions enabled the error becomes `exit mk_(code, message)`
    /// instead, so trap and tixe can intercept it.
    pub(crate) fn fail(
        &self,
        code: ErrorCode,
        message: impl Into<String>,
        location: &Location,
        ctx: &Context<'_>,
    ) -> EvalError {
        let message = message.into();
        if self.settings().exceptions {
            let value = Value::Tuple(vec![Value::Int(i64::from(code.0)), Value::text(&message)]);
            return self.raise(value, location, ctx);
        }
        tracing::debug!(code = code.0, category = %code.category(), %location, %message, "runtime error");
        self.report_fatal(&format!("{code}: {message}"), location, ctx);
        EvalError::runtime(code, message, location, ctx.root_of().title())
    }

    pub(crate) fn lift(&self, err: ValueError, location: &Location, ctx: &Context<'_>) -> EvalError {
        self.fail(err.code(), err.to_string(), location, ctx)
    }

    /// An exit signal, offered to the catchpoints first.
    pub(crate) fn raise(&self, value: Value, location: &Location, ctx: &Context<'_>) -> EvalError {
        if let Err(e) = self.check_catchpoints(&value, location, ctx) {
            return e;
        }
        EvalError::exit(value, location)
    }

    // ══════════════════════════════════════════════════════════════════════
    // Statements
    // ══════════════════════════════════════════════════════════════════════

    /// Evaluate one statement.
    pub fn eval_stmt(&self, stmt: &Stmt, ctx: &Context<'_>) -> EvalResult<Value> {
        self.check(stmt.id, &stmt.location, ctx)?;
        let loc = &stmt.location;
        match &stmt.kind {
            StmtKind::Assign(a) => {
                let value = self.eval_expr(&a.value, ctx)?;
                self.assign(&a.target, value, &a.location, ctx)?;
                Ok(Value::Void)
            }
            StmtKind::Atomic(assignments) => self.eval_atomic(assignments, ctx),
            StmtKind::Block { dcls, body } => self.eval_block(dcls, body, loc, ctx),
            StmtKind::Let { defs, body } | StmtKind::Def { defs, body } => {
                let child = self.eval_definitions(defs, loc, ctx)?;
                self.eval_stmt(body, &child)
            }
            StmtKind::LetBeSt {
                binds,
                predicate,
                body,
            } => self.eval_let_be(binds, predicate.as_ref(), body, loc, ctx),
            StmtKind::If {
                condition,
                then_branch,
                elseifs,
                else_branch,
            } => {
                if self.eval_condition(condition, ctx)? {
                    return self.eval_stmt(then_branch, ctx);
                }
                for (c, s) in elseifs {
                    if self.eval_condition(c, ctx)? {
                        return self.eval_stmt(s, ctx);
                    }
                }
                match else_branch {
                    Some(s) => self.eval_stmt(s, ctx),
                    None => Ok(Value::Void),
                }
            }
            StmtKind::Cases {
                selector,
                alternatives,
                others,
            } => self.eval_cases(selector, alternatives, others.as_deref(), loc, ctx),
            StmtKind::ForIndex {
                var,
                from,
                to,
                by,
                body,
            } => self.eval_for_index(var, from, to, by.as_ref(), body, loc, ctx),
            StmtKind::ForAll { pattern, set, body } => self.eval_for_all(pattern, set, body, loc, ctx),
            StmtKind::ForPattern {
                bind,
                seq,
                reverse,
                body,
            } => self.eval_for_pattern(bind, seq, *reverse, body, loc, ctx),
            StmtKind::While { condition, body } => self.eval_while(condition, body, loc, ctx),
            StmtKind::Call { name, args } => self.eval_call(name, args, loc, ctx),
            StmtKind::CallObject {
                designator,
                field,
                args,
            } => self.eval_object_call(designator, field, args, loc, ctx),
            StmtKind::Start(e) => {
                let obj = self.eval_object(e, ctx)?;
                self.start(&obj, loc, ctx)?;
                Ok(Value::Void)
            }
            StmtKind::StartList(e) => {
                for obj in self.eval_object_set(e, ctx)? {
                    self.start(&obj, loc, ctx)?;
                }
                Ok(Value::Void)
            }
            StmtKind::Stop(e) => {
                let obj = self.eval_object(e, ctx)?;
                self.stop(&obj);
                Ok(Value::Void)
            }
            StmtKind::StopList(e) => {
                for obj in self.eval_object_set(e, ctx)? {
                    self.stop(&obj);
                }
                Ok(Value::Void)
            }
            StmtKind::Cycles { cycles, body } => self.eval_timed(Cost::Cycles(cycles), body, loc, ctx),
            StmtKind::Duration { duration, body } => {
                self.eval_timed(Cost::Duration(duration), body, loc, ctx)
            }
            StmtKind::Always { cleanup, body } => self.eval_always(cleanup, body, ctx),
            StmtKind::Trap {
                bind,
                handler,
                body,
            } => self.eval_trap(bind, handler, body, loc, ctx),
            StmtKind::Tixe { alternatives, body } => self.eval_tixe(alternatives, body, loc, ctx),
            StmtKind::Exit(e) => {
                let value = match e {
                    Some(e) => self.eval_expr(e, ctx)?,
                    None => Value::Void,
                };
                Err(self.raise(value, loc, ctx))
            }
            StmtKind::Return(e) => match e {
                Some(e) => {
                    let value = self.eval_expr(e, ctx)?;
                    Ok(if value.is_void() { Value::VoidReturn } else { value })
                }
                None => Ok(Value::VoidReturn),
            },
            StmtKind::ClassInvariant(clauses) => self.eval_invariant(clauses, ctx).map(Value::Bool),
            StmtKind::NotYetSpecified => self.eval_not_yet_specified(loc, ctx),
            StmtKind::Skip => Ok(Value::Void),
        }
    }

    // ── Assignment ───────────────────────────────────────────────────────

    fn assign(&self, target: &Designator, value: Value, loc: &Location, ctx: &Context<'_>) -> EvalResult<()> {
        let (cell, path) = self.resolve_target(target, loc, ctx)?;
        let stored = if path.is_empty() {
            cell.assign(&value)
        } else {
            update_path(&cell.get(), &path, value).and_then(|v| cell.assign(&v))
        };
        stored.map_err(|e| self.lift(e, loc, ctx))?;

        if self.settings().log_instance_changes && !ctx.thread().is_pure() {
            if let Some(owner) = cell.owner() {
                self.log(
                    ctx,
                    format!(
                        "instance variable {}`{} of #{} changed to {}",
                        owner.class,
                        owner.field,
                        owner.object,
                        cell.get()
                    ),
                );
            }
        }
        Ok(())
    }

    fn resolve_target(
        &self,
        target: &Designator,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<(Cell, Vec<Segment>)> {
        match target {
            Designator::Name(name) => {
                let value = ctx
                    .lookup(name)
                    .ok_or_else(|| self.fail(ErrorCode::NAME_NOT_FOUND, format!("name {name} not in scope"), loc, ctx))?;
                let cell = value.cell_value().map_err(|e| self.lift(e, loc, ctx))?;
                Ok((cell, Vec::new()))
            }
            Designator::Field { object, field } => {
                let (cell, mut path) = self.resolve_target(object, loc, ctx)?;
                if path.is_empty() {
                    if let Value::Object(obj) = cell.get().deref() {
                        let inner = obj
                            .field(field)
                            .and_then(|member| member.cell_value())
                            .map_err(|e| self.lift(e, loc, ctx))?;
                        return Ok((inner, Vec::new()));
                    }
                }
                path.push(Segment::Field(field.clone()));
                Ok((cell, path))
            }
            Designator::Index { seq, index } => {
                let (cell, mut path) = self.resolve_target(seq, loc, ctx)?;
                let i = self.eval_int(index, ctx)?;
                path.push(Segment::Index(i));
                Ok((cell, path))
            }
        }
    }

    fn eval_atomic(&self, assignments: &[Assignment], ctx: &Context<'_>) -> EvalResult<Value> {
        let _atomic = ctx.thread().atomic();
        let values = assignments
            .iter()
            .map(|a| self.eval_expr(&a.value, ctx))
            .collect::<EvalResult<Vec<_>>>()?;
        for (a, value) in assignments.iter().zip(values) {
            self.assign(&a.target, value, &a.location, ctx)?;
        }
        Ok(Value::Void)
    }

    // ── Scopes ───────────────────────────────────────────────────────────

    fn eval_block(&self, dcls: &[Dcl], body: &[Stmt], loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        let mut child = Context::derive(ctx, "block", loc);
        for dcl in dcls {
            let initial = match &dcl.init {
                Some(init) => {
                    let value = self.eval_expr(init, &child)?;
                    value
                        .convert_to(&dcl.ty)
                        .map_err(|e| self.lift(e, &dcl.location, &child))?
                }
                None => Value::Nil,
            };
            child.bind(dcl.name.clone(), Value::Updatable(Cell::new(initial, dcl.ty.clone())));
        }
        for stmt in body {
            let value = self.eval_stmt(stmt, &child)?;
            if !value.is_void() {
                return Ok(value);
            }
        }
        Ok(Value::Void)
    }

    /// Evaluate definitions in order into one child context, each seeing
    /// the ones before it.
    pub(crate) fn eval_definitions<'c>(
        &self,
        defs: &[Definition],
        loc: &Location,
        ctx: &'c Context<'c>,
    ) -> EvalResult<Context<'c>> {
        let mut child = Context::derive(ctx, "let", loc);
        for def in defs {
            match &def.kind {
                DefinitionKind::Value { pattern, ty, expr } => {
                    let mut value = self.eval_expr(expr, &child)?;
                    if let Some(ty) = ty {
                        value = value
                            .convert_to(ty)
                            .map_err(|e| self.lift(e, &def.location, &child))?;
                    }
                    let matched = self.match_or_fail(pattern, &value, &def.location, &child)?;
                    child.bind_all(matched);
                }
                DefinitionKind::Function(func) => {
                    let value = local_function(func, &child);
                    child.bind(func.name.clone(), value);
                }
            }
        }
        Ok(child)
    }

    pub(crate) fn match_or_fail(
        &self,
        pattern: &Pattern,
        value: &Value,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Matched> {
        pattern::match_pattern(pattern, value).ok_or_else(|| {
            self.fail(
                ErrorCode::PATTERN_MISMATCH,
                format!("value {value} does not match pattern"),
                loc,
                ctx,
            )
        })
    }

    fn eval_let_be(
        &self,
        binds: &[Bind],
        predicate: Option<&Expr>,
        body: &Stmt,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        for matched in self.bind_combinations(binds, loc, ctx)? {
            let mut child = Context::derive(ctx, "let be st", loc);
            child.bind_all(matched);
            if let Some(p) = predicate {
                if !self.eval_condition(p, &child)? {
                    continue;
                }
            }
            return self.eval_stmt(body, &child);
        }
        Err(self.fail(
            ErrorCode::LET_BE_EXHAUSTED,
            "let be st found no binding satisfying the predicate",
            loc,
            ctx,
        ))
    }

    /// Every consistent binding of the given binds.
    pub(crate) fn bind_combinations(&self, binds: &[Bind], loc: &Location, ctx: &Context<'_>) -> EvalResult<Vec<Matched>> {
        let mut candidates = Vec::with_capacity(binds.len());
        for bind in binds {
            let values = match bind {
                Bind::Set { set, .. } => self.eval_set(set, ctx)?,
                Bind::Seq { seq, .. } => self.eval_seq(seq, ctx)?,
                Bind::Type { ty, .. } => pattern::enumerate_type(ty).ok_or_else(|| {
                    self.fail(
                        ErrorCode::TYPE_NOT_ENUMERABLE,
                        format!("type {ty} cannot be enumerated"),
                        loc,
                        ctx,
                    )
                })?,
            };
            candidates.push((bind.pattern(), values));
        }
        Ok(pattern::combinations(&candidates))
    }

    /// Restrict a value by a bind: set or sequence membership, or type
    /// conversion. Failure is fatal with `code`.
    fn restrict(&self, bind: &Bind, value: Value, code: ErrorCode, loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        match bind {
            Bind::Set { set, .. } => {
                let items = self.eval_set(set, ctx)?;
                if items.iter().any(|item| *item == value) {
                    Ok(value)
                } else {
                    Err(self.fail(code, format!("{value} is not in set {}", Value::Set(items)), loc, ctx))
                }
            }
            Bind::Seq { seq, .. } => {
                let items = self.eval_seq(seq, ctx)?;
                if items.iter().any(|item| *item == value) {
                    Ok(value)
                } else {
                    Err(self.fail(code, format!("{value} is not in sequence {}", Value::Seq(items)), loc, ctx))
                }
            }
            Bind::Type { ty, .. } => value
                .convert_to(ty)
                .map_err(|e| self.fail(code, e.to_string(), loc, ctx)),
        }
    }

    /// `None` on pattern mismatch.
    fn bind_value(
        &self,
        bind: &PatternBind,
        value: &Value,
        code: ErrorCode,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Option<Matched>> {
        let (pattern, value) = match bind {
            PatternBind::Pattern(p) => (p, value.clone()),
            PatternBind::Bind(b) => (b.pattern(), self.restrict(b, value.clone(), code, loc, ctx)?),
        };
        Ok(pattern::match_pattern(pattern, &value))
    }

    // ── Conditionals & loops ─────────────────────────────────────────────

    fn eval_cases(
        &self,
        selector: &Expr,
        alternatives: &[CaseAlternative],
        others: Option<&Stmt>,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        let value = self.eval_expr(selector, ctx)?;
        for alt in alternatives {
            for p in &alt.patterns {
                if let Some(matched) = pattern::match_pattern(p, &value) {
                    let mut child = Context::derive(ctx, "cases", loc);
                    child.bind_all(matched);
                    return self.eval_stmt(&alt.body, &child);
                }
            }
        }
        match others {
            Some(s) => self.eval_stmt(s, ctx),
            None => Ok(Value::Void),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_for_index(
        &self,
        var: &Name,
        from: &Expr,
        to: &Expr,
        by: Option<&Expr>,
        body: &Stmt,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        let from = self.eval_int(from, ctx)?;
        let to = self.eval_int(to, ctx)?;
        let by = match by {
            Some(by) => self.eval_int(by, ctx)?,
            None => 1,
        };
        if by == 0 {
            return Err(self.fail(
                ErrorCode::LOOP_NEVER_TERMINATES,
                "for loop with a step of zero would never terminate",
                loc,
                ctx,
            ));
        }
        let mut i = from;
        while (by > 0 && i <= to) || (by < 0 && i >= to) {
            let mut child = Context::derive(ctx, "for", loc);
            child.bind(var.clone(), Value::Int(i));
            let value = self.eval_stmt(body, &child)?;
            if !value.is_void() {
                return Ok(value);
            }
            match i.checked_add(by) {
                Some(next) => i = next,
                None => break,
            }
        }
        Ok(Value::Void)
    }

    fn eval_for_all(&self, pattern: &Pattern, set: &Expr, body: &Stmt, loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        for item in self.eval_set(set, ctx)? {
            let Some(matched) = pattern::match_pattern(pattern, &item) else {
                continue;
            };
            let mut child = Context::derive(ctx, "for all", loc);
            child.bind_all(matched);
            let value = self.eval_stmt(body, &child)?;
            if !value.is_void() {
                return Ok(value);
            }
        }
        Ok(Value::Void)
    }

    fn eval_for_pattern(
        &self,
        bind: &PatternBind,
        seq: &Expr,
        reverse: bool,
        body: &Stmt,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        let mut items = self.eval_seq(seq, ctx)?;
        if reverse {
            items.reverse();
        }
        for item in items {
            let Some(matched) = self.bind_value(bind, &item, ErrorCode::BIND_MEMBERSHIP_FAILED, loc, ctx)? else {
                continue;
            };
            let mut child = Context::derive(ctx, "for", loc);
            child.bind_all(matched);
            let value = self.eval_stmt(body, &child)?;
            if !value.is_void() {
                return Ok(value);
            }
        }
        Ok(Value::Void)
    }

    fn eval_while(&self, condition: &Expr, body: &Stmt, loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        while self.eval_condition(condition, ctx)? {
            let child = Context::derive(ctx, "while", loc);
            let value = self.eval_stmt(body, &child)?;
            if !value.is_void() {
                return Ok(value);
            }
        }
        Ok(Value::Void)
    }

    // ── Structured handling ──────────────────────────────────────────────

    /// `always cleanup in body`: the cleanup runs once whatever the body's
    /// outcome, except on cancellation or thread stop.
    fn eval_always(&self, cleanup: &Stmt, body: &Stmt, ctx: &Context<'_>) -> EvalResult<Value> {
        let outcome = self.eval_stmt(body, ctx);
        if matches!(outcome, Err(EvalError::Cancelled { .. } | EvalError::Stopped { .. })) {
            return outcome;
        }
        self.eval_stmt(cleanup, ctx)?;
        outcome
    }

    fn eval_trap(
        &self,
        bind: &PatternBind,
        handler: &Stmt,
        body: &Stmt,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        match self.eval_stmt(body, ctx) {
            Err(EvalError::Exit(signal)) => {
                match self.bind_value(bind, &signal.value, ErrorCode::TRAP_BIND_FAILED, loc, ctx)? {
                    Some(matched) => {
                        let mut child = Context::derive(ctx, "trap", loc);
                        child.bind_all(matched);
                        self.eval_stmt(handler, &child)
                    }
                    None => Err(EvalError::Exit(signal)),
                }
            }
            other => other,
        }
    }

    /// A handler that exits again restarts matching against the new value.
    fn eval_tixe(
        &self,
        alternatives: &[TixeAlternative],
        body: &Stmt,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        let mut signal = match self.eval_stmt(body, ctx) {
            Err(EvalError::Exit(signal)) => signal,
            other => return other,
        };
        'restart: loop {
            for alt in alternatives {
                let Some(matched) = self.bind_value(&alt.bind, &signal.value, ErrorCode::TRAP_BIND_FAILED, loc, ctx)? else {
                    continue;
                };
                let mut child = Context::derive(ctx, "tixe", loc);
                child.bind_all(matched);
                match self.eval_stmt(&alt.handler, &child) {
                    Err(EvalError::Exit(next)) => {
                        signal = next;
                        continue 'restart;
                    }
                    other => return other,
                }
            }
            return Err(EvalError::Exit(signal));
        }
    }

    // ══════════════════════════════════════════════════════════════════════
    // Calls
    // ══════════════════════════════════════════════════════════════════════

    pub(crate) fn eval_args(&self, args: &[Expr], ctx: &Context<'_>) -> EvalResult<Vec<Value>> {
        args.iter().map(|a| self.eval_expr(a, ctx)).collect()
    }

    fn eval_call(&self, name: &Name, args: &[Expr], loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        let callee = ctx.lookup(name).ok_or_else(|| {
            self.fail(ErrorCode::UNRESOLVED_CALL, format!("operation {name} not found"), loc, ctx)
        })?;
        let args = self.eval_args(args, ctx)?;
        self.apply(callee.deref(), args, loc, ctx)
    }

    /// `designator.op(args)`. A thread that was stepping when the call began
    /// may stop again at the call site once it returns.
    fn eval_object_call(
        &self,
        designator: &Expr,
        field: &Name,
        args: &[Expr],
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        let thread = ctx.thread();
        let was_stepping = thread.is_stepping();
        let obj = self.eval_object(designator, ctx)?;
        // A designator carrying the statement's own location counted this call twice.
        if designator.location.shares_hits(loc) {
            loc.unhit();
        }
        let args = self.eval_args(args, ctx)?;
        let result = match obj.field(field) {
            Ok(member) => self.apply(member.deref(), args, loc, ctx)?,
            Err(_) => match self.try_delegate(obj.class(), field, &args, Some(obj.clone()), loc, ctx) {
                Some(result) => result?,
                None => {
                    return Err(self.fail(
                        ErrorCode::UNRESOLVED_CALL,
                        format!("{} has no operation {}", Value::Object(obj.clone()), field.text),
                        loc,
                        ctx,
                    ))
                }
            },
        };
        if was_stepping
            && thread.is_stepping()
            && !self.settings().is_real_time()
            && self.should_step(Some(loc.line()), ctx)
        {
            self.suspend(StopReason::Step, loc, ctx)?;
        }
        Ok(result)
    }

    /// Call a function or operation value, or index a sequence.
    pub(crate) fn apply(&self, callee: Value, args: Vec<Value>, loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        match callee {
            Value::Operation(op) => self.call_operation(&op, args, loc, ctx),
            Value::Function(func) => self.call_function(&func, args, loc, ctx),
            Value::Seq(items) => {
                let [index] = args.as_slice() else {
                    return Err(self.fail(
                        ErrorCode::ARGUMENT_MISMATCH,
                        "sequence application takes exactly one index",
                        loc,
                        ctx,
                    ));
                };
                let i = index.int_value().map_err(|e| self.lift(e, loc, ctx))?;
                usize::try_from(i)
                    .ok()
                    .filter(|&i| i >= 1)
                    .and_then(|i| items.get(i - 1))
                    .cloned()
                    .ok_or_else(|| {
                        self.lift(ValueError::IndexOutOfRange { index: i, len: items.len() }, loc, ctx)
                    })
            }
            other => Err(self.fail(ErrorCode::NOT_CALLABLE, format!("{other} is not callable"), loc, ctx)),
        }
    }

    /// Root context variant for running a routine of `class` (or of
    /// `module` when it has no class).
    fn routine_root(&self, class: Option<&str>, self_obj: Option<ObjectRef>, module: &str) -> RootKind {
        if let Some(obj) = self_obj {
            return RootKind::Object(obj);
        }
        if let Some(scope) = class.and_then(|c| self.globals().class(c)) {
            return RootKind::ClassStatic(scope.clone());
        }
        match self.globals().state(module) {
            Some(state) => RootKind::State(state.clone()),
            None => RootKind::Global,
        }
    }

    fn bind_params(
        &self,
        params: &[Pattern],
        types: &[Type],
        args: Vec<Value>,
        loc: &Location,
        call: &mut Context<'_>,
    ) -> EvalResult<()> {
        for (i, (param, arg)) in params.iter().zip(args).enumerate() {
            let ty = types.get(i).unwrap_or(&Type::Unknown);
            let value = arg.convert_to(ty).map_err(|e| self.lift(e, loc, call))?;
            let matched = self.match_or_fail(param, &value, loc, call)?;
            call.bind_all(matched);
        }
        Ok(())
    }

    fn check_arity(&self, name: &Name, expected: usize, got: usize, loc: &Location, ctx: &Context<'_>) -> EvalResult<()> {
        if expected == got {
            return Ok(());
        }
        Err(self.fail(
            ErrorCode::ARGUMENT_MISMATCH,
            format!("{name} expects {expected} arguments, got {got}"),
            loc,
            ctx,
        ))
    }

    fn check_pre(&self, pre: Option<&Expr>, name: &Name, loc: &Location, call: &Context<'_>) -> EvalResult<()> {
        let Some(pre) = pre.filter(|_| self.settings().pre_checks) else {
            return Ok(());
        };
        if self.eval_condition(pre, call)? {
            Ok(())
        } else {
            Err(self.fail(
                ErrorCode::PRECONDITION_FAILED,
                format!("precondition of {name} failed"),
                loc,
                call,
            ))
        }
    }

    fn result_value(&self, value: Value, ty: &Type, loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        match value {
            Value::Void | Value::VoidReturn => Ok(Value::Void),
            value => match ty {
                Type::Void | Type::Unknown => Ok(value),
                ty => value.convert_to(ty).map_err(|e| self.lift(e, loc, ctx)),
            },
        }
    }

    pub(crate) fn call_operation(
        &self,
        op: &Arc<OperationValue>,
        args: Vec<Value>,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        let def = &op.def;
        self.check_arity(&def.name, def.params.len(), args.len(), loc, ctx)?;
        let kind = self.routine_root(op.class.as_deref(), op.self_obj(), op.module());
        let routine = Routine {
            name: def.name.clone(),
            args: args.clone(),
        };
        let mut call = Context::call(ctx, kind, None, def.name.to_string(), &def.location).with_routine(routine);
        self.bind_params(&def.params, &def.param_types, args, &def.location, &mut call)?;
        self.check_pre(def.pre.as_ref(), &def.name, loc, &call)?;
        let _pure = def.is_pure.then(|| ctx.thread().pure());
        let result = self.eval_stmt(&def.body, &call)?;
        if !def.is_pure {
            if let Some(obj) = op.self_obj() {
                self.check_invariants(&obj, loc, ctx)?;
            }
        }
        self.result_value(result, &def.result, &def.location, &call)
    }

    /// Short-circuits to false on the first clause that fails.
    fn eval_invariant(&self, clauses: &[Expr], ctx: &Context<'_>) -> EvalResult<bool> {
        for clause in clauses {
            if !self.eval_condition(clause, ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate the class invariant of `obj` in the object's own frame.
    fn check_invariants(&self, obj: &ObjectRef, loc: &Location, ctx: &Context<'_>) -> EvalResult<()> {
        if !self.settings().inv_checks {
            return Ok(());
        }
        let Some(scope) = self.globals().class(obj.class()).cloned() else {
            return Ok(());
        };
        let def = &scope.def;
        if def.invariants.is_empty() {
            return Ok(());
        }
        let inv = Context::call(
            ctx,
            RootKind::Object(obj.clone()),
            None,
            format!("{} invariant", def.name),
            &def.location,
        );
        if self.eval_invariant(&def.invariants, &inv)? {
            return Ok(());
        }
        Err(self.fail(
            ErrorCode::INVARIANT_VIOLATED,
            format!("instance invariant of {} violated", Value::Object(obj.clone())),
            loc,
            ctx,
        ))
    }

    pub(crate) fn call_function(
        &self,
        func: &Arc<FunctionValue>,
        args: Vec<Value>,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        let def = &func.def;
        self.check_arity(&def.name, def.params.len(), args.len(), loc, ctx)?;
        let kind = self.routine_root(func.class.as_deref(), func.self_obj(), &def.name.module);
        let routine = Routine {
            name: def.name.clone(),
            args: args.clone(),
        };
        let mut call = Context::call(ctx, kind, func.free_vars.clone(), def.name.to_string(), &def.location)
            .with_routine(routine);
        if func.free_vars.is_some() {
            call.bind(def.name.clone(), Value::Function(func.clone()));
        }
        self.bind_params(&def.params, &def.param_types, args, &def.location, &mut call)?;
        self.check_pre(def.pre.as_ref(), &def.name, loc, &call)?;
        let _pure = ctx.thread().pure();
        let result = self.eval_expr(&def.body, &call)?;
        self.result_value(result, &def.result, &def.location, &call)
    }

    fn try_delegate(
        &self,
        owner: &str,
        operation: &Name,
        args: &[Value],
        this: Option<ObjectRef>,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> Option<EvalResult<Value>> {
        let call = DelegateCall {
            owner,
            operation,
            args,
            this,
            scheduler: self.scheduler().as_ref(),
            thread: ctx.thread().as_ref(),
        };
        self.delegates().invoke(&call).map(|result| {
            result.map_err(|message| self.fail(ErrorCode::NOT_YET_SPECIFIED, message, loc, ctx))
        })
    }

    fn eval_not_yet_specified(&self, loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        let owner = owner_name(ctx);
        if let Some(routine) = ctx.routine() {
            if let Some(result) = self.try_delegate(&owner, &routine.name, &routine.args, ctx.self_object(), loc, ctx) {
                return result;
            }
        }
        let what = ctx.routine().map(|r| r.name.to_string()).unwrap_or(owner);
        Err(self.fail(
            ErrorCode::NOT_YET_SPECIFIED,
            format!("{what} is not yet specified"),
            loc,
            ctx,
        ))
    }

    // ══════════════════════════════════════════════════════════════════════
    // Objects & threads
    // ══════════════════════════════════════════════════════════════════════

    pub(crate) fn eval_object(&self, expr: &Expr, ctx: &Context<'_>) -> EvalResult<ObjectRef> {
        let value = self.eval_expr(expr, ctx)?;
        value.object_value().map_err(|e| self.lift(e, &expr.location, ctx))
    }

    fn eval_object_set(&self, expr: &Expr, ctx: &Context<'_>) -> EvalResult<Vec<ObjectRef>> {
        self.eval_set(expr, ctx)?
            .iter()
            .map(|v| v.object_value().map_err(|e| self.lift(e, &expr.location, ctx)))
            .collect()
    }

    /// Create an instance: operations, functions, instance variables, then
    /// the matching constructor.
    pub(crate) fn new_object(&self, class: &str, args: Vec<Value>, loc: &Location, ctx: &Context<'_>) -> EvalResult<ObjectRef> {
        let Some(scope) = self.globals().class(class).cloned() else {
            if class == CPU_CLASS {
                let obj = ObjectValue::new(CPU_CLASS);
                let ctor = Name::new(CPU_CLASS, CPU_CLASS);
                if let Some(result) = self.try_delegate(CPU_CLASS, &ctor, &args, Some(obj.clone()), loc, ctx) {
                    result?;
                    return Ok(obj);
                }
            }
            return Err(self.fail(ErrorCode::NO_SUCH_CLASS, format!("class {class} is not defined"), loc, ctx));
        };
        let def = &scope.def;
        let obj = ObjectValue::new(class);
        let weak = Arc::downgrade(&obj);

        for op in def.operations.iter().filter(|op| !op.is_static) {
            obj.set_member(
                op.name.clone(),
                Value::Operation(Arc::new(OperationValue {
                    def: op.clone(),
                    class: Some(class.to_string()),
                    self_obj: Some(weak.clone()),
                })),
            );
        }
        for func in &def.functions {
            obj.set_member(
                func.name.clone(),
                Value::Function(Arc::new(FunctionValue {
                    def: func.clone(),
                    free_vars: None,
                    class: Some(class.to_string()),
                    self_obj: Some(weak.clone()),
                })),
            );
        }
        {
            let init = Context::call(ctx, RootKind::Object(obj.clone()), None, format!("{class} initialisation"), &def.location);
            for var in def.instance_vars.iter().filter(|v| !v.is_static) {
                let value = match &var.init {
                    Some(e) => self
                        .eval_expr(e, &init)?
                        .convert_to(&var.ty)
                        .map_err(|err| self.lift(err, &var.location, &init))?,
                    None => Value::Nil,
                };
                let owner = CellOwner {
                    object: obj.id(),
                    class: class.to_string(),
                    field: var.name.text.clone(),
                };
                obj.set_member(var.name.clone(), Value::Updatable(Cell::owned(value, var.ty.clone(), owner)));
            }
        }

        let ctor = def.operations.iter().find(|op| {
            !op.is_static
                && op.name.text == class
                && op.params.len() == args.len()
                && args
                    .iter()
                    .zip(&op.param_types)
                    .all(|(a, ty)| a.convert_to(ty).is_ok())
        });
        match ctor.and_then(|op| obj.member(&op.name)) {
            Some(Value::Operation(op)) => {
                self.call_operation(&op, args, loc, ctx)?;
            }
            _ if args.is_empty() => self.check_invariants(&obj, loc, ctx)?,
            _ => {
                return Err(self.fail(
                    ErrorCode::ARGUMENT_MISMATCH,
                    format!("no constructor of {class} accepts {} arguments", args.len()),
                    loc,
                    ctx,
                ))
            }
        }
        tracing::trace!(object = obj.id(), class, "object created");
        Ok(obj)
    }

    /// Register the object's thread with the scheduler. Never blocks.
    fn start(&self, obj: &ObjectRef, loc: &Location, ctx: &Context<'_>) -> EvalResult<()> {
        if obj.thread().is_some() {
            return Err(self.fail(
                ErrorCode::ALREADY_STARTED,
                format!("{} already has a running thread", Value::Object(obj.clone())),
                loc,
                ctx,
            ));
        }
        let no_thread = || {
            self.fail(
                ErrorCode::NO_THREAD_DEFINED,
                format!("class {} has no thread", obj.class()),
                loc,
                ctx,
            )
        };
        let scope = self.globals().class(obj.class()).cloned().ok_or_else(no_thread)?;
        let thread = ctx.thread();

        let (kind, body): (ThreadKind, ThreadBody) = match &scope.def.thread {
            Some(ThreadDef::Plain(_)) => {
                let evaluator = self.clone();
                let target = obj.clone();
                let scope = scope.clone();
                (
                    ThreadKind::Plain,
                    Arc::new(move |state: &Arc<ThreadState>| evaluator.run_thread_body(&scope.def, &target, state)),
                )
            }
            Some(ThreadDef::Periodic {
                period,
                jitter,
                delay,
                offset,
                operation,
            }) => {
                let _atomic = thread.atomic();
                let kind = ThreadKind::Periodic {
                    period: self.eval_nat(period, ctx)?,
                    jitter: self.eval_nat(jitter, ctx)?,
                    delay: self.eval_nat(delay, ctx)?,
                    offset: self.eval_nat(offset, ctx)?,
                };
                (kind, self.activation_body(obj, operation, loc, ctx)?)
            }
            Some(ThreadDef::Sporadic {
                min_delay,
                max_delay,
                offset,
                operation,
            }) => {
                let _atomic = thread.atomic();
                let kind = ThreadKind::Sporadic {
                    min_delay: self.eval_nat(min_delay, ctx)?,
                    max_delay: self.eval_nat(max_delay, ctx)?,
                    offset: self.eval_nat(offset, ctx)?,
                };
                (kind, self.activation_body(obj, operation, loc, ctx)?)
            }
            None => return Err(no_thread()),
        };
        if kind != ThreadKind::Plain && self.scheduler().time_limit().is_none() {
            return Err(self.fail(
                ErrorCode::NO_TIME_LIMIT,
                format!("periodic thread of {} needs a time limit", Value::Object(obj.clone())),
                loc,
                ctx,
            ));
        }

        let request = SpawnRequest {
            kind,
            name: format!("{}{{#{}}}", obj.class(), obj.id()),
            object: Some(obj.clone()),
            start_time: self.scheduler().time(thread),
            body,
        };
        self.scheduler()
            .spawn(request)
            .map_err(|e| self.fail(ErrorCode::SPAWN_FAILED, e.to_string(), loc, ctx))?;
        Ok(())
    }

    fn run_thread_body(&self, class: &ClassDef, obj: &ObjectRef, state: &Arc<ThreadState>) -> EvalResult<Value> {
        let Some(ThreadDef::Plain(body)) = &class.thread else {
            return Ok(Value::Void);
        };
        let root = Context::root(
            RootKind::Object(obj.clone()),
            format!("{} thread", obj.class()),
            &body.location,
            None,
            state.clone(),
            self.globals().clone(),
        );
        self.eval_stmt(body, &root)
    }

    /// One activation of a periodic or sporadic thread: call `operation`.
    fn activation_body(&self, obj: &ObjectRef, operation: &Name, loc: &Location, ctx: &Context<'_>) -> EvalResult<ThreadBody> {
        let op = match obj.field(operation) {
            Ok(Value::Operation(op)) => op,
            _ => {
                return Err(self.fail(
                    ErrorCode::UNRESOLVED_CALL,
                    format!("thread operation {operation} not found"),
                    loc,
                    ctx,
                ))
            }
        };
        let evaluator = self.clone();
        let target = obj.clone();
        Ok(Arc::new(move |state: &Arc<ThreadState>| {
            let root = Context::root(
                RootKind::Object(target.clone()),
                format!("{} thread", target.class()),
                &op.def.location,
                None,
                state.clone(),
                evaluator.globals().clone(),
            );
            evaluator.call_operation(&op, Vec::new(), &op.def.location, &root)
        }))
    }

    fn stop(&self, obj: &ObjectRef) {
        if !self.scheduler().stop(obj) {
            tracing::debug!(object = obj.id(), "stop requested for an object without a running thread");
        }
    }
}

fn update_path(current: &Value, path: &[Segment], value: Value) -> Result<Value, ValueError> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(value);
    };
    match (head, current.deref()) {
        (Segment::Field(name), Value::Record { tag, mut fields }) => {
            let slot = fields
                .iter_mut()
                .find(|(f, _)| *f == name.text)
                .ok_or_else(|| ValueError::NoSuchField(name.text.clone()))?;
            slot.1 = update_path(&slot.1, rest, value)?;
            Ok(Value::Record { tag, fields })
        }
        (Segment::Field(name), Value::Object(obj)) => {
            let cell = obj.field(name)?.cell_value()?;
            let updated = update_path(&cell.get(), rest, value)?;
            cell.assign(&updated)?;
            Ok(Value::Object(obj))
        }
        (Segment::Index(i), Value::Seq(mut items)) => {
            let len = items.len();
            let slot = usize::try_from(*i)
                .ok()
                .filter(|&n| n >= 1)
                .and_then(|n| items.get_mut(n - 1))
                .ok_or(ValueError::IndexOutOfRange { index: *i, len })?;
            *slot = update_path(slot, rest, value)?;
            Ok(Value::Seq(items))
        }
        (_, other) => Err(ValueError::WrongType {
            expected: "record, object or sequence",
            actual: other.to_string(),
        }),
    }
}

/// A function value for a local definition, capturing the visible bindings.
fn local_function(def: &Arc<FunctionDef>, ctx: &Context<'_>) -> Value {
    let self_obj = ctx.self_object();
    Value::Function(Arc::new(FunctionValue {
        def: def.clone(),
        free_vars: Some(Arc::new(ctx.visible_bindings())),
        class: self_obj.as_ref().map(|o| o.class().to_string()),
        self_obj: self_obj.as_ref().map(Arc::downgrade),
    }))
}

/// The class or module whose code is running in `ctx`.
fn owner_name(ctx: &Context<'_>) -> String {
    match ctx.root_kind() {
        Some(RootKind::Object(obj)) => obj.class().to_string(),
        Some(RootKind::ClassStatic(class)) => class.name().to_string(),
        Some(RootKind::State(state)) => state.module.clone(),
        _ => ctx
            .routine()
            .map(|r| r.name.module.clone())
            .unwrap_or_default(),
    }
}
