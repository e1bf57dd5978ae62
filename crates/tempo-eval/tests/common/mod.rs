//! Tree builders shared by the integration tests.
//!
//! Statements are placed on explicit lines of `test.rt`; expressions sit on
//! line 0 so that line-based breakpoints only ever find statements.

#![allow(dead_code)]

use std::sync::Arc;
use tempo_eval::{Evaluator, LocalScheduler, Runtime, Settings};
use tempo_types::ast::*;
use tempo_types::{Location, NodeId, Span, Value};

pub const FILE: &str = "test.rt";
pub const MODULE: &str = "M";

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

pub fn loc(line: u32) -> Location {
    Location::new(FILE, Span::point(line, 1))
}

pub fn name(text: &str) -> Name {
    Name::new(MODULE, text)
}

pub fn in_class(class: &str, text: &str) -> Name {
    Name::new(class, text)
}

pub fn expr(kind: ExprKind) -> Expr {
    Expr {
        id: NodeId::fresh(),
        location: loc(0),
        kind,
    }
}

pub fn int(i: i64) -> Expr {
    expr(ExprKind::Literal(Literal::Int(i)))
}

pub fn boolean(b: bool) -> Expr {
    expr(ExprKind::Literal(Literal::Bool(b)))
}

pub fn quote(q: &str) -> Expr {
    expr(ExprKind::Literal(Literal::Quote(q.into())))
}

pub fn var(text: &str) -> Expr {
    expr(ExprKind::Name(name(text)))
}

pub fn var_in(class: &str, text: &str) -> Expr {
    expr(ExprKind::Name(in_class(class, text)))
}

pub fn bin(left: Expr, op: BinOp, right: Expr) -> Expr {
    expr(ExprKind::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

pub fn set_of(items: Vec<Expr>) -> Expr {
    expr(ExprKind::SetEnum(items))
}

pub fn seq_of(items: Vec<Expr>) -> Expr {
    expr(ExprKind::SeqEnum(items))
}

pub fn apply(root: Expr, args: Vec<Expr>) -> Expr {
    expr(ExprKind::Apply {
        root: Box::new(root),
        args,
    })
}

pub fn new_object(class: &str, args: Vec<Expr>) -> Expr {
    expr(ExprKind::New {
        class: class.into(),
        args,
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Patterns
// ══════════════════════════════════════════════════════════════════════════════

pub fn pattern(kind: PatternKind) -> Pattern {
    Pattern {
        location: loc(0),
        kind,
    }
}

pub fn ident(text: &str) -> Pattern {
    pattern(PatternKind::Ident(name(text)))
}

pub fn quote_pattern(q: &str) -> Pattern {
    pattern(PatternKind::Literal(Literal::Quote(q.into())))
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

pub fn stmt(line: u32, kind: StmtKind) -> Stmt {
    Stmt {
        id: NodeId::fresh(),
        location: loc(line),
        kind,
    }
}

pub fn block(line: u32, dcls: Vec<Dcl>, body: Vec<Stmt>) -> Stmt {
    stmt(line, StmtKind::Block { dcls, body })
}

pub fn dcl(text: &str, ty: Type, init: Expr) -> Dcl {
    Dcl {
        name: name(text),
        ty,
        init: Some(init),
        location: loc(0),
    }
}

pub fn assign(line: u32, target: &str, value: Expr) -> Stmt {
    assign_to(line, Designator::Name(name(target)), value)
}

pub fn assign_to(line: u32, target: Designator, value: Expr) -> Stmt {
    stmt(
        line,
        StmtKind::Assign(Assignment {
            target,
            value,
            location: loc(line),
        }),
    )
}

/// `target := target + 1`
pub fn incr(line: u32, target: &str) -> Stmt {
    assign(line, target, bin(var(target), BinOp::Add, int(1)))
}

pub fn ret(line: u32, value: Expr) -> Stmt {
    stmt(line, StmtKind::Return(Some(value)))
}

pub fn exit(line: u32, value: Expr) -> Stmt {
    stmt(line, StmtKind::Exit(Some(value)))
}

pub fn skip(line: u32) -> Stmt {
    stmt(line, StmtKind::Skip)
}

pub fn if_then(line: u32, condition: Expr, then_branch: Stmt) -> Stmt {
    stmt(
        line,
        StmtKind::If {
            condition,
            then_branch: Box::new(then_branch),
            elseifs: Vec::new(),
            else_branch: None,
        },
    )
}

pub fn for_index(line: u32, var: &str, from: i64, to: i64, by: Option<i64>, body: Stmt) -> Stmt {
    stmt(
        line,
        StmtKind::ForIndex {
            var: name(var),
            from: int(from),
            to: int(to),
            by: by.map(int),
            body: Box::new(body),
        },
    )
}

pub fn call(line: u32, target: Name, args: Vec<Expr>) -> Stmt {
    stmt(line, StmtKind::Call { name: target, args })
}

pub fn call_object(line: u32, object: Expr, op: &str, args: Vec<Expr>) -> Stmt {
    stmt(
        line,
        StmtKind::CallObject {
            designator: object,
            field: name(op),
            args,
        },
    )
}

// ══════════════════════════════════════════════════════════════════════════════
// Definitions
// ══════════════════════════════════════════════════════════════════════════════

pub fn operation(owner: &str, text: &str, params: Vec<(&str, Type)>, result: Type, body: Stmt) -> Arc<OperationDef> {
    let (params, param_types) = params.into_iter().map(|(p, ty)| (ident(p), ty)).unzip();
    Arc::new(OperationDef {
        name: Name::new(owner, text),
        params,
        param_types,
        result,
        body,
        pre: None,
        is_static: false,
        is_pure: false,
        location: loc(0),
    })
}

pub fn op(text: &str, result: Type, body: Stmt) -> Arc<OperationDef> {
    operation(MODULE, text, Vec::new(), result, body)
}

pub fn module(operations: Vec<Arc<OperationDef>>) -> ModuleDef {
    ModuleDef {
        name: MODULE.into(),
        location: loc(0),
        state: None,
        values: Vec::new(),
        functions: Vec::new(),
        operations,
    }
}

pub fn with_state(mut module: ModuleDef, fields: Vec<(&str, Type, Expr)>) -> ModuleDef {
    module.state = Some(StateDef {
        name: "S".into(),
        fields: fields
            .into_iter()
            .map(|(text, ty, init)| StateField {
                name: name(text),
                ty,
                init: Some(init),
            })
            .collect(),
        location: loc(0),
    });
    module
}

pub fn class(text: &str, instance_vars: Vec<(&str, Type, Expr)>, operations: Vec<Arc<OperationDef>>) -> ClassDef {
    ClassDef {
        name: text.into(),
        location: loc(0),
        instance_vars: instance_vars
            .into_iter()
            .map(|(v, ty, init)| InstanceVarDef {
                name: name(v),
                ty,
                init: Some(init),
                is_static: false,
                location: loc(0),
            })
            .collect(),
        values: Vec::new(),
        functions: Vec::new(),
        operations,
        invariants: Vec::new(),
        thread: None,
    }
}

pub fn model(modules: Vec<ModuleDef>, classes: Vec<ClassDef>) -> Model {
    Model { modules, classes }
}

// ══════════════════════════════════════════════════════════════════════════════
// Runtimes
// ══════════════════════════════════════════════════════════════════════════════

pub fn evaluator(model: Model) -> Evaluator {
    evaluator_with(model, Settings::default())
}

pub fn evaluator_with(model: Model, settings: Settings) -> Evaluator {
    Runtime::builder(model)
        .settings(settings)
        .build()
        .expect("runtime initialisation failed")
}

/// An evaluator plus a handle on its scheduler for joining threads.
pub fn evaluator_scheduled(model: Model, settings: Settings, time_limit: Option<u64>) -> (Evaluator, LocalScheduler) {
    let scheduler = LocalScheduler::new(settings.default_cpu_hz, time_limit);
    let evaluator = Runtime::builder(model)
        .settings(settings)
        .scheduler(Arc::new(scheduler.clone()))
        .build()
        .expect("runtime initialisation failed");
    (evaluator, scheduler)
}

/// Run the single module operation `run` and return its result.
pub fn run_body(body: Stmt) -> tempo_eval::EvalResult<Value> {
    let ev = evaluator(model(vec![module(vec![op("run", Type::Unknown, body)])], Vec::new()));
    ev.call(MODULE, "run", Vec::new())
}
