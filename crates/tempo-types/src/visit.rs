//! Read-only traversal of the executable tree.
//!
//! Used to place breakpoints by source line and to gather coverage.

use crate::ast::*;
use crate::{Location, NodeId};

/// A statement or expression reached during a walk.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Stmt(&'a Stmt),
    Expr(&'a Expr),
}

impl<'a> Node<'a> {
    pub fn id(&self) -> NodeId {
        match self {
            Self::Stmt(s) => s.id,
            Self::Expr(e) => e.id,
        }
    }

    pub fn location(&self) -> &'a Location {
        match self {
            Self::Stmt(s) => &s.location,
            Self::Expr(e) => &e.location,
        }
    }
}

impl Model {
    /// Visit every statement and expression in definition order.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(Node<'a>)) {
        for module in &self.modules {
            if let Some(state) = &module.state {
                for field in &state.fields {
                    if let Some(init) = &field.init {
                        walk_expr(init, f);
                    }
                }
            }
            walk_defs(&module.values, f);
            walk_functions(&module.functions, f);
            walk_operations(&module.operations, f);
        }
        for class in &self.classes {
            for var in &class.instance_vars {
                if let Some(init) = &var.init {
                    walk_expr(init, f);
                }
            }
            walk_defs(&class.values, f);
            walk_functions(&class.functions, f);
            walk_operations(&class.operations, f);
            for inv in &class.invariants {
                walk_expr(inv, f);
            }
            match &class.thread {
                Some(ThreadDef::Plain(body)) => walk_stmt(body, f),
                Some(ThreadDef::Periodic {
                    period,
                    jitter,
                    delay,
                    offset,
                    ..
                }) => {
                    for e in [period, jitter, delay, offset] {
                        walk_expr(e, f);
                    }
                }
                Some(ThreadDef::Sporadic {
                    min_delay,
                    max_delay,
                    offset,
                    ..
                }) => {
                    for e in [min_delay, max_delay, offset] {
                        walk_expr(e, f);
                    }
                }
                None => {}
            }
        }
    }

    /// The first statement starting on `line` of `file`.
    pub fn find_statement(&self, file: &str, line: u32) -> Option<&Stmt> {
        let mut found = None;
        self.walk(&mut |node| {
            if let (None, Node::Stmt(s)) = (found, node) {
                if &*s.location.file == file && s.location.line() == line {
                    found = Some(s);
                }
            }
        });
        found
    }

    /// The first expression starting on `line` of `file`.
    pub fn find_expression(&self, file: &str, line: u32) -> Option<&Expr> {
        let mut found = None;
        self.walk(&mut |node| {
            if let (None, Node::Expr(e)) = (found, node) {
                if &*e.location.file == file && e.location.line() == line {
                    found = Some(e);
                }
            }
        });
        found
    }
}

fn walk_functions<'a>(functions: &'a [std::sync::Arc<FunctionDef>], f: &mut dyn FnMut(Node<'a>)) {
    for func in functions {
        if let Some(pre) = &func.pre {
            walk_expr(pre, f);
        }
        walk_expr(&func.body, f);
    }
}

fn walk_operations<'a>(
    operations: &'a [std::sync::Arc<OperationDef>],
    f: &mut dyn FnMut(Node<'a>),
) {
    for op in operations {
        if let Some(pre) = &op.pre {
            walk_expr(pre, f);
        }
        walk_stmt(&op.body, f);
    }
}

fn walk_defs<'a>(defs: &'a [Definition], f: &mut dyn FnMut(Node<'a>)) {
    for def in defs {
        match &def.kind {
            DefinitionKind::Value { expr, .. } => walk_expr(expr, f),
            DefinitionKind::Function(func) => walk_functions(std::slice::from_ref(func), f),
        }
    }
}

fn walk_bind<'a>(bind: &'a Bind, f: &mut dyn FnMut(Node<'a>)) {
    match bind {
        Bind::Set { set: e, .. } | Bind::Seq { seq: e, .. } => walk_expr(e, f),
        Bind::Type { .. } => {}
    }
}

fn walk_pattern_bind<'a>(pb: &'a PatternBind, f: &mut dyn FnMut(Node<'a>)) {
    if let PatternBind::Bind(bind) = pb {
        walk_bind(bind, f);
    }
}

pub fn walk_stmt<'a>(stmt: &'a Stmt, f: &mut dyn FnMut(Node<'a>)) {
    f(Node::Stmt(stmt));
    match &stmt.kind {
        StmtKind::Assign(a) => walk_expr(&a.value, f),
        StmtKind::Atomic(assignments) => {
            for a in assignments {
                walk_expr(&a.value, f);
            }
        }
        StmtKind::Block { dcls, body } => {
            for dcl in dcls {
                if let Some(init) = &dcl.init {
                    walk_expr(init, f);
                }
            }
            for s in body {
                walk_stmt(s, f);
            }
        }
        StmtKind::Let { defs, body } | StmtKind::Def { defs, body } => {
            walk_defs(defs, f);
            walk_stmt(body, f);
        }
        StmtKind::LetBeSt {
            binds,
            predicate,
            body,
        } => {
            for b in binds {
                walk_bind(b, f);
            }
            if let Some(p) = predicate {
                walk_expr(p, f);
            }
            walk_stmt(body, f);
        }
        StmtKind::If {
            condition,
            then_branch,
            elseifs,
            else_branch,
        } => {
            walk_expr(condition, f);
            walk_stmt(then_branch, f);
            for (c, s) in elseifs {
                walk_expr(c, f);
                walk_stmt(s, f);
            }
            if let Some(s) = else_branch {
                walk_stmt(s, f);
            }
        }
        StmtKind::Cases {
            selector,
            alternatives,
            others,
        } => {
            walk_expr(selector, f);
            for alt in alternatives {
                walk_stmt(&alt.body, f);
            }
            if let Some(s) = others {
                walk_stmt(s, f);
            }
        }
        StmtKind::ForIndex {
            from, to, by, body, ..
        } => {
            walk_expr(from, f);
            walk_expr(to, f);
            if let Some(by) = by {
                walk_expr(by, f);
            }
            walk_stmt(body, f);
        }
        StmtKind::ForAll { set, body, .. } => {
            walk_expr(set, f);
            walk_stmt(body, f);
        }
        StmtKind::ForPattern {
            bind, seq, body, ..
        } => {
            walk_pattern_bind(bind, f);
            walk_expr(seq, f);
            walk_stmt(body, f);
        }
        StmtKind::While { condition, body } => {
            walk_expr(condition, f);
            walk_stmt(body, f);
        }
        StmtKind::Call { args, .. } => {
            for a in args {
                walk_expr(a, f);
            }
        }
        StmtKind::CallObject {
            designator, args, ..
        } => {
            walk_expr(designator, f);
            for a in args {
                walk_expr(a, f);
            }
        }
        StmtKind::Start(e) | StmtKind::StartList(e) | StmtKind::Stop(e) | StmtKind::StopList(e) => {
            walk_expr(e, f)
        }
        StmtKind::Cycles { cycles: e, body } | StmtKind::Duration { duration: e, body } => {
            walk_expr(e, f);
            walk_stmt(body, f);
        }
        StmtKind::Always { cleanup, body } => {
            walk_stmt(body, f);
            walk_stmt(cleanup, f);
        }
        StmtKind::Trap {
            bind,
            handler,
            body,
        } => {
            walk_pattern_bind(bind, f);
            walk_stmt(body, f);
            walk_stmt(handler, f);
        }
        StmtKind::Tixe { alternatives, body } => {
            walk_stmt(body, f);
            for alt in alternatives {
                walk_pattern_bind(&alt.bind, f);
                walk_stmt(&alt.handler, f);
            }
        }
        StmtKind::Exit(e) | StmtKind::Return(e) => {
            if let Some(e) = e {
                walk_expr(e, f);
            }
        }
        StmtKind::ClassInvariant(clauses) => {
            for c in clauses {
                walk_expr(c, f);
            }
        }
        StmtKind::NotYetSpecified | StmtKind::Skip => {}
    }
}

pub fn walk_expr<'a>(expr: &'a Expr, f: &mut dyn FnMut(Node<'a>)) {
    f(Node::Expr(expr));
    match &expr.kind {
        ExprKind::Literal(_) | ExprKind::Name(_) | ExprKind::SelfRef | ExprKind::Time => {}
        ExprKind::Field { object, .. } => walk_expr(object, f),
        ExprKind::Apply { root, args } => {
            walk_expr(root, f);
            for a in args {
                walk_expr(a, f);
            }
        }
        ExprKind::Unary { operand, .. } => walk_expr(operand, f),
        ExprKind::Binary { left, right, .. } => {
            walk_expr(left, f);
            walk_expr(right, f);
        }
        ExprKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            walk_expr(condition, f);
            walk_expr(then_branch, f);
            walk_expr(else_branch, f);
        }
        ExprKind::Let { defs, body } => {
            walk_defs(defs, f);
            walk_expr(body, f);
        }
        ExprKind::SetEnum(items) | ExprKind::SeqEnum(items) | ExprKind::Tuple(items) => {
            for e in items {
                walk_expr(e, f);
            }
        }
        ExprKind::New { args, .. } => {
            for e in args {
                walk_expr(e, f);
            }
        }
        ExprKind::SetRange { low, high } => {
            walk_expr(low, f);
            walk_expr(high, f);
        }
        ExprKind::MkRecord { fields, .. } => {
            for (_, e) in fields {
                walk_expr(e, f);
            }
        }
        ExprKind::Exists { binds, predicate } | ExprKind::ForAll { binds, predicate } => {
            for b in binds {
                walk_bind(b, f);
            }
            walk_expr(predicate, f);
        }
    }
}
