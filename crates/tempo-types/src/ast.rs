//! Executable tree for the tempo evaluator.
//!
//! The tree is produced (parsed and type checked) elsewhere and handed over
//! as JSON. Every statement and expression carries a [`Location`] with its
//! hit counter and a [`NodeId`] that breakpoints attach to. Names are fully
//! resolved: they carry their defining module/class and, for overloaded
//! functions and operations, their parameter signature.

use crate::{Location, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ══════════════════════════════════════════════════════════════════════════════
// Top Level
// ══════════════════════════════════════════════════════════════════════════════

/// A complete executable model: flat modules and classes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub modules: Vec<ModuleDef>,
    #[serde(default)]
    pub classes: Vec<ClassDef>,
}

impl Model {
    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn module(&self, name: &str) -> Option<&ModuleDef> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// A flat module: values, functions, operations and an optional state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDef {
    pub name: String,
    pub location: Location,
    #[serde(default)]
    pub state: Option<StateDef>,
    #[serde(default)]
    pub values: Vec<Definition>,
    #[serde(default)]
    pub functions: Vec<Arc<FunctionDef>>,
    #[serde(default)]
    pub operations: Vec<Arc<OperationDef>>,
}

/// `state S of field : type ... end`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    pub fields: Vec<StateField>,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateField {
    pub name: Name,
    pub ty: Type,
    #[serde(default)]
    pub init: Option<Expr>,
}

/// A class with instance variables, operations and an optional thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub location: Location,
    #[serde(default)]
    pub instance_vars: Vec<InstanceVarDef>,
    #[serde(default)]
    pub values: Vec<Definition>,
    #[serde(default)]
    pub functions: Vec<Arc<FunctionDef>>,
    #[serde(default)]
    pub operations: Vec<Arc<OperationDef>>,
    /// `inv` clauses, checked together by the class invariant statement.
    #[serde(default)]
    pub invariants: Vec<Expr>,
    #[serde(default)]
    pub thread: Option<ThreadDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceVarDef {
    pub name: Name,
    pub ty: Type,
    #[serde(default)]
    pub init: Option<Expr>,
    #[serde(default)]
    pub is_static: bool,
    pub location: Location,
}

/// The body a `start` statement runs on a new simulated thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadDef {
    /// `thread S`, run once.
    Plain(Stmt),
    /// `thread periodic(period, jitter, delay, offset)(op)`
    Periodic {
        period: Expr,
        jitter: Expr,
        delay: Expr,
        offset: Expr,
        operation: Name,
    },
    /// `thread sporadic(min_delay, max_delay, offset)(op)`
    Sporadic {
        min_delay: Expr,
        max_delay: Expr,
        offset: Expr,
        operation: Name,
    },
}

// ══════════════════════════════════════════════════════════════════════════════
// Names & Types
// ══════════════════════════════════════════════════════════════════════════════

/// A resolved name: defining module/class, text, and parameter signature.
///
/// Two names with the same text but different signatures are different keys,
/// which is how overloaded operations coexist in one scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name {
    pub module: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<Type>>,
}

impl Name {
    pub fn new(module: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            text: text.into(),
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: Vec<Type>) -> Self {
        self.signature = Some(signature);
        self
    }

    /// The same name with the signature dropped.
    pub fn unqualified(&self) -> Self {
        Self::new(self.module.clone(), self.text.clone())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}`{}", self.module, self.text)?;
        if let Some(sig) = &self.signature {
            let parts: Vec<String> = sig.iter().map(|t| t.to_string()).collect();
            write!(f, "({})", parts.join(", "))?;
        }
        Ok(())
    }
}

/// Static types, as far as the evaluator needs them for dynamic conversion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Bool,
    Nat,
    Nat1,
    Int,
    Real,
    Char,
    Token,
    Quote(String),
    Seq(Box<Type>),
    Seq1(Box<Type>),
    Set(Box<Type>),
    Product(Vec<Type>),
    Record(String),
    Class(String),
    Optional(Box<Type>),
    Union(Vec<Type>),
    Void,
    Unknown,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Nat => write!(f, "nat"),
            Self::Nat1 => write!(f, "nat1"),
            Self::Int => write!(f, "int"),
            Self::Real => write!(f, "real"),
            Self::Char => write!(f, "char"),
            Self::Token => write!(f, "token"),
            Self::Quote(q) => write!(f, "<{q}>"),
            Self::Seq(t) => write!(f, "seq of {t}"),
            Self::Seq1(t) => write!(f, "seq1 of {t}"),
            Self::Set(t) => write!(f, "set of {t}"),
            Self::Product(ts) => {
                let parts: Vec<String> = ts.iter().map(|t| t.to_string()).collect();
                write!(f, "({})", parts.join(" * "))
            }
            Self::Record(name) | Self::Class(name) => write!(f, "{name}"),
            Self::Optional(t) => write!(f, "[{t}]"),
            Self::Union(ts) => {
                let parts: Vec<String> = ts.iter().map(|t| t.to_string()).collect();
                write!(f, "({})", parts.join(" | "))
            }
            Self::Void => write!(f, "()"),
            Self::Unknown => write!(f, "?"),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Definitions
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub location: Location,
    pub kind: DefinitionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    /// `pattern [: type] = expr`
    Value {
        pattern: Pattern,
        #[serde(default)]
        ty: Option<Type>,
        expr: Expr,
    },
    /// A local (or module level) explicit function.
    Function(Arc<FunctionDef>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: Name,
    pub params: Vec<Pattern>,
    pub param_types: Vec<Type>,
    pub result: Type,
    pub body: Expr,
    #[serde(default)]
    pub pre: Option<Expr>,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDef {
    pub name: Name,
    pub params: Vec<Pattern>,
    pub param_types: Vec<Type>,
    pub result: Type,
    pub body: Stmt,
    #[serde(default)]
    pub pre: Option<Expr>,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub is_pure: bool,
    pub location: Location,
}

/// `dcl name : type [:= init]` inside a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dcl {
    pub name: Name,
    pub ty: Type,
    #[serde(default)]
    pub init: Option<Expr>,
    pub location: Location,
}

// ══════════════════════════════════════════════════════════════════════════════
// Patterns & Binds
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub location: Location,
    pub kind: PatternKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Ident(Name),
    Ignore,
    Literal(Literal),
    Tuple(Vec<Pattern>),
    Record { tag: String, fields: Vec<Pattern> },
    Seq(Vec<Pattern>),
}

/// `pattern in set S`, `pattern in seq S` or `pattern : T`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bind {
    Set { pattern: Pattern, set: Expr },
    Seq { pattern: Pattern, seq: Expr },
    Type { pattern: Pattern, ty: Type },
}

impl Bind {
    pub fn pattern(&self) -> &Pattern {
        match self {
            Self::Set { pattern, .. } | Self::Seq { pattern, .. } | Self::Type { pattern, .. } => {
                pattern
            }
        }
    }
}

/// Either a bare pattern or a bind, as used by `for`, `trap` and `tixe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternBind {
    Pattern(Pattern),
    Bind(Bind),
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    #[serde(default)]
    pub id: NodeId,
    pub location: Location,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    Char(char),
    Text(String),
    Quote(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprKind {
    Literal(Literal),
    Name(Name),
    SelfRef,
    /// Current virtual time of the evaluating thread.
    Time,
    Field {
        object: Box<Expr>,
        field: Name,
    },
    /// Function or operation application, or sequence indexing.
    Apply {
        root: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Let {
        defs: Vec<Definition>,
        body: Box<Expr>,
    },
    SetEnum(Vec<Expr>),
    SetRange {
        low: Box<Expr>,
        high: Box<Expr>,
    },
    SeqEnum(Vec<Expr>),
    Tuple(Vec<Expr>),
    MkRecord {
        tag: String,
        fields: Vec<(String, Expr)>,
    },
    New {
        class: String,
        args: Vec<Expr>,
    },
    Exists {
        binds: Vec<Bind>,
        predicate: Box<Expr>,
    },
    ForAll {
        binds: Vec<Bind>,
        predicate: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    Abs,
    Floor,
    Card,
    Len,
    Elems,
    Inds,
    Hd,
    Tl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Rem,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Implies,
    InSet,
    NotInSet,
    Union,
    Inter,
    Difference,
    Subset,
    Concat,
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(default)]
    pub id: NodeId,
    pub location: Location,
    pub kind: StmtKind,
}

/// The left-hand side of an assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Designator {
    Name(Name),
    Field {
        object: Box<Designator>,
        field: Name,
    },
    Index {
        seq: Box<Designator>,
        index: Expr,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub target: Designator,
    pub value: Expr,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseAlternative {
    pub patterns: Vec<Pattern>,
    pub body: Stmt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TixeAlternative {
    pub bind: PatternBind,
    pub handler: Stmt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StmtKind {
    Assign(Assignment),
    /// `atomic (a1; a2; ...)`
    Atomic(Vec<Assignment>),
    Block {
        #[serde(default)]
        dcls: Vec<Dcl>,
        body: Vec<Stmt>,
    },
    Let {
        defs: Vec<Definition>,
        body: Box<Stmt>,
    },
    Def {
        defs: Vec<Definition>,
        body: Box<Stmt>,
    },
    LetBeSt {
        binds: Vec<Bind>,
        #[serde(default)]
        predicate: Option<Expr>,
        body: Box<Stmt>,
    },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        #[serde(default)]
        elseifs: Vec<(Expr, Stmt)>,
        #[serde(default)]
        else_branch: Option<Box<Stmt>>,
    },
    Cases {
        selector: Expr,
        alternatives: Vec<CaseAlternative>,
        #[serde(default)]
        others: Option<Box<Stmt>>,
    },
    ForIndex {
        var: Name,
        from: Expr,
        to: Expr,
        #[serde(default)]
        by: Option<Expr>,
        body: Box<Stmt>,
    },
    /// `for all p in set S do ...`
    ForAll {
        pattern: Pattern,
        set: Expr,
        body: Box<Stmt>,
    },
    /// `for pb in [reverse] seq do ...`
    ForPattern {
        bind: PatternBind,
        seq: Expr,
        #[serde(default)]
        reverse: bool,
        body: Box<Stmt>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    Call {
        name: Name,
        args: Vec<Expr>,
    },
    CallObject {
        designator: Expr,
        field: Name,
        args: Vec<Expr>,
    },
    Start(Expr),
    StartList(Expr),
    Stop(Expr),
    StopList(Expr),
    Cycles {
        cycles: Expr,
        body: Box<Stmt>,
    },
    Duration {
        duration: Expr,
        body: Box<Stmt>,
    },
    /// `always cleanup in body`
    Always {
        cleanup: Box<Stmt>,
        body: Box<Stmt>,
    },
    /// `trap bind with handler in body`
    Trap {
        bind: PatternBind,
        handler: Box<Stmt>,
        body: Box<Stmt>,
    },
    /// `tixe { bind |-> handler, ... } in body`
    Tixe {
        alternatives: Vec<TixeAlternative>,
        body: Box<Stmt>,
    },
    Exit(Option<Expr>),
    Return(Option<Expr>),
    /// Body of the implicit invariant operation of a class.
    ClassInvariant(Vec<Expr>),
    NotYetSpecified,
    Skip,
}
