//! Runtime values.
//!
//! Values are plain data except for three shared kinds: [`Cell`] (an
//! updatable state designator target), [`ObjectValue`] (class instances,
//! shared by reference) and function/operation values. Operations that belong
//! to an object refer back to it through a [`Weak`] so that an object holding
//! its own operations never keeps itself alive.

use crate::ast::{FunctionDef, Literal, Name, OperationDef, Type};
use crate::ValueError;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Shared handle to an object.
pub type ObjectRef = Arc<ObjectValue>;

/// Captured bindings of a local function definition.
pub type Bindings = BTreeMap<Name, Value>;

#[derive(Clone)]
pub enum Value {
    /// Result of a statement that produced nothing.
    Void,
    /// Result of `return` without a value. Distinct from [`Value::Void`] so
    /// that blocks and loops stop at it.
    VoidReturn,
    Nil,
    Bool(bool),
    Int(i64),
    Real(f64),
    Char(char),
    Quote(String),
    Token(Box<Value>),
    Seq(Vec<Value>),
    /// Sorted, without duplicates. Build with [`Value::set`].
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    Record {
        tag: String,
        fields: Vec<(String, Value)>,
    },
    Object(ObjectRef),
    Function(Arc<FunctionValue>),
    Operation(Arc<OperationValue>),
    Updatable(Cell),
}

impl Value {
    pub fn from_literal(lit: &Literal) -> Self {
        match lit {
            Literal::Nil => Self::Nil,
            Literal::Bool(b) => Self::Bool(*b),
            Literal::Int(i) => Self::Int(*i),
            Literal::Real(r) => Self::Real(*r),
            Literal::Char(c) => Self::Char(*c),
            Literal::Text(s) => Self::text(s),
            Literal::Quote(q) => Self::Quote(q.clone()),
        }
    }

    /// A `seq of char`.
    pub fn text(s: &str) -> Self {
        Self::Seq(s.chars().map(Self::Char).collect())
    }

    /// Build a set, sorting and removing duplicates.
    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        let mut items: Vec<Value> = items.into_iter().map(|v| v.deref()).collect();
        items.sort_by(|a, b| a.compare(b));
        items.dedup_by(|a, b| a.compare(b) == Ordering::Equal);
        Self::Set(items)
    }

    /// Strip any number of updatable wrappers.
    pub fn deref(&self) -> Value {
        match self {
            Self::Updatable(cell) => cell.get().deref(),
            other => other.clone(),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Void | Self::VoidReturn => "void",
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Real(_) => "real",
            Self::Char(_) => "char",
            Self::Quote(_) => "quote",
            Self::Token(_) => "token",
            Self::Seq(_) => "seq",
            Self::Set(_) => "set",
            Self::Tuple(_) => "tuple",
            Self::Record { .. } => "record",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::Operation(_) => "operation",
            Self::Updatable(_) => "updatable",
        }
    }

    fn wrong(&self, expected: &'static str) -> ValueError {
        ValueError::WrongType {
            expected,
            actual: self.to_string(),
        }
    }

    // ── Extraction ───────────────────────────────────────────────────────

    pub fn bool_value(&self) -> Result<bool, ValueError> {
        match self.deref() {
            Self::Bool(b) => Ok(b),
            other => Err(other.wrong("bool")),
        }
    }

    pub fn int_value(&self) -> Result<i64, ValueError> {
        match self.deref() {
            Self::Int(i) => Ok(i),
            Self::Real(r) if r.fract() == 0.0 && r.is_finite() => Ok(r as i64),
            other => Err(other.wrong("int")),
        }
    }

    pub fn nat_value(&self) -> Result<u64, ValueError> {
        let i = self.int_value()?;
        u64::try_from(i).map_err(|_| self.deref().wrong("nat"))
    }

    pub fn real_value(&self) -> Result<f64, ValueError> {
        match self.deref() {
            Self::Int(i) => Ok(i as f64),
            Self::Real(r) => Ok(r),
            other => Err(other.wrong("real")),
        }
    }

    pub fn set_value(&self) -> Result<Vec<Value>, ValueError> {
        match self.deref() {
            Self::Set(items) => Ok(items),
            other => Err(other.wrong("set")),
        }
    }

    pub fn seq_value(&self) -> Result<Vec<Value>, ValueError> {
        match self.deref() {
            Self::Seq(items) => Ok(items),
            other => Err(other.wrong("seq")),
        }
    }

    pub fn tuple_value(&self) -> Result<Vec<Value>, ValueError> {
        match self.deref() {
            Self::Tuple(items) => Ok(items),
            other => Err(other.wrong("tuple")),
        }
    }

    pub fn object_value(&self) -> Result<ObjectRef, ValueError> {
        match self.deref() {
            Self::Object(obj) => Ok(obj),
            other => Err(other.wrong("object")),
        }
    }

    pub fn cell_value(&self) -> Result<Cell, ValueError> {
        match self {
            Self::Updatable(cell) => Ok(cell.clone()),
            _ => Err(ValueError::NotUpdatable),
        }
    }

    /// The string held by a `seq of char`, if this is one.
    pub fn as_text(&self) -> Option<String> {
        match self.deref() {
            Self::Seq(items) => items
                .iter()
                .map(|v| match v {
                    Self::Char(c) => Some(*c),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Select a record field or object member.
    pub fn field(&self, name: &Name) -> Result<Value, ValueError> {
        match self.deref() {
            Self::Record { fields, .. } => fields
                .iter()
                .find(|(f, _)| *f == name.text)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| ValueError::NoSuchField(name.text.clone())),
            Self::Object(obj) => obj.field(name),
            other => Err(other.wrong("record or object")),
        }
    }

    // ── Conversion ───────────────────────────────────────────────────────

    /// Convert to a static type, failing if the value is not a member of it.
    pub fn convert_to(&self, ty: &Type) -> Result<Value, ValueError> {
        let v = self.deref();
        let fail = || ValueError::Conversion {
            value: v.to_string(),
            target: ty.to_string(),
        };
        match (ty, &v) {
            (Type::Unknown, _) => Ok(v.clone()),
            (Type::Void, Self::Void | Self::VoidReturn) => Ok(Self::Void),
            (Type::Bool, Self::Bool(_)) => Ok(v.clone()),
            (Type::Nat | Type::Nat1 | Type::Int, Self::Int(_) | Self::Real(_)) => {
                let i = v.int_value().map_err(|_| fail())?;
                match ty {
                    Type::Nat if i < 0 => Err(fail()),
                    Type::Nat1 if i < 1 => Err(fail()),
                    _ => Ok(Self::Int(i)),
                }
            }
            (Type::Real, Self::Int(_) | Self::Real(_)) => Ok(v.clone()),
            (Type::Char, Self::Char(_)) => Ok(v.clone()),
            (Type::Token, Self::Token(_)) => Ok(v.clone()),
            (Type::Quote(q), Self::Quote(x)) if q == x => Ok(v.clone()),
            (Type::Seq(t), Self::Seq(items)) => Ok(Self::Seq(convert_all(items, t)?)),
            (Type::Seq1(t), Self::Seq(items)) if !items.is_empty() => {
                Ok(Self::Seq(convert_all(items, t)?))
            }
            (Type::Set(t), Self::Set(items)) => Ok(Self::set(convert_all(items, t)?)),
            (Type::Product(ts), Self::Tuple(items)) if ts.len() == items.len() => items
                .iter()
                .zip(ts)
                .map(|(v, t)| v.convert_to(t))
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Tuple),
            (Type::Record(name), Self::Record { tag, .. }) if name == tag => Ok(v.clone()),
            (Type::Class(name), Self::Object(obj)) if obj.class() == name => Ok(v.clone()),
            (Type::Optional(_), Self::Nil) => Ok(Self::Nil),
            (Type::Optional(t), _) => v.convert_to(t),
            (Type::Union(ts), _) => ts
                .iter()
                .find_map(|t| v.convert_to(t).ok())
                .ok_or_else(fail),
            _ => Err(fail()),
        }
    }

    // ── Ordering ─────────────────────────────────────────────────────────

    fn rank(&self) -> u8 {
        match self {
            Self::Nil => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Real(_) => 2,
            Self::Char(_) => 3,
            Self::Quote(_) => 4,
            Self::Token(_) => 5,
            Self::Seq(_) => 6,
            Self::Set(_) => 7,
            Self::Tuple(_) => 8,
            Self::Record { .. } => 9,
            Self::Object(_) => 10,
            Self::Function(_) => 11,
            Self::Operation(_) => 12,
            Self::Void => 13,
            Self::VoidReturn => 14,
            Self::Updatable(_) => 15,
        }
    }

    /// Total order used for set normalisation and deep equality.
    ///
    /// Integers and reals compare numerically; objects by identity.
    pub fn compare(&self, other: &Value) -> Ordering {
        if let Self::Updatable(cell) = self {
            return cell.get().compare(other);
        }
        if let Self::Updatable(cell) = other {
            return self.compare(&cell.get());
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Int(_) | Self::Real(_), Self::Int(_) | Self::Real(_)) => {
                let a = self.real_value().unwrap_or(f64::NAN);
                let b = other.real_value().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (Self::Char(a), Self::Char(b)) => a.cmp(b),
            (Self::Quote(a), Self::Quote(b)) => a.cmp(b),
            (Self::Token(a), Self::Token(b)) => a.compare(b),
            (Self::Seq(a), Self::Seq(b))
            | (Self::Set(a), Self::Set(b))
            | (Self::Tuple(a), Self::Tuple(b)) => compare_all(a, b),
            (
                Self::Record {
                    tag: ta,
                    fields: fa,
                },
                Self::Record {
                    tag: tb,
                    fields: fb,
                },
            ) => ta.cmp(tb).then_with(|| {
                let va: Vec<Value> = fa.iter().map(|(_, v)| v.clone()).collect();
                let vb: Vec<Value> = fb.iter().map(|(_, v)| v.clone()).collect();
                compare_all(&va, &vb)
            }),
            (Self::Object(a), Self::Object(b)) => a.id().cmp(&b.id()),
            (Self::Function(a), Self::Function(b)) => a.def.name.cmp(&b.def.name),
            (Self::Operation(a), Self::Operation(b)) => a.def.name.cmp(&b.def.name),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// Set membership by deep equality.
    pub fn contains(&self, item: &Value) -> Result<bool, ValueError> {
        Ok(self
            .set_value()?
            .binary_search_by(|entry| entry.compare(item))
            .is_ok())
    }
}

fn convert_all(items: &[Value], ty: &Type) -> Result<Vec<Value>, ValueError> {
    items.iter().map(|v| v.convert_to(ty)).collect()
}

fn compare_all(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match x.compare(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

fn join(items: &[Value]) -> String {
    items
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void | Self::VoidReturn => write!(f, "()"),
            Self::Nil => write!(f, "nil"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Real(r) => {
                if r.fract() == 0.0 && r.is_finite() {
                    write!(f, "{r:.1}")
                } else {
                    write!(f, "{r}")
                }
            }
            Self::Char(c) => write!(f, "'{c}'"),
            Self::Quote(q) => write!(f, "<{q}>"),
            Self::Token(v) => write!(f, "mk_token({v})"),
            Self::Seq(items) => match self.as_text() {
                Some(s) if !items.is_empty() => write!(f, "\"{s}\""),
                _ => write!(f, "[{}]", join(items)),
            },
            Self::Set(items) => write!(f, "{{{}}}", join(items)),
            Self::Tuple(items) => write!(f, "mk_({})", join(items)),
            Self::Record { tag, fields } => {
                let values: Vec<Value> = fields.iter().map(|(_, v)| v.clone()).collect();
                write!(f, "mk_{tag}({})", join(&values))
            }
            Self::Object(obj) => write!(f, "{}{{#{}}}", obj.class(), obj.id()),
            Self::Function(func) => write!(f, "{}", func.def.name.text),
            Self::Operation(op) => write!(f, "{}", op.def.name.text),
            Self::Updatable(cell) => write!(f, "{}", cell.get()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({self})", self.kind_name())
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Cells
// ══════════════════════════════════════════════════════════════════════════════

/// Which instance variable a cell stores, for change logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellOwner {
    pub object: u64,
    pub class: String,
    pub field: String,
}

struct CellInner {
    value: RwLock<Value>,
    ty: Type,
    owner: Option<CellOwner>,
}

/// A mutable, typed slot: block variables, state fields, instance variables.
#[derive(Clone)]
pub struct Cell(Arc<CellInner>);

impl Cell {
    pub fn new(value: Value, ty: Type) -> Self {
        Self(Arc::new(CellInner {
            value: RwLock::new(value),
            ty,
            owner: None,
        }))
    }

    pub fn owned(value: Value, ty: Type, owner: CellOwner) -> Self {
        Self(Arc::new(CellInner {
            value: RwLock::new(value),
            ty,
            owner: Some(owner),
        }))
    }

    pub fn get(&self) -> Value {
        self.0
            .value
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.value.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Convert to the cell's declared type, then store.
    pub fn assign(&self, value: &Value) -> Result<(), ValueError> {
        let converted = value.convert_to(&self.0.ty)?;
        self.set(converted);
        Ok(())
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }

    pub fn owner(&self) -> Option<&CellOwner> {
        self.0.owner.as_ref()
    }

    pub fn same(&self, other: &Cell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cell({}: {})", self.get(), self.0.ty)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Objects
// ══════════════════════════════════════════════════════════════════════════════

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// An instance of a class.
pub struct ObjectValue {
    id: u64,
    class: String,
    members: RwLock<BTreeMap<Name, Value>>,
    /// Deployed virtual CPU, 0 when not deployed.
    cpu: AtomicU32,
    /// Simulated thread currently running this object's thread body.
    thread: Mutex<Option<u64>>,
}

impl ObjectValue {
    pub fn new(class: impl Into<String>) -> ObjectRef {
        Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, AtomicOrdering::Relaxed),
            class: class.into(),
            members: RwLock::new(BTreeMap::new()),
            cpu: AtomicU32::new(0),
            thread: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn set_member(&self, name: Name, value: Value) {
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
    }

    /// Exact lookup by resolved name.
    pub fn member(&self, name: &Name) -> Option<Value> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Lookup by resolved name, falling back to a unique match on text when
    /// the name carries no signature.
    pub fn field(&self, name: &Name) -> Result<Value, ValueError> {
        if let Some(v) = self.member(name) {
            return Ok(v);
        }
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        let mut candidates = members
            .iter()
            .filter(|(k, _)| k.text == name.text && name.signature.is_none());
        match (candidates.next(), candidates.next()) {
            (Some((_, v)), None) => Ok(v.clone()),
            _ => Err(ValueError::NoSuchField(name.text.clone())),
        }
    }

    pub fn member_names(&self) -> Vec<Name> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn deploy(&self, cpu: u32) {
        self.cpu.store(cpu, AtomicOrdering::Relaxed);
    }

    pub fn cpu(&self) -> Option<u32> {
        match self.cpu.load(AtomicOrdering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn thread(&self) -> Option<u64> {
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_thread(&self, thread: Option<u64>) {
        *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = thread;
    }
}

impl fmt::Debug for ObjectValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{#{}}}", self.class, self.id)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Functions & Operations
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct FunctionValue {
    pub def: Arc<FunctionDef>,
    /// Bindings visible where a local function was defined.
    pub free_vars: Option<Arc<Bindings>>,
    pub class: Option<String>,
    pub self_obj: Option<Weak<ObjectValue>>,
}

impl FunctionValue {
    pub fn self_obj(&self) -> Option<ObjectRef> {
        self.self_obj.as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Debug, Clone)]
pub struct OperationValue {
    pub def: Arc<OperationDef>,
    pub class: Option<String>,
    pub self_obj: Option<Weak<ObjectValue>>,
}

impl OperationValue {
    pub fn self_obj(&self) -> Option<ObjectRef> {
        self.self_obj.as_ref().and_then(Weak::upgrade)
    }

    pub fn module(&self) -> &str {
        &self.def.name.module
    }
}
