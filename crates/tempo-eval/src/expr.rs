//! Expression evaluation and operators.

use crate::context::Context;
use crate::error::EvalResult;
use crate::evaluator::Evaluator;
use std::cmp::Ordering;
use tempo_types::ast::{BinOp, Bind, Expr, ExprKind, UnaryOp};
use tempo_types::{ErrorCode, Location, Value, ValueError};

/// Largest `{low, ..., high}` range that is built.
const MAX_SET_RANGE: i128 = 1 << 20;

impl Evaluator {
    /// Evaluate one expression. Results never carry an updatable wrapper.
    pub fn eval_expr(&self, expr: &Expr, ctx: &Context<'_>) -> EvalResult<Value> {
        self.check(expr.id, &expr.location, ctx)?;
        let loc = &expr.location;
        match &expr.kind {
            ExprKind::Literal(lit) => Ok(Value::from_literal(lit)),
            ExprKind::Name(name) => ctx
                .lookup(name)
                .map(|v| v.deref())
                .ok_or_else(|| self.fail(ErrorCode::NAME_NOT_FOUND, format!("name {name} not in scope"), loc, ctx)),
            ExprKind::SelfRef => ctx.self_object().map(Value::Object).ok_or_else(|| {
                self.fail(ErrorCode::NAME_NOT_FOUND, "self used outside an object", loc, ctx)
            }),
            ExprKind::Time => {
                let now = self.scheduler().time(ctx.thread());
                Ok(Value::Int(i64::try_from(now).unwrap_or(i64::MAX)))
            }
            ExprKind::Field { object, field } => {
                let value = self.eval_expr(object, ctx)?;
                value
                    .field(field)
                    .map(|v| v.deref())
                    .map_err(|e| self.lift(e, loc, ctx))
            }
            ExprKind::Apply { root, args } => {
                let callee = self.eval_expr(root, ctx)?;
                let args = self.eval_args(args, ctx)?;
                self.apply(callee, args, loc, ctx)
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval_expr(operand, ctx)?;
                unary(*op, &value).map_err(|e| self.lift(e, loc, ctx))
            }
            ExprKind::Binary { left, op, right } => self.eval_binary(left, *op, right, loc, ctx),
            ExprKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if self.eval_condition(condition, ctx)? {
                    self.eval_expr(then_branch, ctx)
                } else {
                    self.eval_expr(else_branch, ctx)
                }
            }
            ExprKind::Let { defs, body } => {
                let child = self.eval_definitions(defs, loc, ctx)?;
                self.eval_expr(body, &child)
            }
            ExprKind::SetEnum(items) => Ok(Value::set(self.eval_args(items, ctx)?)),
            ExprKind::SetRange { low, high } => {
                let low = self.eval_int(low, ctx)?;
                let high = self.eval_int(high, ctx)?;
                let size = i128::from(high) - i128::from(low) + 1;
                if size > MAX_SET_RANGE {
                    return Err(self.fail(
                        ErrorCode::RANGE_TOO_LARGE,
                        format!("set range {{{low}, ..., {high}}} has {size} elements, limit is {MAX_SET_RANGE}"),
                        loc,
                        ctx,
                    ));
                }
                Ok(Value::set((low..=high).map(Value::Int)))
            }
            ExprKind::SeqEnum(items) => Ok(Value::Seq(self.eval_args(items, ctx)?)),
            ExprKind::Tuple(items) => Ok(Value::Tuple(self.eval_args(items, ctx)?)),
            ExprKind::MkRecord { tag, fields } => {
                let fields = fields
                    .iter()
                    .map(|(name, e)| Ok((name.clone(), self.eval_expr(e, ctx)?)))
                    .collect::<EvalResult<Vec<_>>>()?;
                Ok(Value::Record {
                    tag: tag.clone(),
                    fields,
                })
            }
            ExprKind::New { class, args } => {
                let args = self.eval_args(args, ctx)?;
                self.new_object(class, args, loc, ctx).map(Value::Object)
            }
            ExprKind::Exists { binds, predicate } => {
                Ok(Value::Bool(self.any_binding(binds, predicate, true, loc, ctx)?))
            }
            ExprKind::ForAll { binds, predicate } => {
                Ok(Value::Bool(!self.any_binding(binds, predicate, false, loc, ctx)?))
            }
        }
    }

    /// Whether some binding makes `predicate` equal to `wanted`.
    fn any_binding(
        &self,
        binds: &[Bind],
        predicate: &Expr,
        wanted: bool,
        loc: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<bool> {
        for matched in self.bind_combinations(binds, loc, ctx)? {
            let mut child = Context::derive(ctx, "quantifier", loc);
            child.bind_all(matched);
            if self.eval_condition(predicate, &child)? == wanted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ── Typed helpers ────────────────────────────────────────────────────

    pub(crate) fn eval_condition(&self, expr: &Expr, ctx: &Context<'_>) -> EvalResult<bool> {
        let value = self.eval_expr(expr, ctx)?;
        value.bool_value().map_err(|e| self.lift(e, &expr.location, ctx))
    }

    pub(crate) fn eval_int(&self, expr: &Expr, ctx: &Context<'_>) -> EvalResult<i64> {
        let value = self.eval_expr(expr, ctx)?;
        value.int_value().map_err(|e| self.lift(e, &expr.location, ctx))
    }

    pub(crate) fn eval_nat(&self, expr: &Expr, ctx: &Context<'_>) -> EvalResult<u64> {
        let value = self.eval_expr(expr, ctx)?;
        value.nat_value().map_err(|e| self.lift(e, &expr.location, ctx))
    }

    pub(crate) fn eval_set(&self, expr: &Expr, ctx: &Context<'_>) -> EvalResult<Vec<Value>> {
        let value = self.eval_expr(expr, ctx)?;
        value.set_value().map_err(|e| self.lift(e, &expr.location, ctx))
    }

    pub(crate) fn eval_seq(&self, expr: &Expr, ctx: &Context<'_>) -> EvalResult<Vec<Value>> {
        let value = self.eval_expr(expr, ctx)?;
        value.seq_value().map_err(|e| self.lift(e, &expr.location, ctx))
    }

    fn eval_binary(&self, left: &Expr, op: BinOp, right: &Expr, loc: &Location, ctx: &Context<'_>) -> EvalResult<Value> {
        match op {
            BinOp::And => Ok(Value::Bool(
                self.eval_condition(left, ctx)? && self.eval_condition(right, ctx)?,
            )),
            BinOp::Or => Ok(Value::Bool(
                self.eval_condition(left, ctx)? || self.eval_condition(right, ctx)?,
            )),
            BinOp::Implies => Ok(Value::Bool(
                !self.eval_condition(left, ctx)? || self.eval_condition(right, ctx)?,
            )),
            _ => {
                let l = self.eval_expr(left, ctx)?;
                let r = self.eval_expr(right, ctx)?;
                binary(op, &l, &r).map_err(|e| self.lift(e, loc, ctx))
            }
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Operators
// ══════════════════════════════════════════════════════════════════════════════

fn unary(op: UnaryOp, v: &Value) -> Result<Value, ValueError> {
    match op {
        UnaryOp::Neg => match v {
            Value::Int(i) => Ok(i
                .checked_neg()
                .map(Value::Int)
                .unwrap_or(Value::Real(-(*i as f64)))),
            _ => Ok(Value::Real(-v.real_value()?)),
        },
        UnaryOp::Not => Ok(Value::Bool(!v.bool_value()?)),
        UnaryOp::Abs => match v {
            Value::Int(i) => Ok(i
                .checked_abs()
                .map(Value::Int)
                .unwrap_or(Value::Real((*i as f64).abs()))),
            _ => Ok(Value::Real(v.real_value()?.abs())),
        },
        UnaryOp::Floor => Ok(Value::Int(v.real_value()?.floor() as i64)),
        UnaryOp::Card => Ok(Value::Int(v.set_value()?.len() as i64)),
        UnaryOp::Len => Ok(Value::Int(v.seq_value()?.len() as i64)),
        UnaryOp::Elems => Ok(Value::set(v.seq_value()?)),
        UnaryOp::Inds => {
            let len = v.seq_value()?.len() as i64;
            Ok(Value::set((1..=len).map(Value::Int)))
        }
        UnaryOp::Hd => v
            .seq_value()?
            .into_iter()
            .next()
            .ok_or(ValueError::EmptySequence("hd")),
        UnaryOp::Tl => {
            let items = v.seq_value()?;
            match items.split_first() {
                Some((_, rest)) => Ok(Value::Seq(rest.to_vec())),
                None => Err(ValueError::EmptySequence("tl")),
            }
        }
    }
}

/// Integer arithmetic that overflows continues in reals.
fn arith(op: BinOp, l: &Value, r: &Value) -> Result<Value, ValueError> {
    if let (Value::Int(a), Value::Int(b)) = (l, r) {
        let exact = match op {
            BinOp::Add => a.checked_add(*b),
            BinOp::Sub => a.checked_sub(*b),
            _ => a.checked_mul(*b),
        };
        if let Some(i) = exact {
            return Ok(Value::Int(i));
        }
    }
    let a = l.real_value()?;
    let b = r.real_value()?;
    Ok(Value::Real(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        _ => a * b,
    }))
}

fn numeric_cmp(l: &Value, r: &Value) -> Result<Ordering, ValueError> {
    match (l, r) {
        (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
        _ => Ok(l.real_value()?.total_cmp(&r.real_value()?)),
    }
}

fn int_operands(l: &Value, r: &Value) -> Result<(i64, i64), ValueError> {
    let a = l.int_value()?;
    let b = r.int_value()?;
    if b == 0 {
        return Err(ValueError::DivisionByZero);
    }
    Ok((a, b))
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, ValueError> {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => arith(op, l, r),
        BinOp::Div => {
            let d = r.real_value()?;
            if d == 0.0 {
                return Err(ValueError::DivisionByZero);
            }
            if let (Value::Int(a), Value::Int(b)) = (l, r) {
                if let (Some(0), Some(q)) = (a.checked_rem(*b), a.checked_div(*b)) {
                    return Ok(Value::Int(q));
                }
            }
            Ok(Value::Real(l.real_value()? / d))
        }
        BinOp::IntDiv => {
            let (a, b) = int_operands(l, r)?;
            Ok(a.checked_div(b)
                .map(Value::Int)
                .unwrap_or(Value::Real((a as f64 / b as f64).trunc())))
        }
        BinOp::Rem => {
            let (a, b) = int_operands(l, r)?;
            Ok(Value::Int(a.checked_rem(b).unwrap_or(0)))
        }
        BinOp::Mod => {
            let (a, b) = int_operands(l, r)?;
            let m = a.checked_rem(b).unwrap_or(0);
            Ok(Value::Int(if m != 0 && (m < 0) != (b < 0) { m + b } else { m }))
        }
        BinOp::Lt => Ok(Value::Bool(numeric_cmp(l, r)?.is_lt())),
        BinOp::Le => Ok(Value::Bool(numeric_cmp(l, r)?.is_le())),
        BinOp::Gt => Ok(Value::Bool(numeric_cmp(l, r)?.is_gt())),
        BinOp::Ge => Ok(Value::Bool(numeric_cmp(l, r)?.is_ge())),
        BinOp::Eq => Ok(Value::Bool(l == r)),
        BinOp::Ne => Ok(Value::Bool(l != r)),
        BinOp::And => Ok(Value::Bool(l.bool_value()? && r.bool_value()?)),
        BinOp::Or => Ok(Value::Bool(l.bool_value()? || r.bool_value()?)),
        BinOp::Implies => Ok(Value::Bool(!l.bool_value()? || r.bool_value()?)),
        BinOp::InSet => Ok(Value::Bool(r.contains(l)?)),
        BinOp::NotInSet => Ok(Value::Bool(!r.contains(l)?)),
        BinOp::Union => {
            let mut items = l.set_value()?;
            items.extend(r.set_value()?);
            Ok(Value::set(items))
        }
        BinOp::Inter | BinOp::Difference => {
            let keep = op == BinOp::Inter;
            let right = Value::set(r.set_value()?);
            let mut items = Vec::new();
            for item in l.set_value()? {
                if right.contains(&item)? == keep {
                    items.push(item);
                }
            }
            Ok(Value::set(items))
        }
        BinOp::Subset => {
            let right = Value::set(r.set_value()?);
            for item in l.set_value()? {
                if !right.contains(&item)? {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        BinOp::Concat => {
            let mut items = l.seq_value()?;
            items.extend(r.seq_value()?);
            Ok(Value::Seq(items))
        }
    }
}
