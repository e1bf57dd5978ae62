//! Simulated time accounting for `cycles` and `duration` statements.

use crate::context::Context;
use crate::error::EvalResult;
use crate::evaluator::Evaluator;
use crate::scheduler::TimedStepGuard;
use tempo_types::ast::{Expr, Stmt};
use tempo_types::{ErrorCode, Location, Value};

/// The cost clause of a timed statement.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Cost<'e> {
    Cycles(&'e Expr),
    Duration(&'e Expr),
}

impl Evaluator {
    /// Run `body` and charge its cost to the thread.
    ///
    /// Inside an outer timed step only the outer statement is charged. An
    /// abnormal exit from the body charges nothing.
    pub(crate) fn eval_timed(
        &self,
        cost: Cost<'_>,
        body: &Stmt,
        location: &Location,
        ctx: &Context<'_>,
    ) -> EvalResult<Value> {
        let scheduler = self.scheduler();
        let thread = ctx.thread();

        let amount = {
            let _atomic = thread.atomic();
            let expr = match cost {
                Cost::Cycles(e) | Cost::Duration(e) => e,
            };
            let value = self.eval_expr(expr, ctx)?;
            value.real_value().map_err(|e| self.lift(e, location, ctx))?
        };
        if amount < 0.0 || !amount.is_finite() {
            return Err(self.fail(
                ErrorCode::NEGATIVE_DURATION,
                format!("time cost must be a non-negative number, got {amount}"),
                location,
                ctx,
            ));
        }
        let amount = amount.floor() as u64;

        if scheduler.in_timed_step(thread) {
            return self.eval_stmt(body, ctx);
        }

        let duration = match cost {
            Cost::Cycles(_) => scheduler.cycles_to_duration(thread, amount),
            Cost::Duration(_) => amount,
        };
        let result = {
            let _timed = TimedStepGuard::enter(scheduler.as_ref(), thread.as_ref());
            self.eval_stmt(body, ctx)?
        };
        scheduler.charge(thread, duration);
        tracing::trace!(thread = thread.id(), duration, "charged timed step");
        Ok(result)
    }
}
