//! Integration tests for statement evaluation.
//!
//! Covers:
//! - blocks, declarations and return inside loops
//! - for loops (empty ranges, negative steps, zero step)
//! - always / trap / tixe, with and without exceptions
//! - let be st, cases, atomic assignment, designator updates
//! - objects, constructors, class invariants, instance-change logging
//! - delegates for unspecified operations, preconditions
//! - coverage and determinism

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempo_eval::{
    Delegate, DelegateCall, DelegateRegistry, EvalError, MemorySink, Runtime, Settings,
};
use tempo_types::ast::*;
use tempo_types::{ErrorCode, Value};

fn code_of(result: Result<Value, EvalError>) -> Option<ErrorCode> {
    result.err().and_then(|e| e.code())
}

fn always(line: u32, cleanup: Stmt, body: Stmt) -> Stmt {
    stmt(
        line,
        StmtKind::Always {
            cleanup: Box::new(cleanup),
            body: Box::new(body),
        },
    )
}

fn trap(line: u32, bind: PatternBind, handler: Stmt, body: Stmt) -> Stmt {
    stmt(
        line,
        StmtKind::Trap {
            bind,
            handler: Box::new(handler),
            body: Box::new(body),
        },
    )
}

fn tixe(line: u32, alternatives: Vec<(PatternBind, Stmt)>, body: Stmt) -> Stmt {
    stmt(
        line,
        StmtKind::Tixe {
            alternatives: alternatives
                .into_iter()
                .map(|(bind, handler)| TixeAlternative { bind, handler })
                .collect(),
            body: Box::new(body),
        },
    )
}

fn quote_bind(q: &str) -> PatternBind {
    PatternBind::Pattern(quote_pattern(q))
}

/// `state S of count : int init 0`, plus the given operations and `get`.
fn counting_model(operations: Vec<Arc<OperationDef>>) -> Model {
    let mut ops = operations;
    ops.push(op("get", Type::Int, ret(90, var("count"))));
    model(
        vec![with_state(module(ops), vec![("count", Type::Int, int(0))])],
        Vec::new(),
    )
}

// ══════════════════════════════════════════════════════════════════════════════
// Blocks & loops
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn return_inside_loop_ends_the_block() {
    let body = block(
        1,
        vec![dcl("x", Type::Int, int(0))],
        vec![
            for_index(
                2,
                "i",
                1,
                5,
                None,
                block(
                    3,
                    Vec::new(),
                    vec![
                        incr(4, "x"),
                        if_then(5, bin(var("x"), BinOp::Eq, int(2)), ret(6, var("x"))),
                    ],
                ),
            ),
            ret(7, int(99)),
        ],
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(2));
}

#[test]
fn for_loop_with_empty_range_runs_zero_times() {
    let body = block(
        1,
        vec![dcl("x", Type::Int, int(0))],
        vec![for_index(2, "i", 5, 1, None, incr(3, "x")), ret(4, var("x"))],
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(0));
}

#[test]
fn for_loop_with_negative_step() {
    let body = block(
        1,
        vec![dcl("x", Type::Int, int(0))],
        vec![
            for_index(2, "i", 5, 1, Some(-2), assign(3, "x", bin(var("x"), BinOp::Add, var("i")))),
            ret(4, var("x")),
        ],
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(9));
}

#[test]
fn for_loop_with_zero_step_is_fatal() {
    let body = block(1, Vec::new(), vec![for_index(2, "i", 1, 5, Some(0), skip(3))]);
    assert_eq!(code_of(run_body(body)), Some(ErrorCode::LOOP_NEVER_TERMINATES));
}

#[test]
fn while_loop_counts_up() {
    let body = block(
        1,
        vec![dcl("x", Type::Int, int(0))],
        vec![
            stmt(
                2,
                StmtKind::While {
                    condition: bin(var("x"), BinOp::Lt, int(3)),
                    body: Box::new(incr(3, "x")),
                },
            ),
            ret(4, var("x")),
        ],
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(3));
}

#[test]
fn for_all_over_a_set() {
    let body = block(
        1,
        vec![dcl("x", Type::Int, int(0))],
        vec![
            stmt(
                2,
                StmtKind::ForAll {
                    pattern: ident("e"),
                    set: set_of(vec![int(1), int(2), int(3), int(2)]),
                    body: Box::new(assign(3, "x", bin(var("x"), BinOp::Add, var("e")))),
                },
            ),
            ret(4, var("x")),
        ],
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(6));
}

fn set_range(low: i64, high: i64) -> Expr {
    expr(ExprKind::SetRange {
        low: Box::new(int(low)),
        high: Box::new(int(high)),
    })
}

#[test]
fn set_range_is_bounded() {
    assert_eq!(run_body(ret(1, set_range(2, 4))).unwrap().to_string(), "{2, 3, 4}");
    assert_eq!(
        code_of(run_body(ret(1, set_range(1, 1_000_000_000)))),
        Some(ErrorCode::RANGE_TOO_LARGE)
    );
}

#[test]
fn for_pattern_with_set_bind_checks_membership() {
    let body = stmt(
        1,
        StmtKind::ForPattern {
            bind: PatternBind::Bind(Bind::Set {
                pattern: ident("e"),
                set: set_of(vec![int(1), int(2)]),
            }),
            seq: seq_of(vec![int(1), int(3)]),
            reverse: false,
            body: Box::new(skip(2)),
        },
    );
    assert_eq!(code_of(run_body(body)), Some(ErrorCode::BIND_MEMBERSHIP_FAILED));
}

#[test]
fn for_pattern_in_reverse() {
    let body = block(
        1,
        vec![dcl("s", Type::Seq(Box::new(Type::Int)), seq_of(Vec::new()))],
        vec![
            stmt(
                2,
                StmtKind::ForPattern {
                    bind: PatternBind::Pattern(ident("e")),
                    seq: seq_of(vec![int(1), int(2), int(3)]),
                    reverse: true,
                    body: Box::new(assign(
                        3,
                        "s",
                        bin(var("s"), BinOp::Concat, seq_of(vec![var("e")])),
                    )),
                },
            ),
            ret(4, var("s")),
        ],
    );
    assert_eq!(
        run_body(body).unwrap(),
        Value::Seq(vec![Value::Int(3), Value::Int(2), Value::Int(1)])
    );
}

// ══════════════════════════════════════════════════════════════════════════════
// Always, trap, tixe
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn always_runs_once_on_exit_and_on_normal_completion() {
    let body = block(
        1,
        vec![dcl("n", Type::Int, int(0))],
        vec![
            trap(2, quote_bind("E"), skip(3), always(4, incr(5, "n"), exit(6, quote("E")))),
            always(7, incr(8, "n"), skip(9)),
            ret(10, var("n")),
        ],
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(2));
}

#[test]
fn always_runs_once_on_return_and_on_fatal_error() {
    let ev = evaluator(counting_model(vec![
        op("returns", Type::Int, always(1, incr(2, "count"), ret(3, int(5)))),
        op(
            "fails",
            Type::Int,
            always(4, incr(5, "count"), ret(6, bin(int(1), BinOp::Div, int(0)))),
        ),
    ]));
    assert_eq!(ev.call(MODULE, "returns", Vec::new()).unwrap(), Value::Int(5));
    assert_eq!(ev.call(MODULE, "get", Vec::new()).unwrap(), Value::Int(1));
    assert_eq!(
        code_of(ev.call(MODULE, "fails", Vec::new())),
        Some(ErrorCode::DIVISION_BY_ZERO)
    );
    assert_eq!(ev.call(MODULE, "get", Vec::new()).unwrap(), Value::Int(2));
}

#[test]
fn always_cleanup_exit_replaces_the_body_exit() {
    let body = trap(
        1,
        PatternBind::Pattern(ident("v")),
        ret(2, var("v")),
        always(3, exit(4, quote("A")), exit(5, quote("B"))),
    );
    assert_eq!(run_body(body).unwrap(), Value::Quote("A".into()));
}

#[test]
fn trap_that_does_not_match_propagates() {
    let body = trap(1, quote_bind("A"), ret(2, int(1)), exit(3, quote("B")));
    let err = run_body(body).unwrap_err();
    assert_eq!(err.exit_value(), Some(&Value::Quote("B".into())));
}

#[test]
fn trap_with_failing_set_bind_is_fatal() {
    let bind = PatternBind::Bind(Bind::Set {
        pattern: ident("v"),
        set: set_of(vec![int(1), int(2)]),
    });
    let body = trap(1, bind, skip(2), exit(3, int(3)));
    assert_eq!(code_of(run_body(body)), Some(ErrorCode::TRAP_BIND_FAILED));
}

#[test]
fn trap_binds_the_exit_value() {
    let body = trap(
        1,
        PatternBind::Pattern(ident("v")),
        ret(2, bin(var("v"), BinOp::Mul, int(10))),
        exit(3, int(4)),
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(40));
}

#[test]
fn tixe_restarts_matching_when_a_handler_exits() {
    let body = tixe(
        1,
        vec![
            (quote_bind("A"), exit(2, quote("B"))),
            (quote_bind("B"), ret(3, int(7))),
        ],
        exit(4, quote("A")),
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(7));
}

#[test]
fn tixe_without_match_reraises() {
    let body = tixe(1, vec![(quote_bind("A"), ret(2, int(1)))], exit(3, quote("C")));
    let err = run_body(body).unwrap_err();
    assert_eq!(err.exit_value(), Some(&Value::Quote("C".into())));
}

#[test]
fn exceptions_turn_fatal_errors_into_exits() {
    let handler_pattern = pattern(PatternKind::Tuple(vec![ident("c"), pattern(PatternKind::Ignore)]));
    let body = trap(
        1,
        PatternBind::Pattern(handler_pattern),
        ret(2, var("c")),
        ret(3, bin(int(1), BinOp::Div, int(0))),
    );
    let settings = Settings {
        exceptions: true,
        ..Settings::default()
    };
    let ev = evaluator_with(model(vec![module(vec![op("run", Type::Unknown, body)])], Vec::new()), settings);
    assert_eq!(
        ev.call(MODULE, "run", Vec::new()).unwrap(),
        Value::Int(i64::from(ErrorCode::DIVISION_BY_ZERO.0))
    );
}

// ══════════════════════════════════════════════════════════════════════════════
// Bindings & selection
// ══════════════════════════════════════════════════════════════════════════════

fn let_be(predicate: Expr) -> Stmt {
    stmt(
        1,
        StmtKind::LetBeSt {
            binds: vec![Bind::Set {
                pattern: ident("x"),
                set: set_of(vec![int(3), int(1), int(2)]),
            }],
            predicate: Some(predicate),
            body: Box::new(ret(2, var("x"))),
        },
    )
}

#[test]
fn let_be_st_picks_the_first_satisfying_binding() {
    assert_eq!(run_body(let_be(bin(var("x"), BinOp::Gt, int(1)))).unwrap(), Value::Int(2));
}

#[test]
fn let_be_st_without_a_satisfying_binding_is_fatal() {
    assert_eq!(
        code_of(run_body(let_be(bin(var("x"), BinOp::Gt, int(5))))),
        Some(ErrorCode::LET_BE_EXHAUSTED)
    );
}

#[test]
fn let_be_st_over_a_type_bind() {
    let body = stmt(
        1,
        StmtKind::LetBeSt {
            binds: vec![Bind::Type {
                pattern: ident("b"),
                ty: Type::Bool,
            }],
            predicate: Some(var("b")),
            body: Box::new(ret(2, var("b"))),
        },
    );
    assert_eq!(run_body(body).unwrap(), Value::Bool(true));

    let body = stmt(
        1,
        StmtKind::LetBeSt {
            binds: vec![Bind::Type {
                pattern: ident("n"),
                ty: Type::Nat,
            }],
            predicate: None,
            body: Box::new(ret(2, var("n"))),
        },
    );
    assert_eq!(code_of(run_body(body)), Some(ErrorCode::TYPE_NOT_ENUMERABLE));
}

#[test]
fn cases_selects_the_matching_alternative() {
    let cases = |selector: &str| {
        stmt(
            1,
            StmtKind::Cases {
                selector: quote(selector),
                alternatives: vec![
                    CaseAlternative {
                        patterns: vec![quote_pattern("A")],
                        body: ret(2, int(1)),
                    },
                    CaseAlternative {
                        patterns: vec![quote_pattern("B"), quote_pattern("C")],
                        body: ret(3, int(2)),
                    },
                ],
                others: Some(Box::new(ret(4, int(3)))),
            },
        )
    };
    assert_eq!(run_body(cases("C")).unwrap(), Value::Int(2));
    assert_eq!(run_body(cases("Z")).unwrap(), Value::Int(3));
}

#[test]
fn recursive_local_function() {
    let fact = Arc::new(FunctionDef {
        name: name("fact"),
        params: vec![ident("n")],
        param_types: vec![Type::Int],
        result: Type::Int,
        body: expr(ExprKind::If {
            condition: Box::new(bin(var("n"), BinOp::Eq, int(0))),
            then_branch: Box::new(int(1)),
            else_branch: Box::new(bin(
                var("n"),
                BinOp::Mul,
                apply(var("fact"), vec![bin(var("n"), BinOp::Sub, int(1))]),
            )),
        }),
        pre: None,
        location: loc(0),
    });
    let body = stmt(
        1,
        StmtKind::Let {
            defs: vec![Definition {
                location: loc(1),
                kind: DefinitionKind::Function(fact),
            }],
            body: Box::new(ret(2, apply(var("fact"), vec![int(5)]))),
        },
    );
    assert_eq!(run_body(body).unwrap(), Value::Int(120));
}

#[test]
fn let_pattern_mismatch_is_fatal() {
    let body = stmt(
        1,
        StmtKind::Let {
            defs: vec![Definition {
                location: loc(1),
                kind: DefinitionKind::Value {
                    pattern: pattern(PatternKind::Tuple(vec![ident("a"), ident("b")])),
                    ty: None,
                    expr: int(1),
                },
            }],
            body: Box::new(skip(2)),
        },
    );
    assert_eq!(code_of(run_body(body)), Some(ErrorCode::PATTERN_MISMATCH));
}

// ══════════════════════════════════════════════════════════════════════════════
// Assignment
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn atomic_assignment_evaluates_all_values_first() {
    let body = block(
        1,
        vec![dcl("x", Type::Int, int(1)), dcl("y", Type::Int, int(2))],
        vec![
            stmt(
                2,
                StmtKind::Atomic(vec![
                    Assignment {
                        target: Designator::Name(name("x")),
                        value: var("y"),
                        location: loc(2),
                    },
                    Assignment {
                        target: Designator::Name(name("y")),
                        value: var("x"),
                        location: loc(2),
                    },
                ]),
            ),
            ret(3, expr(ExprKind::Tuple(vec![var("x"), var("y")]))),
        ],
    );
    assert_eq!(
        run_body(body).unwrap(),
        Value::Tuple(vec![Value::Int(2), Value::Int(1)])
    );
}

#[test]
fn sequence_element_and_record_field_assignment() {
    let record = expr(ExprKind::MkRecord {
        tag: "P".into(),
        fields: vec![("x".into(), int(1)), ("y".into(), int(2))],
    });
    let body = block(
        1,
        vec![
            dcl("s", Type::Seq(Box::new(Type::Int)), seq_of(vec![int(1), int(2), int(3)])),
            dcl("p", Type::Record("P".into()), record),
        ],
        vec![
            assign_to(
                2,
                Designator::Index {
                    seq: Box::new(Designator::Name(name("s"))),
                    index: int(2),
                },
                int(9),
            ),
            assign_to(
                3,
                Designator::Field {
                    object: Box::new(Designator::Name(name("p"))),
                    field: name("y"),
                },
                int(7),
            ),
            ret(4, expr(ExprKind::Tuple(vec![var("s"), var("p")]))),
        ],
    );
    let result = run_body(body).unwrap();
    assert_eq!(result.to_string(), "mk_([1, 9, 3], mk_P(1, 7))");
}

#[test]
fn assigning_out_of_range_is_fatal() {
    let body = block(
        1,
        vec![dcl("s", Type::Seq(Box::new(Type::Int)), seq_of(vec![int(1)]))],
        vec![assign_to(
            2,
            Designator::Index {
                seq: Box::new(Designator::Name(name("s"))),
                index: int(3),
            },
            int(9),
        )],
    );
    assert_eq!(code_of(run_body(body)), Some(ErrorCode::INDEX_OUT_OF_RANGE));
}

// ══════════════════════════════════════════════════════════════════════════════
// Objects
// ══════════════════════════════════════════════════════════════════════════════

fn counter_class() -> ClassDef {
    class(
        "Counter",
        vec![("n", Type::Nat, int(0))],
        vec![
            operation("Counter", "inc", Vec::new(), Type::Void, incr(1, "n")),
            operation("Counter", "get", Vec::new(), Type::Nat, ret(2, var("n"))),
            operation(
                "Counter",
                "Counter",
                vec![("start", Type::Nat)],
                Type::Void,
                assign(3, "n", var("start")),
            ),
        ],
    )
}

#[test]
fn object_state_survives_between_calls() {
    let ev = evaluator(model(Vec::new(), vec![counter_class()]));
    let obj = ev.new_instance("Counter", Vec::new()).unwrap();
    ev.call_method(&obj, "inc", Vec::new()).unwrap();
    ev.call_method(&obj, "inc", Vec::new()).unwrap();
    assert_eq!(ev.call_method(&obj, "get", Vec::new()).unwrap(), Value::Int(2));
}

#[test]
fn constructor_runs_with_arguments() {
    let ev = evaluator(model(Vec::new(), vec![counter_class()]));
    let obj = ev.new_instance("Counter", vec![Value::Int(5)]).unwrap();
    assert_eq!(ev.call_method(&obj, "get", Vec::new()).unwrap(), Value::Int(5));
}

#[test]
fn object_calls_from_statements() {
    let body = block(
        1,
        vec![dcl("c", Type::Class("Counter".into()), new_object("Counter", Vec::new()))],
        vec![
            call_object(2, var("c"), "inc", Vec::new()),
            ret(3, apply(expr(ExprKind::Field {
                object: Box::new(var("c")),
                field: name("get"),
            }), Vec::new())),
        ],
    );
    let ev = evaluator(model(
        vec![module(vec![op("run", Type::Unknown, body)])],
        vec![counter_class()],
    ));
    assert_eq!(ev.call(MODULE, "run", Vec::new()).unwrap(), Value::Int(1));
}

#[test]
fn object_call_counts_one_hit_per_execution() {
    let separate = call_object(2, var("c"), "inc", Vec::new());
    let mut shared = call_object(3, var("c"), "inc", Vec::new());
    let site = shared.location.clone();
    if let StmtKind::CallObject { designator, .. } = &mut shared.kind {
        designator.location = site.clone();
    }
    let separate_site = separate.location.clone();
    let body = block(
        1,
        vec![dcl("c", Type::Class("Counter".into()), new_object("Counter", Vec::new()))],
        vec![
            separate,
            shared,
            ret(4, apply(expr(ExprKind::Field {
                object: Box::new(var("c")),
                field: name("get"),
            }), Vec::new())),
        ],
    );
    let ev = evaluator(model(
        vec![module(vec![op("run", Type::Unknown, body)])],
        vec![counter_class()],
    ));
    assert_eq!(ev.call(MODULE, "run", Vec::new()).unwrap(), Value::Int(2));
    assert_eq!(separate_site.hit_count(), 1);
    assert_eq!(site.hit_count(), 1);
}

/// `Bounded` keeps `n >= 0` as its class invariant.
fn bounded_class() -> ClassDef {
    let mut bounded = class(
        "Bounded",
        vec![("n", Type::Int, int(0))],
        vec![
            operation("Bounded", "inc", Vec::new(), Type::Void, incr(1, "n")),
            operation(
                "Bounded",
                "dec",
                Vec::new(),
                Type::Void,
                assign(2, "n", bin(var("n"), BinOp::Sub, int(1))),
            ),
        ],
    );
    bounded.invariants = vec![bin(var("n"), BinOp::Ge, int(0))];
    bounded
}

#[test]
fn class_invariant_is_checked_after_each_operation() {
    let ev = evaluator(model(Vec::new(), vec![bounded_class()]));
    let obj = ev.new_instance("Bounded", Vec::new()).unwrap();
    ev.call_method(&obj, "inc", Vec::new()).unwrap();
    ev.call_method(&obj, "dec", Vec::new()).unwrap();
    let err = ev.call_method(&obj, "dec", Vec::new()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::INVARIANT_VIOLATED));

    let mut broken = bounded_class();
    broken.instance_vars[0].init = Some(int(-1));
    let ev = evaluator(model(Vec::new(), vec![broken]));
    let err = ev.new_instance("Bounded", Vec::new()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::INVARIANT_VIOLATED));
}

#[test]
fn class_invariant_checks_can_be_turned_off() {
    let settings = Settings {
        inv_checks: false,
        ..Settings::default()
    };
    let ev = evaluator_with(model(Vec::new(), vec![bounded_class()]), settings);
    let obj = ev.new_instance("Bounded", Vec::new()).unwrap();
    ev.call_method(&obj, "dec", Vec::new()).unwrap();
}

#[test]
fn unknown_class_is_fatal() {
    let ev = evaluator(model(Vec::new(), Vec::new()));
    let err = ev.new_instance("Missing", Vec::new()).unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NO_SUCH_CLASS));
}

#[test]
fn instance_variable_changes_are_logged() {
    let sink = Arc::new(MemorySink::new());
    let ev = Runtime::builder(model(Vec::new(), vec![counter_class()]))
        .settings(Settings {
            log_instance_changes: true,
            ..Settings::default()
        })
        .log(sink.clone())
        .build()
        .unwrap();
    let obj = ev.new_instance("Counter", Vec::new()).unwrap();
    ev.call_method(&obj, "inc", Vec::new()).unwrap();
    let texts = sink.texts();
    assert_eq!(texts.len(), 1);
    assert_eq!(
        texts[0],
        format!("instance variable Counter`n of #{} changed to 1", obj.id())
    );
}

#[test]
fn pure_operations_leave_no_change_records() {
    let mut counter = counter_class();
    let mut peek = operation(
        "Counter",
        "peek",
        Vec::new(),
        Type::Nat,
        block(4, Vec::new(), vec![incr(5, "n"), ret(6, var("n"))]),
    );
    Arc::get_mut(&mut peek).unwrap().is_pure = true;
    counter.operations.push(peek);
    let sink = Arc::new(MemorySink::new());
    let ev = Runtime::builder(model(Vec::new(), vec![counter]))
        .settings(Settings {
            log_instance_changes: true,
            ..Settings::default()
        })
        .log(sink.clone())
        .build()
        .unwrap();
    let obj = ev.new_instance("Counter", Vec::new()).unwrap();
    assert_eq!(ev.call_method(&obj, "peek", Vec::new()).unwrap(), Value::Int(1));
    assert!(sink.texts().is_empty());
    ev.call_method(&obj, "inc", Vec::new()).unwrap();
    assert_eq!(sink.texts().len(), 1);
}

// ══════════════════════════════════════════════════════════════════════════════
// Calls
// ══════════════════════════════════════════════════════════════════════════════

struct Answer;

impl Delegate for Answer {
    fn invoke(&self, call: &DelegateCall<'_>) -> Option<Result<Value, String>> {
        (call.operation.text == "answer").then(|| Ok(Value::Int(42)))
    }
}

fn unspecified_model() -> Model {
    model(
        vec![module(vec![op("answer", Type::Int, stmt(1, StmtKind::NotYetSpecified))])],
        Vec::new(),
    )
}

#[test]
fn unspecified_operation_uses_registered_delegate() {
    let registry = DelegateRegistry::new();
    registry.register(MODULE, Arc::new(Answer));
    let ev = Runtime::builder(unspecified_model())
        .delegates(Arc::new(registry))
        .build()
        .unwrap();
    assert_eq!(ev.call(MODULE, "answer", Vec::new()).unwrap(), Value::Int(42));
}

#[test]
fn unspecified_operation_without_delegate_is_fatal() {
    let ev = evaluator(unspecified_model());
    assert_eq!(
        code_of(ev.call(MODULE, "answer", Vec::new())),
        Some(ErrorCode::NOT_YET_SPECIFIED)
    );
}

fn guarded_model() -> Model {
    let mut def = (*operation(MODULE, "half", vec![("x", Type::Int)], Type::Int, ret(1, bin(var("x"), BinOp::IntDiv, int(2))))).clone();
    def.pre = Some(bin(var("x"), BinOp::Gt, int(0)));
    model(vec![module(vec![Arc::new(def)])], Vec::new())
}

#[test]
fn precondition_is_checked_when_enabled() {
    let ev = evaluator(guarded_model());
    assert_eq!(ev.call(MODULE, "half", vec![Value::Int(8)]).unwrap(), Value::Int(4));
    assert_eq!(
        code_of(ev.call(MODULE, "half", vec![Value::Int(0)])),
        Some(ErrorCode::PRECONDITION_FAILED)
    );

    let unchecked = evaluator_with(
        guarded_model(),
        Settings {
            pre_checks: false,
            ..Settings::default()
        },
    );
    assert_eq!(unchecked.call(MODULE, "half", vec![Value::Int(0)]).unwrap(), Value::Int(0));
}

#[test]
fn wrong_argument_count_is_fatal() {
    let ev = evaluator(model(
        vec![module(vec![
            guarded_model().modules[0].operations[0].clone(),
            op("run", Type::Unknown, call(1, name("half"), Vec::new())),
        ])],
        Vec::new(),
    ));
    assert_eq!(
        code_of(ev.call(MODULE, "run", Vec::new())),
        Some(ErrorCode::ARGUMENT_MISMATCH)
    );
}

#[test]
fn missing_entry_point_is_reported() {
    let ev = evaluator(model(Vec::new(), Vec::new()));
    assert_eq!(
        code_of(ev.call(MODULE, "nothing", Vec::new())),
        Some(ErrorCode::UNRESOLVED_CALL)
    );
}

// ══════════════════════════════════════════════════════════════════════════════
// Coverage & determinism
// ══════════════════════════════════════════════════════════════════════════════

fn branching_body() -> Stmt {
    block(
        1,
        vec![dcl("x", Type::Int, int(0))],
        vec![
            for_index(2, "i", 1, 4, None, assign(3, "x", bin(var("x"), BinOp::Add, var("i")))),
            if_then(4, bin(var("x"), BinOp::Gt, int(100)), ret(5, int(0))),
            ret(6, var("x")),
        ],
    )
}

#[test]
fn coverage_reports_unreached_statements() {
    let ev = evaluator(model(vec![module(vec![op("run", Type::Unknown, branching_body())])], Vec::new()));
    ev.call(MODULE, "run", Vec::new()).unwrap();
    let coverage = ev.coverage();
    let missed: Vec<u32> = coverage.missed().map(|e| e.line).filter(|&l| l > 0).collect();
    assert_eq!(missed, vec![5]);
    let line3 = coverage.entries.iter().find(|e| e.line == 3).unwrap();
    assert_eq!(line3.hits, 4);
}

#[test]
fn evaluation_is_deterministic() {
    let run = || {
        let ev = evaluator(model(vec![module(vec![op("run", Type::Unknown, branching_body())])], Vec::new()));
        let value = ev.call(MODULE, "run", Vec::new()).unwrap();
        let hits: Vec<u64> = ev.coverage().entries.iter().map(|e| e.hits).collect();
        (value, hits)
    };
    assert_eq!(run(), run());
}
