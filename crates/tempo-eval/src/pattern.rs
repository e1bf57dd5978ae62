//! Pattern matching and bind enumeration.

use tempo_types::ast::{Name, Pattern, PatternKind, Type};
use tempo_types::Value;

/// Bindings produced by a successful match, in pattern order.
pub type Matched = Vec<(Name, Value)>;

/// Match `value` against `pattern`.
///
/// `None` on mismatch. A name that occurs twice must match equal values.
pub fn match_pattern(pattern: &Pattern, value: &Value) -> Option<Matched> {
    let mut out = Matched::new();
    if collect(pattern, &value.deref(), &mut out) {
        Some(out)
    } else {
        None
    }
}

fn bind(out: &mut Matched, name: &Name, value: Value) -> bool {
    match out.iter().find(|(n, _)| n == name) {
        Some((_, existing)) => *existing == value,
        None => {
            out.push((name.clone(), value));
            true
        }
    }
}

fn collect_all(patterns: &[Pattern], values: &[Value], out: &mut Matched) -> bool {
    patterns.len() == values.len()
        && patterns
            .iter()
            .zip(values)
            .all(|(p, v)| collect(p, v, out))
}

fn collect(pattern: &Pattern, value: &Value, out: &mut Matched) -> bool {
    match (&pattern.kind, value) {
        (PatternKind::Ignore, _) => true,
        (PatternKind::Ident(name), v) => bind(out, name, v.clone()),
        (PatternKind::Literal(lit), v) => Value::from_literal(lit) == *v,
        (PatternKind::Tuple(ps), Value::Tuple(vs)) => collect_all(ps, vs, out),
        (PatternKind::Seq(ps), Value::Seq(vs)) => collect_all(ps, vs, out),
        (PatternKind::Record { tag, fields }, Value::Record { tag: vt, fields: vf }) => {
            let values: Vec<Value> = vf.iter().map(|(_, v)| v.clone()).collect();
            tag == vt && collect_all(fields, &values, out)
        }
        _ => false,
    }
}

/// Merge two match results; `None` when they disagree on a name.
pub fn merge(mut left: Matched, right: Matched) -> Option<Matched> {
    for (name, value) in right {
        if !bind(&mut left, &name, value) {
            return None;
        }
    }
    Some(left)
}

/// Every consistent combination of candidates, one candidate per pattern.
pub fn combinations(candidates: &[(&Pattern, Vec<Value>)]) -> Vec<Matched> {
    let mut results = vec![Matched::new()];
    for (pattern, values) in candidates {
        let mut next = Vec::new();
        for partial in &results {
            for v in values {
                if let Some(m) = match_pattern(pattern, v) {
                    if let Some(merged) = merge(partial.clone(), m) {
                        next.push(merged);
                    }
                }
            }
        }
        results = next;
        if results.is_empty() {
            break;
        }
    }
    results
}

/// All values of a finite type, or `None` if it is not enumerable.
pub fn enumerate_type(ty: &Type) -> Option<Vec<Value>> {
    match ty {
        Type::Bool => Some(vec![Value::Bool(false), Value::Bool(true)]),
        Type::Quote(q) => Some(vec![Value::Quote(q.clone())]),
        Type::Optional(t) => {
            let mut values = vec![Value::Nil];
            values.extend(enumerate_type(t)?);
            Some(values)
        }
        Type::Union(ts) => {
            let mut values = Vec::new();
            for t in ts {
                values.extend(enumerate_type(t)?);
            }
            Some(values)
        }
        Type::Product(ts) => {
            let mut tuples: Vec<Vec<Value>> = vec![Vec::new()];
            for t in ts {
                let items = enumerate_type(t)?;
                tuples = tuples
                    .iter()
                    .flat_map(|prefix| {
                        items.iter().map(move |item| {
                            let mut next = prefix.clone();
                            next.push(item.clone());
                            next
                        })
                    })
                    .collect();
            }
            Some(tuples.into_iter().map(Value::Tuple).collect())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempo_types::ast::Literal;
    use tempo_types::{Location, Span};

    fn pat(kind: PatternKind) -> Pattern {
        Pattern {
            location: Location::new("p.rt", Span::point(1, 1)),
            kind,
        }
    }

    fn ident(text: &str) -> Pattern {
        pat(PatternKind::Ident(Name::new("M", text)))
    }

    #[test]
    fn test_tuple_pattern_binds() {
        let p = pat(PatternKind::Tuple(vec![ident("a"), pat(PatternKind::Ignore), ident("b")]));
        let v = Value::Tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(
            match_pattern(&p, &v),
            Some(vec![
                (Name::new("M", "a"), Value::Int(1)),
                (Name::new("M", "b"), Value::Int(3))
            ])
        );
    }

    #[test]
    fn test_repeated_name_must_agree() {
        let p = pat(PatternKind::Tuple(vec![ident("a"), ident("a")]));
        assert!(match_pattern(&p, &Value::Tuple(vec![Value::Int(1), Value::Int(1)])).is_some());
        assert!(match_pattern(&p, &Value::Tuple(vec![Value::Int(1), Value::Int(2)])).is_none());
    }

    #[test]
    fn test_literal_and_record_patterns() {
        let lit = pat(PatternKind::Literal(Literal::Quote("A".into())));
        assert!(match_pattern(&lit, &Value::Quote("A".into())).is_some());
        assert!(match_pattern(&lit, &Value::Quote("B".into())).is_none());

        let rec = pat(PatternKind::Record {
            tag: "P".into(),
            fields: vec![ident("x"), pat(PatternKind::Ignore)],
        });
        let v = Value::Record {
            tag: "P".into(),
            fields: vec![("x".into(), Value::Int(4)), ("y".into(), Value::Int(5))],
        };
        assert_eq!(match_pattern(&rec, &v).map(|m| m.len()), Some(1));
        assert!(match_pattern(&rec, &Value::Int(4)).is_none());
    }

    #[test]
    fn test_combinations_skip_inconsistent() {
        let a = ident("a");
        let also_a = ident("a");
        let candidates = vec![
            (&a, vec![Value::Int(1), Value::Int(2)]),
            (&also_a, vec![Value::Int(2), Value::Int(3)]),
        ];
        let combos = combinations(&candidates);
        assert_eq!(combos, vec![vec![(Name::new("M", "a"), Value::Int(2))]]);
    }

    #[test]
    fn test_enumerate_types() {
        assert_eq!(enumerate_type(&Type::Bool).map(|v| v.len()), Some(2));
        let ty = Type::Product(vec![Type::Bool, Type::Optional(Box::new(Type::Quote("X".into())))]);
        assert_eq!(enumerate_type(&ty).map(|v| v.len()), Some(4));
        assert_eq!(enumerate_type(&Type::Nat), None);
    }
}
