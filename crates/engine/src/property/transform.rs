//! The ordered value transform chain applied after decode.
use crate::mapping::Transform;
use crate::property::ValidationEvent;
use crate::property::expr::{self, Bind, CompiledExpr, ExprError, Scope};
use shared::Value;

/// A transform chain with its expressions parsed, built once at load.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledTransform {
    Add(f64),
    Subtract(f64),
    Multiply(f64),
    Divide(f64),
    Modulo(f64),
    BitAnd(u64),
    BitOr(u64),
    BitXor(u64),
    ShiftLeft(u32),
    ShiftRight(u32),
    RangeMap {
        in_min: f64,
        in_max: f64,
        out_min: f64,
        out_max: f64,
        clamp: bool,
    },
    Lookup(Vec<(String, Value)>),
    Trim,
    Uppercase,
    Lowercase,
    Replace { from: String, to: String },
    Truncate(usize),
    Pad { len: usize, pad: char },
    Conditional(Vec<(CompiledExpr, Value)>),
    Expression(CompiledExpr),
}

/// Parses the expressions of a declared chain.
pub fn compile_chain(transforms: &[Transform]) -> Result<Vec<CompiledTransform>, ExprError> {
    transforms
        .iter()
        .map(|t| {
            Ok(match t {
                Transform::Add(v) => CompiledTransform::Add(*v),
                Transform::Subtract(v) => CompiledTransform::Subtract(*v),
                Transform::Multiply(v) => CompiledTransform::Multiply(*v),
                Transform::Divide(v) => CompiledTransform::Divide(*v),
                Transform::Modulo(v) => CompiledTransform::Modulo(*v),
                Transform::BitAnd(v) => CompiledTransform::BitAnd(*v),
                Transform::BitOr(v) => CompiledTransform::BitOr(*v),
                Transform::BitXor(v) => CompiledTransform::BitXor(*v),
                Transform::ShiftLeft(v) => CompiledTransform::ShiftLeft(*v),
                Transform::ShiftRight(v) => CompiledTransform::ShiftRight(*v),
                Transform::RangeMap {
                    in_min,
                    in_max,
                    out_min,
                    out_max,
                    clamp,
                } => CompiledTransform::RangeMap {
                    in_min: *in_min,
                    in_max: *in_max,
                    out_min: *out_min,
                    out_max: *out_max,
                    clamp: *clamp,
                },
                Transform::Lookup(table) => CompiledTransform::Lookup(table.clone()),
                Transform::Trim => CompiledTransform::Trim,
                Transform::Uppercase => CompiledTransform::Uppercase,
                Transform::Lowercase => CompiledTransform::Lowercase,
                Transform::Replace { from, to } => CompiledTransform::Replace {
                    from: from.clone(),
                    to: to.clone(),
                },
                Transform::Truncate(len) => CompiledTransform::Truncate(*len),
                Transform::Pad { len, pad } => CompiledTransform::Pad {
                    len: *len,
                    pad: *pad,
                },
                Transform::Conditional(arms) => CompiledTransform::Conditional(
                    arms.iter()
                        .map(|arm| Ok((expr::compile(&arm.condition)?, arm.value.clone())))
                        .collect::<Result<_, ExprError>>()?,
                ),
                Transform::Expression(source) => {
                    CompiledTransform::Expression(expr::compile(source)?)
                }
            })
        })
        .collect()
}

/// Applies the chain in declared order.
///
/// A step that cannot apply (wrong value type, failed expression) records a
/// validation event and passes its input through unchanged.
pub fn apply_chain(
    value: Value,
    chain: &[CompiledTransform],
    scope: &dyn Scope,
    events: &mut Vec<ValidationEvent>,
) -> Value {
    let mut current = value;
    for step in chain {
        current = apply_step(current, step, scope, events);
    }
    current
}

fn skip(events: &mut Vec<ValidationEvent>, rule: &str, message: String, value: &Value) {
    events.push(ValidationEvent {
        rule: rule.to_string(),
        message,
        value: value.clone(),
    });
}

fn arith(
    value: Value,
    rule: &str,
    events: &mut Vec<ValidationEvent>,
    f: impl Fn(f64) -> Option<f64>,
) -> Value {
    match value.as_f64() {
        Some(x) => match f(x) {
            Some(y) => expr::num_value(y),
            None => {
                skip(events, rule, "division by zero".into(), &value);
                value
            }
        },
        None => {
            skip(
                events,
                rule,
                format!("transform requires a number, got {}", value.type_name()),
                &value,
            );
            value
        }
    }
}

fn bitwise(
    value: Value,
    rule: &str,
    events: &mut Vec<ValidationEvent>,
    f: impl Fn(i64) -> i64,
) -> Value {
    match value {
        Value::Int(x) => Value::Int(f(x)),
        other => {
            skip(
                events,
                rule,
                format!("transform requires an integer, got {}", other.type_name()),
                &other,
            );
            other
        }
    }
}

fn stringy(
    value: Value,
    rule: &str,
    events: &mut Vec<ValidationEvent>,
    f: impl Fn(&str) -> String,
) -> Value {
    match value {
        Value::Str(s) => Value::Str(f(&s)),
        other => {
            skip(
                events,
                rule,
                format!("transform requires a string, got {}", other.type_name()),
                &other,
            );
            other
        }
    }
}

fn apply_step(
    value: Value,
    step: &CompiledTransform,
    scope: &dyn Scope,
    events: &mut Vec<ValidationEvent>,
) -> Value {
    match step {
        CompiledTransform::Add(n) => arith(value, "transform/add", events, |x| Some(x + n)),
        CompiledTransform::Subtract(n) => {
            arith(value, "transform/subtract", events, |x| Some(x - n))
        }
        CompiledTransform::Multiply(n) => {
            arith(value, "transform/multiply", events, |x| Some(x * n))
        }
        CompiledTransform::Divide(n) => arith(value, "transform/divide", events, |x| {
            (*n != 0.0).then(|| x / n)
        }),
        CompiledTransform::Modulo(n) => arith(value, "transform/modulo", events, |x| {
            (*n != 0.0).then(|| x % n)
        }),
        CompiledTransform::BitAnd(m) => bitwise(value, "transform/and", events, |x| x & *m as i64),
        CompiledTransform::BitOr(m) => bitwise(value, "transform/or", events, |x| x | *m as i64),
        CompiledTransform::BitXor(m) => bitwise(value, "transform/xor", events, |x| x ^ *m as i64),
        CompiledTransform::ShiftLeft(n) => {
            bitwise(value, "transform/shl", events, |x| x.wrapping_shl(*n))
        }
        CompiledTransform::ShiftRight(n) => bitwise(value, "transform/shr", events, |x| {
            ((x as u64).wrapping_shr(*n)) as i64
        }),
        CompiledTransform::RangeMap {
            in_min,
            in_max,
            out_min,
            out_max,
            clamp,
        } => arith(value, "transform/range-map", events, |x| {
            if in_max == in_min {
                return None;
            }
            let mut t = (x - in_min) / (in_max - in_min);
            if *clamp {
                t = t.clamp(0.0, 1.0);
            }
            Some(out_min + t * (out_max - out_min))
        }),
        CompiledTransform::Lookup(table) => {
            let key = value.to_string();
            match table.iter().find(|(k, _)| *k == key) {
                Some((_, replacement)) => replacement.clone(),
                None => value,
            }
        }
        CompiledTransform::Trim => stringy(value, "transform/trim", events, |s| s.trim().into()),
        CompiledTransform::Uppercase => {
            stringy(value, "transform/uppercase", events, str::to_uppercase)
        }
        CompiledTransform::Lowercase => {
            stringy(value, "transform/lowercase", events, str::to_lowercase)
        }
        CompiledTransform::Replace { from, to } => {
            stringy(value, "transform/replace", events, |s| s.replace(from, to))
        }
        CompiledTransform::Truncate(len) => stringy(value, "transform/truncate", events, |s| {
            s.chars().take(*len).collect()
        }),
        CompiledTransform::Pad { len, pad } => stringy(value, "transform/pad", events, |s| {
            let mut out = s.to_string();
            while out.chars().count() < *len {
                out.push(*pad);
            }
            out
        }),
        CompiledTransform::Conditional(arms) => {
            let bound = Bind {
                name: "value",
                value: &value,
                parent: scope,
            };
            for (condition, replacement) in arms {
                match condition.eval_bool(&bound) {
                    Ok(true) => return replacement.clone(),
                    Ok(false) => {}
                    Err(err) => skip(
                        events,
                        "transform/conditional",
                        err.to_string(),
                        &value,
                    ),
                }
            }
            value
        }
        CompiledTransform::Expression(expr) => {
            let bound = Bind {
                name: "value",
                value: &value,
                parent: scope,
            };
            match expr.eval(&bound) {
                Ok(result) => result,
                Err(err) => {
                    // Failed expressions fall back to their input.
                    skip(events, "transform/expression", err.to_string(), &value);
                    value
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::expr::EmptyScope;
    use shared::Value;

    fn run(value: Value, transforms: &[Transform]) -> (Value, Vec<ValidationEvent>) {
        let chain = compile_chain(transforms).unwrap();
        let mut events = Vec::new();
        let out = apply_chain(value, &chain, &EmptyScope, &mut events);
        (out, events)
    }

    #[test]
    fn chain_applies_in_declared_order() {
        let (out, events) = run(
            Value::Int(10),
            &[Transform::Add(2.0), Transform::Multiply(3.0)],
        );
        assert_eq!(out, Value::Int(36), "(10 + 2) * 3, not 10 + (2 * 3)");
        assert!(events.is_empty());
    }

    #[test]
    fn range_map_with_clamp() {
        let transforms = [Transform::RangeMap {
            in_min: 0.0,
            in_max: 255.0,
            out_min: 0.0,
            out_max: 100.0,
            clamp: true,
        }];
        let (out, _) = run(Value::Int(510), &transforms);
        assert_eq!(out, Value::Int(100));
    }

    #[test]
    fn lookup_replaces_on_stringified_key() {
        let transforms = [Transform::Lookup(vec![
            ("1".into(), Value::Str("poisoned".into())),
            ("2".into(), Value::Str("asleep".into())),
        ])];
        let (out, _) = run(Value::Int(2), &transforms);
        assert_eq!(out, Value::Str("asleep".into()));
        let (miss, _) = run(Value::Int(3), &transforms);
        assert_eq!(miss, Value::Int(3), "missing key passes through");
    }

    #[test]
    fn conditional_arms_take_the_first_match() {
        let transforms = [Transform::Conditional(vec![
            crate::mapping::ConditionalArm {
                condition: "value < 10".into(),
                value: Value::Str("low".into()),
            },
            crate::mapping::ConditionalArm {
                condition: "value < 100".into(),
                value: Value::Str("mid".into()),
            },
        ])];
        assert_eq!(run(Value::Int(5), &transforms).0, Value::Str("low".into()));
        assert_eq!(run(Value::Int(50), &transforms).0, Value::Str("mid".into()));
        assert_eq!(run(Value::Int(500), &transforms).0, Value::Int(500));
    }

    #[test]
    fn failed_expression_falls_back_to_untransformed_value() {
        let (out, events) = run(
            Value::Int(7),
            &[Transform::Expression("value + missing_prop".into())],
        );
        assert_eq!(out, Value::Int(7));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rule, "transform/expression");
    }

    #[test]
    fn type_mismatch_records_event_and_passes_through() {
        let (out, events) = run(Value::Str("abc".into()), &[Transform::Add(1.0)]);
        assert_eq!(out, Value::Str("abc".into()));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn string_ops() {
        let (out, _) = run(
            Value::Str("  Red  ".into()),
            &[
                Transform::Trim,
                Transform::Uppercase,
                Transform::Pad { len: 5, pad: '_' },
            ],
        );
        assert_eq!(out, Value::Str("RED__".into()));
    }
}
