//! Callables available in every [`Registry::builtin`] registry.
//!
//! Integer arithmetic is checked; any float operand promotes the operation
//! to floating point. Integer division truncates toward zero.

use std::time::Duration;

use crate::error::CallError;
use crate::registry::Registry;
use crate::value::Value;

pub(crate) fn register_all(registry: &mut Registry) {
    registry
        .register("add", |a| binary("add", a, i64::checked_add, |x, y| Ok(x + y)))
        .register("sub", |a| binary("sub", a, i64::checked_sub, |x, y| Ok(x - y)))
        .register("mul", |a| binary("mul", a, i64::checked_mul, |x, y| Ok(x * y)))
        .register("div", div)
        .register("neg", neg)
        .register("sum", sum)
        .register("min", |a| extremum("min", a, |l, r| l < r))
        .register("max", |a| extremum("max", a, |l, r| l > r))
        .register("identity", identity)
        .register("list", |a| Ok(Value::List(a.to_vec())))
        .register("len", len)
        .register("concat", concat)
        .register("sleep", sleep)
        .register("fail", fail);
}

fn bad(callable: &str, reason: impl Into<String>) -> CallError {
    CallError::BadArguments { callable: callable.to_string(), reason: reason.into() }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(callable: &str, v: &Value) -> Result<Self, CallError> {
        match v {
            Value::Int(i) => Ok(Num::Int(*i)),
            Value::Float(f) => Ok(Num::Float(*f)),
            other => Err(bad(callable, format!("expected a number, got {}", other.type_name()))),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

fn two<'a>(callable: &str, args: &'a [Value]) -> Result<(&'a Value, &'a Value), CallError> {
    match args {
        [x, y] => Ok((x, y)),
        _ => Err(bad(callable, format!("expected 2 arguments, got {}", args.len()))),
    }
}

fn binary(
    callable: &str,
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> Result<f64, CallError>,
) -> Result<Value, CallError> {
    let (x, y) = two(callable, args)?;
    match (Num::of(callable, x)?, Num::of(callable, y)?) {
        (Num::Int(a), Num::Int(b)) => int_op(a, b)
            .map(Value::Int)
            .ok_or_else(|| CallError::Overflow(callable.to_string())),
        (a, b) => float_op(a.as_f64(), b.as_f64()).map(Value::Float),
    }
}

fn div(args: &[Value]) -> Result<Value, CallError> {
    let (x, y) = two("div", args)?;
    match (Num::of("div", x)?, Num::of("div", y)?) {
        (_, Num::Int(0)) => Err(CallError::DivisionByZero),
        (_, Num::Float(f)) if f == 0.0 => Err(CallError::DivisionByZero),
        (Num::Int(a), Num::Int(b)) => a
            .checked_div(b)
            .map(Value::Int)
            .ok_or_else(|| CallError::Overflow("div".into())),
        (a, b) => Ok(Value::Float(a.as_f64() / b.as_f64())),
    }
}

fn neg(args: &[Value]) -> Result<Value, CallError> {
    match args {
        [v] => match Num::of("neg", v)? {
            Num::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(|| CallError::Overflow("neg".into())),
            Num::Float(f) => Ok(Value::Float(-f)),
        },
        _ => Err(bad("neg", format!("expected 1 argument, got {}", args.len()))),
    }
}

/// `sum(list)` or `sum(x, y, ...)`.
fn operands(args: &[Value]) -> &[Value] {
    match args {
        [Value::List(items)] => items,
        _ => args,
    }
}

fn sum(args: &[Value]) -> Result<Value, CallError> {
    let mut acc = Value::Int(0);
    for v in operands(args) {
        acc = binary("sum", &[acc, v.clone()], i64::checked_add, |x, y| Ok(x + y))?;
    }
    Ok(acc)
}

fn extremum(callable: &str, args: &[Value], better: fn(f64, f64) -> bool) -> Result<Value, CallError> {
    let items = operands(args);
    let mut best: Option<(f64, &Value)> = None;
    for v in items {
        let n = Num::of(callable, v)?.as_f64();
        if best.map_or(true, |(b, _)| better(n, b)) {
            best = Some((n, v));
        }
    }
    best.map(|(_, v)| v.clone()).ok_or_else(|| bad(callable, "no values"))
}

fn identity(args: &[Value]) -> Result<Value, CallError> {
    match args {
        [v] => Ok(v.clone()),
        _ => Err(bad("identity", format!("expected 1 argument, got {}", args.len()))),
    }
}

fn len(args: &[Value]) -> Result<Value, CallError> {
    match args {
        [Value::List(items)] => Ok(Value::Int(items.len() as i64)),
        [Value::Text(s)] => Ok(Value::Int(s.chars().count() as i64)),
        [other] => Err(bad("len", format!("expected list or text, got {}", other.type_name()))),
        _ => Err(bad("len", format!("expected 1 argument, got {}", args.len()))),
    }
}

/// Concatenate texts, or lists; mixing the two is an error.
fn concat(args: &[Value]) -> Result<Value, CallError> {
    match args.first() {
        None => Ok(Value::Text(String::new())),
        Some(Value::Text(_)) => {
            let mut out = String::new();
            for v in args {
                out.push_str(v.as_str().ok_or_else(|| bad("concat", "cannot mix text with other types"))?);
            }
            Ok(Value::Text(out))
        }
        Some(Value::List(_)) => {
            let mut out = Vec::new();
            for v in args {
                out.extend_from_slice(v.as_list().ok_or_else(|| bad("concat", "cannot mix lists with other types"))?);
            }
            Ok(Value::List(out))
        }
        Some(other) => Err(bad("concat", format!("cannot concatenate {}", other.type_name()))),
    }
}

/// `sleep(ms)` or `sleep(ms, value)`; returns `value` (or null) after the delay.
fn sleep(args: &[Value]) -> Result<Value, CallError> {
    let (ms, out) = match args {
        [ms] => (ms, Value::Null),
        [ms, v] => (ms, v.clone()),
        _ => return Err(bad("sleep", format!("expected 1 or 2 arguments, got {}", args.len()))),
    };
    let ms = ms
        .as_i64()
        .filter(|ms| *ms >= 0)
        .ok_or_else(|| bad("sleep", "delay must be a non-negative int"))?;
    std::thread::sleep(Duration::from_millis(ms as u64));
    Ok(out)
}

fn fail(args: &[Value]) -> Result<Value, CallError> {
    let message = match args.first() {
        Some(Value::Text(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "task failed".to_string(),
    };
    Err(CallError::Failed(message))
}
