//! Tree-walking evaluation of a parsed batch.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::parser::{Expr, Program, Stmt, Target};
use crate::error::{BridgeResult, CallError};
use crate::protocol::Args;
use crate::registry::type_name;
use crate::router::Api;

type Scope = HashMap<String, Value>;

/// Longest list `range()` may build inside one host tick.
const MAX_RANGE_LEN: u64 = 1_000_000;

pub(super) fn run(api: &Api, program: &Program, scope: &mut Scope) -> BridgeResult<()> {
    block(api, &program.body, scope)
}

fn block(api: &Api, body: &[Stmt], scope: &mut Scope) -> BridgeResult<()> {
    body.iter().try_for_each(|stmt| statement(api, stmt, scope))
}

fn statement(api: &Api, stmt: &Stmt, scope: &mut Scope) -> BridgeResult<()> {
    match stmt {
        Stmt::Assign { name, value } => {
            let value = eval(api, value, scope)?;
            scope.insert(name.clone(), value);
        }
        Stmt::Expr(expr) => {
            eval(api, expr, scope)?;
        }
        Stmt::For {
            var,
            iterable,
            body,
        } => {
            let items = match eval(api, iterable, scope)? {
                Value::Array(items) => items,
                Value::Object(map) => map.into_iter().map(|(key, _)| Value::String(key)).collect(),
                other => {
                    return Err(CallError::type_error(format!(
                        "'{}' object is not iterable",
                        type_name(&other)
                    ))
                    .into())
                }
            };
            for item in items {
                scope.insert(var.clone(), item);
                block(api, body, scope)?;
            }
        }
    }
    Ok(())
}

fn eval(api: &Api, expr: &Expr, scope: &mut Scope) -> BridgeResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Var(name) => lookup(scope, name).cloned(),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(api, item, scope))
            .collect::<BridgeResult<Vec<_>>>()
            .map(Value::Array),
        Expr::Dict(entries) => entries
            .iter()
            .map(|(key, value)| eval(api, value, scope).map(|value| (key.clone(), value)))
            .collect::<BridgeResult<Map<_, _>>>()
            .map(Value::Object),
        Expr::Index { target, index } => {
            let target = eval(api, target, scope)?;
            let index = eval(api, index, scope)?;
            subscript(target, &index)
        }
        Expr::Neg(inner) => negate(eval(api, inner, scope)?),
        Expr::Call {
            target: Target::Name(name),
            args,
            kwargs,
        } if name == "append" => append(api, args, kwargs, scope),
        Expr::Call {
            target,
            args,
            kwargs,
        } => {
            let args = arguments(api, args, kwargs, scope)?;
            match target {
                Target::Name(name) => match builtin(name, &args)? {
                    Some(value) => Ok(value),
                    None => api.call_with(name, args),
                },
                Target::Callable(callable) => api.in_host(callable, args),
            }
        }
    }
}

fn lookup<'a>(scope: &'a Scope, name: &str) -> BridgeResult<&'a Value> {
    scope
        .get(name)
        .ok_or_else(|| CallError::name(format!("name '{name}' is not defined")).into())
}

fn arguments(
    api: &Api,
    args: &[Expr],
    kwargs: &[(String, Expr)],
    scope: &mut Scope,
) -> BridgeResult<Args> {
    let mut evaluated = Args::new();
    for arg in args {
        evaluated.args.push(eval(api, arg, scope)?);
    }
    for (name, value) in kwargs {
        let value = eval(api, value, scope)?;
        evaluated.kwargs.insert(name.clone(), value);
    }
    Ok(evaluated)
}

/// `append(xs, item)` mutates the list bound to `xs` in place.
fn append(
    api: &Api,
    args: &[Expr],
    kwargs: &[(String, Expr)],
    scope: &mut Scope,
) -> BridgeResult<Value> {
    let [Expr::Var(name), item] = args else {
        return Err(CallError::type_error("append() takes a list variable and one item").into());
    };
    if !kwargs.is_empty() {
        return Err(CallError::type_error("append() takes no keyword arguments").into());
    }
    let item = eval(api, item, scope)?;
    let target = scope
        .get_mut(name)
        .ok_or_else(|| CallError::name(format!("name '{name}' is not defined")))?;
    match target {
        Value::Array(items) => {
            items.push(item);
            Ok(Value::Null)
        }
        other => Err(CallError::attribute(format!(
            "'{}' object has no attribute 'append'",
            type_name(other)
        ))
        .into()),
    }
}

/// Evaluates `len`, `range` and `list`. Returns `None` for any other name.
fn builtin(name: &str, args: &Args) -> BridgeResult<Option<Value>> {
    if !matches!(name, "len" | "range" | "list") {
        return Ok(None);
    }
    if !args.kwargs.is_empty() {
        return Err(CallError::type_error(format!("{name}() takes no keyword arguments")).into());
    }
    let value = match (name, args.args.as_slice()) {
        ("len", [value]) => {
            let len = match value {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(text) => text.chars().count(),
                other => {
                    return Err(CallError::type_error(format!(
                        "object of type '{}' has no len()",
                        type_name(other)
                    ))
                    .into())
                }
            };
            Value::from(len)
        }
        ("range", bounds) => {
            let bounds = bounds
                .iter()
                .map(|bound| {
                    bound.as_i64().ok_or_else(|| {
                        CallError::type_error(format!(
                            "'{}' object cannot be interpreted as an integer",
                            type_name(bound)
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match bounds.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => {
                    return Err(CallError::type_error(format!(
                        "range expected 1 to 3 arguments, got {}",
                        bounds.len()
                    ))
                    .into())
                }
            };
            if step == 0 {
                return Err(CallError::value("range() arg 3 must not be zero").into());
            }
            let len = range_len(start, stop, step);
            if len > MAX_RANGE_LEN {
                return Err(CallError::value(format!(
                    "range of {len} items exceeds the batch limit of {MAX_RANGE_LEN}"
                ))
                .into());
            }
            let mut items = Vec::with_capacity(len as usize);
            let mut current = Some(start);
            while let Some(value) = current {
                if !((step > 0 && value < stop) || (step < 0 && value > stop)) {
                    break;
                }
                items.push(Value::from(value));
                current = value.checked_add(step);
            }
            Value::Array(items)
        }
        ("list", [Value::Array(items)]) => Value::Array(items.clone()),
        ("list", [Value::Object(map)]) => {
            Value::Array(map.keys().cloned().map(Value::String).collect())
        }
        ("list", [other]) => {
            return Err(CallError::type_error(format!(
                "'{}' object is not iterable",
                type_name(other)
            ))
            .into())
        }
        _ => {
            return Err(CallError::type_error(format!(
                "{name}() got {} arguments",
                args.args.len()
            ))
            .into())
        }
    };
    Ok(Some(value))
}

/// Number of items `range(start, stop, step)` yields; `step` is non-zero.
fn range_len(start: i64, stop: i64, step: i64) -> u64 {
    let (span, stride) = if step > 0 {
        (i128::from(stop) - i128::from(start), i128::from(step))
    } else {
        (i128::from(start) - i128::from(stop), -i128::from(step))
    };
    if span <= 0 {
        return 0;
    }
    u64::try_from((span + stride - 1) / stride).unwrap_or(u64::MAX)
}

fn subscript(target: Value, index: &Value) -> BridgeResult<Value> {
    match target {
        Value::Array(mut items) => {
            let position = index.as_i64().ok_or_else(|| {
                CallError::type_error(format!(
                    "list indices must be integers, not {}",
                    type_name(index)
                ))
            })?;
            let len = items.len() as i64;
            let resolved = if position < 0 { len + position } else { position };
            if !(0..len).contains(&resolved) {
                return Err(CallError::index("list index out of range").into());
            }
            Ok(items.swap_remove(resolved as usize))
        }
        Value::Object(mut map) => {
            let key = index.as_str().ok_or_else(|| {
                CallError::type_error(format!(
                    "dictionary keys must be strings, not {}",
                    type_name(index)
                ))
            })?;
            map.remove(key)
                .ok_or_else(|| CallError::key(format!("key '{key}' not found")).into())
        }
        other => Err(CallError::type_error(format!(
            "'{}' object is not subscriptable",
            type_name(&other)
        ))
        .into()),
    }
}

fn negate(value: Value) -> BridgeResult<Value> {
    if let Some(n) = value.as_i64().and_then(i64::checked_neg) {
        return Ok(Value::from(n));
    }
    if let Some(n) = value.as_f64() {
        return Ok(Value::from(-n));
    }
    Err(CallError::type_error(format!(
        "bad operand type for unary -: '{}'",
        type_name(&value)
    ))
    .into())
}
