//! Batches: a block of host calls shipped as text and run in one tick.
//!
//! A batch is source in a small indentation-structured language (see
//! [`parser`]) plus named inputs and the names of the outputs to return.
//! Native API names and registered callables are in scope, so one request
//! can stand in for many.

mod eval;
mod parser;

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::codec::CallableRef;
use crate::error::{BridgeError, BridgeResult, CallError};
use crate::protocol::Args;
use crate::registry::{object_arg, type_name, Catalog};
use crate::router::Api;

pub use parser::{parse, Expr, Program, Stmt, Target};

pub const MODULE: &str = "reabridge.batch";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct BatchError {
    pub line: usize,
    pub message: String,
}

impl BatchError {
    pub(crate) fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl From<BatchError> for CallError {
    fn from(err: BatchError) -> Self {
        CallError::syntax(err.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub code: String,
    pub inputs: Map<String, Value>,
    pub outputs: Vec<String>,
}

impl Batch {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn input(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    pub fn outputs(mut self, names: &[&str]) -> Self {
        self.outputs = names.iter().map(|name| name.to_string()).collect();
        self
    }
}

/// Removes the longest whitespace prefix shared by every non-blank line.
pub fn dedent(code: &str) -> String {
    let prefix = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| &line[..line.len() - line.trim_start().len()])
        .reduce(|shared, indent| {
            let common = shared
                .char_indices()
                .zip(indent.chars())
                .take_while(|((_, a), b)| a == b)
                .last()
                .map_or(0, |((index, c), _)| index + c.len_utf8());
            &shared[..common]
        })
        .unwrap_or("");
    code.lines()
        .map(|line| line.strip_prefix(prefix).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses and runs `code` with `inputs` bound, returning `outputs` in order.
pub fn execute(
    api: &Api,
    code: &str,
    inputs: Map<String, Value>,
    outputs: &[String],
) -> BridgeResult<Vec<Value>> {
    let program = parse(&dedent(code)).map_err(CallError::from)?;
    let mut scope: HashMap<String, Value> = inputs.into_iter().collect();
    eval::run(api, &program, &mut scope)?;
    outputs
        .iter()
        .map(|name| {
            scope
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    BridgeError::from(CallError::name(format!("name '{name}' is not defined")))
                })
        })
        .collect()
}

pub fn run_ref() -> CallableRef {
    CallableRef::new(MODULE, "run")
}

fn run(api: &Api, args: Args) -> BridgeResult<Value> {
    let mut bound = args
        .bind_with_defaults(
            "run",
            &["code", "inputs", "outputs"],
            &[("inputs", Value::Null), ("outputs", Value::Null)],
        )?
        .into_iter();
    let (code, inputs, outputs) = (bound.next(), bound.next(), bound.next());
    let code = match code {
        Some(Value::String(code)) => code,
        other => {
            return Err(CallError::type_error(format!(
                "code must be a string, not {}",
                other.as_ref().map_or("nothing", type_name)
            ))
            .into())
        }
    };
    let inputs = object_arg(inputs.unwrap_or(Value::Null), "inputs")?;
    let outputs = match outputs.unwrap_or(Value::Null) {
        Value::Null => Vec::new(),
        Value::Array(names) => names
            .into_iter()
            .map(|name| match name {
                Value::String(name) => Ok(name),
                other => Err(CallError::type_error(format!(
                    "output names must be strings, not {}",
                    type_name(&other)
                ))),
            })
            .collect::<Result<_, _>>()?,
        other => {
            return Err(CallError::type_error(format!(
                "outputs must be a list, not {}",
                type_name(&other)
            ))
            .into())
        }
    };
    execute(api, &code, inputs, &outputs).map(Value::Array)
}

pub(crate) fn register(catalog: &mut Catalog) {
    catalog.callables.register(MODULE, "run", run);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::router::tests::inside;
    use serde_json::json;

    #[test]
    fn dedent_strips_shared_indentation() {
        let code = "\n        x = 1\n        for y in xs:\n            z = y\n";
        assert_eq!(dedent(code), "\nx = 1\nfor y in xs:\n    z = y");
    }

    #[test]
    fn dedent_keeps_unindented_code() {
        assert_eq!(dedent("a = 1\n  b = 2"), "a = 1\n  b = 2");
    }

    #[test]
    fn outputs_come_back_in_order() {
        let (_, api) = inside();
        let batch = Batch::new(
            "
            doubled = []
            for x in xs:
                append(doubled, Double(x))
            count = len(doubled)
            ",
        )
        .input("xs", json!([1, 2, 3]))
        .outputs(&["count", "doubled"]);
        let values = api.batch(&batch).unwrap();
        assert_eq!(values, vec![json!(3), json!([2.0, 4.0, 6.0])]);
    }

    #[test]
    fn unbound_output_is_a_name_error() {
        let (_, api) = inside();
        let batch = Batch::new("x = 1").outputs(&["missing"]);
        let err = api.batch(&batch).unwrap_err().into_call_error();
        assert_eq!(err.kind, ErrorKind::NameError);
    }

    #[test]
    fn first_error_aborts_the_batch() {
        let (host, api) = inside();
        let batch = Batch::new("Echo(1)\nFail()\nEcho(2)");
        let err = api.batch(&batch).unwrap_err().into_call_error();
        assert_eq!(err.kind, ErrorKind::HostError);
        assert_eq!(host.calls.borrow().len(), 2);
    }

    #[test]
    fn syntax_errors_name_the_line() {
        let (_, api) = inside();
        let err = api
            .batch(&Batch::new("x = 1\ny = (2"))
            .unwrap_err()
            .into_call_error();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert!(err.message.starts_with("line 2"));
    }

    #[test]
    fn malformed_outputs_are_type_errors() {
        let (_, api) = inside();
        let args = Args::new().kwarg("code", "x = 1").kwarg("outputs", json!([1]));
        let err = api.in_host(&run_ref(), args).unwrap_err().into_call_error();
        assert_eq!(err.kind, ErrorKind::TypeError);
    }
}
