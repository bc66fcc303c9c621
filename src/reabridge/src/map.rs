//! Bulk application of one callable across columns of arguments.
//!
//! `map` zips named argument columns (and optionally a list of per-call
//! keyword maps), stops at the shortest input, and runs every call inside
//! the host as one request. The first failing call aborts the whole map.

use serde_json::{json, Map, Value};

use crate::codec::CallableRef;
use crate::error::{BridgeResult, CallError};
use crate::protocol::Args;
use crate::registry::{object_arg, type_name, Catalog};
use crate::router::Api;

pub const MODULE: &str = "reabridge.map";

#[derive(Debug, Clone, PartialEq)]
pub struct MapCall {
    pub function: CallableRef,
    /// Bound as the first positional argument of every call.
    pub receiver: Option<Value>,
    /// Argument name to the column of values it takes, one per call.
    pub iterables: Map<String, Value>,
    /// Keyword arguments shared by every call.
    pub constants: Map<String, Value>,
    /// Extra keyword arguments, one map per call.
    pub kwargs_iterable: Option<Vec<Map<String, Value>>>,
}

impl MapCall {
    pub fn new(function: CallableRef) -> Self {
        Self {
            function,
            receiver: None,
            iterables: Map::new(),
            constants: Map::new(),
            kwargs_iterable: None,
        }
    }

    /// Maps a method over calls on one wrapper.
    pub fn method(function: CallableRef, receiver: Value) -> Self {
        Self {
            receiver: Some(receiver),
            ..Self::new(function)
        }
    }

    pub fn column(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.iterables.insert(name.into(), Value::Array(values));
        self
    }

    pub fn constant(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.insert(name.into(), value.into());
        self
    }

    pub fn kwargs_iterable(mut self, kwargs: Vec<Map<String, Value>>) -> Self {
        self.kwargs_iterable = Some(kwargs);
        self
    }

    pub(crate) fn to_args(&self) -> Args {
        let kwargs_iterable = match &self.kwargs_iterable {
            Some(items) => Value::Array(items.iter().cloned().map(Value::Object).collect()),
            None => Value::Null,
        };
        Args::new()
            .kwarg("function", json!(self.function))
            .kwarg("receiver", self.receiver.clone().unwrap_or(Value::Null))
            .kwarg("iterables", Value::Object(self.iterables.clone()))
            .kwarg("constants", Value::Object(self.constants.clone()))
            .kwarg("kwargs_iterable", kwargs_iterable)
    }
}

pub fn map_ref() -> CallableRef {
    CallableRef::new(MODULE, "map")
}

fn map(api: &Api, args: Args) -> BridgeResult<Value> {
    let mut bound = args
        .bind_with_defaults(
            "map",
            &["function", "receiver", "iterables", "constants", "kwargs_iterable"],
            &[
                ("receiver", Value::Null),
                ("iterables", Value::Null),
                ("constants", Value::Null),
                ("kwargs_iterable", Value::Null),
            ],
        )?
        .into_iter();
    let mut next = || bound.next().unwrap_or(Value::Null);
    let function: CallableRef = serde_json::from_value(next()).map_err(|err| {
        CallError::type_error(format!("map() function must be a callable reference: {err}"))
    })?;
    let receiver = next();
    let iterables = columns(object_arg(next(), "iterables")?)?;
    let constants = object_arg(next(), "constants")?;
    let kwargs_iterable = match next() {
        Value::Null => None,
        Value::Array(items) => Some(
            items
                .into_iter()
                .map(|item| object_arg(item, "kwargs_iterable item"))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        other => {
            return Err(CallError::type_error(format!(
                "kwargs_iterable must be a list, not {}",
                type_name(&other)
            ))
            .into())
        }
    };

    let lengths = iterables
        .iter()
        .map(|(_, column)| column.len())
        .chain(kwargs_iterable.as_ref().map(Vec::len));
    let count = lengths.min().unwrap_or(0);

    let mut results = Vec::with_capacity(count);
    for position in 0..count {
        let mut call = Args::new();
        if !receiver.is_null() {
            call.args.push(receiver.clone());
        }
        call.kwargs.extend(constants.clone());
        for (name, column) in &iterables {
            call.kwargs.insert(name.clone(), column[position].clone());
        }
        if let Some(extra) = &kwargs_iterable {
            call.kwargs.extend(extra[position].clone());
        }
        results.push(api.in_host(&function, call)?);
    }
    Ok(Value::Array(results))
}

fn columns(iterables: Map<String, Value>) -> Result<Vec<(String, Vec<Value>)>, CallError> {
    iterables
        .into_iter()
        .map(|(name, column)| match column {
            Value::Array(values) => Ok((name, values)),
            other => Err(CallError::type_error(format!(
                "'{}' object for argument '{name}' is not iterable",
                type_name(&other)
            ))),
        })
        .collect()
}

pub(crate) fn register(catalog: &mut Catalog) {
    catalog.callables.register(MODULE, "map", map);
}
