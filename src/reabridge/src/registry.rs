//! Name-indexed tables of callables and wrapper classes.
//!
//! Both sides of the bridge build the same [`Catalog`]; a [`CallableRef`]
//! sent by a client is resolved against the agent's copy.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::codec::{CallableRef, Wrapper, WrapperRegistry};
use crate::error::{BridgeError, CallError};
use crate::protocol::Args;
use crate::router::Api;

/// A function the agent can run on behalf of a client.
pub type Callable = fn(&Api, Args) -> Result<Value, BridgeError>;

/// One of the three accessors of a forwarded property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    Get,
    Set,
    Delete,
}

impl Accessor {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Get => "fget",
            Self::Set => "fset",
            Self::Delete => "fdel",
        }
    }
}

/// A wrapper attribute whose reads, writes and deletes run in the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Property {
    pub module_name: &'static str,
    pub class: &'static str,
    pub name: &'static str,
}

impl Property {
    pub const fn new(module_name: &'static str, class: &'static str, name: &'static str) -> Self {
        Self {
            module_name,
            class,
            name,
        }
    }

    /// `Class.name.fget|fset|fdel` in the property's module.
    pub fn accessor(&self, accessor: Accessor) -> CallableRef {
        CallableRef::new(
            self.module_name,
            format!("{}.{}.{}", self.class, self.name, accessor.suffix()),
        )
    }
}

#[derive(Default)]
pub struct CallableRegistry {
    callables: HashMap<CallableRef, Callable>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module_name: &str, name: &str, callable: Callable) {
        self.callables
            .insert(CallableRef::new(module_name, name), callable);
    }

    /// Registers a property's accessors; missing ones raise `AttributeError`.
    pub fn register_property(
        &mut self,
        property: &Property,
        fget: Callable,
        fset: Option<Callable>,
        fdel: Option<Callable>,
    ) {
        self.callables.insert(property.accessor(Accessor::Get), fget);
        self.callables.insert(
            property.accessor(Accessor::Set),
            fset.unwrap_or(read_only_setter),
        );
        self.callables.insert(
            property.accessor(Accessor::Delete),
            fdel.unwrap_or(undeletable),
        );
    }

    pub fn resolve(&self, target: &CallableRef) -> Result<Callable, CallError> {
        self.callables.get(target).copied().ok_or_else(|| {
            CallError::name(format!(
                "module '{}' has no attribute '{}'",
                target.module_name, target.name
            ))
        })
    }

    pub fn contains(&self, target: &CallableRef) -> bool {
        self.callables.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.callables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callables.is_empty()
    }
}

fn read_only_setter(_api: &Api, _args: Args) -> Result<Value, BridgeError> {
    Err(CallError::attribute("can't set attribute").into())
}

fn undeletable(_api: &Api, _args: Args) -> Result<Value, BridgeError> {
    Err(CallError::attribute("can't delete attribute").into())
}

/// Everything both sides must agree on: callables and wrapper classes.
#[derive(Default)]
pub struct Catalog {
    pub callables: CallableRegistry,
    pub wrappers: WrapperRegistry,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in primitives plus the bundled wrappers.
    pub fn standard() -> Self {
        let mut catalog = Self::new();
        crate::batch::register(&mut catalog);
        crate::map::register(&mut catalog);
        crate::wrappers::register(&mut catalog);
        catalog
    }

    pub fn register_wrapper<W: Wrapper>(&mut self) {
        self.wrappers.register::<W>();
    }
}

impl Args {
    /// Binds positional then keyword arguments to `params`, like a call site.
    pub fn bind(self, function: &str, params: &[&str]) -> Result<Vec<Value>, CallError> {
        let Args { args, mut kwargs } = self;
        if args.len() > params.len() {
            return Err(CallError::type_error(format!(
                "{function}() takes {} positional arguments but {} were given",
                params.len(),
                args.len()
            )));
        }
        let mut bound = Vec::with_capacity(params.len());
        let mut positional = args.into_iter();
        for param in params {
            match positional.next() {
                Some(value) => {
                    if kwargs.contains_key(*param) {
                        return Err(CallError::type_error(format!(
                            "{function}() got multiple values for argument '{param}'"
                        )));
                    }
                    bound.push(value);
                }
                None => match kwargs.remove(*param) {
                    Some(value) => bound.push(value),
                    None => {
                        return Err(CallError::type_error(format!(
                            "{function}() missing required argument: '{param}'"
                        )))
                    }
                },
            }
        }
        if let Some(extra) = kwargs.keys().next() {
            return Err(CallError::type_error(format!(
                "{function}() got an unexpected keyword argument '{extra}'"
            )));
        }
        Ok(bound)
    }

    /// Like [`Args::bind`], with trailing parameters taking defaults when absent.
    pub fn bind_with_defaults(
        mut self,
        function: &str,
        params: &[&str],
        defaults: &[(&str, Value)],
    ) -> Result<Vec<Value>, CallError> {
        let positional = self.args.len();
        for (index, (name, default)) in defaults.iter().enumerate() {
            let position = params.len() - defaults.len() + index;
            if positional <= position && !self.kwargs.contains_key(*name) {
                self.kwargs.insert((*name).to_string(), default.clone());
            }
        }
        self.bind(function, params)
    }
}

/// Takes a JSON object argument, treating `null` as empty.
pub fn object_arg(value: Value, name: &str) -> Result<Map<String, Value>, CallError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(CallError::type_error(format!(
            "'{name}' must be a mapping, not {}",
            type_name(&other)
        ))),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn property_accessors_are_dotted_names() {
        let bpm = Property::new("reabridge.wrappers.project", "Project", "bpm");
        assert_eq!(bpm.accessor(Accessor::Get).name, "Project.bpm.fget");
        assert_eq!(bpm.accessor(Accessor::Set).name, "Project.bpm.fset");
        assert_eq!(bpm.accessor(Accessor::Delete).name, "Project.bpm.fdel");
    }

    #[test]
    fn bind_mixes_positional_and_keyword() {
        let args = Args::new().arg("take").kwarg("time", 1.0);
        let bound = args.bind("time_to_ppq", &["self", "time"]).unwrap();
        assert_eq!(bound, vec![json!("take"), json!(1.0)]);
    }

    #[test]
    fn bind_rejects_missing_duplicate_and_extra() {
        let missing = Args::new().arg(1).bind("f", &["a", "b"]).unwrap_err();
        assert_eq!(missing.kind, ErrorKind::TypeError);

        let duplicate = Args::new().arg(1).kwarg("a", 2).bind("f", &["a"]).unwrap_err();
        assert!(duplicate.message.contains("multiple values"));

        let extra = Args::new().kwarg("z", 2).bind("f", &[]).unwrap_err();
        assert!(extra.message.contains("unexpected keyword argument 'z'"));

        let too_many = Args::new().arg(1).arg(2).bind("f", &["a"]).unwrap_err();
        assert!(too_many.message.contains("positional"));
    }

    #[test]
    fn defaults_fill_only_absent_parameters() {
        let bound = Args::new()
            .arg("f")
            .bind_with_defaults("map", &["f", "opts"], &[("opts", json!({}))])
            .unwrap();
        assert_eq!(bound[1], json!({}));

        let bound = Args::new()
            .arg("f")
            .arg(json!({"a": 1}))
            .bind_with_defaults("map", &["f", "opts"], &[("opts", json!({}))])
            .unwrap();
        assert_eq!(bound[1], json!({"a": 1}));
    }

    #[test]
    fn unknown_callable_is_a_name_error() {
        let registry = CallableRegistry::new();
        let err = registry.resolve(&CallableRef::new("m", "missing")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NameError);
    }

    #[test]
    fn object_arg_accepts_null() {
        assert!(object_arg(Value::Null, "constants").unwrap().is_empty());
        assert!(object_arg(json!([1]), "constants").is_err());
    }
}
