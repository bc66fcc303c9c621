//! JSON codec with wrapper reduction and callable references.
//!
//! Plain JSON values travel unchanged. Two object shapes are special:
//!
//! - `{"__reapy__": true, "module", "class", "args", "kwargs", "state"}` is a
//!   reduced wrapper. Decoding rebuilds it through the constructor registered
//!   for `(module, class)`, so an unknown class is rejected at the boundary.
//! - `{"__callable__": true, "module_name", "name"}` names a registered
//!   callable; the agent resolves it at dispatch time.
//!
//! Byte buffers are carried as lists of integers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::{Request, Response};

const WRAPPER_MARKER: &str = "__reapy__";
const CALLABLE_MARKER: &str = "__callable__";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown wrapper class {module}.{class}")]
    UnknownClass { module: String, class: String },
    #[error("expected wrapper {expected}, found {found}")]
    WrongClass { expected: String, found: String },
    #[error("invalid {class} construction arguments: {message}")]
    InvalidArguments { class: String, message: String },
    #[error("value is not a reduced wrapper")]
    NotAWrapper,
    #[error("value is not a list of bytes")]
    NotBytes,
}

/// Reduced, reproducible form of a wrapper object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ReductionRepr", try_from = "ReductionRepr")]
pub struct Reduction {
    pub module: String,
    pub class: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub state: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct ReductionRepr {
    #[serde(rename = "__reapy__")]
    marker: bool,
    module: String,
    class: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Map<String, Value>,
    #[serde(default)]
    state: Option<Map<String, Value>>,
}

impl From<Reduction> for ReductionRepr {
    fn from(reduction: Reduction) -> Self {
        Self {
            marker: true,
            module: reduction.module,
            class: reduction.class,
            args: reduction.args,
            kwargs: reduction.kwargs,
            state: Some(reduction.state),
        }
    }
}

impl TryFrom<ReductionRepr> for Reduction {
    type Error = CodecError;

    fn try_from(repr: ReductionRepr) -> Result<Self, Self::Error> {
        if !repr.marker {
            return Err(CodecError::NotAWrapper);
        }
        Ok(Self {
            module: repr.module,
            class: repr.class,
            args: repr.args,
            kwargs: repr.kwargs,
            state: repr.state.unwrap_or_default(),
        })
    }
}

impl Reduction {
    /// Reduction with no construction arguments and no state.
    pub fn bare(module: &str, class: &str) -> Self {
        Self {
            module: module.to_string(),
            class: class.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            state: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.state = state;
        self
    }

    pub fn qualified_class(&self) -> String {
        format!("{}.{}", self.module, self.class)
    }

    pub fn into_value(self) -> Value {
        // Serializing owned JSON values into a `Value` cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        if !is_reduced_wrapper(value) {
            return Err(CodecError::NotAWrapper);
        }
        Ok(Self::deserialize(value)?)
    }

    /// First positional argument as a string, the usual home of a host handle.
    pub fn handle_arg(&self) -> Result<String, CodecError> {
        self.args
            .first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CodecError::InvalidArguments {
                class: self.class.clone(),
                message: "expected a handle string as first argument".to_string(),
            })
    }
}

/// A domain object mirroring a host-owned entity.
pub trait Wrapper: Sized {
    const MODULE: &'static str;
    const CLASS: &'static str;

    fn reduce(&self) -> Reduction {
        Reduction::bare(Self::MODULE, Self::CLASS)
    }

    fn from_reduction(reduction: &Reduction) -> Result<Self, CodecError>;

    /// Applied after construction when the reduction carried state.
    fn apply_state(&mut self, _state: &Map<String, Value>) -> Result<(), CodecError> {
        Ok(())
    }

    fn to_value(&self) -> Value {
        self.reduce().into_value()
    }

    fn from_value(value: &Value) -> Result<Self, CodecError> {
        let reduction = Reduction::from_value(value)?;
        if reduction.module != Self::MODULE || reduction.class != Self::CLASS {
            return Err(CodecError::WrongClass {
                expected: format!("{}.{}", Self::MODULE, Self::CLASS),
                found: reduction.qualified_class(),
            });
        }
        let mut wrapper = Self::from_reduction(&reduction)?;
        if !reduction.state.is_empty() {
            wrapper.apply_state(&reduction.state)?;
        }
        Ok(wrapper)
    }
}

type Reconstruct = fn(&Reduction) -> Result<Reduction, CodecError>;

/// Constructors for every wrapper class that may cross the wire.
#[derive(Default)]
pub struct WrapperRegistry {
    classes: HashMap<(String, String), Reconstruct>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Wrapper>(&mut self) {
        self.classes.insert(
            (W::MODULE.to_string(), W::CLASS.to_string()),
            reconstruct::<W>,
        );
    }

    pub fn contains(&self, module: &str, class: &str) -> bool {
        self.classes
            .contains_key(&(module.to_string(), class.to_string()))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Rebuilds every reduced wrapper in `value` through its constructor.
    pub fn revive(&self, value: Value) -> Result<Value, CodecError> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.revive(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(_) if is_reduced_wrapper(&value) => {
                let reduction = Reduction::from_value(&value)?;
                let construct = self
                    .classes
                    .get(&(reduction.module.clone(), reduction.class.clone()))
                    .ok_or_else(|| CodecError::UnknownClass {
                        module: reduction.module.clone(),
                        class: reduction.class.clone(),
                    })?;
                Ok(construct(&reduction)?.into_value())
            }
            Value::Object(_) if is_callable_ref(&value) => Ok(value),
            Value::Object(map) => map
                .into_iter()
                .map(|(key, item)| self.revive(item).map(|item| (key, item)))
                .collect::<Result<Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other),
        }
    }
}

fn reconstruct<W: Wrapper>(reduction: &Reduction) -> Result<Reduction, CodecError> {
    let mut wrapper = W::from_reduction(reduction)?;
    if !reduction.state.is_empty() {
        wrapper.apply_state(&reduction.state)?;
    }
    Ok(wrapper.reduce())
}

/// Reference to a registered callable, resolved on the agent side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "CallableRepr", try_from = "CallableRepr")]
pub struct CallableRef {
    pub module_name: String,
    /// Dotted path: a free function or `Class.attribute[.fget|.fset|.fdel]`.
    pub name: String,
}

#[derive(Serialize, Deserialize)]
struct CallableRepr {
    #[serde(rename = "__callable__")]
    marker: bool,
    module_name: String,
    name: String,
}

impl From<CallableRef> for CallableRepr {
    fn from(callable: CallableRef) -> Self {
        Self {
            marker: true,
            module_name: callable.module_name,
            name: callable.name,
        }
    }
}

impl TryFrom<CallableRepr> for CallableRef {
    type Error = String;

    fn try_from(repr: CallableRepr) -> Result<Self, Self::Error> {
        if !repr.marker {
            return Err("callable marker must be true".to_string());
        }
        Ok(Self {
            module_name: repr.module_name,
            name: repr.name,
        })
    }
}

impl CallableRef {
    pub fn new(module_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for CallableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.module_name, self.name)
    }
}

pub fn is_reduced_wrapper(value: &Value) -> bool {
    value.get(WRAPPER_MARKER).and_then(Value::as_bool) == Some(true)
}

pub fn is_callable_ref(value: &Value) -> bool {
    value.get(CALLABLE_MARKER).and_then(Value::as_bool) == Some(true)
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(request)?)
}

/// Parses a request and revives the wrappers in its arguments.
pub fn decode_request(bytes: &[u8], registry: &WrapperRegistry) -> Result<Request, CodecError> {
    let mut request: Request = serde_json::from_slice(bytes)?;
    let args = std::mem::take(&mut request.input.args);
    request.input.args = args
        .into_iter()
        .map(|arg| registry.revive(arg))
        .collect::<Result<_, _>>()?;
    let kwargs = std::mem::take(&mut request.input.kwargs);
    request.input.kwargs = kwargs
        .into_iter()
        .map(|(key, value)| registry.revive(value).map(|value| (key, value)))
        .collect::<Result<_, _>>()?;
    Ok(request)
}

pub fn encode_response(response: &Response) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(response)?)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn bytes_to_value(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

pub fn value_to_bytes(value: &Value) -> Result<Vec<u8>, CodecError> {
    value
        .as_array()
        .ok_or(CodecError::NotBytes)?
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or(CodecError::NotBytes)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Args, Function};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Marker {
        handle: String,
        label: Option<String>,
    }

    impl Wrapper for Marker {
        const MODULE: &'static str = "tests.marker";
        const CLASS: &'static str = "Marker";

        fn reduce(&self) -> Reduction {
            let mut state = Map::new();
            if let Some(label) = &self.label {
                state.insert("label".to_string(), json!(label));
            }
            Reduction::bare(Self::MODULE, Self::CLASS)
                .with_args(vec![json!(self.handle)])
                .with_state(state)
        }

        fn from_reduction(reduction: &Reduction) -> Result<Self, CodecError> {
            Ok(Self {
                handle: reduction.handle_arg()?,
                label: None,
            })
        }

        fn apply_state(&mut self, state: &Map<String, Value>) -> Result<(), CodecError> {
            self.label = state.get("label").and_then(Value::as_str).map(str::to_string);
            Ok(())
        }
    }

    struct Unit;

    impl Wrapper for Unit {
        const MODULE: &'static str = "tests.unit";
        const CLASS: &'static str = "Unit";

        fn from_reduction(_reduction: &Reduction) -> Result<Self, CodecError> {
            Ok(Self)
        }
    }

    fn registry() -> WrapperRegistry {
        let mut registry = WrapperRegistry::new();
        registry.register::<Marker>();
        registry.register::<Unit>();
        registry
    }

    #[test]
    fn wrapper_survives_the_wire_with_state() {
        let marker = Marker {
            handle: "(MARKER*)0x01".into(),
            label: Some("verse".into()),
        };
        let request = Request::new(
            Function::Name("Touch".into()),
            Args::new().arg(marker.to_value()),
        );
        let bytes = encode_request(&request).unwrap();
        let decoded = decode_request(&bytes, &registry()).unwrap();

        assert_eq!(decoded, request);
        let revived = Marker::from_value(&decoded.input.args[0]).unwrap();
        assert_eq!(revived, marker);
        assert_eq!(revived.handle, marker.handle);
    }

    #[test]
    fn default_reduction_is_empty() {
        let value = Unit.to_value();
        assert_eq!(
            value,
            json!({
                "__reapy__": true,
                "module": "tests.unit",
                "class": "Unit",
                "args": [],
                "kwargs": {},
                "state": {}
            })
        );
    }

    #[test]
    fn missing_state_is_accepted() {
        let value = json!({"__reapy__": true, "module": "tests.unit", "class": "Unit"});
        let revived = registry().revive(value).unwrap();
        assert_eq!(revived, Unit.to_value());
    }

    #[test]
    fn nested_wrappers_are_revived() {
        let marker = Marker {
            handle: "h".into(),
            label: None,
        };
        let value = json!({"items": [marker.to_value(), 3, "x"], "flag": true});
        assert_eq!(registry().revive(value.clone()).unwrap(), value);
    }

    #[test]
    fn unknown_class_is_rejected() {
        let value = json!({"__reapy__": true, "module": "nowhere", "class": "Ghost"});
        let err = registry().revive(value).unwrap_err();
        assert!(matches!(err, CodecError::UnknownClass { .. }));
    }

    #[test]
    fn wrong_class_is_rejected() {
        let err = Marker::from_value(&Unit.to_value()).unwrap_err();
        assert!(matches!(err, CodecError::WrongClass { .. }));
    }

    #[test]
    fn callable_refs_pass_through_untouched() {
        let value = serde_json::to_value(CallableRef::new("m", "f")).unwrap();
        assert!(is_callable_ref(&value));
        assert_eq!(registry().revive(value.clone()).unwrap(), value);
    }

    #[test]
    fn bytes_travel_as_integer_lists() {
        let value = bytes_to_value(&[0x90, 60, 127]);
        assert_eq!(value, json!([144, 60, 127]));
        assert_eq!(value_to_bytes(&value).unwrap(), vec![0x90, 60, 127]);
        assert!(value_to_bytes(&json!([256])).is_err());
    }
}
