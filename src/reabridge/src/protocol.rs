//! Request and result envelopes exchanged between client and agent.
//!
//! Every frame after the greeting carries one JSON document: the client sends
//! a [`Request`] and the agent answers with exactly one [`Response`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::CallableRef;

/// Pins the connection into a single-tick session.
pub const HOLD: &str = "HOLD";
/// Ends a session opened with [`HOLD`].
pub const RELEASE: &str = "RELEASE";

/// What a request asks the agent to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Function {
    /// A registered callable, addressed by module and qualified name.
    Callable(CallableRef),
    /// A native host API name, or one of the control tokens.
    Name(String),
}

impl Function {
    pub fn hold() -> Self {
        Self::Name(HOLD.to_string())
    }

    pub fn release() -> Self {
        Self::Name(RELEASE.to_string())
    }

    pub fn is_hold(&self) -> bool {
        matches!(self, Self::Name(name) if name == HOLD)
    }

    pub fn is_release(&self) -> bool {
        matches!(self, Self::Name(name) if name == RELEASE)
    }

    /// Short label used in logs and tracebacks.
    pub fn label(&self) -> String {
        match self {
            Self::Callable(callable) => callable.name.clone(),
            Self::Name(name) => name.clone(),
        }
    }
}

impl From<CallableRef> for Function {
    fn from(callable: CallableRef) -> Self {
        Self::Callable(callable)
    }
}

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub function: Function,
    #[serde(default)]
    pub input: Args,
}

impl Request {
    pub fn new(function: impl Into<Function>, input: Args) -> Self {
        Self {
            function: function.into(),
            input,
        }
    }

    pub fn named(name: &str, args: Vec<Value>) -> Self {
        Self::new(Function::Name(name.to_string()), Args::positional(args))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Result { value: Value },
    Error { traceback: String },
}

impl Response {
    pub fn null() -> Self {
        Self::Result { value: Value::Null }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn named_request_serializes_as_plain_string() {
        let request = Request::named("GetCursorPosition", vec![json!(0)]);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"function": "GetCursorPosition", "input": {"args": [0], "kwargs": {}}})
        );
    }

    #[test]
    fn callable_request_uses_marker_object() {
        let callable = CallableRef::new("reabridge.wrappers.project", "Project.bpm.fget");
        let request = Request::new(callable.clone(), Args::new().arg("p"));
        let text = serde_json::to_string(&request).unwrap();
        assert!(text.contains("\"__callable__\":true"));

        let parsed: Request = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.function, Function::Callable(callable));
    }

    #[test]
    fn missing_input_defaults_to_empty() {
        let parsed: Request = serde_json::from_str(r#"{"function":"HOLD"}"#).unwrap();
        assert!(parsed.function.is_hold());
        assert!(parsed.input.is_empty());
    }

    #[test]
    fn response_is_tagged_by_type() {
        let ok = serde_json::to_value(Response::Result { value: json!(1.5) }).unwrap();
        assert_eq!(ok, json!({"type": "result", "value": 1.5}));

        let err: Response =
            serde_json::from_str(r#"{"type":"error","traceback":"NameError: x"}"#).unwrap();
        assert!(err.is_error());
    }
}
