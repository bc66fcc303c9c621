//! Domain wrappers over host-owned objects.
//!
//! A wrapper carries only its host handle. Every method goes through an
//! [`Api`], so the same wrapper works inside the host and from a client.

mod project;
mod take;

pub use project::Project;
pub use take::Take;

use serde_json::{json, Value};

use crate::codec::Wrapper;
use crate::error::{BridgeError, BridgeResult, CallError};
use crate::registry::{type_name, Catalog};
use crate::router::Api;

pub(crate) fn register(catalog: &mut Catalog) {
    project::register(catalog);
    take::register(catalog);
}

/// Probes whether `handle` still points at a live object of `pointer_type`.
pub(crate) fn is_live(api: &Api, handle: &str, pointer_type: &str) -> BridgeResult<bool> {
    let valid = api.call("ValidatePtr2", vec![json!(0), json!(handle), json!(pointer_type)])?;
    Ok(valid.as_bool().unwrap_or(false))
}

/// Fails with `UndefinedWrapper` when the handle is stale.
pub(crate) fn ensure_live(
    api: &Api,
    class: &str,
    handle: &str,
    pointer_type: &str,
) -> BridgeResult<()> {
    if is_live(api, handle, pointer_type)? {
        Ok(())
    } else {
        Err(BridgeError::UndefinedWrapper {
            class: class.to_string(),
            handle: handle.to_string(),
        })
    }
}

/// Rebuilds the receiver wrapper of a method call.
pub(crate) fn receiver<W: Wrapper>(value: &Value) -> BridgeResult<W> {
    Ok(W::from_value(value)?)
}

pub(crate) fn number(value: &Value, name: &str) -> Result<f64, CallError> {
    value.as_f64().ok_or_else(|| {
        CallError::type_error(format!(
            "{name} must be a number, not {}",
            type_name(value)
        ))
    })
}

pub(crate) fn float_result(value: Value, function: &str) -> BridgeResult<f64> {
    value.as_f64().ok_or_else(|| BridgeError::Protocol {
        message: format!("{function} returned {value} instead of a number"),
    })
}
