use serde_json::{json, Value};

use super::{ensure_live, float_result, is_live, number, receiver};
use crate::codec::{CallableRef, CodecError, Reduction, Wrapper};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::Args;
use crate::registry::{Catalog, Property};
use crate::router::Api;

const MODULE: &str = "reabridge.wrappers.project";
const POINTER_TYPE: &str = "ReaProject*";

/// Tempo of the project, read and written in the host.
pub const BPM: Property = Property::new(MODULE, "Project", "bpm");

/// A project open in the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    handle: String,
}

impl Wrapper for Project {
    const MODULE: &'static str = MODULE;
    const CLASS: &'static str = "Project";

    fn reduce(&self) -> Reduction {
        Reduction::bare(MODULE, Self::CLASS).with_args(vec![json!(self.handle)])
    }

    fn from_reduction(reduction: &Reduction) -> Result<Self, CodecError> {
        Ok(Self::new(reduction.handle_arg()?))
    }
}

fn method(name: &str) -> CallableRef {
    CallableRef::new(MODULE, format!("Project.{name}"))
}

impl Project {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// The project in the host's active tab.
    pub fn current(api: &Api) -> BridgeResult<Self> {
        let value = api.in_host(&method("current"), Args::new())?;
        Ok(Self::from_value(&value)?)
    }

    pub fn bpm(&self, api: &Api) -> BridgeResult<f64> {
        float_result(api.get(&BPM, self.to_value())?, "Project.bpm")
    }

    pub fn set_bpm(&self, api: &Api, bpm: f64) -> BridgeResult<()> {
        api.set(&BPM, self.to_value(), json!(bpm))
    }

    /// Always fails: a project's tempo cannot be removed.
    pub fn delete_bpm(&self, api: &Api) -> BridgeResult<()> {
        api.delete(&BPM, self.to_value())
    }

    /// Adds a marker and returns its index.
    pub fn add_marker(&self, api: &Api, position: f64, name: &str) -> BridgeResult<i64> {
        let value = api.in_host(
            &method("add_marker"),
            Args::new().arg(self.to_value()).arg(position).arg(name),
        )?;
        value.as_i64().ok_or_else(|| BridgeError::Protocol {
            message: format!("AddProjectMarker returned {value} instead of an index"),
        })
    }

    pub fn cursor_position(&self, api: &Api) -> BridgeResult<f64> {
        float_result(
            api.in_host(&method("cursor_position"), Args::new().arg(self.to_value()))?,
            "Project.cursor_position",
        )
    }

    /// Whether the project is still open in the host.
    pub fn is_valid(&self, api: &Api) -> BridgeResult<bool> {
        let value = api.in_host(&method("is_valid"), Args::new().arg(self.to_value()))?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

fn current(api: &Api, args: Args) -> BridgeResult<Value> {
    args.bind("Project.current", &[])?;
    let handle = api.call("EnumProjects", vec![json!(-1)])?;
    let handle = handle.as_str().ok_or_else(|| BridgeError::Protocol {
        message: format!("EnumProjects returned {handle} instead of a handle"),
    })?;
    Ok(Project::new(handle).to_value())
}

fn bpm_get(api: &Api, args: Args) -> BridgeResult<Value> {
    let bound = args.bind("Project.bpm.fget", &["self"])?;
    let project: Project = receiver(&bound[0])?;
    ensure_live(api, Project::CLASS, &project.handle, POINTER_TYPE)?;
    let signature = api.call("GetProjectTimeSignature2", vec![json!(project.handle)])?;
    Ok(signature.get(0).cloned().unwrap_or(Value::Null))
}

fn bpm_set(api: &Api, args: Args) -> BridgeResult<Value> {
    let bound = args.bind("Project.bpm.fset", &["self", "value"])?;
    let project: Project = receiver(&bound[0])?;
    let bpm = number(&bound[1], "bpm")?;
    if !(bpm.is_finite() && bpm > 0.0) {
        return Err(BridgeError::invalid_argument(format!(
            "bpm must be a positive number, got {bpm}"
        )));
    }
    ensure_live(api, Project::CLASS, &project.handle, POINTER_TYPE)?;
    api.call(
        "SetCurrentBPM",
        vec![json!(project.handle), json!(bpm), json!(true)],
    )?;
    Ok(Value::Null)
}

fn add_marker(api: &Api, args: Args) -> BridgeResult<Value> {
    let bound = args.bind("Project.add_marker", &["self", "position", "name"])?;
    let project: Project = receiver(&bound[0])?;
    let position = number(&bound[1], "position")?;
    ensure_live(api, Project::CLASS, &project.handle, POINTER_TYPE)?;
    api.call(
        "AddProjectMarker",
        vec![
            json!(project.handle),
            json!(false),
            json!(position),
            json!(0.0),
            bound[2].clone(),
            json!(-1),
            json!(0),
        ],
    )
}

fn cursor_position(api: &Api, args: Args) -> BridgeResult<Value> {
    let bound = args.bind("Project.cursor_position", &["self"])?;
    let project: Project = receiver(&bound[0])?;
    ensure_live(api, Project::CLASS, &project.handle, POINTER_TYPE)?;
    api.call("GetCursorPositionEx", vec![json!(project.handle)])
}

fn valid(api: &Api, args: Args) -> BridgeResult<Value> {
    let bound = args.bind("Project.is_valid", &["self"])?;
    let project: Project = receiver(&bound[0])?;
    Ok(json!(is_live(api, &project.handle, POINTER_TYPE)?))
}

pub(super) fn register(catalog: &mut Catalog) {
    catalog.register_wrapper::<Project>();
    catalog
        .callables
        .register_property(&BPM, bpm_get, Some(bpm_set), None);
    catalog.callables.register(MODULE, "Project.current", current);
    catalog
        .callables
        .register(MODULE, "Project.add_marker", add_marker);
    catalog
        .callables
        .register(MODULE, "Project.cursor_position", cursor_position);
    catalog.callables.register(MODULE, "Project.is_valid", valid);
}
