use serde_json::{json, Value};

use super::{ensure_live, float_result, is_live, number, receiver};
use crate::codec::{CallableRef, CodecError, Reduction, Wrapper};
use crate::error::BridgeResult;
use crate::map::MapCall;
use crate::protocol::Args;
use crate::registry::Catalog;
use crate::router::Api;
use crate::wrappers::Project;

const MODULE: &str = "reabridge.wrappers.take";
const POINTER_TYPE: &str = "MediaItem_Take*";

/// One take of a media item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Take {
    handle: String,
}

impl Wrapper for Take {
    const MODULE: &'static str = MODULE;
    const CLASS: &'static str = "Take";

    fn reduce(&self) -> Reduction {
        Reduction::bare(MODULE, Self::CLASS).with_args(vec![json!(self.handle)])
    }

    fn from_reduction(reduction: &Reduction) -> Result<Self, CodecError> {
        Ok(Self::new(reduction.handle_arg()?))
    }
}

impl Take {
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn time_to_ppq_ref() -> CallableRef {
        CallableRef::new(MODULE, "Take.time_to_ppq")
    }

    /// Active take of the first selected item, if any item is selected.
    pub fn selected(api: &Api, project: &Project) -> BridgeResult<Option<Self>> {
        let value = api.in_host(
            &CallableRef::new(MODULE, "Take.selected"),
            Args::new().arg(project.to_value()),
        )?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(Self::from_value(&value)?))
    }

    /// Converts project time in seconds to MIDI ticks of this take.
    pub fn time_to_ppq(&self, api: &Api, time: f64) -> BridgeResult<f64> {
        float_result(
            api.in_host(
                &Self::time_to_ppq_ref(),
                Args::new().arg(self.to_value()).kwarg("time", time),
            )?,
            "Take.time_to_ppq",
        )
    }

    /// Converts many times in one host tick.
    pub fn times_to_ppq(&self, api: &Api, times: &[f64]) -> BridgeResult<Vec<f64>> {
        let call = MapCall::method(Self::time_to_ppq_ref(), self.to_value())
            .column("time", times.iter().map(|time| json!(time)).collect());
        api.map(&call)?
            .into_iter()
            .map(|value| float_result(value, "Take.time_to_ppq"))
            .collect()
    }

    pub fn is_valid(&self, api: &Api) -> BridgeResult<bool> {
        let value = api.in_host(
            &CallableRef::new(MODULE, "Take.is_valid"),
            Args::new().arg(self.to_value()),
        )?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

fn selected(api: &Api, args: Args) -> BridgeResult<Value> {
    let bound = args.bind("Take.selected", &["project"])?;
    let project: Project = receiver(&bound[0])?;
    let item = api.call("GetSelectedMediaItem", vec![json!(project.handle()), json!(0)])?;
    if item.is_null() {
        return Ok(Value::Null);
    }
    let take = api.call("GetActiveTake", vec![item])?;
    Ok(match take.as_str() {
        Some(handle) => Take::new(handle).to_value(),
        None => Value::Null,
    })
}

fn time_to_ppq(api: &Api, args: Args) -> BridgeResult<Value> {
    let bound = args.bind("Take.time_to_ppq", &["self", "time"])?;
    let take: Take = receiver(&bound[0])?;
    let time = number(&bound[1], "time")?;
    ensure_live(api, Take::CLASS, &take.handle, POINTER_TYPE)?;
    api.call(
        "MIDI_GetPPQPosFromProjTime",
        vec![json!(take.handle), json!(time)],
    )
}

fn valid(api: &Api, args: Args) -> BridgeResult<Value> {
    let bound = args.bind("Take.is_valid", &["self"])?;
    let take: Take = receiver(&bound[0])?;
    Ok(json!(is_live(api, &take.handle, POINTER_TYPE)?))
}

pub(super) fn register(catalog: &mut Catalog) {
    catalog.register_wrapper::<Take>();
    catalog.callables.register(MODULE, "Take.selected", selected);
    catalog
        .callables
        .register(MODULE, "Take.time_to_ppq", time_to_ppq);
    catalog.callables.register(MODULE, "Take.is_valid", valid);
}
