//! Execution-site routing for host API calls.
//!
//! The same [`Api`] value serves code running inside the host, where names
//! bind to the native table, and code running outside, where every call is
//! forwarded over a [`Client`] connection.

use std::rc::Rc;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::trace;

use crate::batch::{self, Batch};
use crate::client::Client;
use crate::codec::CallableRef;
use crate::error::{BridgeError, BridgeResult, CallError};
use crate::host::Host;
use crate::map::{self, MapCall};
use crate::protocol::{Args, Function};
use crate::registry::{Accessor, Catalog, Property};
use crate::surface::ApiSurface;

#[derive(Clone)]
enum Site {
    Inside(Rc<dyn Host>),
    Outside(Arc<Client>),
}

#[derive(Clone)]
pub struct Api {
    site: Site,
    catalog: Arc<Catalog>,
    surface: Option<Arc<ApiSurface>>,
}

impl Api {
    pub fn inside(host: Rc<dyn Host>, catalog: Arc<Catalog>) -> Self {
        Self {
            site: Site::Inside(host),
            catalog,
            surface: None,
        }
    }

    pub fn outside(client: Arc<Client>, catalog: Arc<Catalog>) -> Self {
        Self {
            site: Site::Outside(client),
            catalog,
            surface: None,
        }
    }

    /// Rejects names missing from `surface` before they reach the wire.
    pub fn with_surface(mut self, surface: Arc<ApiSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn is_inside(&self) -> bool {
        matches!(self.site, Site::Inside(_))
    }

    pub fn host(&self) -> Option<&dyn Host> {
        match &self.site {
            Site::Inside(host) => Some(host.as_ref()),
            Site::Outside(_) => None,
        }
    }

    pub fn client(&self) -> Option<&Arc<Client>> {
        match &self.site {
            Site::Inside(_) => None,
            Site::Outside(client) => Some(client),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Calls a native API function with positional arguments.
    pub fn call(&self, name: &str, args: Vec<Value>) -> BridgeResult<Value> {
        self.call_with(name, Args::positional(args))
    }

    pub fn call_with(&self, name: &str, args: Args) -> BridgeResult<Value> {
        match &self.site {
            Site::Inside(host) => {
                if !args.kwargs.is_empty() {
                    return Err(
                        CallError::type_error(format!("{name}() takes no keyword arguments"))
                            .into(),
                    );
                }
                trace!(function = name, "native call");
                Ok(host.call(name, &args.args).map_err(CallError::from)?)
            }
            Site::Outside(client) => {
                if let Some(surface) = &self.surface {
                    if !surface.contains(name) {
                        return Err(CallError::name(name).into());
                    }
                }
                client.request(Function::Name(name.to_string()), args)
            }
        }
    }

    /// Runs a registered callable's whole body inside the host.
    ///
    /// Outside the host only the reference travels, so both sides must have
    /// registered the same `(module_name, name)`.
    pub fn in_host(&self, target: &CallableRef, args: Args) -> BridgeResult<Value> {
        match &self.site {
            Site::Inside(_) => {
                let callable = self.catalog.callables.resolve(target)?;
                callable(self, args)
            }
            Site::Outside(client) => client.request(Function::Callable(target.clone()), args),
        }
    }

    /// Runs `body` with the host pinned to this connection.
    ///
    /// Outside the host the connection is put on hold for the duration and
    /// released on every exit path. Inside, `body` simply runs.
    pub fn hold<T>(&self, body: impl FnOnce(&Api) -> BridgeResult<T>) -> BridgeResult<T> {
        match &self.site {
            Site::Inside(_) => body(self),
            Site::Outside(client) => {
                let session = client.hold()?;
                let result = body(self);
                let released = session.release();
                let value = result?;
                released?;
                Ok(value)
            }
        }
    }

    pub fn get(&self, property: &Property, receiver: Value) -> BridgeResult<Value> {
        self.in_host(
            &property.accessor(Accessor::Get),
            Args::positional(vec![receiver]),
        )
    }

    pub fn set(&self, property: &Property, receiver: Value, value: Value) -> BridgeResult<()> {
        self.in_host(
            &property.accessor(Accessor::Set),
            Args::positional(vec![receiver, value]),
        )?;
        Ok(())
    }

    pub fn delete(&self, property: &Property, receiver: Value) -> BridgeResult<()> {
        self.in_host(
            &property.accessor(Accessor::Delete),
            Args::positional(vec![receiver]),
        )?;
        Ok(())
    }

    /// Executes a batch in one host tick and returns its outputs in order.
    pub fn batch(&self, batch: &Batch) -> BridgeResult<Vec<Value>> {
        let args = Args::new()
            .kwarg("code", batch.code.clone())
            .kwarg("inputs", Value::Object(batch.inputs.clone()))
            .kwarg("outputs", json!(batch.outputs));
        expect_list(self.in_host(&batch::run_ref(), args)?, "batch")
    }

    /// Applies a callable across columns of arguments in one host tick.
    pub fn map(&self, call: &MapCall) -> BridgeResult<Vec<Value>> {
        expect_list(self.in_host(&map::map_ref(), call.to_args())?, "map")
    }
}

fn expect_list(value: Value, what: &str) -> BridgeResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(BridgeError::Protocol {
            message: format!("{what} returned {other} instead of a list"),
        }),
    }
}
