//! Drive a host application's scripting API from outside its process.
//!
//! An [`agent`] runs inside the host on its cooperative scheduler and
//! serves requests over TCP. A [`Client`] outside the host finds the agent
//! through the host's web control interface, connects, and forwards calls.
//! Code written against [`Api`] runs unchanged on either side.

pub mod agent;
pub mod batch;
pub mod client;
pub mod codec;
pub mod control;
pub mod error;
pub mod frame;
pub mod host;
pub mod host_config;
pub mod map;
pub mod protocol;
pub mod registry;
pub mod rendezvous;
pub mod router;
pub mod surface;
pub mod wrappers;

pub use agent::{AgentError, AgentHandle, AgentSettings};
pub use batch::{Batch, BatchError};
pub use client::{Client, ClientSettings, HoldSession, SlavePool, SlaveScope};
pub use codec::{CallableRef, CodecError, Reduction, Wrapper, WrapperRegistry};
pub use control::{ControlClient, ControlError};
pub use error::{BridgeError, BridgeResult, CallError, ErrorKind, RemoteError};
pub use host::{Deferred, Host, HostCallError};
pub use map::MapCall;
pub use protocol::{Args, Function, Request, Response};
pub use registry::{Callable, Catalog, Property};
pub use rendezvous::{BootstrapError, Enabled};
pub use router::Api;
pub use surface::{ApiSurface, SurfaceError};
pub use wrappers::{Project, Take};
