//! The seam between the bridge and the host application.

use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

use crate::error::{CallError, ErrorKind};

/// Work queued on the host's cooperative scheduler.
pub type Deferred = Box<dyn FnOnce() + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostCallError {
    #[error("{name}")]
    UnknownFunction { name: String },
    #[error("{name}: {message}")]
    BadArguments { name: String, message: String },
    #[error("{name} failed: {message}")]
    Failed { name: String, message: String },
}

impl From<HostCallError> for CallError {
    fn from(err: HostCallError) -> Self {
        let kind = match err {
            HostCallError::UnknownFunction { .. } => ErrorKind::NameError,
            HostCallError::BadArguments { .. } => ErrorKind::TypeError,
            HostCallError::Failed { .. } => ErrorKind::HostError,
        };
        CallError::new(kind, err.to_string())
    }
}

/// Services the host offers to code running on its script thread.
///
/// Every method is called from that one thread; implementations need no
/// locking.
pub trait Host {
    /// Invokes a native API function by name.
    fn call(&self, name: &str, args: &[Value]) -> Result<Value, HostCallError>;

    /// Names of every native API function.
    fn function_names(&self) -> Vec<String>;

    fn ext_state_get(&self, section: &str, key: &str) -> Option<String>;

    fn ext_state_set(&self, section: &str, key: &str, value: &str, persist: bool);

    fn ext_state_delete(&self, section: &str, key: &str, persist: bool);

    /// Runs `task` on a later scheduler tick.
    fn defer(&self, task: Deferred);

    /// Runs `task` when the script environment shuts down.
    fn at_exit(&self, task: Deferred);

    /// Registers a script as a host action and returns its command token.
    fn register_action(&self, script: &str) -> Result<String, HostCallError>;

    /// Directory holding the host's configuration files.
    fn resource_path(&self) -> PathBuf;
}
