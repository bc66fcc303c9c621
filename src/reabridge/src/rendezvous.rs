//! Publishing and discovering the agent port through the host store.
//!
//! Inside the host the agent writes its port under `(section, server_port)`
//! while it is live. Enabling the bridge records the launcher action token
//! under `(section, activate_reapy_server)`. Outside the host the client
//! reads both through the web control endpoint and launches the agent when
//! no port is published.

use std::io;
use std::net::SocketAddr;
use std::thread;

use reabridge_core::{BootstrapConfig, BridgeConfig};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::control::{ControlClient, ControlError};
use crate::host::{Host, HostCallError};
use crate::host_config::{self, HostConfigError};

pub const PORT_KEY: &str = "server_port";
pub const ACTIVATOR_KEY: &str = "activate_reapy_server";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("the bridge is not enabled in the host: {reason}; run `reabridge enable` inside the host and restart it")]
    NotEnabled { reason: String },
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("agent did not publish {section}/{key} after {attempts} attempts")]
    Timeout {
        section: String,
        key: String,
        attempts: u32,
    },
    #[error("published port {value:?} is not a valid port number")]
    InvalidPort { value: String },
    #[error("{}", connect_message(.address, .stale, .source))]
    Connect {
        address: SocketAddr,
        /// The port came from an earlier agent run rather than a fresh launch.
        stale: bool,
        #[source]
        source: io::Error,
    },
    #[error("could not resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("agent did not send its greeting: {message}")]
    Greeting { message: String },
    #[error(transparent)]
    HostConfig(#[from] HostConfigError),
    #[error("failed to register the agent action: {0}")]
    Action(#[from] HostCallError),
}

fn connect_message(address: &SocketAddr, stale: &bool, source: &io::Error) -> String {
    if *stale {
        format!(
            "cannot connect to agent at {address}: {source}; the published {PORT_KEY} may be stale, restart the host or clear the key"
        )
    } else {
        format!("cannot connect to agent at {address}: {source}")
    }
}

/// Where the agent was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rendezvous {
    pub port: u16,
    /// Whether this lookup had to launch the agent.
    pub launched: bool,
}

/// Finds the agent port, launching the agent through its action when needed.
pub fn discover_port(
    control: &ControlClient,
    section: &str,
    settings: &BootstrapConfig,
) -> Result<Rendezvous, BootstrapError> {
    if let Some(port) = published_port(control, section)? {
        debug!(port, "agent port already published");
        return Ok(Rendezvous {
            port,
            launched: false,
        });
    }

    let token = match control.kv_get(section, ACTIVATOR_KEY) {
        Ok(token) => token,
        Err(ControlError::UndefinedKey { .. }) => {
            return Err(BootstrapError::NotEnabled {
                reason: format!("no {ACTIVATOR_KEY} key in section {section}"),
            })
        }
        Err(err) => return Err(err.into()),
    };
    info!(token = %token, "launching agent through host action");
    control.perform(&token)?;

    for attempt in 1..=settings.poll_attempts {
        thread::sleep(settings.poll_interval());
        if let Some(port) = published_port(control, section)? {
            info!(port, attempt, "agent published its port");
            return Ok(Rendezvous {
                port,
                launched: true,
            });
        }
        debug!(attempt, "agent port not yet published");
    }
    warn!(attempts = settings.poll_attempts, "agent never published its port");
    Err(BootstrapError::Timeout {
        section: section.to_string(),
        key: PORT_KEY.to_string(),
        attempts: settings.poll_attempts,
    })
}

fn published_port(control: &ControlClient, section: &str) -> Result<Option<u16>, BootstrapError> {
    match control.kv_get(section, PORT_KEY) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BootstrapError::InvalidPort { value }),
        Err(ControlError::UndefinedKey { .. }) => Ok(None),
        Err(err) if err.is_unreachable() => Err(BootstrapError::NotEnabled {
            reason: err.to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

/// Records the agent port. Called inside the host before the first accept.
pub fn publish_port(host: &dyn Host, section: &str, port: u16) {
    host.ext_state_set(section, PORT_KEY, &port.to_string(), false);
}

pub fn clear_port(host: &dyn Host, section: &str) {
    host.ext_state_delete(section, PORT_KEY, false);
}

/// Result of enabling the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enabled {
    pub action_token: String,
    /// The host must restart before the web interface answers.
    pub restart_required: bool,
}

/// Installs the web interface, registers the agent action and records its token.
pub fn enable_bridge(
    host: &dyn Host,
    config: &BridgeConfig,
    agent_script: &str,
) -> Result<Enabled, BootstrapError> {
    let ini = host.resource_path().join(host_config::INI_FILE);
    let restart_required = host_config::add_web_interface(&ini, config.web_interface_port)?;
    let action_token = host.register_action(agent_script)?;
    host.ext_state_set(&config.section, ACTIVATOR_KEY, &action_token, true);
    info!(token = %action_token, restart_required, "bridge enabled");
    Ok(Enabled {
        action_token,
        restart_required,
    })
}

/// Reverses [`enable_bridge`]. Returns whether the host config changed.
pub fn disable_bridge(host: &dyn Host, config: &BridgeConfig) -> Result<bool, BootstrapError> {
    let ini = host.resource_path().join(host_config::INI_FILE);
    let changed = host_config::remove_web_interface(&ini, config.web_interface_port)?;
    host.ext_state_delete(&config.section, ACTIVATOR_KEY, true);
    info!(changed, "bridge disabled");
    Ok(changed)
}
