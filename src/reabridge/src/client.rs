//! Out-of-host side of the bridge: one connection per slave host.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use reabridge_core::{BootstrapConfig, Config};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::{decode_response, encode_request};
use crate::control::ControlClient;
use crate::error::{BridgeError, BridgeResult, RemoteError};
use crate::frame::{read_frame, write_frame};
use crate::protocol::{Args, Function, Request, Response};
use crate::registry::Catalog;
use crate::rendezvous::{self, BootstrapError, Rendezvous};
use crate::router::Api;

/// How to reach the agent on one slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub host: String,
    pub section: String,
    pub web_interface_port: u16,
    /// Skip the rendezvous and connect straight to this port.
    pub port: Option<u16>,
    pub bootstrap: BootstrapConfig,
}

impl ClientSettings {
    pub fn from_config(host: &str, config: &Config) -> Self {
        Self {
            host: host.to_string(),
            section: config.bridge.section.clone(),
            web_interface_port: config.bridge.web_interface_port,
            port: None,
            bootstrap: config.bootstrap.clone(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

struct Connection {
    stream: TcpStream,
    peer_address: String,
}

#[derive(Default)]
struct ClientState {
    connection: Option<Connection>,
    hold_depth: usize,
}

/// Connection to the agent on one slave.
///
/// Calls on one client are serialized by an internal lock, so a client may
/// be shared between threads; their requests simply queue.
pub struct Client {
    settings: ClientSettings,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(ClientState::default()),
        }
    }

    pub fn slave(&self) -> &str {
        &self.settings.host
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    /// The agent's view of our address, as sent in its greeting.
    pub fn peer_address(&self) -> Option<String> {
        self.state
            .lock()
            .connection
            .as_ref()
            .map(|connection| connection.peer_address.clone())
    }

    /// Sends one request and waits for its response.
    pub fn request(&self, function: Function, input: Args) -> BridgeResult<Value> {
        let mut state = self.state.lock();
        self.request_locked(&mut state, &Request::new(function, input))
    }

    /// Drops the current connection, bootstraps again and connects.
    pub fn reconnect(&self) -> BridgeResult<()> {
        let mut state = self.state.lock();
        state.connection = None;
        state.hold_depth = 0;
        state.connection = Some(self.connect()?);
        Ok(())
    }

    /// Closes the connection with a zero-length frame.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        if let Some(mut connection) = state.connection.take() {
            if let Err(err) = write_frame(&mut connection.stream, &[]) {
                debug!(error = %err, "agent already gone while disconnecting");
            }
        }
        state.hold_depth = 0;
    }

    /// Pins the agent to this connection until the returned session ends.
    ///
    /// Sessions nest; only the outermost one sends `HOLD` and `RELEASE`.
    pub fn hold(&self) -> BridgeResult<HoldSession<'_>> {
        let mut state = self.state.lock();
        if state.hold_depth == 0 {
            self.request_locked(&mut state, &Request::new(Function::hold(), Args::new()))?;
        }
        state.hold_depth += 1;
        Ok(HoldSession {
            client: self,
            released: false,
        })
    }

    fn release(&self) -> BridgeResult<()> {
        let mut state = self.state.lock();
        state.hold_depth = state.hold_depth.saturating_sub(1);
        if state.hold_depth > 0 || state.connection.is_none() {
            return Ok(());
        }
        self.request_locked(&mut state, &Request::new(Function::release(), Args::new()))?;
        Ok(())
    }

    fn request_locked(&self, state: &mut ClientState, request: &Request) -> BridgeResult<Value> {
        let payload = encode_request(request)?;
        if state.connection.is_none() {
            state.connection = Some(self.connect()?);
        }
        let Some(connection) = state.connection.as_mut() else {
            return Err(self.disconnected());
        };

        let exchange = write_frame(&mut connection.stream, &payload)
            .and_then(|()| read_frame(&mut connection.stream));
        let reply = match exchange {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                warn!(slave = %self.settings.host, "agent closed the connection");
                state.connection = None;
                state.hold_depth = 0;
                return Err(self.disconnected());
            }
            Err(err) => {
                warn!(slave = %self.settings.host, error = %err, "connection to agent lost");
                state.connection = None;
                state.hold_depth = 0;
                return Err(self.disconnected());
            }
        };

        match decode_response(&reply)? {
            Response::Result { value } => Ok(value),
            Response::Error { traceback } => Err(RemoteError::new(traceback).into()),
        }
    }

    fn disconnected(&self) -> BridgeError {
        BridgeError::Disconnected {
            slave: self.settings.host.clone(),
        }
    }

    fn connect(&self) -> Result<Connection, BootstrapError> {
        let settings = &self.settings;
        let rendezvous = match settings.port {
            Some(port) => Rendezvous {
                port,
                launched: false,
            },
            None => {
                let control = ControlClient::new(
                    &settings.host,
                    settings.web_interface_port,
                    settings.bootstrap.http_timeout(),
                )?;
                rendezvous::discover_port(&control, &settings.section, &settings.bootstrap)?
            }
        };

        let address = resolve(&settings.host, rendezvous.port)?;
        let mut stream =
            TcpStream::connect(address).map_err(|source| BootstrapError::Connect {
                address,
                stale: settings.port.is_none() && !rendezvous.launched,
                source,
            })?;
        let greeting_error = |message: String| BootstrapError::Greeting { message };
        stream
            .set_nodelay(true)
            .and_then(|()| stream.set_read_timeout(None))
            .map_err(|err| greeting_error(err.to_string()))?;
        let greeting = read_frame(&mut stream)
            .map_err(|err| greeting_error(err.to_string()))?
            .ok_or_else(|| greeting_error("connection closed before greeting".to_string()))?;
        let peer_address = String::from_utf8(greeting)
            .map_err(|_| greeting_error("greeting is not ASCII".to_string()))?;

        info!(slave = %settings.host, %address, peer = %peer_address, "connected to agent");
        Ok(Connection {
            stream,
            peer_address,
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, BootstrapError> {
    let resolve_error = |source| BootstrapError::Resolve {
        host: host.to_string(),
        port,
        source,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(std::io::ErrorKind::AddrNotAvailable.into()))
}

/// An open hold on a client; releases on drop.
#[must_use = "the hold ends as soon as the session is dropped"]
pub struct HoldSession<'a> {
    client: &'a Client,
    released: bool,
}

impl HoldSession<'_> {
    /// Ends the hold, reporting any failure to send `RELEASE`.
    pub fn release(mut self) -> BridgeResult<()> {
        self.released = true;
        self.client.release()
    }
}

impl Drop for HoldSession<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.client.release() {
                warn!(error = %err, "failed to release hold");
            }
        }
    }
}

/// The slaves this process can drive and which one is current.
pub struct SlavePool {
    config: Config,
    catalog: Arc<Catalog>,
    clients: Mutex<HashMap<String, Arc<Client>>>,
    current: Mutex<String>,
}

static GLOBAL_POOL: OnceLock<SlavePool> = OnceLock::new();

impl SlavePool {
    pub fn new(config: Config, catalog: Arc<Catalog>) -> Self {
        let current = config
            .bridge
            .slaves
            .first()
            .cloned()
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            config,
            catalog,
            clients: Mutex::new(HashMap::new()),
            current: Mutex::new(current),
        }
    }

    /// Installs the process-wide pool. Returns `false` if one already exists.
    pub fn install(config: Config) -> bool {
        GLOBAL_POOL
            .set(Self::new(config, Arc::new(Catalog::standard())))
            .is_ok()
    }

    /// The process-wide pool, created from default settings on first use.
    pub fn global() -> &'static SlavePool {
        GLOBAL_POOL.get_or_init(|| Self::new(Config::default(), Arc::new(Catalog::standard())))
    }

    /// Registers a preconfigured client, replacing any previous one.
    pub fn insert(&self, client: Arc<Client>) {
        self.clients
            .lock()
            .insert(client.slave().to_string(), client);
    }

    pub fn client(&self, slave: &str) -> BridgeResult<Arc<Client>> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(slave) {
            return Ok(client.clone());
        }
        if !self.config.bridge.slaves.iter().any(|known| known == slave) {
            return Err(BridgeError::UnknownSlave {
                slave: slave.to_string(),
            });
        }
        let client = Arc::new(Client::new(ClientSettings::from_config(slave, &self.config)));
        clients.insert(slave.to_string(), client.clone());
        Ok(client)
    }

    pub fn current_slave(&self) -> String {
        self.current.lock().clone()
    }

    pub fn current(&self) -> BridgeResult<Arc<Client>> {
        self.client(&self.current_slave())
    }

    /// Router bound to the current slave.
    pub fn api(&self) -> BridgeResult<Api> {
        Ok(Api::outside(self.current()?, self.catalog.clone()))
    }

    /// Makes `slave` current until the returned scope is dropped.
    pub fn select(&self, slave: &str) -> BridgeResult<SlaveScope<'_>> {
        self.client(slave)?;
        let previous = std::mem::replace(&mut *self.current.lock(), slave.to_string());
        debug!(slave, previous = %previous, "selected slave");
        Ok(SlaveScope {
            pool: self,
            previous: Some(previous),
        })
    }
}

/// Restores the previously selected slave on drop.
#[must_use = "the selection reverts as soon as the scope is dropped"]
pub struct SlaveScope<'a> {
    pool: &'a SlavePool,
    previous: Option<String>,
}

impl Drop for SlaveScope<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.pool.current.lock() = previous;
        }
    }
}
