//! The in-host side of the bridge.
//!
//! The agent never owns a thread. It runs one short step per host scheduler
//! tick: accept whatever clients are waiting, read at most one frame from
//! each, and answer it. A `HOLD` request pins the agent to one connection
//! and serves it without yielding until `RELEASE`.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use reabridge_core::Config;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::{decode_request, encode_response};
use crate::error::{BridgeError, CallError, ErrorKind};
use crate::frame::{write_frame, FrameError, FramePoll, FrameReader};
use crate::host::Host;
use crate::protocol::{Function, Request, Response};
use crate::registry::Catalog;
use crate::rendezvous;
use crate::router::Api;
use crate::surface::{ApiSurface, SurfaceError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub bind_host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub section: String,
    /// How long one tick waits for bytes on each idle connection.
    pub read_timeout: Duration,
    /// Where to write the list of native API names on startup.
    pub surface_path: Option<PathBuf>,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_host: config.bridge.bind_host.clone(),
            port: config.bridge.server_port,
            section: config.bridge.section.clone(),
            read_timeout: config.agent.read_timeout(),
            surface_path: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_surface_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.surface_path = Some(path.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to bind agent on {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error("agent listener failed: {0}")]
    Listener(#[from] io::Error),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
}

/// Binds the agent, publishes its port and schedules its first tick.
pub fn start(
    host: Rc<dyn Host>,
    catalog: Arc<Catalog>,
    settings: AgentSettings,
) -> Result<AgentHandle, AgentError> {
    let listener = TcpListener::bind((settings.bind_host.as_str(), settings.port)).map_err(
        |source| AgentError::Bind {
            address: format!("{}:{}", settings.bind_host, settings.port),
            source,
        },
    )?;
    listener.set_nonblocking(true)?;
    let port = listener.local_addr()?.port();

    if let Some(path) = &settings.surface_path {
        let surface = ApiSurface::from_host(host.as_ref());
        surface.save(path)?;
        debug!(path = %path.display(), functions = surface.len(), "wrote API surface");
    }

    rendezvous::publish_port(host.as_ref(), &settings.section, port);
    info!(bind_host = %settings.bind_host, port, "agent listening");

    let agent = Agent {
        host: host.clone(),
        api: Api::inside(host.clone(), catalog),
        listener,
        section: settings.section,
        read_timeout: settings.read_timeout.max(Duration::from_millis(1)),
        connections: BTreeMap::new(),
        running: true,
    };
    let shared = Rc::new(Shared {
        host: host.clone(),
        agent: RefCell::new(agent),
        stop: Cell::new(false),
    });

    let weak = Rc::downgrade(&shared);
    host.at_exit(Box::new(move || {
        if let Some(shared) = weak.upgrade() {
            shared.request_stop();
        }
    }));
    schedule(shared.clone());

    Ok(AgentHandle { port, shared })
}

/// Control over a started agent, usable from the host's script thread.
pub struct AgentHandle {
    port: u16,
    shared: Rc<Shared>,
}

impl AgentHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of clients currently connected. Reads `0` mid-tick.
    pub fn connection_count(&self) -> usize {
        self.shared
            .agent
            .try_borrow()
            .map(|agent| agent.connections.len())
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.get()
            && self
                .shared
                .agent
                .try_borrow()
                .map(|agent| agent.running)
                .unwrap_or(true)
    }

    /// Closes every connection and withdraws the published port.
    pub fn stop(&self) {
        self.shared.request_stop();
    }
}

struct Shared {
    host: Rc<dyn Host>,
    agent: RefCell<Agent>,
    stop: Cell<bool>,
}

impl Shared {
    fn request_stop(&self) {
        self.stop.set(true);
        // Mid-tick the next scheduled step performs the shutdown.
        if let Ok(mut agent) = self.agent.try_borrow_mut() {
            agent.shutdown();
        }
    }

    fn step(&self) -> bool {
        let Ok(mut agent) = self.agent.try_borrow_mut() else {
            return true;
        };
        if self.stop.get() {
            agent.shutdown();
            return false;
        }
        agent.tick()
    }
}

fn schedule(shared: Rc<Shared>) {
    let host = shared.host.clone();
    host.defer(Box::new(move || {
        if shared.step() {
            schedule(shared);
        }
    }));
}

struct Connection {
    stream: TcpStream,
    reader: FrameReader,
}

enum Incoming {
    Pending,
    Frame(Vec<u8>),
    Disconnect,
}

enum Command {
    Call(Request),
    Hold,
    Release,
}

struct Agent {
    host: Rc<dyn Host>,
    api: Api,
    listener: TcpListener,
    section: String,
    read_timeout: Duration,
    connections: BTreeMap<SocketAddr, Connection>,
    running: bool,
}

impl Agent {
    fn tick(&mut self) -> bool {
        if !self.running {
            return false;
        }
        self.accept_pending();

        let addresses: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for address in addresses {
            match self.poll(address) {
                Incoming::Pending => {}
                Incoming::Disconnect => self.drop_connection(address),
                Incoming::Frame(bytes) => match self.decode(&bytes) {
                    Err(response) => {
                        self.send(address, &response);
                    }
                    Ok(Command::Hold) => {
                        if self.send(address, &Response::null()) {
                            self.hold(address);
                        }
                    }
                    Ok(Command::Release) => {
                        debug!(%address, "release outside of a hold");
                        self.send(address, &Response::null());
                    }
                    Ok(Command::Call(request)) => {
                        let response = self.dispatch(request);
                        self.send(address, &response);
                    }
                },
            }
        }
        self.running
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, address)) => match self.admit(stream, address) {
                    Ok(connection) => {
                        info!(%address, "client connected");
                        self.connections.insert(address, connection);
                    }
                    Err(err) => warn!(%address, error = %err, "failed to greet client"),
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "socket accept error");
                    break;
                }
            }
        }
    }

    fn admit(&self, mut stream: TcpStream, address: SocketAddr) -> Result<Connection, FrameError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        let greeting = format!("('{}', {})", address.ip(), address.port());
        write_frame(&mut stream, greeting.as_bytes())?;
        Ok(Connection {
            stream,
            reader: FrameReader::new(),
        })
    }

    fn poll(&mut self, address: SocketAddr) -> Incoming {
        let Some(Connection { stream, reader }) = self.connections.get_mut(&address) else {
            return Incoming::Disconnect;
        };
        match reader.poll(stream) {
            Ok(FramePoll::Pending) => Incoming::Pending,
            Ok(FramePoll::Frame(bytes)) => Incoming::Frame(bytes),
            Ok(FramePoll::Closed) => Incoming::Disconnect,
            Err(err) => {
                if !err.is_disconnect() {
                    warn!(%address, error = %err, "failed to read from client");
                }
                Incoming::Disconnect
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Command, Response> {
        let request = decode_request(bytes, &self.api.catalog().wrappers).map_err(|err| {
            warn!(error = %err, "rejecting malformed request");
            error_response(BridgeError::from(err), "<request>")
        })?;
        Ok(if request.function.is_hold() {
            Command::Hold
        } else if request.function.is_release() {
            Command::Release
        } else {
            Command::Call(request)
        })
    }

    fn dispatch(&self, request: Request) -> Response {
        let Request { function, input } = request;
        let label = function.label();
        debug!(function = %label, "dispatching request");

        let api = &self.api;
        let outcome = catch_unwind(AssertUnwindSafe(|| match function {
            Function::Name(name) => api.call_with(&name, input),
            Function::Callable(callable) => api.in_host(&callable, input),
        }));
        let result = outcome.unwrap_or_else(|panic| {
            Err(CallError::new(ErrorKind::HostError, panic_message(panic.as_ref())).into())
        });

        match result {
            Ok(value) => Response::Result { value },
            Err(err) => {
                debug!(function = %label, error = %err, "request failed");
                error_response(err, &label)
            }
        }
    }

    /// Serves one connection exclusively until it sends `RELEASE`.
    fn hold(&mut self, address: SocketAddr) {
        debug!(%address, "hold started");
        if !self.set_timeout(address, None) {
            return;
        }
        loop {
            match self.poll(address) {
                Incoming::Pending => continue,
                Incoming::Disconnect => {
                    self.drop_connection(address);
                    return;
                }
                Incoming::Frame(bytes) => {
                    let (response, released) = match self.decode(&bytes) {
                        Err(response) => (response, false),
                        Ok(Command::Hold) => (Response::null(), false),
                        Ok(Command::Release) => (Response::null(), true),
                        Ok(Command::Call(request)) => (self.dispatch(request), false),
                    };
                    if !self.send(address, &response) {
                        return;
                    }
                    if released {
                        break;
                    }
                }
            }
        }
        debug!(%address, "hold released");
        self.set_timeout(address, Some(self.read_timeout));
    }

    fn set_timeout(&mut self, address: SocketAddr, timeout: Option<Duration>) -> bool {
        let Some(connection) = self.connections.get(&address) else {
            return false;
        };
        match connection.stream.set_read_timeout(timeout) {
            Ok(()) => true,
            Err(err) => {
                warn!(%address, error = %err, "failed to set read timeout");
                self.drop_connection(address);
                false
            }
        }
    }

    /// Writes one response. Drops the connection and returns `false` on failure.
    fn send(&mut self, address: SocketAddr, response: &Response) -> bool {
        let payload = encode_response(response).or_else(|err| {
            warn!(%address, error = %err, "failed to encode response");
            encode_response(&error_response(BridgeError::from(err), "<response>"))
        });
        let Some(connection) = self.connections.get_mut(&address) else {
            return false;
        };
        let written = match payload {
            Ok(payload) => write_frame(&mut connection.stream, &payload),
            Err(err) => Err(FrameError::Io(io::Error::new(io::ErrorKind::InvalidData, err))),
        };
        match written {
            Ok(()) => true,
            Err(err) => {
                warn!(%address, error = %err, "failed to send response");
                self.drop_connection(address);
                false
            }
        }
    }

    fn drop_connection(&mut self, address: SocketAddr) {
        if let Some(connection) = self.connections.remove(&address) {
            let _ = connection.stream.shutdown(Shutdown::Both);
            info!(%address, "client disconnected");
        }
    }

    fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        let addresses: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for address in addresses {
            self.drop_connection(address);
        }
        rendezvous::clear_port(self.host.as_ref(), &self.section);
        info!(section = %self.section, "agent stopped");
    }
}

fn error_response(err: BridgeError, function: &str) -> Response {
    Response::Error {
        traceback: err.into_call_error().traceback(function),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("host call panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("host call panicked: {message}")
    } else {
        "host call panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientSettings};
    use crate::codec::{decode_response, encode_request};
    use crate::frame::read_frame;
    use crate::host::{Deferred, HostCallError};
    use crate::protocol::Args;
    use crate::rendezvous::PORT_KEY;
    use crate::router::tests::TestHost;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::io::Write;
    use std::thread;
    use std::time::Instant;

    const SECTION: &str = "reapy";

    /// `TestHost` plus a working scheduler queue.
    #[derive(Default)]
    struct LoopHost {
        inner: TestHost,
        queue: RefCell<VecDeque<Deferred>>,
        exits: RefCell<Vec<Deferred>>,
    }

    impl LoopHost {
        fn run_once(&self) {
            let pending: Vec<Deferred> = self.queue.borrow_mut().drain(..).collect();
            for task in pending {
                task();
            }
        }

        fn pump_until(&self, mut done: impl FnMut() -> bool) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while !done() {
                assert!(Instant::now() < deadline, "agent did not make progress");
                self.run_once();
            }
        }

        fn exit(&self) {
            let exits: Vec<Deferred> = self.exits.borrow_mut().drain(..).collect();
            for task in exits {
                task();
            }
        }
    }

    impl Host for LoopHost {
        fn call(&self, name: &str, args: &[Value]) -> Result<Value, HostCallError> {
            if name == "Panic" {
                panic!("native crash");
            }
            self.inner.call(name, args)
        }

        fn function_names(&self) -> Vec<String> {
            self.inner.function_names()
        }

        fn ext_state_get(&self, section: &str, key: &str) -> Option<String> {
            self.inner.ext_state_get(section, key)
        }

        fn ext_state_set(&self, section: &str, key: &str, value: &str, persist: bool) {
            self.inner.ext_state_set(section, key, value, persist)
        }

        fn ext_state_delete(&self, section: &str, key: &str, persist: bool) {
            self.inner.ext_state_delete(section, key, persist)
        }

        fn defer(&self, task: Deferred) {
            self.queue.borrow_mut().push_back(task);
        }

        fn at_exit(&self, task: Deferred) {
            self.exits.borrow_mut().push(task);
        }

        fn register_action(&self, script: &str) -> Result<String, HostCallError> {
            self.inner.register_action(script)
        }

        fn resource_path(&self) -> PathBuf {
            self.inner.resource_path()
        }
    }

    fn settings() -> AgentSettings {
        AgentSettings::from_config(&Config::default()).with_port(0)
    }

    fn start_agent() -> (Rc<LoopHost>, AgentHandle) {
        let host = Rc::new(LoopHost::default());
        let handle = start(host.clone(), Arc::new(Catalog::standard()), settings()).unwrap();
        (host, handle)
    }

    /// Runs `body` against the agent from another thread while pumping ticks.
    fn with_client<T: Send + 'static>(
        host: &LoopHost,
        port: u16,
        body: impl FnOnce(&Client) -> T + Send + 'static,
    ) -> T {
        let worker = thread::spawn(move || {
            let settings =
                ClientSettings::from_config("127.0.0.1", &Config::default()).with_port(port);
            let client = Client::new(settings);
            body(&client)
        });
        host.pump_until(|| worker.is_finished());
        worker.join().unwrap()
    }

    #[test]
    fn publishes_its_port_and_clears_it_on_stop() {
        let (host, handle) = start_agent();
        assert_eq!(
            host.ext_state_get(SECTION, PORT_KEY),
            Some(handle.port().to_string())
        );
        assert!(handle.is_running());

        handle.stop();
        assert!(!handle.is_running());
        assert_eq!(host.ext_state_get(SECTION, PORT_KEY), None);
        host.run_once();
        assert!(host.queue.borrow().is_empty());
    }

    #[test]
    fn at_exit_stops_the_agent() {
        let (host, handle) = start_agent();
        host.exit();
        assert!(!handle.is_running());
        assert_eq!(host.ext_state_get(SECTION, PORT_KEY), None);
    }

    #[test]
    fn serves_native_calls_and_reports_errors() {
        let (host, handle) = start_agent();
        let (doubled, missing, crashed) = with_client(&host, handle.port(), |client| {
            let doubled = client.request(Function::Name("Double".into()), Args::new().arg(2.0));
            let missing = client.request(Function::Name("NonExistentApi".into()), Args::new());
            let crashed = client.request(Function::Name("Panic".into()), Args::new());
            (doubled, missing, crashed)
        });
        assert_eq!(doubled.unwrap(), json!(4.0));

        let BridgeError::Remote(remote) = missing.unwrap_err() else {
            panic!("expected a remote error");
        };
        assert_eq!(remote.kind(), Some(ErrorKind::NameError));
        assert_eq!(remote.summary(), "NameError: NonExistentApi");

        let BridgeError::Remote(remote) = crashed.unwrap_err() else {
            panic!("expected a remote error");
        };
        assert_eq!(remote.kind(), Some(ErrorKind::HostError));
        assert!(remote.message().contains("native crash"));
    }

    #[test]
    fn hold_serves_a_whole_session() {
        let (host, handle) = start_agent();
        let total = with_client(&host, handle.port(), |client| {
            let session = client.hold().unwrap();
            let mut total = 0.0;
            for i in 0..100 {
                let value = client
                    .request(Function::Name("Double".into()), Args::new().arg(i))
                    .unwrap();
                total += value.as_f64().unwrap();
            }
            session.release().unwrap();
            total
        });
        assert_eq!(total, 9900.0);
        assert_eq!(host.inner.calls.borrow().len(), 100);
    }

    #[test]
    fn release_outside_a_hold_is_a_no_op() {
        let (host, handle) = start_agent();
        let reply = with_client(&host, handle.port(), |client| {
            client.request(Function::release(), Args::new())
        });
        assert_eq!(reply.unwrap(), Value::Null);
    }

    #[test]
    fn malformed_requests_get_an_error_reply() {
        let (host, handle) = start_agent();
        let port = handle.port();
        let worker = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let greeting = read_frame(&mut stream).unwrap().unwrap();
            write_frame(&mut stream, b"{not json").unwrap();
            let reply = read_frame(&mut stream).unwrap().unwrap();
            (String::from_utf8(greeting).unwrap(), decode_response(&reply).unwrap())
        });
        host.pump_until(|| worker.is_finished());
        let (greeting, reply) = worker.join().unwrap();
        assert!(greeting.starts_with("('127.0.0.1', "));
        assert!(reply.is_error());
    }

    #[test]
    fn disconnected_clients_are_dropped() {
        let (host, handle) = start_agent();
        let stream = TcpStream::connect(("127.0.0.1", handle.port())).unwrap();
        host.pump_until(|| handle.connection_count() == 1);
        drop(stream);
        host.pump_until(|| handle.connection_count() == 0);
        assert!(handle.is_running());
    }

    #[test]
    fn garbage_length_header_does_not_stop_the_agent() {
        let (host, handle) = start_agent();
        let port = handle.port();
        let worker = thread::spawn(move || {
            let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
            read_frame(&mut raw).unwrap().unwrap();
            raw.write_all(&u64::MAX.to_le_bytes()).unwrap();
            raw.write_all(b"junk").unwrap();

            let settings =
                ClientSettings::from_config("127.0.0.1", &Config::default()).with_port(port);
            let client = Client::new(settings);
            let doubled = client.request(Function::Name("Double".into()), Args::new().arg(2.0));
            drop(raw);
            doubled
        });
        host.pump_until(|| worker.is_finished());
        assert_eq!(worker.join().unwrap().unwrap(), json!(4.0));
        host.pump_until(|| handle.connection_count() == 0);
        assert!(handle.is_running());
    }

    #[test]
    fn client_closing_mid_request_is_dropped_after_dispatch() {
        let (host, handle) = start_agent();
        let port = handle.port();
        let worker = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            read_frame(&mut stream).unwrap().unwrap();
            let request = Request::new(Function::Name("Double".into()), Args::new().arg(21.0));
            write_frame(&mut stream, &encode_request(&request).unwrap()).unwrap();
        });
        host.pump_until(|| worker.is_finished());
        worker.join().unwrap();
        host.pump_until(|| handle.connection_count() == 0);
        assert!(handle.is_running());
        assert_eq!(host.inner.calls.borrow().len(), 1);

        let doubled = with_client(&host, port, |client| {
            client.request(Function::Name("Double".into()), Args::new().arg(1.0))
        });
        assert_eq!(doubled.unwrap(), json!(2.0));
    }

    #[test]
    fn writes_the_api_surface() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surface.json");
        let host = Rc::new(LoopHost::default());
        let handle = start(
            host.clone(),
            Arc::new(Catalog::standard()),
            settings().with_surface_path(&path),
        )
        .unwrap();
        let surface = ApiSurface::load(&path).unwrap();
        assert!(surface.contains("Double"));
        assert_eq!(surface.len(), 3);
        handle.stop();
    }
}
