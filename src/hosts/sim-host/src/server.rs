use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use reabridge::agent::{self, AgentError, AgentSettings};
use reabridge::registry::Catalog;
use reabridge_core::Config;
use tracing::{info, warn};

use crate::SimHost;

/// A simulated host running its agent on a dedicated thread.
pub struct SimServer {
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimServer {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shuts the host down and waits for its thread to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(port = self.port, "simulated host thread panicked");
            }
        }
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts a simulated host with an agent bound per `config`.
///
/// `setup` runs on the host thread before the agent starts, so it can open
/// projects and add items.
pub fn spawn(
    config: Config,
    resource_dir: PathBuf,
    setup: impl FnOnce(&SimHost) + Send + 'static,
) -> Result<SimServer, AgentError> {
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let thread_stop = stop.clone();

    let thread = thread::Builder::new()
        .name("sim-host".to_string())
        .spawn(move || {
            let host = Rc::new(SimHost::new(resource_dir));
            setup(&host);
            let settings = AgentSettings::from_config(&config);
            match agent::start(host.clone(), Arc::new(Catalog::standard()), settings) {
                Ok(handle) => {
                    // The receiver only disappears if `spawn` already returned.
                    let _ = ready_tx.send(Ok(handle.port()));
                    host.run(&thread_stop);
                    handle.stop();
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            }
        })?;

    let port = match ready_rx.recv() {
        Ok(result) => result?,
        Err(_) => {
            return Err(AgentError::Listener(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated host exited before its agent started",
            )))
        }
    };
    info!(port, "simulated host running");
    Ok(SimServer {
        port,
        stop,
        thread: Some(thread),
    })
}
