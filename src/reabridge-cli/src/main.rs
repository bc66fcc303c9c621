use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reabridge::agent::{self, AgentSettings};
use reabridge::host_config;
use reabridge::{Api, ApiSurface, Catalog, Client, ClientSettings};
use reabridge_core::{init_logging, AppDirs, Config};
use serde_json::Value;
use sim_host::SimHost;
use thiserror::Error;

#[derive(Debug, Parser)]
#[command(name = "reabridge", version, about = "Drive a host's scripting API over TCP")]
struct Cli {
    /// Slave host to talk to (defaults to the first configured slave)
    #[arg(long, global = true)]
    host: Option<String>,
    /// Connect straight to this agent port instead of asking the web interface
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call one native API function and print the JSON result
    Call(CallCommand),
    /// Add the web control interface to a host config file
    Enable(IniCommand),
    /// Remove the web control interface from a host config file
    Disable(IniCommand),
    /// List the persisted API surface
    Surface,
    /// Run the agent inside a simulated host until interrupted
    Agent,
}

#[derive(Debug, Parser, Clone)]
struct CallCommand {
    /// Native function name, e.g. GetAppVersion
    function: String,
    /// Positional arguments as a JSON array
    #[arg(default_value = "[]")]
    args: String,
}

#[derive(Debug, Parser, Clone)]
struct IniCommand {
    /// Path to the host's reaper.ini
    #[arg(long)]
    ini: PathBuf,
}

#[derive(Debug, Error, PartialEq, Eq)]
enum ArgsError {
    #[error("arguments must be a JSON array, got {0}")]
    NotAList(String),
    #[error("arguments are not valid JSON: {0}")]
    Json(String),
}

impl CallCommand {
    fn positional(&self) -> Result<Vec<Value>, ArgsError> {
        match serde_json::from_str(&self.args) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(other) => Err(ArgsError::NotAList(other.to_string())),
            Err(err) => Err(ArgsError::Json(err.to_string())),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    match &cli.command {
        Command::Call(call) => {
            let args = call.positional()?;
            let api = connect(&cli, &config, &dirs);
            let value = api
                .call(&call.function, args)
                .with_context(|| format!("calling {}", call.function))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Enable(ini) => {
            let changed =
                host_config::add_web_interface(&ini.ini, config.bridge.web_interface_port)?;
            if changed {
                println!(
                    "Web interface added on port {}; restart the host to apply.",
                    config.bridge.web_interface_port
                );
            } else {
                println!("Web interface already configured.");
            }
        }
        Command::Disable(ini) => {
            let changed =
                host_config::remove_web_interface(&ini.ini, config.bridge.web_interface_port)?;
            if changed {
                println!("Web interface removed; restart the host to apply.");
            } else {
                println!("No web interface on port {}.", config.bridge.web_interface_port);
            }
        }
        Command::Surface => {
            let path = dirs.api_surface_path();
            let surface = ApiSurface::load(&path)
                .with_context(|| format!("no API surface at {}", path.display()))?;
            for name in surface.names() {
                println!("{name}");
            }
        }
        Command::Agent => run_agent(&cli, &config, &dirs)?,
    }

    Ok(())
}

fn connect(cli: &Cli, config: &Config, dirs: &AppDirs) -> Api {
    let host = cli
        .host
        .clone()
        .or_else(|| config.bridge.slaves.first().cloned())
        .unwrap_or_else(|| "localhost".to_string());
    let mut settings = ClientSettings::from_config(&host, config);
    if let Some(port) = cli.port {
        settings = settings.with_port(port);
    }
    tracing::info!(slave = %host, port = ?cli.port, "connecting");
    let api = Api::outside(Arc::new(Client::new(settings)), Arc::new(Catalog::standard()));
    match ApiSurface::load(&dirs.api_surface_path()) {
        Ok(surface) => api.with_surface(Arc::new(surface)),
        Err(err) => {
            tracing::debug!(error = %err, "no API surface; names are checked by the agent");
            api
        }
    }
}

fn run_agent(cli: &Cli, config: &Config, dirs: &AppDirs) -> Result<()> {
    dirs.ensure_exists()?;
    let host = std::rc::Rc::new(SimHost::new(dirs.data_dir()));
    let mut settings =
        AgentSettings::from_config(config).with_surface_path(dirs.api_surface_path());
    if let Some(port) = cli.port {
        settings = settings.with_port(port);
    }
    let handle = agent::start(host.clone(), Arc::new(Catalog::standard()), settings)?;
    println!("Simulated host serving on port {}", handle.port());
    host.run(&AtomicBool::new(false));
    Ok(())
}
