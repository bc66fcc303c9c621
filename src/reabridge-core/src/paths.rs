use crate::{APP_AUTHOR, APP_NAME, APP_QUALIFIER};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const API_SURFACE_FILE: &str = "api_surface.json";
/// Overrides the platform directories with one self-contained root.
pub const HOME_ENV: &str = "REABRIDGE_HOME";

/// Where configuration, logs and the persisted API surface live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    config_dir: PathBuf,
    data_dir: PathBuf,
    log_dir: PathBuf,
}

impl AppDirs {
    /// Uses `$REABRIDGE_HOME` when set, else the platform's per-user directories.
    pub fn discover() -> Result<Self, DirsError> {
        match std::env::var_os(HOME_ENV).filter(|root| !root.is_empty()) {
            Some(root) => Ok(Self::rooted_at(Path::new(&root))),
            None => Self::platform(),
        }
    }

    pub fn platform() -> Result<Self, DirsError> {
        let project = ProjectDirs::from(APP_QUALIFIER, APP_AUTHOR, APP_NAME)
            .ok_or(DirsError::NoHomeDirectory)?;
        let data_dir = project.data_dir().to_path_buf();
        Ok(Self {
            config_dir: project.config_dir().to_path_buf(),
            log_dir: data_dir.join("logs"),
            data_dir,
        })
    }

    /// Lays every directory out beneath `root`.
    pub fn rooted_at(root: &Path) -> Self {
        let data_dir = root.join("data");
        Self {
            config_dir: root.join("config"),
            log_dir: data_dir.join("logs"),
            data_dir,
        }
    }

    pub fn ensure_exists(&self) -> Result<(), DirsError> {
        [&self.config_dir, &self.data_dir, &self.log_dir]
            .into_iter()
            .try_for_each(|dir| {
                std::fs::create_dir_all(dir).map_err(|source| DirsError::CreateDirectory {
                    path: dir.clone(),
                    source,
                })
            })
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Native API names written by the agent and read by clients.
    pub fn api_surface_path(&self) -> PathBuf {
        self.data_dir.join(API_SURFACE_FILE)
    }
}

#[derive(Debug, Error)]
pub enum DirsError {
    #[error("no home directory to place reabridge files in; set REABRIDGE_HOME")]
    NoHomeDirectory,
    #[error("cannot create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}
