//! The list of native API names, persisted for out-of-host callers.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::Host;

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("failed to access API surface at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse API surface at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSurface {
    functions: BTreeSet<String>,
}

impl ApiSurface {
    pub fn from_host(host: &dyn Host) -> Self {
        host.function_names().into_iter().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(String::as_str)
    }

    pub fn load(path: &Path) -> Result<Self, SurfaceError> {
        let text = fs::read_to_string(path).map_err(|source| SurfaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SurfaceError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SurfaceError> {
        let io_error = |source| SurfaceError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| SurfaceError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(io_error)
    }
}

impl FromIterator<String> for ApiSurface {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            functions: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::TestHost;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("api_surface.json");
        let surface = ApiSurface::from_host(&TestHost::default());
        surface.save(&path).unwrap();

        let loaded = ApiSurface::load(&path).unwrap();
        assert_eq!(loaded, surface);
        assert!(loaded.contains("Double"));
        assert!(!loaded.contains("NonExistentApi"));
        assert_eq!(loaded.names().next(), Some("Double"));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_surface.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ApiSurface::load(&path),
            Err(SurfaceError::Parse { .. })
        ));
    }
}
