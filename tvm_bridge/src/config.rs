use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

pub const LIBRARY_ENV: &str = "TVM_LIBRARY_PATH";
pub const LOG_ENV: &str = "TVM_BRIDGE_LOG";

/// Bridge settings, normally read from a `tvm_bridge.toml`:
///
/// ```toml
/// library = "/opt/tvm/libtvmrt.so"
/// log_filter = "tvm_bridge=debug"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Explicit runtime library. `None` uses the runtime linked into the process.
    pub library: Option<PathBuf>,
    /// `tracing` filter directive, e.g. `warn` or `tvm_bridge=debug`.
    pub log_filter: Option<String>,
}

impl BridgeConfig {
    pub fn from_toml_str(text: &str) -> BridgeResult<Self> {
        toml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e.message())))
    }

    /// Applies `TVM_LIBRARY_PATH` and `TVM_BRIDGE_LOG` when set and non-empty.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(LIBRARY_ENV).filter(|v| !v.is_empty()) {
            self.library = Some(PathBuf::from(path));
        }
        if let Some(filter) = lookup(LOG_ENV).filter(|v| !v.is_empty()) {
            self.log_filter = Some(filter);
        }
        self
    }
}
