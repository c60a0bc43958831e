//! YAML daemon settings.
//!
//! # Layout under the root directory
//!
//! ```text
//! <root>/
//!   etc/
//!     syslogd.yaml              (these settings; optional)
//!     asl.conf                  (default module rules)
//!     asl/<module>              (one additional module per file)
//!   var/
//!     log/asl/                  (durable store)
//!     log/asl/aux/              (aux payloads)
//!     run/syslogd.sock          (RPC)
//!     run/syslog                (legacy datagram socket)
//!     run/syslogd.console.sock  (console)
//! ```
//!
//! Path helpers take the root explicitly (`fn_at(root)`) so tests can point
//! them at a `TempDir`. Settings override individual paths when set.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::params::Params;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<root>/etc/syslogd.yaml`
pub fn settings_path_at(root: &Path) -> PathBuf {
    root.join("etc").join("syslogd.yaml")
}

/// `<root>/etc/asl.conf`
pub fn asl_conf_at(root: &Path) -> PathBuf {
    root.join("etc").join("asl.conf")
}

/// `<root>/etc/asl/`
pub fn module_dir_at(root: &Path) -> PathBuf {
    root.join("etc").join("asl")
}

/// `<root>/var/log/asl/`
pub fn store_dir_at(root: &Path) -> PathBuf {
    root.join("var").join("log").join("asl")
}

/// `<root>/var/log/asl/aux/`
pub fn aux_dir_at(root: &Path) -> PathBuf {
    store_dir_at(root).join("aux")
}

/// `<root>/var/log/syslogd.log`
pub fn debug_log_at(root: &Path) -> PathBuf {
    root.join("var").join("log").join("syslogd.log")
}

/// `<root>/var/run/syslogd.sock`
pub fn rpc_socket_at(root: &Path) -> PathBuf {
    root.join("var").join("run").join("syslogd.sock")
}

/// `<root>/var/run/syslog`
pub fn bsd_socket_at(root: &Path) -> PathBuf {
    root.join("var").join("run").join("syslog")
}

/// `<root>/var/run/syslogd.console.sock`
pub fn console_socket_at(root: &Path) -> PathBuf {
    root.join("var").join("run").join("syslogd.console.sock")
}

// ---------------------------------------------------------------------------
// 2. Settings
// ---------------------------------------------------------------------------

/// Daemon settings. Every field is optional in the YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub root: PathBuf,
    pub asl_conf: Option<PathBuf>,
    pub module_dir: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
    pub rpc_socket: Option<PathBuf>,
    pub console_socket: Option<PathBuf>,
    /// Legacy datagram socket; `None` means the default path.
    pub bsd_socket: Option<PathBuf>,
    /// UDP listener, e.g. `0.0.0.0:514`. Disabled when unset.
    pub udp_bind: Option<String>,
    /// Kernel log device, e.g. `/dev/kmsg`. Disabled when unset.
    pub kernel_device: Option<PathBuf>,
    pub queue_capacity: usize,
    pub params: Params,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            asl_conf: None,
            module_dir: None,
            store_dir: None,
            rpc_socket: None,
            console_socket: None,
            bsd_socket: None,
            udp_bind: None,
            kernel_device: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            params: Params::default(),
        }
    }
}

impl DaemonConfig {
    /// Settings rooted at `root` with everything else defaulted.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load settings from `path`. A missing file yields defaults rooted at
    /// `root`; a malformed file is an error carrying the path.
    pub fn load_at(root: &Path, path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::with_root(root));
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        if contents.trim().is_empty() {
            return Ok(Self::with_root(root));
        }
        let mut config: DaemonConfig =
            serde_yaml::from_str(&contents).map_err(|source| CoreError::Settings {
                path: path.to_path_buf(),
                source,
            })?;
        if config.root == Path::new("/") {
            config.root = root.to_path_buf();
        }
        Ok(config)
    }

    /// Load `<root>/etc/syslogd.yaml`.
    pub fn load_default_at(root: &Path) -> Result<Self, CoreError> {
        Self::load_at(root, &settings_path_at(root))
    }

    pub fn asl_conf(&self) -> PathBuf {
        self.asl_conf.clone().unwrap_or_else(|| asl_conf_at(&self.root))
    }

    pub fn module_dir(&self) -> PathBuf {
        self.module_dir
            .clone()
            .unwrap_or_else(|| module_dir_at(&self.root))
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| store_dir_at(&self.root))
    }

    pub fn aux_dir(&self) -> PathBuf {
        self.store_dir().join("aux")
    }

    pub fn rpc_socket(&self) -> PathBuf {
        self.rpc_socket
            .clone()
            .unwrap_or_else(|| rpc_socket_at(&self.root))
    }

    pub fn console_socket(&self) -> PathBuf {
        self.console_socket
            .clone()
            .unwrap_or_else(|| console_socket_at(&self.root))
    }

    pub fn bsd_socket(&self) -> PathBuf {
        self.bsd_socket
            .clone()
            .unwrap_or_else(|| bsd_socket_at(&self.root))
    }

    pub fn debug_file(&self) -> PathBuf {
        self.params
            .debug_file
            .clone()
            .unwrap_or_else(|| debug_log_at(&self.root))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
