//! Configuration management for network-asset reservation.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`NETRES__RESERVE__` prefix, e.g.
//!    `NETRES__RESERVE__LEDGER_PATH`)
//! 2. Config file (`netres.toml`, `[reserve]` section)
//! 3. Defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::NetresError;
use crate::types::AssetTemplate;

/// Suffix appended to the ledger path when no lock path is configured.
pub const LOCK_SUFFIX: &str = ".lock";

/// Top-level reservation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReservationConfig {
    /// Shared ledger file (default: "/tmp/netres_assets.json").
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Lock file guarding the ledger. Defaults to the ledger path plus `.lock`.
    #[serde(default)]
    pub lock_path: Option<PathBuf>,

    /// How long to wait for the lock before treating the holder as dead.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Interval between lock attempts.
    #[serde(default = "default_lock_poll")]
    pub lock_poll_millis: u64,

    /// Hypervisor connection URI.
    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,

    /// Path to the virsh binary (default: "virsh").
    #[serde(default = "default_virsh_path")]
    pub virsh_path: String,

    /// Candidates tried per field before giving up with a pool-exhausted error.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Where each search starts.
    #[serde(default)]
    pub template: AssetTemplate,
}

impl ReservationConfig {
    /// Load the `[reserve]` section from `{file_prefix}.toml` and the environment.
    ///
    /// A missing file or section yields the defaults; a section that is
    /// present but malformed is an error.
    pub fn load(file_prefix: &str) -> Result<Self, NetresError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("NETRES")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        match cfg.get::<ReservationConfig>("reserve") {
            Ok(c) => Ok(c),
            Err(config::ConfigError::NotFound(_)) => {
                tracing::debug!(file_prefix, "No [reserve] section, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Effective lock file path.
    pub fn lock_path(&self) -> PathBuf {
        match &self.lock_path {
            Some(p) => p.clone(),
            None => {
                let mut raw = self.ledger_path.clone().into_os_string();
                raw.push(LOCK_SUFFIX);
                PathBuf::from(raw)
            }
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_poll(&self) -> Duration {
        Duration::from_millis(self.lock_poll_millis.max(1))
    }

    /// Whether the hypervisor runs on this machine.
    pub fn is_local_target(&self) -> bool {
        is_local_uri(&self.libvirt_uri)
    }
}

/// Whether a libvirt URI points at the local machine.
///
/// `qemu:///system` has no host and is local; `qemu+ssh://user@host/system`
/// is local only when the host is a loopback name.
pub fn is_local_uri(uri: &str) -> bool {
    let Some((_, rest)) = uri.split_once("://") else {
        return true;
    };
    let authority = rest.split(['/', '?']).next().unwrap_or("");
    let host_port = authority.rsplit('@').next().unwrap_or("");

    let host = if let Some(bracketed) = host_port.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or("")
    } else {
        host_port.split(':').next().unwrap_or("")
    };

    matches!(host, "" | "localhost" | "127.0.0.1" | "::1")
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("/tmp/netres_assets.json")
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_lock_poll() -> u64 {
    100
}

fn default_libvirt_uri() -> String {
    "qemu:///system".to_string()
}

fn default_virsh_path() -> String {
    "virsh".to_string()
}

fn default_max_attempts() -> u32 {
    4096
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ledger_path: default_ledger_path(),
            lock_path: None,
            lock_timeout_secs: default_lock_timeout(),
            lock_poll_millis: default_lock_poll(),
            libvirt_uri: default_libvirt_uri(),
            virsh_path: default_virsh_path(),
            max_attempts: default_max_attempts(),
            template: AssetTemplate::default(),
        }
    }
}
