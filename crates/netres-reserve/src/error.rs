//! Error types for the netres-reserve crate.

use std::path::PathBuf;

use netres_core::{AssetField, NetresError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReserveError {
    #[error("Timed out after {waited_secs}s waiting for lock {path:?}")]
    LockTimeout { path: PathBuf, waited_secs: u64 },

    #[error("Address pool exhausted for `{field}` after {attempts} attempts")]
    PoolExhausted { field: AssetField, attempts: u32 },

    #[error("virsh not found at path: {path}")]
    VirshNotFound { path: String },

    #[error("virsh exited with code {code}: {stderr}")]
    VirshFailed { code: i32, stderr: String },

    #[error("Hypervisor error: {0}")]
    Hypervisor(String),

    #[error(transparent)]
    Core(#[from] NetresError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReserveError>;
