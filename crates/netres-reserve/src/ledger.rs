//! File-backed ledger of allocated assets, shared by every process on the host.
//!
//! The ledger is only ever read or written by the holder of the companion
//! lock, so plain overwrite is sufficient.

use std::fs;
use std::path::{Path, PathBuf};

use netres_core::{AllocatedAsset, InUseSet};

use crate::error::Result;

/// JSON array of [`AllocatedAsset`] records at a fixed path.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry. A missing or blank file is an empty ledger.
    pub fn load(&self) -> Result<Vec<AllocatedAsset>> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "Ledger absent, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        if json.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&json)?)
    }

    /// Overwrite the file with `entries`.
    ///
    /// An empty ledger is stored by removing the file, which [`load`](Self::load)
    /// reads back as empty.
    pub fn store(&self, entries: &[AllocatedAsset]) -> Result<()> {
        if entries.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(path = %self.path.display(), "Ledger emptied, file removed");
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut json = serde_json::to_string_pretty(entries)?;
        json.push('\n');
        fs::write(&self.path, json)?;

        tracing::debug!(
            path = %self.path.display(),
            entries = entries.len(),
            "Ledger stored"
        );

        Ok(())
    }

    /// Fold every entry's subnets and bridge names into an in-use view.
    pub fn in_use(entries: &[AllocatedAsset]) -> InUseSet {
        let mut in_use = InUseSet::new();
        for entry in entries {
            in_use.insert_asset(entry);
        }
        in_use
    }
}
