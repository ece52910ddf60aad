//! Acquire/release lifecycle.
//!
//! A [`ReservationSession`] is the handle one test run uses to take assets
//! from the shared pool and give them back. Every ledger read or write, and
//! every scan that feeds an allocation decision, happens under the ledger
//! lock so the decision is made against one consistent snapshot.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use netres_core::{AllocatedAsset, AssetTemplate, ReservationConfig};

use crate::engine::AllocationEngine;
use crate::error::{ReserveError, Result};
use crate::hypervisor::Hypervisor;
use crate::ledger::Ledger;
use crate::lock::{self, LockGuard};
use crate::scanner::{HostInterfaceScanner, HypervisorNetworkScanner};

/// One process's view of the shared asset pool.
///
/// Tracks every entry it wrote, bookkeeping stamps included, so that
/// [`release_all`](Self::release_all) removes exactly those ledger entries
/// and never an identical allocation another run made after a reclaim.
/// Calls on one session are sequential.
pub struct ReservationSession {
    ledger: Ledger,
    lock_path: PathBuf,
    lock_timeout: Duration,
    lock_poll: Duration,
    template: AssetTemplate,
    max_attempts: u32,
    hypervisor: Arc<dyn Hypervisor>,
    host_scanner: HostInterfaceScanner,
    pending: Vec<AllocatedAsset>,
}

impl ReservationSession {
    /// Build a session from configuration.
    ///
    /// Host interfaces are scanned only when the configured hypervisor URI
    /// is local.
    pub fn new(config: &ReservationConfig, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            ledger: Ledger::new(&config.ledger_path),
            lock_path: config.lock_path(),
            lock_timeout: config.lock_timeout(),
            lock_poll: config.lock_poll(),
            template: config.template.clone(),
            max_attempts: config.max_attempts,
            hypervisor,
            host_scanner: HostInterfaceScanner::new(config.is_local_target()),
            pending: Vec::new(),
        }
    }

    /// Override whether host interfaces are scanned.
    pub fn with_host_scan(mut self, enabled: bool) -> Self {
        self.host_scanner = HostInterfaceScanner::new(enabled);
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Entries acquired and not yet released.
    pub fn pending(&self) -> &[AllocatedAsset] {
        &self.pending
    }

    async fn lock(&self) -> Result<LockGuard> {
        lock::acquire(&self.lock_path, self.lock_timeout, self.lock_poll).await
    }

    /// Reserve a fresh, conflict-free asset.
    ///
    /// Orchestrates: validate template → lock → load ledger → scan host and
    /// hypervisor → allocate → append and persist → unlock.
    pub async fn acquire(&mut self) -> Result<AllocatedAsset> {
        let template = self.template.validate()?;

        let guard = self.lock().await?;

        let mut entries = self.ledger.load()?;
        let mut in_use = Ledger::in_use(&entries);
        in_use.extend(self.host_scanner.scan());
        in_use.extend(
            HypervisorNetworkScanner
                .scan(self.hypervisor.as_ref())
                .await?,
        );

        let engine = AllocationEngine::new(&template, self.max_attempts);
        let mut asset = engine.allocate(&mut in_use)?;
        asset.allocated_at = Some(Utc::now());
        asset.owner_pid = Some(std::process::id());

        entries.push(asset.clone());
        self.ledger.store(&entries)?;
        guard.release()?;

        self.pending.push(asset.clone());

        tracing::info!(
            ledger = %self.ledger.path().display(),
            asset_id = %asset.id(),
            machine_cidr = %asset.machine_cidr,
            machine_cidr6 = %asset.machine_cidr6,
            provisioning_cidr = %asset.provisioning_cidr,
            provisioning_cidr6 = %asset.provisioning_cidr6,
            network_if = %asset.network_if,
            secondary_network_if = %asset.secondary_network_if,
            ledger_entries = entries.len(),
            "Asset acquired"
        );

        Ok(asset)
    }

    /// Remove every asset this session acquired from the ledger.
    ///
    /// Returns the number of entries removed. With nothing pending the
    /// ledger is not touched. On failure the pending set is kept so the
    /// call can be retried.
    pub async fn release_all(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let guard = self.lock().await?;

        let mut entries = self.ledger.load()?;
        let before = entries.len();
        entries.retain(|entry| !self.pending.contains(entry));
        let removed = before - entries.len();

        self.ledger.store(&entries)?;
        guard.release()?;

        if removed < self.pending.len() {
            tracing::warn!(
                pending = self.pending.len(),
                removed,
                "Some acquired assets were already gone from the ledger"
            );
        }
        tracing::info!(
            ledger = %self.ledger.path().display(),
            removed,
            ledger_entries = entries.len(),
            "Assets released"
        );

        self.pending.clear();
        Ok(removed)
    }

    /// Acquire `count` assets, run `body` with them, and release them on
    /// every exit path.
    ///
    /// If `body` fails its error is returned and a release failure is only
    /// logged; if `body` succeeds a release failure is returned.
    pub async fn scoped<F, Fut, T, E>(&mut self, count: usize, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Vec<AllocatedAsset>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<ReserveError>,
    {
        let mut assets = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire().await {
                Ok(asset) => assets.push(asset),
                Err(e) => {
                    if let Err(release_err) = self.release_all().await {
                        tracing::error!(error = %release_err, "Failed to release partial acquisition");
                    }
                    return Err(e.into());
                }
            }
        }

        let outcome = body(assets).await;
        let released = self.release_all().await;

        match (outcome, released) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err.into()),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(release_err)) => {
                tracing::error!(error = %release_err, "Failed to release assets after error");
                Err(e)
            }
        }
    }

    /// Ledger contents, read under the lock.
    pub async fn snapshot(&self) -> Result<Vec<AllocatedAsset>> {
        let guard = self.lock().await?;
        let entries = self.ledger.load()?;
        guard.release()?;
        Ok(entries)
    }

    /// Remove the entry whose primary bridge is `network_if`, whoever owns it.
    ///
    /// For clearing out orphans left by crashed runs.
    pub async fn reclaim(&self, network_if: &str) -> Result<Option<AllocatedAsset>> {
        let guard = self.lock().await?;

        let mut entries = self.ledger.load()?;
        let Some(pos) = entries.iter().position(|e| e.network_if == network_if) else {
            guard.release()?;
            return Ok(None);
        };
        let reclaimed = entries.remove(pos);

        self.ledger.store(&entries)?;
        guard.release()?;

        tracing::info!(
            asset_id = %reclaimed.id(),
            network_if = %reclaimed.network_if,
            owner_pid = ?reclaimed.owner_pid,
            "Asset reclaimed"
        );

        Ok(Some(reclaimed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::StaticHypervisor;
    use netres_core::{AssetField, NetresError};

    fn config_in(dir: &std::path::Path) -> ReservationConfig {
        ReservationConfig {
            ledger_path: dir.join("assets.json"),
            lock_timeout_secs: 5,
            lock_poll_millis: 10,
            ..Default::default()
        }
    }

    fn session(config: &ReservationConfig) -> ReservationSession {
        ReservationSession::new(config, Arc::new(StaticHypervisor::new())).with_host_scan(false)
    }

    #[tokio::test]
    async fn acquire_records_pending_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut s = session(&config);

        let asset = s.acquire().await.unwrap();
        assert_eq!(s.pending(), &[asset.clone()]);
        assert_eq!(asset.owner_pid, Some(std::process::id()));
        assert!(asset.allocated_at.is_some());
        assert_eq!(s.ledger().load().unwrap(), vec![asset]);
    }

    #[tokio::test]
    async fn second_acquire_moves_on() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut s = session(&config);

        let first = s.acquire().await.unwrap();
        let second = s.acquire().await.unwrap();

        assert_eq!(first.machine_cidr.to_string(), "192.168.127.0/24");
        assert_eq!(second.machine_cidr.to_string(), "192.168.128.0/24");
        assert_eq!(second.network_if, "test1");
        assert_eq!(second.secondary_network_if, "stest1");
        assert_eq!(s.pending().len(), 2);
    }

    #[tokio::test]
    async fn missing_template_field_is_fatal_and_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.template.machine_cidr6 = None;
        let mut s = session(&config);

        let err = s.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            ReserveError::Core(NetresError::MissingTemplateField(AssetField::MachineCidr6))
        ));
        assert!(!config.ledger_path.exists());
        assert!(!config.lock_path().exists());
    }

    #[tokio::test]
    async fn release_without_acquire_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut s = session(&config);

        assert_eq!(s.release_all().await.unwrap(), 0);
        assert!(!config.ledger_path.exists());
    }

    #[tokio::test]
    async fn release_only_removes_own_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut mine = session(&config);
        let mut theirs = session(&config);

        mine.acquire().await.unwrap();
        let kept = theirs.acquire().await.unwrap();
        mine.acquire().await.unwrap();

        assert_eq!(mine.release_all().await.unwrap(), 2);
        assert!(mine.pending().is_empty());
        assert_eq!(mine.ledger().load().unwrap(), vec![kept]);
    }

    #[tokio::test]
    async fn scoped_releases_on_success_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut s = session(&config);

        let names = s
            .scoped(2, |assets| async move {
                Ok::<_, ReserveError>(
                    assets
                        .into_iter()
                        .map(|a| a.network_if)
                        .collect::<Vec<_>>(),
                )
            })
            .await
            .unwrap();
        assert_eq!(names, vec!["test0", "test1"]);
        assert!(s.ledger().load().unwrap().is_empty());

        let result: std::result::Result<(), ReserveError> = s
            .scoped(1, |_| async { Err(ReserveError::Hypervisor("boom".to_string())) })
            .await;
        assert!(matches!(result, Err(ReserveError::Hypervisor(_))));
        assert!(s.ledger().load().unwrap().is_empty());
        assert!(s.pending().is_empty());
    }

    #[tokio::test]
    async fn scoped_releases_partial_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        // Room for exactly one bridge name per prefix.
        config.max_attempts = 1;
        let mut s = session(&config);

        let result: std::result::Result<(), ReserveError> =
            s.scoped(2, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ReserveError::PoolExhausted { .. })));
        assert!(s.ledger().load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaim_removes_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut crashed = session(&config);
        let orphan = crashed.acquire().await.unwrap();
        drop(crashed);

        let operator = session(&config);
        assert_eq!(operator.snapshot().await.unwrap().len(), 1);

        let reclaimed = operator.reclaim(&orphan.network_if).await.unwrap();
        assert_eq!(reclaimed.map(|a| a.id()), Some(orphan.id()));
        assert!(operator.snapshot().await.unwrap().is_empty());
        assert!(operator.reclaim("test9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_spares_identical_entry_acquired_after_reclaim() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut first = session(&config);
        let original = first.acquire().await.unwrap();

        let operator = session(&config);
        operator.reclaim(&original.network_if).await.unwrap();

        // The freed parameters are handed out again, to a different run.
        let mut second = session(&config);
        let reissued = second.acquire().await.unwrap();
        assert_eq!(reissued.id(), original.id());
        assert_ne!(reissued.allocated_at, original.allocated_at);

        assert_eq!(first.release_all().await.unwrap(), 0);
        assert_eq!(first.ledger().load().unwrap(), vec![reissued]);
    }
}
