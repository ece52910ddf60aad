//! End-to-end reservation tests against shared ledger and lock files.
//!
//! Each test gets its own temporary ledger, so they run in parallel safely.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netres_core::types::overlaps;
use netres_core::{AllocatedAsset, ReservationConfig};
use netres_reserve::ledger::Ledger;
use netres_reserve::{lock, DhcpLease, ReservationSession, StaticHypervisor};

fn config_in(dir: &Path) -> ReservationConfig {
    ReservationConfig {
        ledger_path: dir.join("assets.json"),
        lock_timeout_secs: 30,
        lock_poll_millis: 5,
        ..Default::default()
    }
}

fn session(config: &ReservationConfig) -> ReservationSession {
    ReservationSession::new(config, Arc::new(StaticHypervisor::new())).with_host_scan(false)
}

fn assert_pairwise_disjoint(entries: &[AllocatedAsset]) {
    for (i, a) in entries.iter().enumerate() {
        let nets = a.networks();
        for (x, (field_x, net_x)) in nets.iter().enumerate() {
            for (field_y, net_y) in &nets[x + 1..] {
                assert!(
                    !overlaps(net_x, net_y),
                    "{field_x} and {field_y} of one entry overlap: {net_x} / {net_y}"
                );
            }
        }
        assert_ne!(a.network_if, a.secondary_network_if);

        for b in &entries[i + 1..] {
            for (field_a, net_a) in a.networks() {
                for (field_b, net_b) in b.networks() {
                    assert!(
                        !overlaps(&net_a, &net_b),
                        "{field_a}={net_a} overlaps {field_b}={net_b}"
                    );
                }
            }
            for name in a.bridge_names() {
                assert!(
                    !b.bridge_names().contains(&name),
                    "bridge name {name} shared between entries"
                );
            }
        }
    }
}

#[tokio::test]
async fn acquire_then_release_restores_ledger_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    // Pre-existing entry from another run.
    let other = AllocatedAsset {
        machine_cidr: "192.168.127.0/24".parse().unwrap(),
        machine_cidr6: "1001:db8::/120".parse().unwrap(),
        provisioning_cidr: "192.168.145.0/24".parse().unwrap(),
        provisioning_cidr6: "3001:db8::/120".parse().unwrap(),
        network_if: "test0".to_string(),
        secondary_network_if: "stest0".to_string(),
        allocated_at: "2024-05-02T10:11:12Z".parse().ok(),
        owner_pid: Some(31337),
    };
    Ledger::new(&config.ledger_path).store(&[other]).unwrap();
    let before = std::fs::read(&config.ledger_path).unwrap();

    let mut s = session(&config);
    let asset = s.acquire().await.unwrap();
    assert_eq!(asset.machine_cidr.to_string(), "192.168.128.0/24");
    assert_eq!(asset.network_if, "test1");
    assert_ne!(std::fs::read(&config.ledger_path).unwrap(), before);

    assert_eq!(s.release_all().await.unwrap(), 1);
    assert_eq!(std::fs::read(&config.ledger_path).unwrap(), before);
}

#[tokio::test]
async fn round_trip_from_absent_ledger_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let mut s = session(&config);

    s.acquire().await.unwrap();
    assert!(config.ledger_path.exists());
    s.release_all().await.unwrap();

    assert!(!config.ledger_path.exists());
}

#[tokio::test]
async fn hypervisor_leases_are_avoided() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let hv = StaticHypervisor::new()
        .with_network(
            "test-infra-net-a",
            vec![
                DhcpLease {
                    iface: "test0".to_string(),
                    addr: "192.168.127.10/24".parse().unwrap(),
                },
                DhcpLease {
                    iface: "test0".to_string(),
                    addr: "1001:db8::10/120".parse().unwrap(),
                },
            ],
        )
        .with_vanishing_network("test-infra-net-b");

    let mut s = ReservationSession::new(&config, Arc::new(hv)).with_host_scan(false);
    let asset = s.acquire().await.unwrap();

    assert_eq!(asset.machine_cidr.to_string(), "192.168.128.0/24");
    assert_eq!(asset.machine_cidr6.to_string(), "1001:db8:0:100::/120");
    assert_eq!(asset.provisioning_cidr.to_string(), "192.168.145.0/24");
    assert_eq!(asset.network_if, "test1");
    assert_eq!(asset.secondary_network_if, "stest0");
}

#[tokio::test]
async fn ledger_stays_disjoint_across_many_acquisitions() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let mut s = session(&config);

    // Enough runs for the primary range to walk into the provisioning range.
    for _ in 0..24 {
        s.acquire().await.unwrap();
    }

    let entries = s.ledger().load().unwrap();
    assert_eq!(entries.len(), 24);
    assert_pairwise_disjoint(&entries);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_get_disjoint_assets() {
    const RUNS: usize = 8;
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let mut handles = Vec::new();
    for _ in 0..RUNS {
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let mut s = session(&config);
            s.acquire().await
        }));
    }

    let mut acquired = Vec::new();
    for handle in handles {
        acquired.push(handle.await.unwrap().unwrap());
    }

    let entries = Ledger::new(&config.ledger_path).load().unwrap();
    assert_eq!(entries.len(), RUNS);
    assert_pairwise_disjoint(&entries);
    for asset in &acquired {
        assert!(entries.iter().any(|e| e.id() == asset.id()));
    }
}

#[test]
fn concurrent_processes_get_disjoint_assets() {
    const RUNS: usize = 6;
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("assets.json");
    let config_prefix = dir.path().join("no-such-config");

    let children: Vec<_> = (0..RUNS)
        .map(|_| {
            Command::new(env!("CARGO_BIN_EXE_netres"))
                .args(["-c", config_prefix.to_str().unwrap()])
                .args(["acquire", "--no-hypervisor"])
                .env("NETRES__RESERVE__LEDGER_PATH", &ledger_path)
                .env("NETRES__RESERVE__LOCK_POLL_MILLIS", "5")
                .env("RUST_LOG", "warn")
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .unwrap()
        })
        .collect();

    for child in children {
        let output = child.wait_with_output().unwrap();
        assert!(
            output.status.success(),
            "netres acquire failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let printed: Vec<AllocatedAsset> = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(printed.len(), 1);
    }

    let entries = Ledger::new(&ledger_path).load().unwrap();
    assert_eq!(entries.len(), RUNS);
    assert_pairwise_disjoint(&entries);
}

#[tokio::test]
async fn stale_lock_does_not_block_acquire() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.lock_timeout_secs = 1;

    // A holder that died without unlocking, as far as anyone can tell.
    let _abandoned = lock::acquire(
        &config.lock_path(),
        Duration::from_secs(1),
        Duration::from_millis(5),
    )
    .await
    .unwrap();

    let start = Instant::now();
    let mut s = session(&config);
    s.acquire().await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(s.ledger().load().unwrap().len(), 1);
}
