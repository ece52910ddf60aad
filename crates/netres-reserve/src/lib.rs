//! netres-reserve: Conflict-free network assets for concurrent test runs.
//!
//! Hands each test run sharing a virtualization host its own subnets and
//! bridge names. Decisions are made under a host-wide file lock against the
//! union of the shared ledger, the local interfaces, and the hypervisor's
//! DHCP leases, so uncoordinated processes never collide.

pub mod engine;
pub mod error;
pub mod hypervisor;
pub mod ledger;
pub mod lock;
pub mod scanner;
pub mod session;
pub mod virsh;

pub use error::ReserveError;
pub use hypervisor::{DhcpLease, Hypervisor, StaticHypervisor};
pub use session::ReservationSession;
pub use virsh::VirshHypervisor;
