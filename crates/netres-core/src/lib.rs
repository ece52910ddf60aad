//! netres-core: Shared types, configuration, and error handling for
//! network-asset reservation.
//!
//! This crate provides the foundational types used by the reservation engine:
//! - Asset templates and the concrete assets handed to a test run
//! - The transient in-use view merged from the ledger and live scans
//! - Configuration management
//! - Common error types

pub mod config;
pub mod error;
pub mod types;

pub use config::ReservationConfig;
pub use error::NetresError;
pub use types::{AllocatedAsset, AssetField, AssetId, AssetTemplate, InUseSet, ValidTemplate};
