//! Common types for vm-route-forge: CRDs, errors, keys and utilities

#![deny(missing_docs)]

pub mod cidr;
pub mod crd;
pub mod error;
pub mod key;
pub mod metrics;
pub mod placement;
pub mod retry;
pub mod telemetry;

pub use cidr::ManagedRanges;
pub use error::Error;
pub use key::VmKey;
pub use placement::{Addresses, NodeOverlay, VmPlacement};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Routing table that holds VM host routes unless configured otherwise
pub const DEFAULT_ROUTE_TABLE_ID: u32 = 1490;

/// Kernel "local" routing table id
pub const LOCAL_ROUTE_TABLE_ID: u32 = 255;

/// Kernel "main" routing table id
pub const MAIN_ROUTE_TABLE_ID: u32 = 254;

/// Kernel "default" routing table id
pub const DEFAULT_TABLE_ID: u32 = 253;

/// Interface that receives routes toward addresses owned by this node
pub const CILIUM_HOST_IFACE: &str = "cilium_host";
