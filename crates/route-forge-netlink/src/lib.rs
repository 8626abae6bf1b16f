//! Kernel routing access for vm-route-forge
//!
//! Routes and rules are read and programmed through the iproute2 `ip` tool.
//! [`RoutingManager`] is the mutation contract the controller depends on;
//! [`RouteReader`] and [`RouteMonitor`] are the read side used by drift
//! watchers.

#![deny(missing_docs)]

pub mod command;
pub mod kernel;
pub mod manager;
pub mod route;

pub use command::{DryRun, IpCommand, IpRunner};
pub use kernel::{Kernel, RouteMonitor, RouteReader};
pub use manager::{NetlinkManager, RoutingManager};
pub use route::{KernelRoute, RouteChange, RouteType, RoutingRule};
