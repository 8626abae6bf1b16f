//! Route reconciliation for vm-route-forge
//!
//! - **Informers**: VirtualMachine and CiliumNode watch streams feeding
//!   reflector stores and add/update/delete notifications
//! - **Controller**: work queue and workers converging one VM route per key
//! - **Address cache**: what the controller last programmed, indexed by key
//!   and by VM address
//! - **Watchers**: detect kernel routes that drifted from the cache

#![deny(missing_docs)]

pub mod cache;
pub mod controller;
pub mod informer;
pub mod objects;
pub mod queue;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use cache::AddressCache;
pub use controller::{ControllerConfig, ControllerEvent, ControllerInputs, RouteController, SyncAction};
pub use informer::{spawn_informer, ResourceEvent};
pub use objects::{ObjectCache, ReflectorCache};
pub use queue::WorkQueue;
pub use watcher::{new_watcher, DriftCheck, PeriodicScanner, Watcher, WatcherKind};
