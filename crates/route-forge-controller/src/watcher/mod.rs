//! Drift watchers: observers of the kernel routing table
//!
//! Each watcher compares what the kernel holds against the [`AddressCache`]
//! and emits the key of every VM whose route looks wrong. Watchers never
//! mutate routes; the controller reconciles whatever they report.

mod kprobe;
mod netlink;
mod periodic;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use route_forge_common::{ManagedRanges, Result, VmKey};
use route_forge_netlink::{KernelRoute, RouteMonitor, RouteReader};

use crate::cache::AddressCache;

pub use kprobe::KprobeWatcher;
pub use netlink::NetlinkWatcher;
pub use periodic::{PeriodicScanner, DEFAULT_SCAN_INTERVAL};

/// Keys buffered between a watcher and the controller
const DRIFT_BUFFER: usize = 1024;

/// A source of suspect VM keys
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Start observing; the returned stream closes when `cancel` fires
    ///
    /// An error here is a setup failure and must abort startup.
    async fn start(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<VmKey>>;
}

/// Event-driven watcher backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum WatcherKind {
    /// Kernel route notifications via `ip monitor`
    #[default]
    Netlink,
    /// Kernel function probes
    Kprobe,
}

impl fmt::Display for WatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherKind::Netlink => write!(f, "netlink"),
            WatcherKind::Kprobe => write!(f, "kprobe"),
        }
    }
}

/// Build the event-driven watcher selected by `kind`
pub fn new_watcher(
    kind: WatcherKind,
    drift: DriftCheck,
    monitor: Arc<dyn RouteMonitor>,
) -> Box<dyn Watcher> {
    match kind {
        WatcherKind::Netlink => Box::new(NetlinkWatcher::new(drift, monitor)),
        WatcherKind::Kprobe => Box::new(KprobeWatcher::new()),
    }
}

/// Why a key was reported
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Drift {
    /// A cached VM has no route
    MissingRoute,
    /// A route exists for an address the cache has no entry for
    MissingEntry,
    /// Route source or destination disagree with the cache
    Mismatch,
    /// A route for a cached address was removed
    Removed,
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Drift::MissingRoute => "route missing",
            Drift::MissingEntry => "cache entry missing",
            Drift::Mismatch => "route differs from cache",
            Drift::Removed => "route removed",
        };
        f.write_str(s)
    }
}

/// Comparison logic shared by the watchers
#[derive(Clone)]
pub struct DriftCheck {
    cache: Arc<AddressCache>,
    ranges: ManagedRanges,
    table: u32,
    reader: Arc<dyn RouteReader>,
    report_missing: bool,
}

impl DriftCheck {
    /// Create a checker for routes in `table`
    pub fn new(
        cache: Arc<AddressCache>,
        ranges: ManagedRanges,
        table: u32,
        reader: Arc<dyn RouteReader>,
    ) -> Self {
        Self {
            cache,
            ranges,
            table,
            reader,
            report_missing: true,
        }
    }

    /// Stop reporting cached VMs that have no route (dry-run mode)
    pub fn ignore_missing_routes(mut self) -> Self {
        self.report_missing = false;
        self
    }

    /// Owner of a managed host route in the managed table
    ///
    /// `None` for other tables, network prefixes, unmanaged addresses and
    /// addresses the cache does not know.
    pub(crate) fn owner(&self, route: &KernelRoute, default_table: u32) -> Option<VmKey> {
        if !route.in_table(self.table, default_table) {
            return None;
        }
        let ip = route.host_address()?;
        if !self.ranges.is_managed(ip) {
            return None;
        }
        self.cache.get_name(ip)
    }

    /// Verify an existing route owned by `key` against the cache
    pub(crate) async fn verify(
        &self,
        route: &KernelRoute,
        key: &VmKey,
        sources: &mut SourceMemo,
    ) -> Result<Option<Drift>> {
        let Some(addrs) = self.cache.get_addresses(key) else {
            return Ok(Some(Drift::MissingEntry));
        };
        let expected_src = sources.get(self.reader.as_ref(), addrs.node_ip).await?;
        if route.src != expected_src || route.host_address() != Some(addrs.vm_ip) {
            return Ok(Some(Drift::Mismatch));
        }
        Ok(None)
    }
}

/// Memoised `route_get(node_ip).src` lookups
#[derive(Default)]
pub(crate) struct SourceMemo {
    sources: HashMap<IpAddr, Option<IpAddr>>,
}

impl SourceMemo {
    async fn get(&mut self, reader: &dyn RouteReader, node_ip: IpAddr) -> Result<Option<IpAddr>> {
        if let Some(src) = self.sources.get(&node_ip) {
            return Ok(*src);
        }
        let src = reader.route_get(node_ip).await?.src;
        self.sources.insert(node_ip, src);
        Ok(src)
    }
}
