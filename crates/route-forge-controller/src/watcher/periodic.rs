//! Periodic full-table scan
//!
//! Catches everything the event-driven watcher misses: notifications lost
//! while the monitor was down, and cached VMs whose route never made it into
//! the kernel.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use route_forge_common::{metrics, Result, VmKey};
use route_forge_netlink::KernelRoute;

use super::{Drift, DriftCheck, SourceMemo, Watcher, DRIFT_BUFFER};

const NAME: &str = "periodic";

/// Default interval between scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Diffs the managed table against the address cache on a fixed interval
#[derive(Clone)]
pub struct PeriodicScanner {
    drift: DriftCheck,
    interval: Duration,
}

impl PeriodicScanner {
    /// Create a scanner ticking every `interval`
    pub fn new(drift: DriftCheck, interval: Duration) -> Self {
        Self { drift, interval }
    }

    /// Run one scan, returning the keys that need reconciliation
    pub async fn scan(&self) -> Result<Vec<(VmKey, Drift)>> {
        let routes = self.drift.reader.list_routes(self.drift.table).await?;
        let by_dst: HashMap<IpAddr, &KernelRoute> = routes
            .iter()
            .filter_map(|r| r.host_address().map(|ip| (ip, r)))
            .collect();

        let mut reported = HashSet::new();
        let mut out = Vec::new();

        if self.drift.report_missing {
            for (key, addrs) in self.drift.cache.entries() {
                if !self.drift.ranges.is_managed(addrs.vm_ip) || by_dst.contains_key(&addrs.vm_ip) {
                    continue;
                }
                if reported.insert(key.clone()) {
                    out.push((key, Drift::MissingRoute));
                }
            }
        }

        let mut sources = SourceMemo::default();
        for route in by_dst.values() {
            let Some(key) = self.drift.owner(route, self.drift.table) else {
                continue;
            };
            if reported.contains(&key) {
                continue;
            }
            match self.drift.verify(route, &key, &mut sources).await {
                Ok(Some(reason)) => {
                    reported.insert(key.clone());
                    out.push((key, reason));
                }
                Ok(None) => {}
                Err(e) => warn!(watcher = NAME, route = %route, error = %e, "Failed to check route"),
            }
        }

        Ok(out)
    }
}

#[async_trait]
impl Watcher for PeriodicScanner {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<VmKey>> {
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(DRIFT_BUFFER);
        let scanner = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scanner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(watcher = NAME, interval_ms = scanner.interval.as_millis() as u64, "Periodic scan started");

            'outer: loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let found = match scanner.scan().await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(watcher = NAME, error = %e, "Route scan failed, retrying next tick");
                        continue;
                    }
                };
                for (key, reason) in found {
                    debug!(watcher = NAME, vm = %key, reason = %reason, "Drift detected");
                    metrics::record_drift(NAME);
                    if tx.send(key).await.is_err() {
                        break 'outer;
                    }
                }
            }
            info!(watcher = NAME, "Periodic scan stopped");
        });

        Ok(rx)
    }
}
