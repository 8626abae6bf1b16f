//! Event-driven watcher over kernel route notifications

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use route_forge_common::{metrics, Error, Result, VmKey, MAIN_ROUTE_TABLE_ID};
use route_forge_netlink::{RouteChange, RouteMonitor};

use super::{Drift, DriftCheck, SourceMemo, Watcher, DRIFT_BUFFER};

const NAME: &str = "netlink";

/// Reports VMs whose routes the kernel just added or removed
pub struct NetlinkWatcher {
    drift: DriftCheck,
    monitor: Arc<dyn RouteMonitor>,
}

impl NetlinkWatcher {
    /// Create a watcher over `monitor`
    pub fn new(drift: DriftCheck, monitor: Arc<dyn RouteMonitor>) -> Self {
        Self { drift, monitor }
    }
}

/// Decide whether one notification points at drift
async fn inspect(drift: &DriftCheck, change: &RouteChange) -> Result<Option<(VmKey, Drift)>> {
    let Some(key) = drift.owner(change.route(), MAIN_ROUTE_TABLE_ID) else {
        return Ok(None);
    };
    match change {
        RouteChange::Deleted(_) => Ok(Some((key, Drift::Removed))),
        RouteChange::Added(route) => {
            // Fresh lookups: the kernel state just changed
            let mut sources = SourceMemo::default();
            Ok(drift
                .verify(route, &key, &mut sources)
                .await?
                .map(|reason| (key, reason)))
        }
    }
}

#[async_trait]
impl Watcher for NetlinkWatcher {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn start(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<VmKey>> {
        let mut changes = self
            .monitor
            .subscribe(cancel.clone())
            .await
            .map_err(|e| Error::setup("netlink-watcher", e.to_string()))?;

        let (tx, rx) = mpsc::channel(DRIFT_BUFFER);
        let drift = self.drift.clone();
        tokio::spawn(async move {
            info!(watcher = NAME, "Route watcher started");
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => match change {
                        Some(change) => change,
                        None => {
                            warn!(watcher = NAME, "Route notifications ended, periodic scan continues");
                            break;
                        }
                    }
                };

                match inspect(&drift, &change).await {
                    Ok(Some((key, reason))) => {
                        debug!(watcher = NAME, vm = %key, route = %change.route(), reason = %reason, "Drift detected");
                        metrics::record_drift(NAME);
                        if tx.send(key).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(watcher = NAME, route = %change.route(), error = %e, "Failed to check route"),
                }
            }
            info!(watcher = NAME, "Route watcher stopped");
        });

        Ok(rx)
    }
}
