//! Route reconciliation controller
//!
//! Cluster notifications and drift reports are reduced to VM keys and fed
//! into one [`WorkQueue`]. Workers resolve each key against the object cache
//! and converge the kernel through the [`RoutingManager`], recording the
//! result in the [`AddressCache`].
//!
//! Startup sequence:
//! 1. wait for the informers' initial list
//! 2. ensure policy rules (fatal after retries)
//! 3. remove routes for addresses no VM owns
//! 4. start the blackhole task
//! 5. start watchers (fatal on failure)
//! 6. start event pumps, enqueue every cached VM and start workers
//!
//! Informers stay silent during their initial list, so step 6 is what
//! reconciles VMs that existed before startup.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use route_forge_common::crd::{CiliumNode, VirtualMachine};
use route_forge_common::metrics;
use route_forge_common::retry::{retry_with_backoff, RetryConfig};
use route_forge_common::{Error, ManagedRanges, NodeOverlay, Result, VmKey, VmPlacement};
use route_forge_netlink::RoutingManager;

use crate::cache::AddressCache;
use crate::informer::ResourceEvent;
use crate::objects::ObjectCache;
use crate::queue::WorkQueue;
use crate::watcher::Watcher;

/// Default delay before re-checking a VM that has no node or address yet
pub const DEFAULT_NO_NODE_REQUEUE: Duration = Duration::from_secs(60);

/// Default interval of the blackhole task
pub const DEFAULT_BLACKHOLE_INTERVAL: Duration = Duration::from_secs(60);

/// Controller tuning
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Requeue delay for VMs without a node or address
    pub no_node_requeue: Duration,
    /// Interval of the blackhole task
    pub blackhole_interval: Duration,
    /// Backoff for the startup rule sync
    pub rule_sync_retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            no_node_requeue: DEFAULT_NO_NODE_REQUEUE,
            blackhole_interval: DEFAULT_BLACKHOLE_INTERVAL,
            rule_sync_retry: RetryConfig::with_max_attempts(5),
        }
    }
}

/// Input to the work queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A VM was added, deleted or moved
    PlacementChanged(VmKey),
    /// The node hosting a VM changed its overlay address or went away
    OverlayChanged(VmKey),
    /// A watcher found the kernel out of line with the cache
    DriftDetected(VmKey),
}

impl ControllerEvent {
    /// Key to reconcile
    pub fn key(&self) -> &VmKey {
        match self {
            ControllerEvent::PlacementChanged(k)
            | ControllerEvent::OverlayChanged(k)
            | ControllerEvent::DriftDetected(k) => k,
        }
    }

    fn into_key(self) -> VmKey {
        match self {
            ControllerEvent::PlacementChanged(k)
            | ControllerEvent::OverlayChanged(k)
            | ControllerEvent::DriftDetected(k) => k,
        }
    }

    fn source(&self) -> &'static str {
        match self {
            ControllerEvent::PlacementChanged(_) => "placement",
            ControllerEvent::OverlayChanged(_) => "overlay",
            ControllerEvent::DriftDetected(_) => "drift",
        }
    }
}

/// Outcome of one successful reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Kernel and cache match the declared placement
    Converged,
    /// Placement is incomplete, check again later
    RequeueAfter(Duration),
}

/// Streams the controller consumes
pub struct ControllerInputs {
    /// VirtualMachine notifications
    pub vm_events: mpsc::Receiver<ResourceEvent<VirtualMachine>>,
    /// CiliumNode notifications
    pub node_events: mpsc::Receiver<ResourceEvent<CiliumNode>>,
    /// Drift watchers to start
    pub watchers: Vec<Box<dyn Watcher>>,
}

/// Map a VM notification to a queue event
///
/// Updates only matter when the address or hosting node changed.
pub fn vm_event(event: &ResourceEvent<VirtualMachine>) -> Option<ControllerEvent> {
    match event {
        ResourceEvent::Added(vm) | ResourceEvent::Deleted(vm) => {
            Some(ControllerEvent::PlacementChanged(VmKey::from_object(vm.as_ref())))
        }
        ResourceEvent::Updated { old, new } => {
            let old = VmPlacement::from(old.as_ref());
            let new = VmPlacement::from(new.as_ref());
            new.placement_changed(&old)
                .then(|| ControllerEvent::PlacementChanged(new.key))
        }
    }
}

/// Map a node notification to queue events for every VM on that node
///
/// Added nodes are ignored; updates only matter when the overlay address
/// changed.
pub fn node_events(event: &ResourceEvent<CiliumNode>, vms: &[VmPlacement]) -> Vec<ControllerEvent> {
    let node = match event {
        ResourceEvent::Added(_) => return Vec::new(),
        ResourceEvent::Deleted(node) => NodeOverlay::from(node.as_ref()),
        ResourceEvent::Updated { old, new } => {
            let old = NodeOverlay::from(old.as_ref());
            let new = NodeOverlay::from(new.as_ref());
            if old.internal_ip == new.internal_ip {
                return Vec::new();
            }
            new
        }
    };

    vms.iter()
        .filter(|vm| vm.node_name() == Some(node.name.as_str()))
        .map(|vm| ControllerEvent::OverlayChanged(vm.key.clone()))
        .collect()
}

/// Route reconciliation controller
pub struct RouteController {
    objects: Arc<dyn ObjectCache>,
    manager: Arc<dyn RoutingManager>,
    cache: Arc<AddressCache>,
    ranges: ManagedRanges,
    queue: Arc<WorkQueue<VmKey>>,
    config: ControllerConfig,
}

impl RouteController {
    /// Create a controller
    pub fn new(
        objects: Arc<dyn ObjectCache>,
        manager: Arc<dyn RoutingManager>,
        cache: Arc<AddressCache>,
        ranges: ManagedRanges,
        config: ControllerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            objects,
            manager,
            cache,
            ranges,
            queue: WorkQueue::new(),
            config,
        })
    }

    /// Queue a key for reconciliation
    pub fn dispatch(&self, event: ControllerEvent) {
        debug!(vm = %event.key(), source = event.source(), "Enqueueing");
        self.queue.add(event.into_key());
    }

    /// Run until `cancel` fires
    ///
    /// Returns an error only for setup failures; per-key failures are
    /// retried through the queue.
    pub async fn run(self: Arc<Self>, inputs: ControllerInputs, cancel: CancellationToken) -> Result<()> {
        let ControllerInputs {
            vm_events,
            node_events,
            watchers,
        } = inputs;

        info!("Waiting for object caches to sync");
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            synced = self.objects.wait_until_synced() => synced?,
        }

        let manager = self.manager.clone();
        retry_with_backoff(&self.config.rule_sync_retry, "sync_rules", || {
            let manager = manager.clone();
            async move { manager.sync_rules().await }
        })
        .await
        .map_err(|e| Error::setup("sync_rules", e.to_string()))?;
        info!(ranges = %self.ranges, "Policy rules synced");

        let known = self.known_addresses();
        if let Err(e) = self.manager.sync_routes(&known).await {
            error!(error = %e, "Failed to remove stale routes");
        }

        // Background tasks also stop if a later startup step fails
        let scope = cancel.child_token();
        let mut tasks: Vec<JoinHandle<()>> = vec![self.spawn_blackhole(scope.clone())];

        for watcher in watchers {
            match watcher.start(scope.clone()).await {
                Ok(keys) => {
                    info!(watcher = watcher.name(), "Watcher started");
                    tasks.push(self.spawn_drift_pump(keys));
                }
                Err(e) => {
                    error!(watcher = watcher.name(), error = %e, "Failed to start watcher");
                    scope.cancel();
                    for task in tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            }
        }

        tasks.push(self.spawn_vm_pump(vm_events, scope.clone()));
        tasks.push(self.spawn_node_pump(node_events, scope.clone()));

        let vms = self.objects.list_vms();
        info!(vms = vms.len(), "Enqueueing cached VMs");
        for vm in vms {
            self.queue.add(vm.key);
        }

        let workers: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|id| self.spawn_worker(id))
            .collect();
        info!(workers = workers.len(), "Controller started");

        cancel.cancelled().await;
        info!("Shutting down controller");
        scope.cancel();
        self.queue.shutdown();
        join_all(workers).await;
        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    fn known_addresses(&self) -> HashSet<IpAddr> {
        self.objects
            .list_vms()
            .iter()
            .filter_map(|vm| vm.address()?.parse::<IpAddr>().ok())
            .filter(|ip| self.ranges.is_managed(*ip))
            .collect()
    }

    fn spawn_blackhole(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let period = self.config.blackhole_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.add_subnets_routes_to_blackhole().await {
                            error!(error = %e, "Failed to install blackhole routes");
                        }
                    }
                }
            }
        })
    }

    fn spawn_drift_pump(self: &Arc<Self>, mut keys: mpsc::Receiver<VmKey>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(key) = keys.recv().await {
                this.dispatch(ControllerEvent::DriftDetected(key));
            }
        })
    }

    fn spawn_vm_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ResourceEvent<VirtualMachine>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Some(event) = vm_event(&event) {
                    this.dispatch(event);
                }
            }
        })
    }

    fn spawn_node_pump(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ResourceEvent<CiliumNode>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let vms = this.objects.list_vms();
                for event in node_events(&event, &vms) {
                    this.dispatch(event);
                }
            }
        })
    }

    fn spawn_worker(self: &Arc<Self>, id: usize) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            debug!(worker = id, "Worker started");
            while let Some(key) = this.queue.get().await {
                this.process(key).await;
            }
            debug!(worker = id, "Worker stopped");
        })
    }

    async fn process(&self, key: VmKey) {
        let start = Instant::now();
        match self.sync(&key).await {
            Ok(SyncAction::Converged) => {
                self.queue.forget(&key);
                metrics::record_reconcile("converged", start.elapsed().as_secs_f64());
            }
            Ok(SyncAction::RequeueAfter(delay)) => {
                self.queue.forget(&key);
                self.queue.add_after(key.clone(), delay);
                metrics::record_reconcile("requeued", start.elapsed().as_secs_f64());
            }
            Err(e) if e.is_retryable() => {
                error!(vm = %key, error = %e, retries = self.queue.num_requeues(&key), "Reconciliation failed, requeueing");
                self.queue.add_rate_limited(key.clone());
                metrics::record_reconcile("error", start.elapsed().as_secs_f64());
            }
            Err(e) => {
                error!(vm = %key, error = %e, "Reconciliation failed permanently, dropping");
                self.queue.forget(&key);
                metrics::record_reconcile("error", start.elapsed().as_secs_f64());
            }
        }
        self.queue.done(&key);
    }

    /// Converge the route of one VM
    #[instrument(skip_all, fields(vm = %key))]
    pub async fn sync(&self, key: &VmKey) -> Result<SyncAction> {
        let cached = self.cache.get_addresses(key);

        let Some(vm) = self.objects.get_vm(key) else {
            debug!("VM is gone, removing route");
            self.remove(key, cached.map(|a| a.vm_ip)).await?;
            return Ok(SyncAction::Converged);
        };

        if vm.deleting {
            let vm_ip = vm
                .address()
                .and_then(|a| a.parse().ok())
                .or(cached.map(|a| a.vm_ip));
            debug!("VM is being deleted, removing route");
            self.remove(key, vm_ip).await?;
            return Ok(SyncAction::Converged);
        }

        let (Some(node_name), Some(address)) = (vm.node_name(), vm.address()) else {
            debug!(
                node = vm.node_name().unwrap_or_default(),
                address = vm.address().unwrap_or_default(),
                "VM has no node or address yet"
            );
            return Ok(SyncAction::RequeueAfter(self.config.no_node_requeue));
        };

        let vm_ip: IpAddr = match address.parse() {
            Ok(ip) => ip,
            Err(e) => {
                warn!(address, error = %e, "VM has an unparsable address");
                if let Some(old) = cached {
                    self.remove(key, Some(old.vm_ip)).await?;
                }
                return Err(Error::invalid_address(address, e));
            }
        };

        if !self.ranges.is_managed(vm_ip) {
            debug!(vm_ip = %vm_ip, "Address is not managed, ignoring");
            if let Some(old) = cached {
                self.remove(key, Some(old.vm_ip)).await?;
            }
            return Ok(SyncAction::Converged);
        }

        if let Some(old) = cached.filter(|old| old.vm_ip != vm_ip) {
            info!(old = %old.vm_ip, new = %vm_ip, "VM address changed, removing old route");
            self.remove(key, Some(old.vm_ip)).await?;
        }

        let node = self.objects.get_node(node_name);
        let addrs = self.manager.update_route(&vm, node.as_ref()).await?;
        self.cache.set(key.clone(), addrs);
        debug!(node = node_name, node_ip = %addrs.node_ip, vm_ip = %addrs.vm_ip, "Route converged");
        Ok(SyncAction::Converged)
    }

    async fn remove(&self, key: &VmKey, vm_ip: Option<IpAddr>) -> Result<()> {
        self.manager.delete_route(key, vm_ip).await?;
        self.cache.delete_by_key(key);
        Ok(())
    }
}
