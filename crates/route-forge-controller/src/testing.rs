//! In-memory kernel and object cache for tests

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use route_forge_common::cidr::{host_net, parse_ip};
use route_forge_common::{Addresses, Error, NodeOverlay, Result, VmKey, VmPlacement};
use route_forge_netlink::{KernelRoute, RouteChange, RouteMonitor, RouteReader, RoutingManager};

use crate::objects::ObjectCache;

pub const TABLE: u32 = 1490;

/// Routing table, scripted notifications and a call log
#[derive(Default)]
pub struct FakeKernel {
    pub routes: Mutex<Vec<KernelRoute>>,
    pub sources: Mutex<HashMap<IpAddr, IpAddr>>,
    pub changes: Mutex<Option<mpsc::Receiver<RouteChange>>>,
    pub route_gets: Mutex<u32>,
    pub calls: Mutex<Vec<String>>,
    pub fail_rules: Mutex<bool>,
    /// Returned by the next `update_route` calls, last first
    pub update_errors: Mutex<Vec<Error>>,
}

impl FakeKernel {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn mutations(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with("update ") || c.starts_with("delete "))
            .count()
    }

    pub fn route_to(&self, vm_ip: &str) -> Option<KernelRoute> {
        let ip: IpAddr = vm_ip.parse().ok()?;
        self.routes
            .lock()
            .iter()
            .find(|r| r.host_address() == Some(ip))
            .cloned()
    }

    /// Simulate someone else removing a route
    pub fn remove_externally(&self, vm_ip: &str) {
        let ip: IpAddr = vm_ip.parse().unwrap();
        self.routes.lock().retain(|r| r.host_address() != Some(ip));
    }
}

#[async_trait]
impl RouteReader for FakeKernel {
    async fn list_routes(&self, table: u32) -> Result<Vec<KernelRoute>> {
        Ok(self
            .routes
            .lock()
            .iter()
            .filter(|r| r.table == Some(table))
            .cloned()
            .collect())
    }

    async fn route_get(&self, ip: IpAddr) -> Result<KernelRoute> {
        *self.route_gets.lock() += 1;
        Ok(KernelRoute {
            dst: Some(host_net(ip)),
            src: self.sources.lock().get(&ip).copied(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl RouteMonitor for FakeKernel {
    async fn subscribe(&self, _cancel: CancellationToken) -> Result<mpsc::Receiver<RouteChange>> {
        self.changes
            .lock()
            .take()
            .ok_or_else(|| Error::command("ip -4 monitor route", "failed to spawn"))
    }
}

#[async_trait]
impl RoutingManager for FakeKernel {
    async fn update_route(&self, vm: &VmPlacement, node: Option<&NodeOverlay>) -> Result<Addresses> {
        if let Some(e) = self.update_errors.lock().pop() {
            self.calls.lock().push(format!("update-failed {}", vm.key));
            return Err(e);
        }
        let vm_ip = parse_ip(vm.address().unwrap_or_default())?;
        let node = node.ok_or_else(|| Error::missing_node_address(vm.node_name().unwrap_or_default()))?;
        let node_ip = node
            .internal_ip
            .ok_or_else(|| Error::missing_node_address(&node.name))?;
        self.calls.lock().push(format!("update {} {} {}", vm.key, vm_ip, node_ip));

        let src = self.sources.lock().get(&node_ip).copied();
        let mut routes = self.routes.lock();
        routes.retain(|r| r.host_address() != Some(vm_ip));
        routes.push(KernelRoute {
            dst: Some(host_net(vm_ip)),
            gateway: Some(node_ip),
            src,
            table: Some(TABLE),
            ..Default::default()
        });
        Ok(Addresses { node_ip, vm_ip })
    }

    async fn delete_route(&self, key: &VmKey, vm_ip: Option<IpAddr>) -> Result<()> {
        let Some(vm_ip) = vm_ip else {
            self.calls.lock().push(format!("delete {} none", key));
            return Ok(());
        };
        self.calls.lock().push(format!("delete {} {}", key, vm_ip));
        self.routes.lock().retain(|r| r.host_address() != Some(vm_ip));
        Ok(())
    }

    async fn sync_rules(&self) -> Result<()> {
        self.calls.lock().push("sync_rules".to_string());
        if *self.fail_rules.lock() {
            return Err(Error::command("ip rule add", "Operation not permitted"));
        }
        Ok(())
    }

    async fn sync_routes(&self, known: &HashSet<IpAddr>) -> Result<()> {
        self.calls.lock().push("sync_routes".to_string());
        self.routes
            .lock()
            .retain(|r| r.host_address().map_or(true, |ip| known.contains(&ip)));
        Ok(())
    }

    async fn add_subnets_routes_to_blackhole(&self) -> Result<()> {
        self.calls.lock().push("blackhole".to_string());
        Ok(())
    }
}

/// Mutable stand-in for the reflector stores
#[derive(Default)]
pub struct FakeObjects {
    pub vms: Mutex<HashMap<VmKey, VmPlacement>>,
    pub nodes: Mutex<HashMap<String, NodeOverlay>>,
}

impl FakeObjects {
    pub fn put_vm(&self, ns: &str, name: &str, ip: Option<&str>, node: Option<&str>) -> VmKey {
        let key = VmKey::new(ns, name);
        self.vms.lock().insert(
            key.clone(),
            VmPlacement {
                key: key.clone(),
                ip_address: ip.map(String::from),
                node: node.map(String::from),
                deleting: false,
            },
        );
        key
    }

    pub fn put_node(&self, name: &str, ip: Option<&str>) {
        self.nodes.lock().insert(
            name.to_string(),
            NodeOverlay {
                name: name.to_string(),
                internal_ip: ip.map(|ip| ip.parse().unwrap()),
            },
        );
    }
}

#[async_trait]
impl ObjectCache for FakeObjects {
    fn get_vm(&self, key: &VmKey) -> Option<VmPlacement> {
        self.vms.lock().get(key).cloned()
    }

    fn get_node(&self, name: &str) -> Option<NodeOverlay> {
        self.nodes.lock().get(name).cloned()
    }

    fn list_vms(&self) -> Vec<VmPlacement> {
        self.vms.lock().values().cloned().collect()
    }

    async fn wait_until_synced(&self) -> Result<()> {
        Ok(())
    }
}

pub fn host_route(dst: &str, src: &str, table: u32) -> KernelRoute {
    KernelRoute {
        dst: Some(format!("{dst}/32").parse().unwrap()),
        src: Some(src.parse().unwrap()),
        table: Some(table),
        ..Default::default()
    }
}
