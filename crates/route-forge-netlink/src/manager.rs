//! Routing manager: the only component that mutates kernel routes
//!
//! All operations are idempotent. `update_route` uses `ip route replace`,
//! deletes treat a missing route as success, and rule sync converges the
//! rule set toward the configured ranges.

use std::collections::HashSet;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{error, info, warn};

use route_forge_common::cidr::{host_net, parse_ip};
use route_forge_common::{
    Addresses, Error, ManagedRanges, NodeOverlay, Result, VmKey, VmPlacement, CILIUM_HOST_IFACE,
    LOCAL_ROUTE_TABLE_ID,
};

use crate::command::{is_already_exists, is_not_found};
use crate::kernel::{Kernel, RouteReader};
use crate::route::{KernelRoute, RouteType, RoutingRule};

/// Kernel route programming contract used by the controller
#[async_trait]
pub trait RoutingManager: Send + Sync {
    /// Upsert the host route for `vm` toward `node`'s overlay address
    ///
    /// Returns the addresses the route was programmed with.
    async fn update_route(&self, vm: &VmPlacement, node: Option<&NodeOverlay>)
        -> Result<Addresses>;

    /// Remove the host route for `key`
    ///
    /// `None` means the address is unknown; a warning is logged and the call
    /// succeeds.
    async fn delete_route(&self, key: &VmKey, vm_ip: Option<IpAddr>) -> Result<()>;

    /// Ensure one policy rule per managed range points at the managed table
    async fn sync_rules(&self) -> Result<()>;

    /// Remove host routes whose destination is not a known VM address
    async fn sync_routes(&self, known: &HashSet<IpAddr>) -> Result<()>;

    /// Install a blackhole route for every managed range
    async fn add_subnets_routes_to_blackhole(&self) -> Result<()>;
}

/// [`RoutingManager`] backed by the iproute2 tool
pub struct NetlinkManager {
    kernel: Kernel,
    ranges: ManagedRanges,
    table: u32,
}

impl NetlinkManager {
    /// Create a manager programming `table` for `ranges`
    pub fn new(kernel: Kernel, ranges: ManagedRanges, table: u32) -> Self {
        Self {
            kernel,
            ranges,
            table,
        }
    }

    /// Build the VM route from the kernel's route toward the node
    fn vm_route(&self, template: KernelRoute, node_ip: IpAddr, vm_ip: IpAddr) -> KernelRoute {
        let local = template.in_table(LOCAL_ROUTE_TABLE_ID, 0) || template.kind == RouteType::Local;
        let (dev, gateway) = if local {
            (Some(CILIUM_HOST_IFACE.to_string()), None)
        } else {
            // Directly connected nodes have no gateway in the template
            (template.dev, template.gateway.or(Some(node_ip)))
        };

        KernelRoute {
            kind: RouteType::Unicast,
            dst: Some(host_net(vm_ip)),
            gateway,
            dev,
            src: template.src,
            table: Some(self.table),
            protocol: None,
            scope: None,
        }
    }
}

#[async_trait]
impl RoutingManager for NetlinkManager {
    async fn update_route(
        &self,
        vm: &VmPlacement,
        node: Option<&NodeOverlay>,
    ) -> Result<Addresses> {
        let address = vm
            .address()
            .ok_or_else(|| Error::invalid_address("", format!("{} has no address", vm.key)))?;
        let vm_ip = parse_ip(address)?;

        let node_name = vm.node_name().unwrap_or_default();
        let node = node.ok_or_else(|| Error::missing_node_address(node_name))?;
        let node_ip = node
            .internal_ip
            .ok_or_else(|| Error::missing_node_address(&node.name))?;

        let template = self.kernel.route_get(node_ip).await?;
        let route = self.vm_route(template, node_ip, vm_ip);
        self.kernel.replace_route(&route).await?;

        info!(vm = %vm.key, node = %node.name, route = %route, "Route updated");
        Ok(Addresses { node_ip, vm_ip })
    }

    async fn delete_route(&self, key: &VmKey, vm_ip: Option<IpAddr>) -> Result<()> {
        let Some(vm_ip) = vm_ip else {
            warn!(vm = %key, "No address known for VM, route may be stale");
            return Ok(());
        };

        match self.kernel.delete_route(host_net(vm_ip), self.table).await {
            Ok(()) => {
                info!(vm = %key, vm_ip = %vm_ip, table = self.table, "Route deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                info!(vm = %key, vm_ip = %vm_ip, "Route already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_rules(&self) -> Result<()> {
        let existing = self.kernel.list_rules(self.table).await?;

        for cidr in self.ranges.iter() {
            let rule = RoutingRule {
                priority: self.table,
                dst: Some(*cidr),
                table: Some(self.table),
            };
            if existing.contains(&rule) {
                continue;
            }
            match self.kernel.add_rule(&rule).await {
                Ok(()) => info!(rule = %rule, "Rule added"),
                Err(e) if is_already_exists(&e) => {}
                Err(e) => return Err(e),
            }
        }

        for rule in existing {
            let Some(dst) = rule.dst else { continue };
            if self.ranges.contains_range(&dst) {
                continue;
            }
            match self.kernel.delete_rule(&rule).await {
                Ok(()) => info!(rule = %rule, "Stale rule deleted"),
                Err(e) => error!(rule = %rule, error = %e, "Failed to delete stale rule"),
            }
        }

        Ok(())
    }

    async fn sync_routes(&self, known: &HashSet<IpAddr>) -> Result<()> {
        let routes = self.kernel.list_routes(self.table).await?;

        for route in routes {
            let Some(dst) = route.dst else { continue };
            if route.kind == RouteType::Blackhole {
                continue;
            }
            if route.host_address().is_some_and(|ip| known.contains(&ip)) {
                continue;
            }
            match self.kernel.delete_route(dst, self.table).await {
                Ok(()) => info!(route = %route, "Stale route removed"),
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn add_subnets_routes_to_blackhole(&self) -> Result<()> {
        for cidr in self.ranges.iter() {
            let route = KernelRoute {
                kind: RouteType::Blackhole,
                dst: Some(*cidr),
                table: Some(self.table),
                ..Default::default()
            };
            self.kernel.replace_route(&route).await?;
        }
        info!(ranges = %self.ranges, table = self.table, "Blackhole routes ensured");
        Ok(())
    }
}
