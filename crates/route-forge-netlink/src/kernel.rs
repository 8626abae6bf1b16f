//! Read and write access to the kernel routing tables through `ip`

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use route_forge_common::{Error, Result, MAIN_ROUTE_TABLE_ID};

use crate::command::{args, IpRunner};
use crate::route::{parse_routes, parse_rules, KernelRoute, RouteChange, RouteType, RoutingRule};

/// Route notifications buffered between the monitor and the watcher
const CHANGE_BUFFER: usize = 1024;

/// Read-only view of the kernel routing tables
#[async_trait]
pub trait RouteReader: Send + Sync {
    /// All routes of one table
    async fn list_routes(&self, table: u32) -> Result<Vec<KernelRoute>>;

    /// The route the kernel would use to reach `ip`
    async fn route_get(&self, ip: IpAddr) -> Result<KernelRoute>;
}

/// Live stream of kernel route changes
#[async_trait]
pub trait RouteMonitor: Send + Sync {
    /// Subscribe to route add/remove notifications
    ///
    /// The stream ends when `cancel` fires or the subscription breaks.
    async fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<RouteChange>>;
}

/// Kernel access backed by an [`IpRunner`]
#[derive(Clone)]
pub struct Kernel {
    runner: Arc<dyn IpRunner>,
}

impl Kernel {
    /// Create a kernel handle over `runner`
    pub fn new(runner: Arc<dyn IpRunner>) -> Self {
        Self { runner }
    }

    /// Create or overwrite a route (`ip route replace`)
    pub async fn replace_route(&self, route: &KernelRoute) -> Result<()> {
        self.runner.run(&route_args("replace", route)?).await?;
        Ok(())
    }

    /// Delete the route to `dst` in `table`
    pub async fn delete_route(&self, dst: IpNet, table: u32) -> Result<()> {
        let route = KernelRoute {
            dst: Some(dst),
            table: Some(table),
            ..Default::default()
        };
        self.runner.run(&route_args("del", &route)?).await?;
        Ok(())
    }

    /// Policy rules that look up `table`
    pub async fn list_rules(&self, table: u32) -> Result<Vec<RoutingRule>> {
        let output = self
            .runner
            .run(&args(["-4", "rule", "list", "table", &table.to_string()]))
            .await?;
        Ok(parse_rules(&output)?
            .into_iter()
            .filter(|r| r.table == Some(table))
            .collect())
    }

    /// Install a policy rule
    pub async fn add_rule(&self, rule: &RoutingRule) -> Result<()> {
        self.runner.run(&rule_args("add", rule)?).await?;
        Ok(())
    }

    /// Remove a policy rule
    pub async fn delete_rule(&self, rule: &RoutingRule) -> Result<()> {
        self.runner.run(&rule_args("del", rule)?).await?;
        Ok(())
    }
}

#[async_trait]
impl RouteReader for Kernel {
    async fn list_routes(&self, table: u32) -> Result<Vec<KernelRoute>> {
        let output = self
            .runner
            .run(&args(["-4", "route", "show", "table", &table.to_string()]))
            .await?;
        let mut routes = parse_routes(&output)?;
        // The table is implied by the filter and usually not printed
        for route in &mut routes {
            route.table.get_or_insert(table);
        }
        Ok(routes)
    }

    async fn route_get(&self, ip: IpAddr) -> Result<KernelRoute> {
        let output = self
            .runner
            .run(&args(["route".to_string(), "get".to_string(), ip.to_string()]))
            .await?;
        parse_routes(&output)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::parse("route get", format!("no route to {}", ip)))
    }
}

#[async_trait]
impl RouteMonitor for Kernel {
    async fn subscribe(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<RouteChange>> {
        let mut lines = self
            .runner
            .stream(&args(["-4", "monitor", "route"]), cancel.clone())
            .await?;

        let (tx, rx) = mpsc::channel(CHANGE_BUFFER);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if line.trim().is_empty() {
                    continue;
                }
                let mut change: RouteChange = match line.parse() {
                    Ok(change) => change,
                    Err(e) => {
                        debug!(line = %line, error = %e, "Skipping unparsable monitor line");
                        continue;
                    }
                };
                // Monitor lines omit the table for routes in main
                match &mut change {
                    RouteChange::Added(r) | RouteChange::Deleted(r) => {
                        r.table.get_or_insert(MAIN_ROUTE_TABLE_ID);
                    }
                }
                if tx.send(change).await.is_err() {
                    break;
                }
            }
            if !cancel.is_cancelled() {
                warn!("Route monitor stream closed");
            }
        });

        Ok(rx)
    }
}

fn family_flag(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "-4",
        IpNet::V6(_) => "-6",
    }
}

fn route_args(verb: &str, route: &KernelRoute) -> Result<Vec<String>> {
    let dst = route
        .dst
        .ok_or_else(|| Error::internal_with_context("kernel", "route without destination"))?;

    let mut out = args([family_flag(&dst), "route", verb]);
    match &route.kind {
        RouteType::Unicast => {}
        RouteType::Local => out.push("local".into()),
        RouteType::Blackhole => out.push("blackhole".into()),
        RouteType::Other(kind) => out.push(kind.clone()),
    }
    out.push(dst.to_string());
    if let Some(gw) = route.gateway {
        out.extend(["via".to_string(), gw.to_string()]);
    }
    if let Some(dev) = &route.dev {
        out.extend(["dev".to_string(), dev.clone()]);
    }
    if let Some(src) = route.src {
        out.extend(["src".to_string(), src.to_string()]);
    }
    if let Some(table) = route.table {
        out.extend(["table".to_string(), table.to_string()]);
    }
    Ok(out)
}

fn rule_args(verb: &str, rule: &RoutingRule) -> Result<Vec<String>> {
    let dst = rule
        .dst
        .ok_or_else(|| Error::internal_with_context("kernel", "rule without destination"))?;
    let table = rule
        .table
        .ok_or_else(|| Error::internal_with_context("kernel", "rule without table"))?;

    Ok(args([
        family_flag(&dst).to_string(),
        "rule".to_string(),
        verb.to_string(),
        "to".to_string(),
        dst.to_string(),
        "lookup".to_string(),
        table.to_string(),
        "priority".to_string(),
        rule.priority.to_string(),
    ]))
}
