//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use route_forge_common::{Error, ManagedRanges, DEFAULT_ROUTE_TABLE_ID};
use route_forge_controller::watcher::DEFAULT_SCAN_INTERVAL;
use route_forge_controller::{ControllerConfig, WatcherKind};

/// vm-route-forge - keeps this node's routing tables in line with VM placement
#[derive(Parser, Debug, Clone)]
#[command(name = "vm-route-forge", version, about, long_about = None)]
pub struct Cli {
    /// Managed VM address ranges (repeatable or comma separated)
    #[arg(long = "cidr", env = "VM_ROUTE_FORGE_CIDRS", value_delimiter = ',', required = true)]
    pub cidrs: Vec<String>,

    /// Routing table that holds VM host routes
    #[arg(long, env = "VM_ROUTE_FORGE_ROUTE_TABLE_ID", default_value_t = DEFAULT_ROUTE_TABLE_ID)]
    pub route_table_id: u32,

    /// Interval between full route table scans
    #[arg(long, env = "VM_ROUTE_FORGE_SCAN_INTERVAL_MS", default_value_t = DEFAULT_SCAN_INTERVAL.as_millis() as u64)]
    pub scan_interval_ms: u64,

    /// Event-driven drift watcher backend
    #[arg(long, env = "VM_ROUTE_FORGE_WATCHER", value_enum, default_value_t = WatcherKind::Netlink)]
    pub watcher: WatcherKind,

    /// Delay before re-checking a VM that has no node or address yet
    #[arg(long, env = "VM_ROUTE_FORGE_NO_NODE_REQUEUE_SECS", default_value_t = 60)]
    pub no_node_requeue_secs: u64,

    /// Number of reconciliation workers
    #[arg(long, env = "VM_ROUTE_FORGE_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Log route and rule changes instead of applying them
    #[arg(long, env = "VM_ROUTE_FORGE_DRY_RUN")]
    pub dry_run: bool,

    /// Path to the iproute2 `ip` binary
    #[arg(long, env = "VM_ROUTE_FORGE_IP_BINARY", default_value = "ip")]
    pub ip_binary: PathBuf,
}

impl Cli {
    /// Parse and validate the managed ranges
    ///
    /// Route listing and monitoring are IPv4 only, so IPv6 ranges are
    /// rejected.
    pub fn ranges(&self) -> route_forge_common::Result<ManagedRanges> {
        let cidrs: Vec<&str> = self
            .cidrs
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        let ranges = ManagedRanges::parse(&cidrs)?;
        if let Some(net) = ranges.iter().find(|net| !net.addr().is_ipv4()) {
            return Err(Error::invalid_cidr(net.to_string(), "only IPv4 ranges are supported"));
        }
        Ok(ranges)
    }

    /// Interval of the periodic scanner
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(1))
    }

    /// Controller tuning derived from the flags
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers.max(1),
            no_node_requeue: Duration::from_secs(self.no_node_requeue_secs),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("vm-route-forge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let cli = parse(&["--cidr", "10.66.0.0/16"]);
        assert_eq!(cli.route_table_id, 1490);
        assert_eq!(cli.scan_interval(), Duration::from_millis(500));
        assert_eq!(cli.watcher, WatcherKind::Netlink);
        assert_eq!(cli.controller_config().no_node_requeue, Duration::from_secs(60));
        assert_eq!(cli.controller_config().workers, 2);
        assert!(!cli.dry_run);
        assert_eq!(cli.ip_binary, PathBuf::from("ip"));
    }

    #[test]
    fn cidrs_accept_lists_and_repeats() {
        let cli = parse(&["--cidr", "10.66.0.0/16,10.20.0.0/24", "--cidr", "10.30.0.0/24"]);
        let ranges = cli.ranges().unwrap();
        assert_eq!(ranges.len(), 3);
        assert!(ranges.is_managed("10.20.0.5".parse().unwrap()));
        assert!(!ranges.is_managed("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        let cli = parse(&["--cidr", "10.66.0.0/99"]);
        assert!(cli.ranges().is_err());
    }

    #[test]
    fn ipv6_ranges_are_rejected() {
        let cli = parse(&["--cidr", "10.66.0.0/16,fd00:66::/64"]);
        let err = cli.ranges().unwrap_err();
        assert!(matches!(err, Error::InvalidCidr { ref value, .. } if value == "fd00:66::/64"));
    }

    #[test]
    fn cidr_is_required() {
        assert!(Cli::try_parse_from(["vm-route-forge"]).is_err());
    }

    #[test]
    fn watcher_backend_is_selectable() {
        let cli = parse(&["--cidr", "10.66.0.0/16", "--watcher", "kprobe", "--dry-run"]);
        assert_eq!(cli.watcher, WatcherKind::Kprobe);
        assert!(cli.dry_run);
    }
}
