//! Managed address ranges
//!
//! The engine only ever touches routes whose destination falls inside one of
//! the configured CIDR blocks. Everything else on the host belongs to someone
//! else and is left alone.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::Error;

/// Ordered set of CIDR blocks this engine is responsible for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedRanges {
    cidrs: Vec<IpNet>,
}

impl ManagedRanges {
    /// Create from already-parsed networks
    ///
    /// Host bits are truncated so `10.0.0.1/16` and `10.0.0.0/16` compare equal.
    pub fn new(cidrs: impl IntoIterator<Item = IpNet>) -> Self {
        let mut out: Vec<IpNet> = Vec::new();
        for cidr in cidrs.into_iter().map(|c| c.trunc()) {
            if !out.contains(&cidr) {
                out.push(cidr);
            }
        }
        Self { cidrs: out }
    }

    /// Parse a list of CIDR strings
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self, Error> {
        let cidrs = values
            .iter()
            .map(|v| parse_cidr(v.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(cidrs))
    }

    /// Whether `ip` falls inside at least one managed range
    pub fn is_managed(&self, ip: IpAddr) -> bool {
        self.cidrs.iter().any(|cidr| cidr.contains(&ip))
    }

    /// Whether `net` is exactly one of the managed ranges
    pub fn contains_range(&self, net: &IpNet) -> bool {
        self.cidrs.contains(&net.trunc())
    }

    /// Iterate over the managed ranges in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.cidrs.iter()
    }

    /// Number of configured ranges
    pub fn len(&self) -> usize {
        self.cidrs.len()
    }

    /// True when no range is configured
    pub fn is_empty(&self) -> bool {
        self.cidrs.is_empty()
    }
}

impl fmt::Display for ManagedRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.cidrs.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", joined.join(","))
    }
}

/// Parse an IP address, trimming surrounding whitespace
pub fn parse_ip(value: &str) -> Result<IpAddr, Error> {
    IpAddr::from_str(value.trim()).map_err(|e| Error::invalid_address(value, e))
}

/// Parse a CIDR block; a bare address is accepted as a host prefix
pub fn parse_cidr(value: &str) -> Result<IpNet, Error> {
    let value = value.trim();
    if value.contains('/') {
        IpNet::from_str(value).map_err(|e| Error::invalid_cidr(value, e))
    } else {
        let ip = IpAddr::from_str(value).map_err(|e| Error::invalid_cidr(value, e))?;
        Ok(host_net(ip))
    }
}

/// Host prefix (`/32` or `/128`) for a single address
pub fn host_net(ip: IpAddr) -> IpNet {
    IpNet::from(ip)
}

/// Whether `net` covers exactly one address
pub fn is_host_net(net: &IpNet) -> bool {
    net.prefix_len() == net.max_prefix_len()
}
