//! Kernel route and rule model, parsed from iproute2 text output
//!
//! The same line grammar is printed by `ip route show`, `ip route get` and
//! `ip monitor route`:
//!
//! ```text
//! [Deleted ][TYPE ]DST [via GW] [dev DEV] [table ID] [proto P] [scope S] [src SRC] [metric N] [FLAGS...]
//! ```

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use route_forge_common::cidr::{host_net, is_host_net};
use route_forge_common::{Error, DEFAULT_TABLE_ID, LOCAL_ROUTE_TABLE_ID, MAIN_ROUTE_TABLE_ID};

/// Route type keyword
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RouteType {
    /// Regular forwarding route (no keyword printed)
    #[default]
    Unicast,
    /// Route to an address owned by this host
    Local,
    /// Silently discarding route
    Blackhole,
    /// Any other type (broadcast, unreachable, prohibit, ...)
    Other(String),
}

impl RouteType {
    fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "unicast" => Some(Self::Unicast),
            "local" => Some(Self::Local),
            "blackhole" => Some(Self::Blackhole),
            "broadcast" | "unreachable" | "prohibit" | "throw" | "nat" | "anycast"
            | "multicast" => Some(Self::Other(word.to_string())),
            _ => None,
        }
    }
}

/// One kernel route
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelRoute {
    /// Route type
    pub kind: RouteType,
    /// Destination prefix, `None` for the default route
    pub dst: Option<IpNet>,
    /// Next hop (`via`)
    pub gateway: Option<IpAddr>,
    /// Output device
    pub dev: Option<String>,
    /// Preferred source address
    pub src: Option<IpAddr>,
    /// Table id, `None` when not printed
    pub table: Option<u32>,
    /// Routing protocol
    pub protocol: Option<String>,
    /// Route scope
    pub scope: Option<String>,
}

impl KernelRoute {
    /// Destination address when the route covers exactly one address
    pub fn host_address(&self) -> Option<IpAddr> {
        self.dst.filter(is_host_net).map(|net| net.addr())
    }

    /// Whether the route lives in `table`; routes without a printed table
    /// are assumed to belong to `default_table`
    pub fn in_table(&self, table: u32, default_table: u32) -> bool {
        self.table.unwrap_or(default_table) == table
    }
}

impl fmt::Display for KernelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dst {
            Some(dst) => write!(f, "dst {}", dst)?,
            None => write!(f, "dst default")?,
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(dev) = &self.dev {
            write!(f, " dev {}", dev)?;
        }
        if let Some(src) = self.src {
            write!(f, " src {}", src)?;
        }
        if let Some(table) = self.table {
            write!(f, " table {}", table)?;
        }
        Ok(())
    }
}

/// Keywords that are followed by exactly one value
const VALUE_KEYWORDS: &[&str] = &[
    "via", "dev", "table", "proto", "scope", "src", "metric", "uid", "mtu", "expires", "realm",
    "realms", "pref", "error", "advmss", "hoplimit", "tos", "dsfield",
];

impl FromStr for KernelRoute {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let mut route = KernelRoute::default();

        let first = tokens
            .next()
            .ok_or_else(|| Error::parse("route", "empty line"))?;
        let dst_token = match RouteType::from_keyword(first) {
            Some(kind) => {
                route.kind = kind;
                tokens
                    .next()
                    .ok_or_else(|| Error::parse("route", format!("missing destination: {line:?}")))?
            }
            None => first,
        };
        route.dst = parse_destination(dst_token)?;

        while let Some(token) = tokens.next() {
            if !VALUE_KEYWORDS.contains(&token) {
                // Flags such as onlink, linkdown, or bare values we do not track
                continue;
            }
            let mut value = tokens.next();
            // `via inet6 fe80::1` carries an address family before the gateway
            if token == "via" && matches!(value, Some("inet") | Some("inet6")) {
                value = tokens.next();
            }
            let Some(value) = value else {
                return Err(Error::parse(
                    "route",
                    format!("keyword {token:?} without value: {line:?}"),
                ));
            };
            match token {
                "via" => route.gateway = Some(parse_addr(value, line)?),
                "src" => route.src = Some(parse_addr(value, line)?),
                "dev" => route.dev = Some(value.to_string()),
                "table" => route.table = Some(parse_table(value)?),
                "proto" => route.protocol = Some(value.to_string()),
                "scope" => route.scope = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(route)
    }
}

fn parse_destination(token: &str) -> Result<Option<IpNet>, Error> {
    if token == "default" {
        return Ok(None);
    }
    if token.contains('/') {
        let net = IpNet::from_str(token)
            .map_err(|e| Error::parse("route", format!("destination {token:?}: {e}")))?;
        return Ok(Some(net));
    }
    let ip = IpAddr::from_str(token)
        .map_err(|e| Error::parse("route", format!("destination {token:?}: {e}")))?;
    Ok(Some(host_net(ip)))
}

fn parse_addr(value: &str, line: &str) -> Result<IpAddr, Error> {
    IpAddr::from_str(value).map_err(|e| Error::parse("route", format!("{value:?} in {line:?}: {e}")))
}

/// Parse a table id, accepting the well-known table names
pub fn parse_table(value: &str) -> Result<u32, Error> {
    match value {
        "local" => Ok(LOCAL_ROUTE_TABLE_ID),
        "main" => Ok(MAIN_ROUTE_TABLE_ID),
        "default" => Ok(DEFAULT_TABLE_ID),
        other => other
            .parse()
            .map_err(|_| Error::parse("table", format!("invalid table {other:?}"))),
    }
}

/// Parse every route line of a multi-line listing
///
/// Continuation lines (indented, e.g. the `cache` line of `ip route get`) are
/// skipped.
pub fn parse_routes(output: &str) -> Result<Vec<KernelRoute>, Error> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with(char::is_whitespace))
        .map(KernelRoute::from_str)
        .collect()
}

/// A notification from `ip monitor route`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteChange {
    /// A route was added or replaced
    Added(KernelRoute),
    /// A route was removed
    Deleted(KernelRoute),
}

impl RouteChange {
    /// The route carried by the notification
    pub fn route(&self) -> &KernelRoute {
        match self {
            RouteChange::Added(r) | RouteChange::Deleted(r) => r,
        }
    }
}

impl FromStr for RouteChange {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        match line.strip_prefix("Deleted ") {
            Some(rest) => Ok(RouteChange::Deleted(rest.parse()?)),
            None => Ok(RouteChange::Added(line.parse()?)),
        }
    }
}

/// One policy routing rule, parsed from `ip rule list`
///
/// ```text
/// 1490:	from all to 10.66.10.0/24 lookup 1490
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingRule {
    /// Rule priority
    pub priority: u32,
    /// Destination selector (`to`), `None` when the rule matches everything
    pub dst: Option<IpNet>,
    /// Table looked up when the rule matches
    pub table: Option<u32>,
}

impl fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: from all", self.priority)?;
        if let Some(dst) = self.dst {
            write!(f, " to {}", dst)?;
        }
        if let Some(table) = self.table {
            write!(f, " lookup {}", table)?;
        }
        Ok(())
    }
}

impl FromStr for RoutingRule {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (prio, rest) = line
            .split_once(':')
            .ok_or_else(|| Error::parse("rule", format!("missing priority: {line:?}")))?;
        let priority = prio
            .trim()
            .parse()
            .map_err(|_| Error::parse("rule", format!("invalid priority: {line:?}")))?;

        let mut rule = RoutingRule {
            priority,
            dst: None,
            table: None,
        };
        let mut tokens = rest.split_whitespace();
        while let Some(token) = tokens.next() {
            match token {
                "to" => {
                    let value = tokens
                        .next()
                        .ok_or_else(|| Error::parse("rule", format!("`to` without value: {line:?}")))?;
                    if value != "all" {
                        rule.dst = parse_destination(value)?;
                    }
                }
                "lookup" | "table" => {
                    let value = tokens.next().ok_or_else(|| {
                        Error::parse("rule", format!("`lookup` without value: {line:?}"))
                    })?;
                    rule.table = Some(parse_table(value)?);
                }
                _ => {}
            }
        }
        Ok(rule)
    }
}

/// Parse every rule line of `ip rule list`
pub fn parse_rules(output: &str) -> Result<Vec<RoutingRule>, Error> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(RoutingRule::from_str)
        .collect()
}
