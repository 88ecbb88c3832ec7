//! Routing table management module
//!
//! Policy rules, routes and neighbor entries as the router installs them,
//! and the [`RouteManager`] seam every kernel mutation goes through.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

use crate::error::NetlinkError;

pub mod hijack;
pub mod host;
pub mod manager;
pub mod migrate;
pub mod pod;
pub mod rules;
pub mod table;

pub use table::TableAllocator;

/// Kernel main routing table
pub const RT_TABLE_MAIN: u32 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Prefix length of a single-address match
    pub fn host_prefix(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Exact single-address prefix, /32 or /128
pub fn host_network(addr: IpAddr) -> IpNetwork {
    match IpNetwork::new(addr, IpFamily::of(&addr).host_prefix()) {
        Ok(net) => net,
        Err(_) => unreachable!("full-length prefix is always valid"),
    }
}

/// Policy routing rule `[from <source>] [to <destination>] lookup <table>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub table: u32,
    pub family: IpFamily,
    pub destination: Option<IpNetwork>,
    pub source: Option<IpNetwork>,
}

impl PolicyRule {
    pub fn to_destination(table: u32, destination: IpNetwork) -> Self {
        Self {
            table,
            family: IpFamily::of(&destination.ip()),
            destination: Some(destination),
            source: None,
        }
    }

    pub fn from_source(table: u32, source: IpNetwork) -> Self {
        Self {
            table,
            family: IpFamily::of(&source.ip()),
            destination: None,
            source: Some(source),
        }
    }
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rule", self.family)?;
        if let Some(src) = self.source {
            write!(f, " from {}", src)?;
        }
        if let Some(dst) = self.destination {
            write!(f, " to {}", dst)?;
        }
        write!(f, " lookup {}", self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    Universe,
    Link,
    Host,
}

/// Unicast route in a given table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub table: u32,
    pub destination: IpNetwork,
    pub link_index: u32,
    pub scope: RouteScope,
    pub gateway: Option<IpAddr>,
    /// Installed by the kernel for a configured address (proto kernel)
    pub kernel_owned: bool,
}

impl Route {
    /// Link-scope route to a single address
    pub fn to_host(table: u32, addr: IpAddr, link_index: u32) -> Self {
        Self {
            table,
            destination: host_network(addr),
            link_index,
            scope: RouteScope::Link,
            gateway: None,
            kernel_owned: false,
        }
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.destination.ip())
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix() == 0
    }

    /// Same route placed into another table
    pub fn in_table(&self, table: u32) -> Self {
        Self {
            table,
            kernel_owned: false,
            ..self.clone()
        }
    }

    /// Whether `other` forwards the same way, ignoring table bookkeeping
    pub fn same_path(&self, other: &Route) -> bool {
        self.table == other.table
            && self.destination == other.destination
            && self.link_index == other.link_index
            && self.gateway == other.gateway
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev #{} table {}", self.link_index, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(MacAddr)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Neighbor table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: IpAddr,
    pub mac: MacAddr,
    pub link_index: u32,
    pub permanent: bool,
}

impl NeighborEntry {
    pub fn permanent(ip: IpAddr, mac: MacAddr, link_index: u32) -> Self {
        Self {
            ip,
            mac,
            link_index,
            permanent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mac: Option<MacAddr>,
    /// IFLA_LINK: peer index for veth, lower device for macvlan
    pub parent_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAddress {
    pub link_index: u32,
    pub network: IpNetwork,
    /// IPv6 duplicate address detection found another owner
    pub dad_failed: bool,
}

/// Kernel routing state of one network namespace
pub trait RouteManager {
    fn link_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<LinkInfo>, NetlinkError>> + Send;
    fn link_by_index(
        &self,
        index: u32,
    ) -> impl Future<Output = Result<Option<LinkInfo>, NetlinkError>> + Send;
    fn links(&self) -> impl Future<Output = Result<Vec<LinkInfo>, NetlinkError>> + Send;
    fn addresses(&self) -> impl Future<Output = Result<Vec<LinkAddress>, NetlinkError>> + Send;

    fn add_rule(&self, rule: &PolicyRule)
        -> impl Future<Output = Result<(), NetlinkError>> + Send;
    fn del_rule(&self, rule: &PolicyRule)
        -> impl Future<Output = Result<(), NetlinkError>> + Send;
    fn list_rules(
        &self,
        family: IpFamily,
    ) -> impl Future<Output = Result<Vec<PolicyRule>, NetlinkError>> + Send;

    fn add_route(&self, route: &Route) -> impl Future<Output = Result<(), NetlinkError>> + Send;
    fn del_route(&self, route: &Route) -> impl Future<Output = Result<(), NetlinkError>> + Send;
    fn list_routes(
        &self,
        family: IpFamily,
    ) -> impl Future<Output = Result<Vec<Route>, NetlinkError>> + Send;

    fn add_neighbor(
        &self,
        entry: &NeighborEntry,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;
    fn replace_neighbor(
        &self,
        entry: &NeighborEntry,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;
    fn neighbors(
        &self,
        family: IpFamily,
    ) -> impl Future<Output = Result<Vec<NeighborEntry>, NetlinkError>> + Send;

    fn set_link_address(
        &self,
        index: u32,
        mac: MacAddr,
    ) -> impl Future<Output = Result<(), NetlinkError>> + Send;
}
