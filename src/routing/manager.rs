//! Route management using rtnetlink
//!
//! Every kernel reply is classified right here, so callers decide on
//! `AlreadyExists`/`NotFound` without looking at raw errno values.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures_util::TryStreamExt;
use ipnetwork::IpNetwork;
use rtnetlink::packet_route::address::{AddressAttribute, AddressFlags, AddressMessage};
use rtnetlink::packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourMessage, NeighbourState,
};
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope as NlRouteScope,
    RouteType,
};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{new_connection, Handle, IpVersion, LinkUnspec, RouteMessageBuilder};

use crate::error::NetlinkError;
use crate::routing::{
    IpFamily, LinkAddress, LinkInfo, MacAddr, NeighborEntry, PolicyRule, Route, RouteManager,
    RouteScope,
};

/// Route manager implementation using rtnetlink
///
/// The netlink socket belongs to the namespace that was current when
/// [`RtNetlinkRouteManager::new`] ran, not to the caller's.
pub struct RtNetlinkRouteManager {
    handle: Handle,
}

impl RtNetlinkRouteManager {
    /// Create a new route manager bound to the current network namespace
    pub fn new() -> Result<Self, NetlinkError> {
        let (connection, handle, _) = new_connection()?;

        // Spawn the connection handler
        tokio::spawn(connection);

        Ok(Self { handle })
    }

    async fn rule_messages(&self, family: IpFamily) -> Result<Vec<RuleMessage>, NetlinkError> {
        let version = match family {
            IpFamily::V4 => IpVersion::V4,
            IpFamily::V6 => IpVersion::V6,
        };
        let mut stream = self.handle.rule().get(version).execute();
        let mut rules = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| classify(e, "dump rules"))?
        {
            rules.push(msg);
        }
        Ok(rules)
    }
}

impl RouteManager for RtNetlinkRouteManager {
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkInfo>, NetlinkError> {
        let result = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await;
        match result {
            Ok(msg) => Ok(msg.as_ref().map(link_info)),
            Err(e) => match classify(e, format!("get link {}", name)) {
                e if e.is_gone() => Ok(None),
                e => Err(e),
            },
        }
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<LinkInfo>, NetlinkError> {
        let result = self
            .handle
            .link()
            .get()
            .match_index(index)
            .execute()
            .try_next()
            .await;
        match result {
            Ok(msg) => Ok(msg.as_ref().map(link_info)),
            Err(e) => match classify(e, format!("get link #{}", index)) {
                e if e.is_gone() => Ok(None),
                e => Err(e),
            },
        }
    }

    async fn links(&self) -> Result<Vec<LinkInfo>, NetlinkError> {
        let mut stream = self.handle.link().get().execute();
        let mut links = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| classify(e, "dump links"))?
        {
            links.push(link_info(&msg));
        }
        Ok(links)
    }

    async fn addresses(&self) -> Result<Vec<LinkAddress>, NetlinkError> {
        let mut stream = self.handle.address().get().execute();
        let mut addresses = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| classify(e, "dump addresses"))?
        {
            if let Some(addr) = link_address(&msg) {
                addresses.push(addr);
            }
        }
        Ok(addresses)
    }

    async fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        let request = self
            .handle
            .rule()
            .add()
            .table_id(rule.table)
            .action(RuleAction::ToTable);

        let result = match rule.family {
            IpFamily::V4 => {
                let mut request = request.v4();
                if let Some(IpNetwork::V4(dst)) = rule.destination {
                    request = request.destination_prefix(dst.ip(), dst.prefix());
                }
                if let Some(IpNetwork::V4(src)) = rule.source {
                    request = request.source_prefix(src.ip(), src.prefix());
                }
                request.execute().await
            }
            IpFamily::V6 => {
                let mut request = request.v6();
                if let Some(IpNetwork::V6(dst)) = rule.destination {
                    request = request.destination_prefix(dst.ip(), dst.prefix());
                }
                if let Some(IpNetwork::V6(src)) = rule.source {
                    request = request.source_prefix(src.ip(), src.prefix());
                }
                request.execute().await
            }
        };
        result.map_err(|e| classify(e, rule.to_string()))
    }

    async fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        let matching: Vec<RuleMessage> = self
            .rule_messages(rule.family)
            .await?
            .into_iter()
            .filter(|msg| policy_rule(msg).as_ref() == Some(rule))
            .collect();

        if matching.is_empty() {
            return Err(NetlinkError::NotFound(rule.to_string()));
        }
        for msg in matching {
            self.handle
                .rule()
                .del(msg)
                .execute()
                .await
                .map_err(|e| classify(e, rule.to_string()))?;
        }
        Ok(())
    }

    async fn list_rules(&self, family: IpFamily) -> Result<Vec<PolicyRule>, NetlinkError> {
        Ok(self
            .rule_messages(family)
            .await?
            .iter()
            .filter_map(policy_rule)
            .collect())
    }

    async fn add_route(&self, route: &Route) -> Result<(), NetlinkError> {
        let msg = route_message(route)?;
        self.handle
            .route()
            .add(msg)
            .execute()
            .await
            .map_err(|e| classify(e, format!("route {}", route)))
    }

    async fn del_route(&self, route: &Route) -> Result<(), NetlinkError> {
        let mut msg = route_message(route)?;
        // match whatever protocol installed it
        msg.header.protocol = RouteProtocol::Unspec;
        self.handle
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(|e| classify(e, format!("route {}", route)))
    }

    async fn list_routes(&self, family: IpFamily) -> Result<Vec<Route>, NetlinkError> {
        let filter = match family {
            IpFamily::V4 => RouteMessageBuilder::<Ipv4Addr>::new().build(),
            IpFamily::V6 => RouteMessageBuilder::<Ipv6Addr>::new().build(),
        };
        let mut stream = self.handle.route().get(filter).execute();
        let mut routes = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| classify(e, "dump routes"))?
        {
            if let Some(route) = unicast_route(&msg, family) {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    async fn add_neighbor(&self, entry: &NeighborEntry) -> Result<(), NetlinkError> {
        self.handle
            .neighbours()
            .add(entry.link_index, entry.ip)
            .link_local_address(&entry.mac.0)
            .state(NeighbourState::Permanent)
            .execute()
            .await
            .map_err(|e| classify(e, format!("neighbor {} dev #{}", entry.ip, entry.link_index)))
    }

    async fn replace_neighbor(&self, entry: &NeighborEntry) -> Result<(), NetlinkError> {
        self.handle
            .neighbours()
            .add(entry.link_index, entry.ip)
            .link_local_address(&entry.mac.0)
            .replace()
            .state(NeighbourState::Permanent)
            .execute()
            .await
            .map_err(|e| classify(e, format!("neighbor {} dev #{}", entry.ip, entry.link_index)))
    }

    async fn neighbors(&self, family: IpFamily) -> Result<Vec<NeighborEntry>, NetlinkError> {
        let mut stream = self.handle.neighbours().get().execute();
        let mut entries = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| classify(e, "dump neighbors"))?
        {
            if let Some(entry) = neighbor_entry(&msg) {
                if IpFamily::of(&entry.ip) == family {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    async fn set_link_address(&self, index: u32, mac: MacAddr) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).address(mac.0.to_vec()).build())
            .execute()
            .await
            .map_err(|e| classify(e, format!("set address of link #{}", index)))
    }
}

/// Map a kernel errno onto the outcome classes the router distinguishes
fn classify(err: rtnetlink::Error, what: impl Into<String>) -> NetlinkError {
    let what = what.into();
    if let rtnetlink::Error::NetlinkError(ref msg) = err {
        if let Some(code) = msg.code {
            match -code.get() {
                libc::EEXIST => return NetlinkError::AlreadyExists(what),
                libc::ENOENT | libc::ESRCH => return NetlinkError::NotFound(what),
                libc::ENODEV => return NetlinkError::NoDevice(what),
                _ => {}
            }
        }
    }
    NetlinkError::Request {
        what,
        reason: err.to_string(),
    }
}

fn route_message(route: &Route) -> Result<RouteMessage, NetlinkError> {
    let invalid = |reason: String| NetlinkError::Request {
        what: format!("route {}", route),
        reason,
    };

    let mut builder = RouteMessageBuilder::<IpAddr>::new()
        .table_id(route.table)
        .output_interface(route.link_index)
        .scope(match route.scope {
            RouteScope::Universe => NlRouteScope::Universe,
            RouteScope::Link => NlRouteScope::Link,
            RouteScope::Host => NlRouteScope::Host,
        })
        .destination_prefix(route.destination.ip(), route.destination.prefix())
        .map_err(|e| invalid(format!("{:?}", e)))?;
    if let Some(gateway) = route.gateway {
        builder = builder
            .gateway(gateway)
            .map_err(|e| invalid(format!("{:?}", e)))?;
    }
    Ok(builder.build())
}

fn link_info(msg: &LinkMessage) -> LinkInfo {
    let mut info = LinkInfo {
        index: msg.header.index,
        name: format!("if{}", msg.header.index),
        mac: None,
        parent_index: None,
    };
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => info.name = name.clone(),
            LinkAttribute::Address(addr) => info.mac = MacAddr::from_bytes(addr),
            LinkAttribute::Link(index) => info.parent_index = Some(*index),
            _ => {}
        }
    }
    info
}

fn link_address(msg: &AddressMessage) -> Option<LinkAddress> {
    if !matches!(msg.header.family, AddressFamily::Inet | AddressFamily::Inet6) {
        return None;
    }
    // IFA_ADDRESS is the peer on point-to-point links, IFA_LOCAL our own
    let mut local = None;
    let mut address = None;
    let mut dad_failed = false;
    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Local(addr) => local = Some(*addr),
            AddressAttribute::Address(addr) => address = Some(*addr),
            AddressAttribute::Flags(flags) => dad_failed = flags.contains(AddressFlags::Dadfailed),
            _ => {}
        }
    }
    let ip = local.or(address)?;
    let network = IpNetwork::new(ip, msg.header.prefix_len).ok()?;
    Some(LinkAddress {
        link_index: msg.header.index,
        network,
        dad_failed,
    })
}

fn policy_rule(msg: &RuleMessage) -> Option<PolicyRule> {
    if msg.header.action != RuleAction::ToTable {
        return None;
    }
    let family = match msg.header.family {
        AddressFamily::Inet => IpFamily::V4,
        AddressFamily::Inet6 => IpFamily::V6,
        _ => return None,
    };

    let mut table = u32::from(msg.header.table);
    let mut destination = None;
    let mut source = None;
    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Table(id) => table = *id,
            RuleAttribute::Destination(ip) => {
                destination = IpNetwork::new(*ip, msg.header.dst_len).ok()
            }
            RuleAttribute::Source(ip) => source = IpNetwork::new(*ip, msg.header.src_len).ok(),
            _ => {}
        }
    }
    Some(PolicyRule {
        table,
        family,
        destination,
        source,
    })
}

fn route_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn unicast_route(msg: &RouteMessage, family: IpFamily) -> Option<Route> {
    let expected = match family {
        IpFamily::V4 => AddressFamily::Inet,
        IpFamily::V6 => AddressFamily::Inet6,
    };
    if msg.header.kind != RouteType::Unicast || msg.header.address_family != expected {
        return None;
    }

    let mut table = u32::from(msg.header.table);
    let mut destination = None;
    let mut gateway = None;
    let mut link_index = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Table(id) => table = *id,
            RouteAttribute::Destination(addr) => destination = route_address(addr),
            RouteAttribute::Gateway(addr) => gateway = route_address(addr),
            RouteAttribute::Oif(index) => link_index = Some(*index),
            _ => {}
        }
    }

    let destination = IpNetwork::new(
        destination.unwrap_or_else(|| family.unspecified()),
        msg.header.destination_prefix_length,
    )
    .ok()?;
    if IpFamily::of(&destination.ip()) != family {
        return None;
    }

    Some(Route {
        table,
        destination,
        // multipath routes carry no single output interface
        link_index: link_index?,
        scope: match msg.header.scope {
            NlRouteScope::Link => RouteScope::Link,
            NlRouteScope::Host => RouteScope::Host,
            _ => RouteScope::Universe,
        },
        gateway,
        kernel_owned: msg.header.protocol == RouteProtocol::Kernel,
    })
}

fn neighbor_entry(msg: &NeighbourMessage) -> Option<NeighborEntry> {
    let mut ip = None;
    let mut mac = None;
    for attr in &msg.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(v4)) => {
                ip = Some(IpAddr::V4(*v4))
            }
            NeighbourAttribute::Destination(NeighbourAddress::Inet6(v6)) => {
                ip = Some(IpAddr::V6(*v6))
            }
            NeighbourAttribute::LinkLocalAddress(addr) => mac = MacAddr::from_bytes(addr),
            _ => {}
        }
    }
    Some(NeighborEntry {
        ip: ip?,
        mac: mac?,
        link_index: msg.header.ifindex,
        permanent: msg.header.state == NeighbourState::Permanent,
    })
}
