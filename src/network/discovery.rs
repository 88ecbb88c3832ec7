//! Pod and host network discovery
//!
//! Nothing here is cached: every invocation reads addresses, links and routes
//! fresh from the kernel.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{debug, info};

use crate::error::RouterError;
use crate::network::{FamilySet, InterfaceSnapshot};
use crate::routing::{IpFamily, LinkInfo, MacAddr, RouteManager, RT_TABLE_MAIN};

/// Overlay interface in the pod and its peer link in the host namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLink {
    pub name: String,
    pub index: u32,
    pub mac: MacAddr,
    pub parent_index: u32,
    pub parent_mac: MacAddr,
}

/// Reads interface addresses out of one namespace
pub struct AddressInspector<'a, R> {
    routes: &'a R,
}

impl<'a, R: RouteManager> AddressInspector<'a, R> {
    pub fn new(routes: &'a R) -> Self {
        Self { routes }
    }

    /// Addresses of `interface`, restricted to the families in `hints`
    ///
    /// A family only counts as active when the hint is set and the
    /// namespace holds a global address of that family on any link.
    pub async fn inspect(
        &self,
        interface: &str,
        hints: FamilySet,
    ) -> Result<InterfaceSnapshot, RouterError> {
        let link = self.find_link(interface).await?;
        let all = self.routes.addresses().await?;

        let addresses: Vec<IpNetwork> = all
            .iter()
            .filter(|a| a.link_index == link.index)
            .map(|a| a.network)
            .filter(|net| hints.contains(IpFamily::of(&net.ip())))
            .filter(|net| !is_ipv6_link_local(&net.ip()))
            .collect();

        let global = FamilySet::from_addresses(
            all.iter()
                .map(|a| &a.network)
                .filter(|net| is_usable(&net.ip())),
        );

        let snapshot = InterfaceSnapshot {
            name: interface.to_string(),
            addresses,
            ipv4_active: hints.ipv4 && global.ipv4,
            ipv6_active: hints.ipv6 && global.ipv6,
        };
        debug!(
            "Interface {} has addresses {:?} (ipv4: {}, ipv6: {})",
            interface, snapshot.addresses, snapshot.ipv4_active, snapshot.ipv6_active
        );
        Ok(snapshot)
    }

    /// Routable addresses of every link, for the families in `families`
    pub async fn usable_addresses(&self, families: FamilySet) -> Result<Vec<IpAddr>, RouterError> {
        let mut addrs: Vec<IpAddr> = Vec::new();
        for addr in self.routes.addresses().await? {
            let ip = addr.network.ip();
            if is_usable(&ip) && families.contains(IpFamily::of(&ip)) && !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
        Ok(addrs)
    }

    /// Name of the interface holding the main-table default route
    ///
    /// IPv4 is consulted before IPv6. Routes through `chained` never count,
    /// and `fallback` is returned when no other default route exists.
    pub async fn default_route_interface(
        &self,
        chained: &str,
        fallback: &str,
        families: FamilySet,
    ) -> Result<String, RouterError> {
        let chained_index = self.routes.link_by_name(chained).await?.map(|l| l.index);

        for family in families.iter() {
            let candidate = self
                .routes
                .list_routes(family)
                .await?
                .into_iter()
                .find(|r| {
                    r.table == RT_TABLE_MAIN && r.is_default() && Some(r.link_index) != chained_index
                });

            if let Some(route) = candidate {
                if let Some(link) = self.routes.link_by_index(route.link_index).await? {
                    debug!("Default {} route goes through {}", family, link.name);
                    return Ok(link.name);
                }
            }
        }

        debug!("No default route outside {}, using {}", chained, fallback);
        Ok(fallback.to_string())
    }

    async fn find_link(&self, interface: &str) -> Result<LinkInfo, RouterError> {
        self.routes
            .link_by_name(interface)
            .await?
            .ok_or_else(|| RouterError::InterfaceNotFound {
                interface: interface.to_string(),
            })
    }
}

/// Resolve the overlay interface in the pod and its parent link on the host
pub async fn resolve_overlay_link<P, H>(
    pod: &P,
    host: &H,
    interface: &str,
) -> Result<OverlayLink, RouterError>
where
    P: RouteManager,
    H: RouteManager,
{
    let link = pod
        .link_by_name(interface)
        .await?
        .ok_or_else(|| RouterError::InterfaceNotFound {
            interface: interface.to_string(),
        })?;

    let parent_missing = || RouterError::ParentLinkNotFound {
        interface: interface.to_string(),
    };

    let parent_index = match link.parent_index {
        Some(index) if index != 0 => index,
        _ => return Err(parent_missing()),
    };
    let parent = host
        .link_by_index(parent_index)
        .await?
        .ok_or_else(parent_missing)?;

    let mac = link.mac.ok_or_else(|| RouterError::InterfaceNotFound {
        interface: interface.to_string(),
    })?;
    let parent_mac = parent.mac.ok_or_else(parent_missing)?;

    info!(
        "Overlay {} (#{}, {}) pairs with host link {} (#{}, {})",
        link.name, link.index, mac, parent.name, parent.index, parent_mac
    );
    Ok(OverlayLink {
        name: link.name,
        index: link.index,
        mac,
        parent_index: parent.index,
        parent_mac,
    })
}

/// Global unicast address usable for routing
pub fn is_usable(ip: &IpAddr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local(),
        IpAddr::V6(_) => !is_ipv6_link_local(ip),
    }
}

fn is_ipv6_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
        IpAddr::V4(_) => false,
    }
}
