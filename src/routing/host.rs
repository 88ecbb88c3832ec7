//! Host-side return path to the pod
//!
//! When the host shares a subnet with the pod's chained interface, the host
//! would answer the pod over that (underlay) subnet and bypass the overlay.
//! A destination rule into the host table plus a link route through the
//! overlay's parent link sends those replies back over the veth instead.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{info, warn};

use crate::error::RouterError;
use crate::network::OverlayLink;
use crate::routing::rules::{ensure_route, ensure_rule, remove_route, remove_rule};
use crate::routing::{host_network, IpFamily, PolicyRule, Route, RouteManager};

pub struct HostRouteInstaller {
    table: u32,
}

impl HostRouteInstaller {
    pub fn new(table: u32) -> Self {
        Self { table }
    }

    /// Install a rule and a route for every chained address whose subnet
    /// holds a host address
    pub async fn install<H: RouteManager>(
        &self,
        host: &H,
        overlay: &OverlayLink,
        chained: &[IpNetwork],
        host_addrs: &[IpAddr],
    ) -> Result<usize, RouterError> {
        let mut installed = 0;
        for net in chained {
            let shared = host_addrs
                .iter()
                .find(|ip| IpFamily::of(ip) == IpFamily::of(&net.ip()) && net.contains(**ip));
            let Some(host_ip) = shared else {
                continue;
            };

            let ip = net.ip();
            ensure_rule(host, &PolicyRule::to_destination(self.table, host_network(ip))).await?;
            ensure_route(host, &Route::to_host(self.table, ip, overlay.parent_index)).await?;
            info!(
                "Host reaches {} through #{} in table {} (shares subnet with {})",
                ip, overlay.parent_index, self.table, host_ip
            );
            installed += 1;
        }
        Ok(installed)
    }

    /// Remove the rule and routes of each address; missing entries are
    /// fine. Every address is attempted, the last failure is returned.
    pub async fn remove<H: RouteManager>(
        &self,
        host: &H,
        addrs: &[IpAddr],
    ) -> Result<(), RouterError> {
        let mut result = Ok(());

        for ip in addrs {
            let dst = host_network(*ip);
            if let Err(e) = remove_rule(host, &PolicyRule::to_destination(self.table, dst)).await {
                warn!("Failed to remove host rule for {}: {}", ip, e);
                result = Err(e);
            }

            let routes = match host.list_routes(IpFamily::of(ip)).await {
                Ok(routes) => routes,
                Err(e) => {
                    warn!("Failed to list host routes: {}", e);
                    result = Err(e.into());
                    continue;
                }
            };
            for route in routes
                .iter()
                .filter(|r| r.table == self.table && r.destination == dst)
            {
                if let Err(e) = remove_route(host, route).await {
                    warn!("Failed to remove host route {}: {}", route, e);
                    result = Err(e);
                }
            }
        }
        result
    }
}
