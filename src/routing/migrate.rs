//! Moving default-interface routes out of main into the pod table

use ipnetwork::IpNetwork;
use tracing::{debug, info};

use crate::config::MigrateRoute;
use crate::error::RouterError;
use crate::network::FamilySet;
use crate::routing::rules::{ensure_route, remove_route};
use crate::routing::{IpFamily, Route, RouteManager, RouteScope, RT_TABLE_MAIN};

pub struct RouteMigrator {
    options: MigrateRoute,
    table: u32,
}

impl RouteMigrator {
    pub fn new(options: MigrateRoute, table: u32) -> Self {
        Self { options, table }
    }

    /// Copy the selected main-table routes of `default_iface` into the pod
    /// table, then delete them from main
    pub async fn migrate<P: RouteManager>(
        &self,
        pod: &P,
        default_iface: &str,
        chained: &str,
        default_addrs: &[IpNetwork],
        families: FamilySet,
    ) -> Result<usize, RouterError> {
        if !self.options.enable {
            debug!("Route migration disabled");
            return Ok(0);
        }
        if default_iface == chained {
            debug!("Default route already on {}, nothing to migrate", chained);
            return Ok(0);
        }

        let link = pod
            .link_by_name(default_iface)
            .await?
            .ok_or_else(|| RouterError::InterfaceNotFound {
                interface: default_iface.to_string(),
            })?;

        let mut moved = 0;
        for family in families.iter() {
            if !default_addrs.iter().any(|n| IpFamily::of(&n.ip()) == family) {
                debug!("{} has no {} address, skipping", default_iface, family);
                continue;
            }

            let selected: Vec<Route> = pod
                .list_routes(family)
                .await?
                .into_iter()
                .filter(|r| r.table == RT_TABLE_MAIN && r.link_index == link.index)
                .filter(|r| self.selects(r))
                .collect();

            for route in selected {
                ensure_route(pod, &route.in_table(self.table)).await?;
                remove_route(pod, &route).await?;
                info!("Migrated route {} to table {}", route, self.table);
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn selects(&self, route: &Route) -> bool {
        if route.is_default() {
            self.options.default_route
        } else if route.gateway.is_some() {
            self.options.gateway_routes
        } else {
            // IPv6 routes are always reported with universe scope
            let on_link = route.scope == RouteScope::Link || route.family() == IpFamily::V6;
            self.options.link_routes && on_link && !route.kernel_owned
        }
    }
}
