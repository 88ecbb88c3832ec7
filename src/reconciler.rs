//! Attach and detach pipelines
//!
//! ADD walks a fixed sequence of steps, each consuming what the previous
//! ones discovered:
//!
//! ```text
//! Validated -> ConflictChecked -> MacHandled -> Discovered -> Allocated
//!   -> NeighborsSet -> HostRoutesSet -> PodRoutesSet -> DefaultDiscovered
//!   -> Hijacked -> Migrated -> RPFilterSet -> Done
//! ```
//!
//! `Skipped` and the MAC-only return are the only other terminals. Any
//! failure aborts the invocation; the runtime follows up with DEL.

use std::net::IpAddr;
use std::path::Path;
use std::time::Instant;

use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use crate::config::netconf::PrevResult;
use crate::config::RoutingConfig;
use crate::error::{ConfigError, NamespaceError, RouterError};
use crate::network::discovery::resolve_overlay_link;
use crate::network::{
    conflict, mac, neighbor, sysctl, AddressInspector, FamilySet, Namespace, NamespaceOpener,
};
use crate::routing::hijack::hijack;
use crate::routing::host::HostRouteInstaller;
use crate::routing::migrate::RouteMigrator;
use crate::routing::pod::install_host_routes;
use crate::routing::{MacAddr, RouteManager, TableAllocator};

/// Progress of an ADD invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Validated,
    Skipped,
    ConflictChecked,
    MacHandled,
    Discovered,
    Allocated,
    NeighborsSet,
    HostRoutesSet,
    PodRoutesSet,
    DefaultDiscovered,
    Hijacked,
    Migrated,
    RPFilterSet,
    Done,
}

/// Progress of a DEL invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachState {
    Opened,
    NotFound,
    AddressesDiscovered,
    RulesDeleted,
    Done,
}

/// How an ADD ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Skipped,
    MacOnly { mac: MacAddr },
    Completed { interface: String, table: u32 },
}

/// One ADD request
#[derive(Debug, Clone, Copy)]
pub struct AttachRequest<'a> {
    pub netns: &'a Path,
    /// `CNI_IFNAME`, target of the conflict probe and MAC rewrite
    pub ifname: &'a str,
    pub prev_result: Option<&'a PrevResult>,
}

pub struct RouterReconciler<'a, O> {
    config: &'a RoutingConfig,
    opener: &'a O,
}

impl<'a, O: NamespaceOpener> RouterReconciler<'a, O> {
    pub fn new(config: &'a RoutingConfig, opener: &'a O) -> Self {
        Self { config, opener }
    }

    pub async fn attach(&self, request: AttachRequest<'_>) -> Result<AttachOutcome, RouterError> {
        let started = Instant::now();
        let mut state = AttachState::Validated;

        if self.config.skip_call {
            advance(&mut state, AttachState::Skipped);
            info!("skip_call is set, passing the previous result through");
            return Ok(AttachOutcome::Skipped);
        }

        let prev = request.prev_result.ok_or(RouterError::MissingPrevResult)?;
        let chained = prev
            .interfaces
            .first()
            .map(|i| i.name.as_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "prevResult.interfaces[0].name".to_string(),
            })?;

        let pod = self.opener.open(request.netns)?;
        let pod_routes = pod.route_manager()?;

        let prev_ips: Vec<IpAddr> = prev.ips.iter().map(|ip| ip.address.ip()).collect();
        if let Some(probe) = self.config.ip_conflict {
            let link = pod_routes
                .link_by_name(request.ifname)
                .await?
                .ok_or_else(|| RouterError::InterfaceNotFound {
                    interface: request.ifname.to_string(),
                })?;
            let prober = pod.prober(&link)?;
            conflict::check_ip_conflict(&pod_routes, &prober, &prev_ips, probe).await?;
        }
        advance(&mut state, AttachState::ConflictChecked);

        if let Some(prefix) = self.config.mac_prefix {
            let mac = mac::rewrite_mac(&pod_routes, request.ifname, prefix).await?;
            if self.config.only_op_mac {
                info!("Only the mac address of {} was requested, done", request.ifname);
                return Ok(AttachOutcome::MacOnly { mac });
            }
        }
        advance(&mut state, AttachState::MacHandled);

        let hints = FamilySet::from_addresses(prev.ips.iter().map(|ip| &ip.address));
        let pod_inspector = AddressInspector::new(&pod_routes);
        let snapshot = pod_inspector.inspect(chained, hints).await?;
        let families = snapshot.families();
        let chained_addrs: Vec<IpNetwork> = snapshot.active_addresses().copied().collect();
        advance(&mut state, AttachState::Discovered);

        let allocator = TableAllocator::new(self.config.pod_table_base, &self.config.overlay_interface);
        let table = allocator.table_for(chained)?;
        info!("Interface {} routes through table {}", snapshot.name, table);
        advance(&mut state, AttachState::Allocated);

        let host = self.opener.host()?;
        let host_routes = host.route_manager()?;
        let host_addrs = AddressInspector::new(&host_routes)
            .usable_addresses(families)
            .await?;

        let overlay = if self.config.sriov {
            debug!("Primary attachment is sriov, no overlay pairing to route through");
            None
        } else {
            Some(resolve_overlay_link(&pod_routes, &host_routes, &self.config.overlay_interface).await?)
        };

        if let Some(ref overlay) = overlay {
            neighbor::provision(&pod_routes, &host_routes, overlay, &chained_addrs, &host_addrs)
                .await?;
        }
        if families.ipv6 {
            sysctl::enable_ipv6(&pod)?;
        }
        advance(&mut state, AttachState::NeighborsSet);

        if let Some(ref overlay) = overlay {
            HostRouteInstaller::new(self.config.host_rule_table)
                .install(&host_routes, overlay, &chained_addrs, &host_addrs)
                .await?;
        }
        advance(&mut state, AttachState::HostRoutesSet);

        if let Some(ref overlay) = overlay {
            install_host_routes(&pod_routes, table, overlay.index, &host_addrs).await?;
        }
        advance(&mut state, AttachState::PodRoutesSet);

        let default_iface = pod_inspector
            .default_route_interface(chained, &self.config.overlay_interface, families)
            .await?;
        let default_addrs: Vec<IpNetwork> = pod_inspector
            .inspect(&default_iface, families)
            .await?
            .active_addresses()
            .copied()
            .collect();
        advance(&mut state, AttachState::DefaultDiscovered);

        hijack(&pod_routes, table, &default_addrs, self.config.hijack_subnets(), families).await?;
        advance(&mut state, AttachState::Hijacked);

        RouteMigrator::new(self.config.migrate_route, table)
            .migrate(&pod_routes, &default_iface, chained, &default_addrs, families)
            .await?;
        advance(&mut state, AttachState::Migrated);

        let links = pod_routes.links().await?;
        sysctl::apply_rp_filter(&pod, &links, self.config.rp_filter)?;
        advance(&mut state, AttachState::RPFilterSet);

        advance(&mut state, AttachState::Done);
        info!(
            "Set up {} alongside {} in {:?} in {}us",
            chained,
            self.config.overlay_interface,
            pod.path(),
            started.elapsed().as_micros()
        );
        Ok(AttachOutcome::Completed {
            interface: chained.to_string(),
            table,
        })
    }

    /// Remove the host rules and routes of `ifname`'s addresses
    ///
    /// A namespace that is already gone counts as clean.
    pub async fn detach(&self, netns: Option<&Path>, ifname: &str) -> Result<(), RouterError> {
        let Some(netns) = netns else {
            info!("No network namespace given, nothing to clean up");
            return Ok(());
        };

        let pod = match self.opener.open(netns) {
            Ok(pod) => pod,
            Err(NamespaceError::NotFound { path }) => {
                debug!("detach -> {:?}", DetachState::NotFound);
                info!("Network namespace {:?} is gone, nothing to clean up", path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut state = DetachState::Opened;

        let addrs: Vec<IpAddr> = match self.pod_addresses(&pod, ifname).await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Failed to get addresses of {} in {:?}: {}", ifname, pod.path(), e);
                Vec::new()
            }
        };
        if addrs.is_empty() {
            warn!("No addresses found on {}, no host rules to remove", ifname);
        }
        advance_detach(&mut state, DetachState::AddressesDiscovered);

        let host = self.opener.host()?;
        let host_routes = host.route_manager()?;
        HostRouteInstaller::new(self.config.host_rule_table)
            .remove(&host_routes, &addrs)
            .await?;
        advance_detach(&mut state, DetachState::RulesDeleted);

        advance_detach(&mut state, DetachState::Done);
        info!("Removed host rules for {:?}", addrs);
        Ok(())
    }

    async fn pod_addresses(&self, pod: &O::Ns, ifname: &str) -> Result<Vec<IpAddr>, RouterError> {
        let routes = pod.route_manager()?;
        let snapshot = AddressInspector::new(&routes)
            .inspect(ifname, FamilySet::ALL)
            .await?;
        Ok(snapshot.addresses.iter().map(|net| net.ip()).collect())
    }
}

fn advance(state: &mut AttachState, next: AttachState) {
    debug!("attach {:?} -> {:?}", state, next);
    *state = next;
}

fn advance_detach(state: &mut DetachState, next: DetachState) {
    debug!("detach {:?} -> {:?}", state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::netconf::{ResultInterface, ResultIp};
    use crate::config::{IpConflict, MigrateRoute};
    use crate::routing::{IpFamily, PolicyRule, Route, RouteScope, RT_TABLE_MAIN};
    use crate::testing::{FakeNamespace, FakeOpener};
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::time::Duration;

    const NETNS: &str = "/var/run/netns/cni-test";
    const NET1_TABLE: u32 = 11491;

    /// Pod with eth0 (overlay, peer #7 on the host) and net1 (chained), host
    /// with an address in net1's subnet
    fn cluster() -> FakeOpener {
        let host = FakeNamespace::new("/proc/self/ns/net");
        host.kernel.add_link(1, "lo", None, None);
        host.kernel.add_link(2, "ens3", Some([0x52, 0x54, 0, 0, 0, 2]), None);
        host.kernel.add_link(7, "veth1234", Some([0xee, 0, 0, 0, 0, 7]), Some(3));
        host.kernel.add_address(1, "127.0.0.1/8");
        host.kernel.add_address(2, "10.0.0.2/24");

        let pod = FakeNamespace::new(NETNS);
        pod.kernel.add_link(1, "lo", None, None);
        pod.kernel.add_link(3, "eth0", Some([0x0a, 0, 0, 0, 0, 3]), Some(7));
        pod.kernel.add_link(4, "net1", Some([0x02, 0, 0, 0, 0, 4]), Some(2));
        pod.kernel.add_address(1, "127.0.0.1/8");
        pod.kernel.add_address(3, "10.244.1.7/24");
        pod.kernel.add_address(4, "10.0.0.5/24");
        pod.kernel.preload_route(Route {
            table: RT_TABLE_MAIN,
            destination: "0.0.0.0/0".parse().unwrap(),
            link_index: 3,
            scope: RouteScope::Universe,
            gateway: Some("10.244.1.1".parse().unwrap()),
            kernel_owned: false,
        });

        FakeOpener::new(host, vec![pod])
    }

    fn prev_result() -> PrevResult {
        PrevResult {
            interfaces: vec![ResultInterface {
                name: "net1".to_string(),
                mac: String::new(),
                sandbox: NETNS.to_string(),
            }],
            ips: vec![ResultIp {
                address: "10.0.0.5/24".parse().unwrap(),
                gateway: None,
                interface: Some(0),
            }],
        }
    }

    fn request(prev: &PrevResult) -> AttachRequest<'_> {
        AttachRequest {
            netns: Path::new(NETNS),
            ifname: "net1",
            prev_result: Some(prev),
        }
    }

    fn config() -> RoutingConfig {
        RoutingConfig {
            service_hijack_subnet: vec!["10.96.0.0/12".parse().unwrap(), "fd00:96::/108".parse().unwrap()],
            ..RoutingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_attach_installs_host_and_pod_routes() {
        let opener = cluster();
        let config = config();
        let prev = prev_result();

        let outcome = RouterReconciler::new(&config, &opener)
            .attach(request(&prev))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AttachOutcome::Completed {
                interface: "net1".to_string(),
                table: NET1_TABLE,
            }
        );

        let host = &opener.host.kernel;
        assert_eq!(
            host.rules(),
            vec![PolicyRule::to_destination(500, "10.0.0.5/32".parse().unwrap())]
        );
        assert_eq!(
            host.routes_in(500),
            vec![Route::to_host(500, "10.0.0.5".parse().unwrap(), 7)]
        );

        let pod = &opener.pods[0].kernel;
        let pod_table = pod.routes_in(NET1_TABLE);
        assert!(pod_table.contains(&Route::to_host(NET1_TABLE, "10.0.0.2".parse().unwrap(), 3)));
        // default route migrated out of main
        assert!(pod_table.iter().any(|r| r.is_default() && r.link_index == 3));
        assert!(!pod.routes_in(RT_TABLE_MAIN).iter().any(|r| r.is_default()));
    }

    #[tokio::test]
    async fn test_attach_hijacks_active_family_only() {
        let opener = cluster();
        let config = config();
        let prev = prev_result();

        RouterReconciler::new(&config, &opener)
            .attach(request(&prev))
            .await
            .unwrap();

        let rules = opener.pods[0].kernel.rules();
        let to_service: Vec<_> = rules.iter().filter(|r| r.destination.is_some()).collect();
        assert_eq!(to_service.len(), 1);
        assert_eq!(to_service[0].to_string(), "ipv4 rule to 10.96.0.0/12 lookup 11491");
        assert!(rules.iter().all(|r| r.family == IpFamily::V4));
        assert!(rules.contains(&PolicyRule::from_source(
            NET1_TABLE,
            "10.244.1.7/32".parse().unwrap()
        )));

        // no IPv6 state anywhere
        let pod = &opener.pods[0].kernel;
        assert!(pod.routes().iter().all(|r| r.family() == IpFamily::V4));
        assert!(pod.neighbor_entries().iter().all(|n| n.ip.is_ipv4()));
        assert!(pod.sysctl("net/ipv6/conf/all/forwarding").is_none());
    }

    /// cluster() plus IPv6 on the host, the overlay and the chained interface
    fn dual_stack_cluster() -> FakeOpener {
        let opener = cluster();
        opener.host.kernel.add_address(2, "fd00::2/64");
        let pod = &opener.pods[0].kernel;
        pod.add_address(3, "fd00:244::7/64");
        pod.add_address(4, "fd00::5/64");
        pod.preload_route(Route {
            table: RT_TABLE_MAIN,
            destination: "::/0".parse().unwrap(),
            link_index: 3,
            scope: RouteScope::Universe,
            gateway: Some("fe80::1".parse().unwrap()),
            kernel_owned: false,
        });
        opener
    }

    fn dual_stack_prev_result() -> PrevResult {
        let mut prev = prev_result();
        prev.ips.push(ResultIp {
            address: "fd00::5/64".parse().unwrap(),
            gateway: None,
            interface: Some(0),
        });
        prev
    }

    #[tokio::test]
    async fn test_attach_dual_stack() {
        let opener = dual_stack_cluster();
        let config = config();
        let prev = dual_stack_prev_result();

        RouterReconciler::new(&config, &opener)
            .attach(request(&prev))
            .await
            .unwrap();

        let host = &opener.host.kernel;
        let host_rules = host.rules();
        assert!(host_rules.contains(&PolicyRule::to_destination(500, "10.0.0.5/32".parse().unwrap())));
        let v6_rule = PolicyRule::to_destination(500, "fd00::5/128".parse().unwrap());
        assert!(host_rules.contains(&v6_rule));
        assert_eq!(v6_rule.to_string(), "ipv6 rule to fd00::5/128 lookup 500");
        assert!(host
            .routes_in(500)
            .contains(&Route::to_host(500, "fd00::5".parse().unwrap(), 7)));
        assert!(host
            .neighbor_entries()
            .iter()
            .any(|n| n.ip == "fd00::5".parse::<IpAddr>().unwrap() && n.link_index == 7 && n.permanent));

        let pod = &opener.pods[0].kernel;
        assert!(pod
            .neighbor_entries()
            .iter()
            .any(|n| n.ip == "fd00::2".parse::<IpAddr>().unwrap() && n.link_index == 3));
        let pod_table = pod.routes_in(NET1_TABLE);
        assert!(pod_table.contains(&Route::to_host(NET1_TABLE, "fd00::2".parse().unwrap(), 3)));
        let v6_default = pod_table
            .iter()
            .find(|r| r.is_default() && r.family() == IpFamily::V6)
            .unwrap();
        assert_eq!(v6_default.to_string(), "::/0 via fe80::1 dev #3 table 11491");
        assert!(!pod.routes_in(RT_TABLE_MAIN).iter().any(|r| r.is_default()));

        let pod_rules = pod.rules();
        assert!(pod_rules.contains(&PolicyRule::to_destination(
            NET1_TABLE,
            "fd00:96::/108".parse().unwrap()
        )));
        assert!(pod_rules.contains(&PolicyRule::from_source(
            NET1_TABLE,
            "fd00:244::7/128".parse().unwrap()
        )));
        assert_eq!(pod.sysctl("net/ipv6/conf/all/forwarding").as_deref(), Some("1"));
        assert_eq!(pod.sysctl("net/ipv6/conf/all/disable_ipv6").as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_attach_stops_on_claimed_address() {
        let opener = cluster();
        opener.pods[0].kernel.claim("10.0.0.5", [0x52, 0x54, 0, 0, 0, 9]);
        let config = RoutingConfig {
            ip_conflict: Some(IpConflict {
                interval: Duration::from_millis(1),
                retries: 2,
            }),
            ..config()
        };
        let prev = prev_result();

        let result = RouterReconciler::new(&config, &opener)
            .attach(request(&prev))
            .await;
        assert!(matches!(result, Err(RouterError::IpConflict { .. })));
        assert_eq!(opener.pods[0].kernel.probes(), vec![(4u32, "10.0.0.5".parse::<Ipv4Addr>().unwrap())]);
        assert_eq!(opener.pods[0].kernel.mutations(), 0);
        assert_eq!(opener.host.kernel.mutations(), 0);
    }

    #[tokio::test]
    async fn test_attach_twice_changes_nothing() {
        let opener = cluster();
        let config = config();
        let prev = prev_result();
        let reconciler = RouterReconciler::new(&config, &opener);

        reconciler.attach(request(&prev)).await.unwrap();
        let rules = opener.pods[0].kernel.rules();
        let routes = opener.pods[0].kernel.routes();
        let host_rules = opener.host.kernel.rules();

        reconciler.attach(request(&prev)).await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(opener.pods[0].kernel.rules(), rules);
        assert_eq!(opener.pods[0].kernel.routes(), routes);
        assert_eq!(opener.host.kernel.rules(), host_rules);
    }

    #[tokio::test]
    async fn test_skip_call_touches_nothing() {
        let opener = cluster();
        let config = RoutingConfig {
            skip_call: true,
            ..config()
        };

        let outcome = RouterReconciler::new(&config, &opener)
            .attach(AttachRequest {
                netns: Path::new(NETNS),
                ifname: "net1",
                prev_result: None,
            })
            .await
            .unwrap();
        assert_eq!(outcome, AttachOutcome::Skipped);
        assert_eq!(opener.host.kernel.mutations(), 0);
        assert_eq!(opener.pods[0].kernel.mutations(), 0);
    }

    #[tokio::test]
    async fn test_mac_only() {
        let opener = cluster();
        let config = RoutingConfig {
            mac_prefix: Some([0x0a, 0x1b]),
            only_op_mac: true,
            ..config()
        };
        let prev = prev_result();

        let outcome = RouterReconciler::new(&config, &opener)
            .attach(request(&prev))
            .await
            .unwrap();
        let expected = MacAddr([0x0a, 0x1b, 10, 0, 0, 5]);
        assert_eq!(outcome, AttachOutcome::MacOnly { mac: expected });

        let pod = &opener.pods[0].kernel;
        assert_eq!(pod.link(4).unwrap().mac, Some(expected));
        assert_eq!(pod.mutations(), 1);
        assert!(pod.rules().is_empty());
        assert_eq!(opener.host.kernel.mutations(), 0);
    }

    #[tokio::test]
    async fn test_missing_prev_result() {
        let opener = cluster();
        let config = config();
        let result = RouterReconciler::new(&config, &opener)
            .attach(AttachRequest {
                netns: Path::new(NETNS),
                ifname: "net1",
                prev_result: None,
            })
            .await;
        assert!(matches!(result, Err(RouterError::MissingPrevResult)));

        let empty = PrevResult {
            interfaces: Vec::new(),
            ips: Vec::new(),
        };
        let result = RouterReconciler::new(&config, &opener)
            .attach(request(&empty))
            .await;
        assert!(matches!(result, Err(RouterError::ConfigInvalid(_))));
    }

    #[tokio::test]
    async fn test_sriov_skips_overlay_pairing() {
        let opener = cluster();
        let config = RoutingConfig {
            sriov: true,
            migrate_route: MigrateRoute {
                enable: false,
                ..MigrateRoute::default()
            },
            ..config()
        };
        let prev = prev_result();

        RouterReconciler::new(&config, &opener)
            .attach(request(&prev))
            .await
            .unwrap();
        assert_eq!(opener.host.kernel.mutations(), 0);
        assert!(opener.pods[0].kernel.neighbor_entries().is_empty());
        assert!(opener.pods[0].kernel.routes_in(NET1_TABLE).is_empty());
        // hijack rules are still installed
        assert!(!opener.pods[0].kernel.rules().is_empty());
    }

    #[tokio::test]
    async fn test_attach_fails_without_parent_link() {
        let opener = cluster();
        let pod = FakeNamespace::new("/var/run/netns/orphan");
        pod.kernel.add_link(3, "eth0", Some([0x0a, 0, 0, 0, 0, 3]), None);
        pod.kernel.add_link(4, "net1", None, None);
        pod.kernel.add_address(4, "10.0.0.5/24");
        let opener = FakeOpener::new(opener.host.clone(), vec![pod]);
        let config = config();
        let prev = prev_result();

        let result = RouterReconciler::new(&config, &opener)
            .attach(AttachRequest {
                netns: Path::new("/var/run/netns/orphan"),
                ifname: "net1",
                prev_result: Some(&prev),
            })
            .await;
        assert!(matches!(result, Err(RouterError::ParentLinkNotFound { .. })));
    }

    #[tokio::test]
    async fn test_detach_removes_host_rules() {
        let opener = cluster();
        let config = config();
        let prev = prev_result();
        let reconciler = RouterReconciler::new(&config, &opener);
        reconciler.attach(request(&prev)).await.unwrap();

        reconciler
            .detach(Some(Path::new(NETNS)), "net1")
            .await
            .unwrap();
        assert!(opener.host.kernel.rules().is_empty());
        assert!(opener.host.kernel.routes_in(500).is_empty());

        reconciler
            .detach(Some(Path::new(NETNS)), "net1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_detach_missing_namespace_is_success() {
        let opener = cluster();
        let config = config();
        let reconciler = RouterReconciler::new(&config, &opener);

        let gone = PathBuf::from("/var/run/netns/already-gone");
        reconciler.detach(Some(&gone), "net1").await.unwrap();
        reconciler.detach(None, "net1").await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_missing_interface_is_warning() {
        let opener = cluster();
        let config = config();
        RouterReconciler::new(&config, &opener)
            .detach(Some(Path::new(NETNS)), "net9")
            .await
            .unwrap();
        assert_eq!(opener.host.kernel.mutations(), 0);
    }
}
