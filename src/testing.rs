//! In-memory kernel used by unit tests

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ipnetwork::IpNetwork;

use crate::error::{NamespaceError, NetlinkError, RouterError};
use crate::network::{AddressProber, Namespace, NamespaceOpener};
use crate::routing::{
    IpFamily, LinkAddress, LinkInfo, MacAddr, NeighborEntry, PolicyRule, Route, RouteManager,
};

#[derive(Default)]
struct KernelState {
    links: Vec<LinkInfo>,
    addresses: Vec<LinkAddress>,
    rules: Vec<PolicyRule>,
    routes: Vec<Route>,
    neighbors: Vec<NeighborEntry>,
    sysctls: Vec<(String, String)>,
    claims: Vec<(IpAddr, MacAddr)>,
    probes: Vec<(u32, Ipv4Addr)>,
    mutations: usize,
    fail_next: Option<String>,
}

impl KernelState {
    fn take_failure(&mut self, op: &str) -> Result<(), NetlinkError> {
        if self.fail_next.as_deref() == Some(op) {
            self.fail_next = None;
            return Err(NetlinkError::Request {
                what: op.to_string(),
                reason: "operation not permitted".to_string(),
            });
        }
        Ok(())
    }
}

/// Routing state of one fake namespace; clones share state
#[derive(Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<KernelState>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap()
    }

    pub fn add_link(&self, index: u32, name: &str, mac: Option<[u8; 6]>, parent: Option<u32>) {
        self.lock().links.push(LinkInfo {
            index,
            name: name.to_string(),
            mac: mac.map(MacAddr),
            parent_index: parent,
        });
    }

    pub fn add_address(&self, link_index: u32, cidr: &str) {
        let network: IpNetwork = cidr.parse().unwrap();
        self.lock().addresses.push(LinkAddress {
            link_index,
            network,
            dad_failed: false,
        });
    }

    /// Flag an address as failed duplicate address detection
    pub fn fail_dad(&self, ip: &str) {
        let ip: IpAddr = ip.parse().unwrap();
        for addr in self.lock().addresses.iter_mut().filter(|a| a.network.ip() == ip) {
            addr.dad_failed = true;
        }
    }

    /// Another station on the segment answers ARP for `ip` with `mac`
    pub fn claim(&self, ip: &str, mac: [u8; 6]) {
        self.lock().claims.push((ip.parse().unwrap(), MacAddr(mac)));
    }

    /// ARP probes sent so far, as (link index, address)
    pub fn probes(&self) -> Vec<(u32, Ipv4Addr)> {
        self.lock().probes.clone()
    }

    /// Preload a route without counting it as a mutation
    pub fn preload_route(&self, route: Route) {
        self.lock().routes.push(route);
    }

    pub fn preload_neighbor(&self, entry: NeighborEntry) {
        self.lock().neighbors.push(entry);
    }

    /// Make the next mutation of kind `op` ("rule", "route", "neighbor", "link") fail
    pub fn fail_next(&self, op: &str) {
        self.lock().fail_next = Some(op.to_string());
    }

    pub fn rules(&self) -> Vec<PolicyRule> {
        self.lock().rules.clone()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.lock().routes.clone()
    }

    pub fn routes_in(&self, table: u32) -> Vec<Route> {
        self.lock()
            .routes
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    pub fn neighbor_entries(&self) -> Vec<NeighborEntry> {
        self.lock().neighbors.clone()
    }

    pub fn sysctls(&self) -> Vec<(String, String)> {
        self.lock().sysctls.clone()
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.lock()
            .sysctls
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn link(&self, index: u32) -> Option<LinkInfo> {
        self.lock().links.iter().find(|l| l.index == index).cloned()
    }

    /// Number of state changes made through the kernel interfaces
    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    fn record_sysctl(&self, key: &str, value: &str) {
        let mut state = self.lock();
        state.sysctls.push((key.to_string(), value.to_string()));
        state.mutations += 1;
    }
}

impl RouteManager for FakeKernel {
    async fn link_by_name(&self, name: &str) -> Result<Option<LinkInfo>, NetlinkError> {
        Ok(self.lock().links.iter().find(|l| l.name == name).cloned())
    }

    async fn link_by_index(&self, index: u32) -> Result<Option<LinkInfo>, NetlinkError> {
        Ok(self.link(index))
    }

    async fn links(&self) -> Result<Vec<LinkInfo>, NetlinkError> {
        Ok(self.lock().links.clone())
    }

    async fn addresses(&self) -> Result<Vec<LinkAddress>, NetlinkError> {
        Ok(self.lock().addresses.clone())
    }

    /// Rules carry no priority, so like the kernel every add gets its own entry
    async fn add_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        let mut state = self.lock();
        state.take_failure("rule")?;
        state.rules.push(rule.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn del_rule(&self, rule: &PolicyRule) -> Result<(), NetlinkError> {
        let mut state = self.lock();
        state.take_failure("rule")?;
        let before = state.rules.len();
        state.rules.retain(|r| r != rule);
        if state.rules.len() == before {
            return Err(NetlinkError::NotFound(rule.to_string()));
        }
        state.mutations += 1;
        Ok(())
    }

    async fn list_rules(&self, family: IpFamily) -> Result<Vec<PolicyRule>, NetlinkError> {
        Ok(self
            .lock()
            .rules
            .iter()
            .filter(|r| r.family == family)
            .cloned()
            .collect())
    }

    async fn add_route(&self, route: &Route) -> Result<(), NetlinkError> {
        let mut state = self.lock();
        state.take_failure("route")?;
        if state
            .routes
            .iter()
            .any(|r| r.table == route.table && r.destination == route.destination)
        {
            return Err(NetlinkError::AlreadyExists(route.to_string()));
        }
        state.routes.push(route.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn del_route(&self, route: &Route) -> Result<(), NetlinkError> {
        let mut state = self.lock();
        state.take_failure("route")?;
        match state.routes.iter().position(|r| r.same_path(route)) {
            Some(pos) => {
                state.routes.remove(pos);
                state.mutations += 1;
                Ok(())
            }
            None => Err(NetlinkError::NotFound(route.to_string())),
        }
    }

    async fn list_routes(&self, family: IpFamily) -> Result<Vec<Route>, NetlinkError> {
        Ok(self
            .lock()
            .routes
            .iter()
            .filter(|r| r.family() == family)
            .cloned()
            .collect())
    }

    async fn add_neighbor(&self, entry: &NeighborEntry) -> Result<(), NetlinkError> {
        let mut state = self.lock();
        state.take_failure("neighbor")?;
        if state
            .neighbors
            .iter()
            .any(|n| n.ip == entry.ip && n.link_index == entry.link_index)
        {
            return Err(NetlinkError::AlreadyExists(entry.ip.to_string()));
        }
        state.neighbors.push(entry.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn replace_neighbor(&self, entry: &NeighborEntry) -> Result<(), NetlinkError> {
        let mut state = self.lock();
        state.take_failure("neighbor")?;
        state
            .neighbors
            .retain(|n| !(n.ip == entry.ip && n.link_index == entry.link_index));
        state.neighbors.push(entry.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn neighbors(&self, family: IpFamily) -> Result<Vec<NeighborEntry>, NetlinkError> {
        Ok(self
            .lock()
            .neighbors
            .iter()
            .filter(|n| IpFamily::of(&n.ip) == family)
            .cloned()
            .collect())
    }

    async fn set_link_address(&self, index: u32, mac: MacAddr) -> Result<(), NetlinkError> {
        let mut state = self.lock();
        state.take_failure("link")?;
        match state.links.iter_mut().find(|l| l.index == index) {
            Some(link) => {
                link.mac = Some(mac);
                state.mutations += 1;
                Ok(())
            }
            None => Err(NetlinkError::NoDevice(format!("link #{}", index))),
        }
    }
}

/// Prober answering from the claims registered on a [`FakeKernel`]
pub struct FakeProber {
    kernel: FakeKernel,
    link: LinkInfo,
}

impl AddressProber for FakeProber {
    async fn probe(&self, ip: Ipv4Addr, _wait: Duration) -> Result<Option<MacAddr>, RouterError> {
        let mut state = self.kernel.lock();
        state.probes.push((self.link.index, ip));
        Ok(state
            .claims
            .iter()
            .find(|(claimed, mac)| *claimed == IpAddr::V4(ip) && Some(*mac) != self.link.mac)
            .map(|(_, mac)| *mac))
    }
}

/// Namespace backed by a [`FakeKernel`]
#[derive(Clone)]
pub struct FakeNamespace {
    path: PathBuf,
    pub kernel: FakeKernel,
}

impl FakeNamespace {
    pub fn new(path: &str) -> Self {
        Self {
            path: PathBuf::from(path),
            kernel: FakeKernel::new(),
        }
    }
}

impl Namespace for FakeNamespace {
    type Routes = FakeKernel;
    type Prober = FakeProber;

    fn path(&self) -> &Path {
        &self.path
    }

    fn run<F, T>(&self, f: F) -> Result<T, NamespaceError>
    where
        F: FnOnce() -> T,
    {
        Ok(f())
    }

    fn route_manager(&self) -> Result<FakeKernel, RouterError> {
        Ok(self.kernel.clone())
    }

    fn prober(&self, link: &LinkInfo) -> Result<FakeProber, RouterError> {
        Ok(FakeProber {
            kernel: self.kernel.clone(),
            link: link.clone(),
        })
    }

    fn write_sysctl(&self, key: &str, value: &str) -> Result<(), RouterError> {
        self.kernel.record_sysctl(key, value);
        Ok(())
    }
}

/// Opener over a fixed host namespace and a set of pod namespaces
pub struct FakeOpener {
    pub host: FakeNamespace,
    pub pods: Vec<FakeNamespace>,
}

impl FakeOpener {
    pub fn new(host: FakeNamespace, pods: Vec<FakeNamespace>) -> Self {
        Self { host, pods }
    }
}

impl NamespaceOpener for FakeOpener {
    type Ns = FakeNamespace;

    fn open(&self, path: &Path) -> Result<FakeNamespace, NamespaceError> {
        self.pods
            .iter()
            .find(|ns| ns.path == path)
            .cloned()
            .ok_or_else(|| NamespaceError::NotFound {
                path: path.to_path_buf(),
            })
    }

    fn host(&self) -> Result<FakeNamespace, NamespaceError> {
        Ok(self.host.clone())
    }
}
