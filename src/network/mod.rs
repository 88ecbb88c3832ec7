//! Network operations module
//!
//! Handles network namespace access, address discovery and the per-namespace
//! side effects (neighbors, sysctls, MAC rewrite, conflict probing)

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use ipnetwork::IpNetwork;

use crate::error::{NamespaceError, RouterError};
use crate::routing::{IpFamily, LinkInfo, MacAddr, RouteManager};

pub mod conflict;
pub mod discovery;
pub mod mac;
pub mod namespace;
pub mod neighbor;
pub mod probe;
pub mod sysctl;

pub use discovery::{AddressInspector, OverlayLink};
pub use namespace::{NetNamespace, NetNsOpener};

/// Asks a link who answers for an address
pub trait AddressProber {
    /// MAC of another station claiming `ip` within `wait`, if any
    fn probe(
        &self,
        ip: Ipv4Addr,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<MacAddr>, RouterError>> + Send;
}

/// An open network namespace, host or pod
pub trait Namespace {
    type Routes: RouteManager;
    type Prober: AddressProber;

    fn path(&self) -> &Path;

    /// Run `f` with this namespace as the current one
    fn run<F, T>(&self, f: F) -> Result<T, NamespaceError>
    where
        F: FnOnce() -> T;

    /// Netlink access bound to this namespace
    fn route_manager(&self) -> Result<Self::Routes, RouterError>;

    /// Address prober on `link`, bound to this namespace
    fn prober(&self, link: &LinkInfo) -> Result<Self::Prober, RouterError>;

    /// Write `/proc/sys/<key>` as seen from inside this namespace
    fn write_sysctl(&self, key: &str, value: &str) -> Result<(), RouterError>;
}

/// Source of namespace handles for one invocation
pub trait NamespaceOpener {
    type Ns: Namespace;

    fn open(&self, path: &Path) -> Result<Self::Ns, NamespaceError>;

    /// The namespace the plugin itself runs in
    fn host(&self) -> Result<Self::Ns, NamespaceError>;
}

/// IP families in use by a pod
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FamilySet {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl FamilySet {
    pub const ALL: FamilySet = FamilySet {
        ipv4: true,
        ipv6: true,
    };

    /// Families present in a list of addresses
    pub fn from_addresses<'a>(addrs: impl IntoIterator<Item = &'a IpNetwork>) -> Self {
        addrs.into_iter().fold(FamilySet::default(), |set, net| match net {
            IpNetwork::V4(_) => FamilySet { ipv4: true, ..set },
            IpNetwork::V6(_) => FamilySet { ipv6: true, ..set },
        })
    }

    pub fn contains(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::V4 => self.ipv4,
            IpFamily::V6 => self.ipv6,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = IpFamily> + '_ {
        [IpFamily::V4, IpFamily::V6]
            .into_iter()
            .filter(move |f| self.contains(*f))
    }
}

/// Addresses of one pod interface, taken fresh on every invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub addresses: Vec<IpNetwork>,
    pub ipv4_active: bool,
    pub ipv6_active: bool,
}

impl InterfaceSnapshot {
    pub fn families(&self) -> FamilySet {
        FamilySet {
            ipv4: self.ipv4_active,
            ipv6: self.ipv6_active,
        }
    }

    /// Addresses of active families only
    pub fn active_addresses(&self) -> impl Iterator<Item = &IpNetwork> {
        let families = self.families();
        self.addresses
            .iter()
            .filter(move |net| families.contains(IpFamily::of(&net.ip())))
    }
}
