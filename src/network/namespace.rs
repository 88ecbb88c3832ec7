//! Network namespace operations

use std::path::{Path, PathBuf};

use netns_rs::NetNs;
use tracing::debug;

use crate::error::{NamespaceError, RouterError};
use crate::network::probe::{self, ArpProber};
use crate::network::{Namespace, NamespaceOpener};
use crate::routing::manager::RtNetlinkRouteManager;
use crate::routing::LinkInfo;

const PROC_SYS: &str = "/proc/sys";

/// Handle on a network namespace; `netns` is `None` for the namespace the
/// process already runs in
pub struct NetNamespace {
    path: PathBuf,
    netns: Option<NetNs>,
}

impl NetNamespace {
    /// Open a namespace by path, e.g. `/var/run/netns/cni-1234` or
    /// `/proc/<pid>/ns/net`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NamespaceError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(NamespaceError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let netns = netns_rs::get_from_path(path).map_err(|e| NamespaceError::Access {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        debug!("Opened network namespace {:?}", path);

        Ok(Self {
            path: path.to_path_buf(),
            netns: Some(netns),
        })
    }

    /// The namespace of the running process
    pub fn current() -> Self {
        Self {
            path: PathBuf::from("/proc/self/ns/net"),
            netns: None,
        }
    }
}

impl Namespace for NetNamespace {
    type Routes = RtNetlinkRouteManager;
    type Prober = ArpProber;

    fn path(&self) -> &Path {
        &self.path
    }

    fn run<F, T>(&self, f: F) -> Result<T, NamespaceError>
    where
        F: FnOnce() -> T,
    {
        match self.netns {
            Some(ref netns) => netns.run(|_| f()).map_err(|e| NamespaceError::Access {
                path: self.path.clone(),
                reason: e.to_string(),
            }),
            None => Ok(f()),
        }
    }

    fn route_manager(&self) -> Result<RtNetlinkRouteManager, RouterError> {
        // the socket keeps the namespace it was created in
        let manager = self.run(RtNetlinkRouteManager::new)??;
        Ok(manager)
    }

    fn prober(&self, link: &LinkInfo) -> Result<ArpProber, RouterError> {
        // packet sockets also stay in the namespace they were created in
        let socket = self
            .run(|| probe::packet_socket(link.index))?
            .map_err(|source| RouterError::ProbeFailed {
                interface: link.name.clone(),
                source,
            })?;
        ArpProber::new(socket, link)
    }

    fn write_sysctl(&self, key: &str, value: &str) -> Result<(), RouterError> {
        let file = Path::new(PROC_SYS).join(key);
        self.run(|| std::fs::write(&file, value))?
            .map_err(|source| RouterError::SysctlApplyFailed {
                key: key.to_string(),
                value: value.to_string(),
                source,
            })?;
        debug!("Set sysctl {}={} in {:?}", key, value, self.path);
        Ok(())
    }
}

/// Opens namespaces through netns-rs
#[derive(Debug, Default, Clone, Copy)]
pub struct NetNsOpener;

impl NamespaceOpener for NetNsOpener {
    type Ns = NetNamespace;

    fn open(&self, path: &Path) -> Result<NetNamespace, NamespaceError> {
        NetNamespace::open(path)
    }

    fn host(&self) -> Result<NetNamespace, NamespaceError> {
        Ok(NetNamespace::current())
    }
}
