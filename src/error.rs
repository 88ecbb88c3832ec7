//! Centralized error types and handling

use std::path::PathBuf;
use thiserror::Error;

/// Pipeline error surfaced to the invoking runtime
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(#[from] ConfigError),

    #[error("failed to find PrevResult, must be called as chained plugin")]
    MissingPrevResult,

    #[error("interface {interface} not found in namespace")]
    InterfaceNotFound { interface: String },

    #[error("parent link of {interface} not found, overlay interface is not a veth/macvlan pairing")]
    ParentLinkNotFound { interface: String },

    #[error("failed to get the number of rule table for interface {interface}")]
    TableAllocationFailed { interface: String },

    #[error("failed to add neighbor {ip} on link {link}: {reason}")]
    NeighborInstallFailed { ip: String, link: u32, reason: String },

    #[error("failed to install {what}: {source}")]
    RuleOrRouteInstallFailed {
        what: String,
        #[source]
        source: NetlinkError,
    },

    #[error("route {route} conflicts with existing entry {existing}")]
    RouteConflict { route: String, existing: String },

    #[error("failed to set sysctl {key}={value}: {source}")]
    SysctlApplyFailed {
        key: String,
        value: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ip {ip} is already in use by {mac}")]
    IpConflict { ip: String, mac: String },

    #[error("failed to probe addresses on {interface}: {source}")]
    ProbeFailed {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to update mac address of {interface}: {reason}")]
    MacRewriteFailed { interface: String, reason: String },

    #[error("{0} is not supported by the router plugin")]
    UnsupportedCommand(String),

    #[error("namespace error: {0}")]
    Namespace(#[from] NamespaceError),

    #[error("netlink error: {0}")]
    Netlink(#[from] NetlinkError),
}

/// Network namespace errors
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("network namespace {path:?} does not exist")]
    NotFound { path: PathBuf },

    #[error("failed to access network namespace {path:?}: {reason}")]
    Access { path: PathBuf, reason: String },
}

/// Kernel result classification of a netlink request
#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("{0}: entry already exists")]
    AlreadyExists(String),

    #[error("{0}: no such entry")]
    NotFound(String),

    #[error("{0}: no such device")]
    NoDevice(String),

    #[error("{what}: {reason}")]
    Request { what: String, reason: String },

    #[error("failed to open netlink connection: {0}")]
    Connection(#[from] std::io::Error),
}

impl NetlinkError {
    pub fn is_exist(&self) -> bool {
        matches!(self, NetlinkError::AlreadyExists(_))
    }

    /// Deletion targets that are already gone
    pub fn is_gone(&self) -> bool {
        matches!(self, NetlinkError::NotFound(_) | NetlinkError::NoDevice(_))
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to parse network configuration: {0}")]
    InvalidFormat(String),

    #[error("missing required configuration: {field}")]
    MissingRequired { field: String },

    #[error("invalid subnet {subnet}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    #[error("invalid mac_prefix {0}, expected two hex octets like \"0a:1b\" with a unicast first octet")]
    InvalidMacPrefix(String),

    #[error("invalid interval {0}, input like: 500ms, 1s, 1m")]
    InvalidInterval(String),

    #[error("invalid {field} {value}: {reason}")]
    InvalidTable {
        field: &'static str,
        value: u32,
        reason: &'static str,
    },
}
