//! Configuration management module
//!
//! The network configuration arrives as JSON on stdin ([`netconf`]), the
//! invocation parameters through `CNI_*` environment variables ([`env`]).
//! [`RoutingConfig::from_netconf`] validates and defaults the former into the
//! immutable configuration one reconciliation pass works with.

use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::routing::table::{OVERLAY_ROUTE_TABLE, RT_TABLE_MAX};

pub mod cli;
pub mod env;
pub mod netconf;

pub use netconf::NetConf;

pub const DEFAULT_OVERLAY_INTERFACE: &str = "eth0";
pub const DEFAULT_HOST_RULE_TABLE: u32 = 500;
pub const DEFAULT_POD_TABLE_BASE: u32 = 1000;
pub const DEFAULT_LOG_FILE: &str = "/var/log/cni/router.log";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Validated, fully defaulted configuration of one plugin invocation
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub cni_version: String,
    pub service_hijack_subnet: Vec<IpNetwork>,
    pub overlay_hijack_subnet: Vec<IpNetwork>,
    pub additional_hijack_subnet: Vec<IpNetwork>,
    pub overlay_interface: String,
    pub host_rule_table: u32,
    pub pod_table_base: u32,
    pub rp_filter: RpFilter,
    pub migrate_route: MigrateRoute,
    pub ip_conflict: Option<IpConflict>,
    pub mac_prefix: Option<[u8; 2]>,
    pub only_op_mac: bool,
    pub skip_call: bool,
    pub sriov: bool,
    pub log_options: LogOptions,
}

/// Reverse-path filter mode, the value written to `rp_filter`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpFilterMode {
    Disabled = 0,
    Strict = 1,
    Loose = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpFilter {
    pub enabled: bool,
    pub mode: RpFilterMode,
}

/// Which routes of the default-route interface move into the pod table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateRoute {
    pub enable: bool,
    pub default_route: bool,
    pub gateway_routes: bool,
    pub link_routes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpConflict {
    pub interval: Duration,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    pub log_level: String,
    pub log_file_path: String,
}

impl Default for MigrateRoute {
    fn default() -> Self {
        Self {
            enable: true,
            default_route: true,
            gateway_routes: false,
            link_routes: false,
        }
    }
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_file_path: DEFAULT_LOG_FILE.to_string(),
        }
    }
}

impl Default for RpFilter {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: RpFilterMode::Loose,
        }
    }
}

impl RpFilterMode {
    /// Values other than 0/1/2 fall back to loose
    pub fn from_value(value: i64) -> Self {
        match value {
            0 => RpFilterMode::Disabled,
            1 => RpFilterMode::Strict,
            _ => RpFilterMode::Loose,
        }
    }

    pub fn as_sysctl(&self) -> &'static str {
        match self {
            RpFilterMode::Disabled => "0",
            RpFilterMode::Strict => "1",
            RpFilterMode::Loose => "2",
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            service_hijack_subnet: Vec::new(),
            overlay_hijack_subnet: Vec::new(),
            additional_hijack_subnet: Vec::new(),
            overlay_interface: DEFAULT_OVERLAY_INTERFACE.to_string(),
            host_rule_table: DEFAULT_HOST_RULE_TABLE,
            pod_table_base: DEFAULT_POD_TABLE_BASE,
            rp_filter: RpFilter::default(),
            migrate_route: MigrateRoute::default(),
            ip_conflict: None,
            mac_prefix: None,
            only_op_mac: false,
            skip_call: false,
            sriov: false,
            log_options: LogOptions::default(),
        }
    }
}

impl RoutingConfig {
    /// Validate a parsed network configuration and fill in defaults
    pub fn from_netconf(conf: &NetConf) -> Result<Self, ConfigError> {
        let mut config = RoutingConfig {
            cni_version: conf.cni_version.clone(),
            mac_prefix: parse_mac_prefix(&conf.mac_prefix)?,
            only_op_mac: conf.only_op_mac,
            skip_call: conf.skip_call,
            sriov: conf.sriov,
            log_options: conf.log_options.clone().unwrap_or_default(),
            ..RoutingConfig::default()
        };
        if config.log_options.log_file_path.is_empty() {
            config.log_options.log_file_path = DEFAULT_LOG_FILE.to_string();
        }

        if config.only_op_mac {
            return Ok(config);
        }

        config.service_hijack_subnet = validate_subnets(&conf.service_hijack_subnet)?;
        config.overlay_hijack_subnet = validate_subnets(&conf.overlay_hijack_subnet)?;
        config.additional_hijack_subnet = validate_subnets(&conf.additional_hijack_subnet)?;

        if let Some(ref conflict) = conf.ip_conflict {
            if conflict.enabled {
                config.ip_conflict = Some(IpConflict {
                    interval: parse_interval(&conflict.interval)?,
                    retries: conflict.retries.max(1),
                });
            }
        }

        config.migrate_route = conf.migrate_route.unwrap_or_default();

        if let Some(ref iface) = conf.overlay_interface {
            if !iface.is_empty() {
                config.overlay_interface = iface.clone();
            }
        }

        if let Some(table) = conf.host_rule_table {
            config.host_rule_table = validate_host_table(table)?;
        }

        if let Some(base) = conf.pod_table_base {
            if !(256..RT_TABLE_MAX).contains(&base) {
                return Err(ConfigError::InvalidTable {
                    field: "pod_table_base",
                    value: base,
                    reason: "must be within [256, 32767)",
                });
            }
            config.pod_table_base = base;
        }

        if let Some(ref rp) = conf.rp_filter {
            config.rp_filter = RpFilter {
                enabled: rp.enable.unwrap_or(true),
                mode: rp
                    .value
                    .map(RpFilterMode::from_value)
                    .unwrap_or(RpFilterMode::Loose),
            };
        }

        Ok(config)
    }

    /// All hijack subnets, service first
    pub fn hijack_subnets(&self) -> impl Iterator<Item = &IpNetwork> {
        self.service_hijack_subnet
            .iter()
            .chain(self.overlay_hijack_subnet.iter())
            .chain(self.additional_hijack_subnet.iter())
    }
}

fn validate_host_table(table: u32) -> Result<u32, ConfigError> {
    let reason = match table {
        0 => "table 0 is unspecified",
        253..=255 => "tables 253-255 are reserved by the kernel",
        OVERLAY_ROUTE_TABLE => "table 100 is reserved for the overlay",
        _ => return Ok(table),
    };
    Err(ConfigError::InvalidTable {
        field: "host_rule_table",
        value: table,
        reason,
    })
}

/// Parse hijack subnets, dropping duplicates and rejecting reserved ranges
fn validate_subnets(subnets: &[String]) -> Result<Vec<IpNetwork>, ConfigError> {
    let reserved: [IpNetwork; 6] = [
        reserved_net("127.0.0.0/8"),
        reserved_net("224.0.0.0/4"),
        reserved_net("169.254.0.0/16"),
        reserved_net("::1/128"),
        reserved_net("ff00::/8"),
        reserved_net("fe80::/10"),
    ];

    let mut parsed: Vec<IpNetwork> = Vec::with_capacity(subnets.len());
    for subnet in subnets {
        // a bare address would otherwise parse as a single-host network
        if !subnet.contains('/') {
            return Err(ConfigError::InvalidSubnet {
                subnet: subnet.clone(),
                reason: "missing prefix length, expected CIDR notation".to_string(),
            });
        }
        let net = subnet
            .trim()
            .parse::<IpNetwork>()
            .map_err(|e| ConfigError::InvalidSubnet {
                subnet: subnet.clone(),
                reason: e.to_string(),
            })?;

        if net.prefix() == 0 {
            return Err(ConfigError::InvalidSubnet {
                subnet: subnet.clone(),
                reason: "default route cannot be hijacked".to_string(),
            });
        }

        if let Some(hit) = reserved.iter().find(|r| overlaps(r, &net)) {
            return Err(ConfigError::InvalidSubnet {
                subnet: subnet.clone(),
                reason: format!("overlaps reserved range {}", hit),
            });
        }

        // normalize host bits away so 10.96.0.1/12 and 10.96.0.0/12 are one subnet
        let net = IpNetwork::new(net.network(), net.prefix()).map_err(|e| {
            ConfigError::InvalidSubnet {
                subnet: subnet.clone(),
                reason: e.to_string(),
            }
        })?;
        if !parsed.contains(&net) {
            parsed.push(net);
        }
    }
    Ok(parsed)
}

fn reserved_net(cidr: &str) -> IpNetwork {
    match cidr.parse() {
        Ok(net) => net,
        Err(_) => unreachable!("reserved range literal {cidr} is valid"),
    }
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    match (a.network(), b.network()) {
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
            a.contains(b.network()) || b.contains(a.network())
        }
        _ => false,
    }
}

/// Parse a mac prefix like "0a:1b"; empty means no rewrite
pub fn parse_mac_prefix(prefix: &str) -> Result<Option<[u8; 2]>, ConfigError> {
    if prefix.is_empty() {
        return Ok(None);
    }
    let invalid = || ConfigError::InvalidMacPrefix(prefix.to_string());

    let parts: Vec<&str> = prefix.split(':').collect();
    if parts.len() != 2 || parts.iter().any(|p| p.len() != 2) {
        return Err(invalid());
    }
    let first = u8::from_str_radix(parts[0], 16).map_err(|_| invalid())?;
    let second = u8::from_str_radix(parts[1], 16).map_err(|_| invalid())?;
    // multicast bit
    if first & 0x01 != 0 {
        return Err(invalid());
    }
    Ok(Some([first, second]))
}

/// Parse an interval such as "500ms", "1s" or "1m"
pub fn parse_interval(interval: &str) -> Result<Duration, ConfigError> {
    let re = Regex::new(r"^(\d+)(ms|s|m)$")
        .map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
    let caps = re
        .captures(interval.trim())
        .ok_or_else(|| ConfigError::InvalidInterval(interval.to_string()))?;

    let value: u64 = caps[1]
        .parse()
        .map_err(|_| ConfigError::InvalidInterval(interval.to_string()))?;
    let duration = match &caps[2] {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        _ => Duration::from_secs(value * 60),
    };
    Ok(duration)
}
