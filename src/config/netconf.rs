//! CNI network configuration and previous-result parsing

use std::path::Path;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{LogOptions, MigrateRoute};
use crate::error::ConfigError;

/// Network configuration as handed to the plugin on stdin
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(rename = "prevResult", default, skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<Value>,
    #[serde(default)]
    pub service_hijack_subnet: Vec<String>,
    #[serde(default)]
    pub overlay_hijack_subnet: Vec<String>,
    #[serde(default)]
    pub additional_hijack_subnet: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_route: Option<MigrateRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_rule_table: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_table_base: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rp_filter: Option<RpFilterConf>,
    #[serde(default)]
    pub skip_call: bool,
    #[serde(default)]
    pub sriov: bool,
    #[serde(default)]
    pub only_op_mac: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_options: Option<LogOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_conflict: Option<IpConflictConf>,
    #[serde(default)]
    pub mac_prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpFilterConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpConflictConf {
    pub enabled: bool,
    pub interval: String,
    pub retries: u32,
}

impl Default for IpConflictConf {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: "1s".to_string(),
            retries: 3,
        }
    }
}

/// The subset of the previous plugin's result the router works with
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PrevResult {
    #[serde(default)]
    pub interfaces: Vec<ResultInterface>,
    #[serde(default)]
    pub ips: Vec<ResultIp>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResultInterface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub sandbox: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResultIp {
    pub address: IpNetwork,
    #[serde(default)]
    pub gateway: Option<std::net::IpAddr>,
    #[serde(default)]
    pub interface: Option<usize>,
}

impl NetConf {
    /// Parse stdin bytes
    pub fn parse(stdin: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(stdin)
            .map_err(|e| ConfigError::InvalidFormat(format!("[router] {}", e)))
    }

    /// Load a configuration file, used by `--validate-config`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading network configuration from {:?}", path);

        let content = std::fs::read(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Self::parse(&content)
    }

    /// Decode `prevResult` into the typed view
    pub fn prev_result(&self) -> Result<Option<PrevResult>, ConfigError> {
        self.prev_result
            .as_ref()
            .map(|value| {
                PrevResult::deserialize(value).map_err(|e| {
                    ConfigError::InvalidFormat(format!("[router] could not parse prevResult: {}", e))
                })
            })
            .transpose()
    }

    /// Every option spelled out with its default value
    pub fn with_defaults() -> Self {
        Self {
            cni_version: "1.0.0".to_string(),
            name: "router".to_string(),
            plugin_type: "router".to_string(),
            migrate_route: Some(MigrateRoute::default()),
            overlay_interface: Some(crate::config::DEFAULT_OVERLAY_INTERFACE.to_string()),
            host_rule_table: Some(crate::config::DEFAULT_HOST_RULE_TABLE),
            pod_table_base: Some(crate::config::DEFAULT_POD_TABLE_BASE),
            rp_filter: Some(RpFilterConf {
                enable: Some(true),
                value: Some(2),
            }),
            log_options: Some(LogOptions::default()),
            ip_conflict: Some(IpConflictConf::default()),
            ..Self::default()
        }
    }
}

/// Stdout payload for a successful ADD: the previous result, untouched apart
/// from the version stamp
pub fn passthrough_result(prev_result: &Value, cni_version: &str) -> Value {
    let mut result = prev_result.clone();
    if let Value::Object(ref mut map) = result {
        if !cni_version.is_empty() {
            map.insert("cniVersion".to_string(), Value::String(cni_version.to_string()));
        }
    }
    result
}
