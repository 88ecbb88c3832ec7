//! CNI invocation environment handling

use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Operation requested by the container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
    Check,
    Version,
}

/// Parameters passed through `CNI_*` environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniArgs {
    pub command: CniCommand,
    pub container_id: String,
    pub netns: Option<PathBuf>,
    pub ifname: String,
    pub args: Vec<(String, String)>,
}

impl CniArgs {
    /// Read the invocation from the process environment; `None` when the
    /// binary was not started by a container runtime
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let command = match lookup("CNI_COMMAND") {
            Some(cmd) => parse_command(&cmd)?,
            None => return Ok(None),
        };

        let required = |key: &str| -> Result<String, ConfigError> {
            match lookup(key) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(ConfigError::MissingRequired {
                    field: key.to_string(),
                }),
            }
        };

        let (container_id, ifname) = match command {
            CniCommand::Version => (String::new(), String::new()),
            _ => (required("CNI_CONTAINERID")?, required("CNI_IFNAME")?),
        };

        let netns = match command {
            CniCommand::Add | CniCommand::Check => Some(PathBuf::from(required("CNI_NETNS")?)),
            _ => lookup("CNI_NETNS")
                .filter(|ns| !ns.is_empty())
                .map(PathBuf::from),
        };

        let args = match lookup("CNI_ARGS") {
            Some(raw) => parse_cni_args(&raw)?,
            None => Vec::new(),
        };

        Ok(Some(Self {
            command,
            container_id,
            netns,
            ifname,
            args,
        }))
    }

    fn arg(&self, key: &str) -> &str {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn pod_name(&self) -> &str {
        self.arg("K8S_POD_NAME")
    }

    pub fn pod_namespace(&self) -> &str {
        self.arg("K8S_POD_NAMESPACE")
    }

    pub fn pod_uid(&self) -> &str {
        self.arg("K8S_POD_UID")
    }
}

fn parse_command(cmd: &str) -> Result<CniCommand, ConfigError> {
    match cmd {
        "ADD" => Ok(CniCommand::Add),
        "DEL" => Ok(CniCommand::Del),
        "CHECK" => Ok(CniCommand::Check),
        "VERSION" => Ok(CniCommand::Version),
        other => Err(ConfigError::InvalidFormat(format!(
            "unknown CNI_COMMAND '{}'",
            other
        ))),
    }
}

/// Parse `CNI_ARGS`, format: "K8S_POD_NAME=web-0;K8S_POD_NAMESPACE=default"
pub fn parse_cni_args(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut args = Vec::new();
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            ConfigError::InvalidFormat(format!(
                "invalid CNI_ARGS pair '{}'. Expected format: 'KEY=VALUE'",
                pair
            ))
        })?;
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidFormat(format!(
                "invalid CNI_ARGS pair '{}': empty key",
                pair
            )));
        }
        args.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok(args)
}
