//! CNI protocol glue: command dispatch and stdout payloads

use serde_json::{json, Value};
use tracing::info;

use crate::config::env::{CniArgs, CniCommand};
use crate::config::netconf::passthrough_result;
use crate::config::{NetConf, RoutingConfig};
use crate::error::{ConfigError, RouterError};
use crate::network::NamespaceOpener;
use crate::reconciler::{AttachOutcome, AttachRequest, RouterReconciler};

pub const SUPPORTED_VERSIONS: [&str; 4] = ["0.3.0", "0.3.1", "0.4.0", "1.0.0"];
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// Failed to decode or validate the network configuration
pub const ERR_INVALID_NETWORK_CONFIG: u32 = 7;
pub const ERR_INTERNAL: u32 = 999;

/// Run one CNI command; `Some` is the payload for stdout
pub async fn execute<O: NamespaceOpener>(
    args: &CniArgs,
    conf: &NetConf,
    config: &RoutingConfig,
    opener: &O,
) -> Result<Option<Value>, RouterError> {
    let reconciler = RouterReconciler::new(config, opener);

    match args.command {
        CniCommand::Add => {
            let prev = conf.prev_result()?;
            let netns = args
                .netns
                .as_deref()
                .ok_or_else(|| ConfigError::MissingRequired {
                    field: "CNI_NETNS".to_string(),
                })?;
            let outcome = reconciler
                .attach(AttachRequest {
                    netns,
                    ifname: &args.ifname,
                    prev_result: prev.as_ref(),
                })
                .await?;
            if let AttachOutcome::Completed { ref interface, table } = outcome {
                info!("Chained interface {} attached with table {}", interface, table);
            }

            let prev = conf.prev_result.clone().unwrap_or_else(|| json!({}));
            Ok(Some(passthrough_result(&prev, &config.cni_version)))
        }
        CniCommand::Del => {
            reconciler.detach(args.netns.as_deref(), &args.ifname).await?;
            Ok(None)
        }
        CniCommand::Check => Err(RouterError::UnsupportedCommand("CHECK".to_string())),
        CniCommand::Version => Ok(Some(version_result())),
    }
}

pub fn version_result() -> Value {
    json!({
        "cniVersion": DEFAULT_CNI_VERSION,
        "supportedVersions": SUPPORTED_VERSIONS,
    })
}

pub fn error_code(err: &RouterError) -> u32 {
    match err {
        RouterError::ConfigInvalid(_) => ERR_INVALID_NETWORK_CONFIG,
        _ => ERR_INTERNAL,
    }
}

/// Error payload printed on stdout when a command fails
pub fn error_result(cni_version: &str, err: &RouterError) -> Value {
    let details = std::error::Error::source(err)
        .map(|source| source.to_string())
        .unwrap_or_default();
    let version = if cni_version.is_empty() {
        DEFAULT_CNI_VERSION
    } else {
        cni_version
    };
    json!({
        "cniVersion": version,
        "code": error_code(err),
        "msg": err.to_string(),
        "details": details,
    })
}
