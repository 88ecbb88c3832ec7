use std::fs::OpenOptions;
use std::io::Read;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use serde_json::Value;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

use cni_router::cni::{self, DEFAULT_CNI_VERSION};
use cni_router::config::cli::{print_default_config, CliArgs};
use cni_router::config::env::{CniArgs, CniCommand};
use cni_router::config::{LogOptions, NetConf, RoutingConfig};
use cni_router::error::{ConfigError, RouterError};
use cni_router::network::NetNsOpener;

// setns(2) applies to the calling thread, so everything runs on one
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match CniArgs::from_env() {
        Ok(Some(args)) => run_plugin(args).await,
        Ok(None) => run_cli(),
        Err(e) => fail(DEFAULT_CNI_VERSION, &e.into()),
    }
}

async fn run_plugin(args: CniArgs) -> ExitCode {
    if args.command == CniCommand::Version {
        return emit(&cni::version_result());
    }

    let mut stdin = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut stdin) {
        let err = ConfigError::InvalidFormat(format!("failed to read stdin: {}", e));
        return fail(DEFAULT_CNI_VERSION, &err.into());
    }

    let conf = match NetConf::parse(&stdin) {
        Ok(conf) => conf,
        Err(e) => return fail(DEFAULT_CNI_VERSION, &e.into()),
    };
    let config = match RoutingConfig::from_netconf(&conf) {
        Ok(config) => config,
        Err(e) => return fail(&conf.cni_version, &e.into()),
    };

    init_logging(&config.log_options, None);

    let span = info_span!(
        "router",
        action = ?args.command,
        container_id = %args.container_id,
        pod = %args.pod_name(),
        namespace = %args.pod_namespace(),
        uid = %args.pod_uid(),
        ifname = %args.ifname,
    );

    let result = cni::execute(&args, &conf, &config, &NetNsOpener)
        .instrument(span.clone())
        .await;

    let _entered = span.enter();
    match result {
        Ok(Some(output)) => emit(&output),
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?} failed: {}", args.command, e);
            fail(&config.cni_version, &e)
        }
    }
}

fn run_cli() -> ExitCode {
    let cli = CliArgs::parse();
    init_logging(&LogOptions::default(), Some(cli.log_level.as_deref().unwrap_or("info")));

    if cli.print_default_config {
        return match print_default_config() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    if cli.validate_config {
        return match cli.validate() {
            Ok(config) => {
                info!("Configuration is valid");
                println!("{:#?}", config);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Configuration is invalid: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    eprintln!("router is a CNI plugin and expects CNI_COMMAND to be set, see --help");
    ExitCode::FAILURE
}

/// Log to the configured file, or to stderr when it cannot be opened. Stdout
/// is reserved for the CNI result.
fn init_logging(options: &LogOptions, stderr_level: Option<&str>) {
    let level = stderr_level.unwrap_or(&options.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if stderr_level.is_none() {
        if let Some(file) = open_log_file(&options.log_file_path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_log_file(path: &str) -> Option<std::fs::File> {
    let path = Path::new(path);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

fn emit(value: &Value) -> ExitCode {
    match serde_json::to_string(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to encode result: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn fail(cni_version: &str, err: &RouterError) -> ExitCode {
    emit(&cni::error_result(cni_version, err));
    ExitCode::FAILURE
}
