//! unity-relay - send commands to Unity editor instances through the relay

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use unity_relay::client::{verbose, RelayClient, RetryEvent, VersionInfo};
use unity_relay::config::{Config, CONFIG_FILE_NAME};
use unity_relay::error::ExitCode;
use unity_relay::logging;
use unity_relay::protocol::{InstanceInfo, Params, RELAY_VERSION};
use unity_relay::status_file::{StatusDir, DEFAULT_MAX_AGE};

#[derive(Parser)]
#[command(name = "unity-relay")]
#[command(about = "Send commands to Unity editor instances through the relay server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Relay server host
    #[arg(long, global = true)]
    relay_host: Option<String>,

    /// Relay server port
    #[arg(long, global = true)]
    relay_port: Option<u16>,

    /// Target instance (id, ref number, project name or path suffix)
    #[arg(short, long, global = true)]
    instance: Option<String>,

    /// Command timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Dump requests and responses to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a command to an instance
    Send {
        /// Command name
        command: String,

        /// Parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
    },
    /// List connected instances
    Instances,
    /// Check that the relay server answers
    Ping,
    /// Report whether an instance's status file says it is reloading
    Reloading {
        /// Instance id, project name or path suffix
        selector: String,
    },
    /// Show or create configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default config file to the current directory
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::UsageError.into()
            } else {
                ExitCode::Success.into()
            };
        }
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::UsageError.into();
        }
    };

    if let Err(e) = logging::init(&config.logging, cli.debug, false) {
        eprintln!("Warning: {:#}", e);
    }

    run(cli, config).await.into()
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    let client = &mut config.client;
    if let Some(host) = &cli.relay_host {
        client.relay_host = host.clone();
    }
    if let Some(port) = cli.relay_port {
        client.relay_port = port;
    }
    if let Some(instance) = &cli.instance {
        client.instance = Some(instance.clone());
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        client.timeout_ms = timeout_ms;
    }
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli, config: Config) -> ExitCode {
    match cli.command {
        Commands::Send { command, params } => {
            let params = match parse_params(params.as_deref()) {
                Ok(params) => params,
                Err(e) => {
                    eprintln!("Error: {:#}", e);
                    return ExitCode::UsageError;
                }
            };
            send(&config, cli.verbose, &command, params).await
        }
        Commands::Instances => list_instances(&config, cli.verbose).await,
        Commands::Ping => ping(&config, cli.verbose).await,
        Commands::Reloading { selector } => reloading(&config, &selector),
        Commands::Config { action } => match config_command(action, &config) {
            Ok(()) => ExitCode::Success,
            Err(e) => {
                eprintln!("Error: {:#}", e);
                ExitCode::UsageError
            }
        },
    }
}

fn build_client(config: &Config, verbose: bool) -> RelayClient {
    let client = RelayClient::new(config.client.clone())
        .on_retry(print_retry)
        .on_version_info(|info| {
            if let Some(warning) = version_warning(info) {
                eprintln!("Warning: {}", warning);
            }
        });
    if verbose {
        client.on_traffic(verbose::dump_to_stderr)
    } else {
        client
    }
}

fn print_retry(event: &RetryEvent) {
    eprintln!(
        "[Retry] {}: {} (attempt {}, waiting {}ms)",
        event.code, event.message, event.attempt, event.backoff_ms
    );
}

fn version_warning(info: &VersionInfo) -> Option<String> {
    if info.relay_version.is_empty() || info.relay_version == RELAY_VERSION {
        return None;
    }
    Some(format!(
        "relay server version {} differs from CLI version {}",
        info.relay_version, RELAY_VERSION
    ))
}

fn parse_params(raw: Option<&str>) -> Result<Params> {
    let Some(raw) = raw else {
        return Ok(Params::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw).context("Invalid --params JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--params must be a JSON object, got {}", other),
    }
}

/// Commands that ran but reported failures (e.g. `failed: 3`) get their own exit code
fn exit_code_for_data(data: &Params) -> ExitCode {
    match data.get("failed").and_then(|v| v.as_i64()) {
        Some(failed) if failed > 0 => ExitCode::TestFailure,
        _ => ExitCode::Success,
    }
}

async fn send(config: &Config, verbose: bool, command: &str, params: Params) -> ExitCode {
    let mut client = build_client(config, verbose);
    match client.send_request(command, params, None).await {
        Ok(data) => {
            match serde_json::to_string_pretty(&data) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return ExitCode::OperationError;
                }
            }
            exit_code_for_data(&data)
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

async fn list_instances(config: &Config, verbose: bool) -> ExitCode {
    let mut client = build_client(config, verbose);
    match client.list_instances().await {
        Ok(instances) => {
            print_instances(&instances);
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn print_instances(instances: &[InstanceInfo]) {
    if instances.is_empty() {
        println!("No instances connected.");
        return;
    }
    println!(
        "{:<5} {:<13} {:<24} {:<14} INSTANCE",
        "REF", "STATUS", "PROJECT", "VERSION"
    );
    for info in instances {
        let marker = if info.is_default { "*" } else { " " };
        let status = match &info.detail {
            Some(detail) => format!("{} ({})", info.status, detail),
            None => info.status.to_string(),
        };
        println!(
            "{}{:<4} {:<13} {:<24} {:<14} {}",
            marker,
            info.ref_id,
            status,
            info.project_name,
            info.application_version,
            info.instance_id
        );
    }
}

async fn ping(config: &Config, verbose: bool) -> ExitCode {
    let mut client = build_client(config, verbose);
    match client.ping().await {
        Ok(rtt) => {
            println!(
                "pong from {} in {}ms",
                config.client.relay_addr(),
                rtt.as_millis()
            );
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn reloading(config: &Config, selector: &str) -> ExitCode {
    let status_dir = match &config.client.status_dir {
        Some(dir) => StatusDir::new(dir),
        None => StatusDir::from_env(),
    };
    if status_dir.is_any_instance_reloading(selector, DEFAULT_MAX_AGE) {
        println!("reloading");
    } else {
        println!("not reloading");
    }
    ExitCode::Success
}

fn config_command(action: ConfigAction, config: &Config) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Init { force } => {
            let path = std::env::current_dir()?.join(CONFIG_FILE_NAME);
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            std::fs::write(&path, Config::default().to_toml()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params() {
        assert!(parse_params(None).unwrap().is_empty());
        let params = parse_params(Some(r#"{"filter": "Editor", "count": 2}"#)).unwrap();
        assert_eq!(params["count"], json!(2));
        assert!(parse_params(Some("[1, 2]")).is_err());
        assert!(parse_params(Some("{oops")).is_err());
    }

    #[test]
    fn test_failed_tests_exit_code() {
        let mut data = Params::new();
        assert_eq!(exit_code_for_data(&data), ExitCode::Success);
        data.insert("failed".into(), json!(0));
        assert_eq!(exit_code_for_data(&data), ExitCode::Success);
        data.insert("failed".into(), json!(3));
        assert_eq!(exit_code_for_data(&data), ExitCode::TestFailure);
    }

    #[test]
    fn test_version_warning() {
        let same = VersionInfo {
            relay_version: RELAY_VERSION.into(),
            bridge_version: String::new(),
        };
        assert_eq!(version_warning(&same), None);

        let other = VersionInfo {
            relay_version: "0.0.1-old".into(),
            bridge_version: String::new(),
        };
        assert!(version_warning(&other).unwrap().contains("0.0.1-old"));
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from([
            "unity-relay",
            "send",
            "state",
            "--params",
            "{}",
            "-i",
            "MyGame",
        ])
        .unwrap();
        assert_eq!(cli.instance.as_deref(), Some("MyGame"));
        assert!(matches!(cli.command, Commands::Send { ref command, .. } if command == "state"));
    }
}
