use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};
use tunnel_core::config::{Config, ConfigManager};
use tunnel_core::logging::{LogOptions, init_logging};

mod scenario;
mod sim;

use scenario::Scenario;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Packet tunnel controller tool", long_about = None, after_help = "Examples:\n  tunnelctl simulate tunnelctl/scenarios/failover.toml\n  tunnelctl --output json simulate tunnelctl/scenarios/start_failure.toml\n  tunnelctl config show")]
struct Args {
    /// Path to the configuration file (defaults to the per-user config if it exists)
    #[arg(short, long, value_name = "FILE", env = "PACKET_TUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration
    #[arg(short, long, value_enum, env = "PACKET_TUNNEL_LOG_LEVEL")]
    log_level: Option<LogLevelArg>,

    /// Emit JSON logs
    #[arg(long, env = "PACKET_TUNNEL_JSON_LOGS")]
    json_logs: bool,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub(crate) enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a scenario against the controller with simulated collaborators
    Simulate {
        /// Scenario file
        scenario: PathBuf,
    },
    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Destination (defaults to the per-user config path)
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let manager = ConfigManager::load(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?;
            Ok(manager.config().clone())
        }
        None => {
            let default_path = Config::default_path();
            if default_path.exists() {
                Config::load(&default_path).with_context(|| {
                    format!("loading configuration from {}", default_path.display())
                })
            } else {
                Ok(Config::default())
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let mut log_options = LogOptions::from_config(&config);
    if let Some(level) = args.log_level {
        log_options.level = level.into();
    }
    log_options.json_format |= args.json_logs;
    let _guard = init_logging(log_options);

    debug!(?config, "Configuration loaded");

    match args.command {
        Command::Simulate { scenario } => {
            let scenario = Scenario::load(&scenario)?;
            info!(relays = scenario.relays.len(), steps = scenario.steps.len(), "Running scenario");

            let summary = sim::run(&config, &scenario, args.output).await?;
            match args.output {
                OutputFormat::Table => {
                    println!();
                    println!("final state:     {}", summary.state);
                    println!(
                        "relay:           {}",
                        summary.relay.as_deref().unwrap_or("-")
                    );
                    println!("failed attempts: {}", summary.failed_attempts);
                    println!("reachable:       {}", summary.is_network_reachable);
                    println!("transitions:     {}", summary.transitions);
                }
                OutputFormat::Json => print_json(&summary)?,
            }
        }
        Command::Config { action } => match action {
            ConfigCmd::Show => match args.output {
                OutputFormat::Table => print!("{}", toml::to_string_pretty(&config)?),
                OutputFormat::Json => print_json(&config)?,
            },
            ConfigCmd::Init { path } => {
                let path = path.unwrap_or_else(Config::default_path);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                Config::default()
                    .save(&path)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("wrote {}", path.display());
            }
        },
    }

    Ok(())
}
