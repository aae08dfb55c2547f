// Configuration management for the route reconciler
// Supports CLI arguments, config file (TOML), and environment variables

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Route Reconciler - keep the Windows IPv4 route table in line with a profile
#[derive(Parser, Debug, Clone)]
#[command(name = "route-reconciler")]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace)
    #[arg(short, long, env = "RTR_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Path to configuration file
    #[arg(short, long, env = "RTR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Profile to operate on
    #[arg(short, long, env = "RTR_PROFILE")]
    pub profile: Option<String>,

    /// Directory holding profile JSON files
    #[arg(long, env = "RTR_PROFILES_DIR")]
    pub profiles_dir: Option<PathBuf>,

    /// Directory holding snapshots
    #[arg(long, env = "RTR_SNAPSHOTS_DIR")]
    pub snapshots_dir: Option<PathBuf>,

    /// Timeout for route.exe calls in seconds
    #[arg(long, env = "RTR_ROUTE_TIMEOUT")]
    pub route_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List active IPv4 interfaces
    Interfaces,
    /// Show the system route table
    Routes {
        /// Include routes not owned by this tool
        #[arg(long)]
        all: bool,
    },
    /// Show what an apply would change
    Diff,
    /// Reconcile the system route table with the profile
    Apply {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
        /// Skip the pre-apply system snapshot
        #[arg(long)]
        no_snapshot: bool,
    },
    /// Manage snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommand,
    },
    /// Check which route traffic to each target takes
    Verify {
        /// Targets to check (default: enabled profile routes)
        targets: Vec<String>,
        /// Also run a trace route
        #[arg(long)]
        trace: bool,
    },
    /// Manage profiles
    Profile {
        #[command(subcommand)]
        action: ProfileCommand,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SnapshotCommand {
    /// Capture the system route table
    Create,
    /// List snapshots, newest first
    List,
    /// Delete tool-owned routes that are absent from a system snapshot
    Prune { file: PathBuf },
    /// Delete a snapshot file
    Delete { file: PathBuf },
    /// Keep only the newest snapshots
    Cleanup {
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ProfileCommand {
    List,
    Show,
    Delete { name: String },
    Export { name: String, dest: PathBuf },
    Import { src: PathBuf, name: String },
}

/// Configuration file structure (TOML format)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    /// Profile and snapshot storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// External command timeouts
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,

    #[serde(default = "default_profile")]
    pub profile: String,

    #[serde(default = "default_snapshots_dir")]
    pub snapshots_dir: PathBuf,

    /// Snapshots kept by `snapshot cleanup`
    #[serde(default = "default_snapshot_keep")]
    pub snapshot_keep: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_powershell_timeout")]
    pub powershell_timeout_seconds: u64,

    #[serde(default = "default_route_timeout")]
    pub route_timeout_seconds: u64,

    #[serde(default = "default_trace_timeout")]
    pub trace_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log to file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_profiles_dir() -> PathBuf {
    PathBuf::from("profiles")
}
fn default_profile() -> String {
    "home".to_string()
}
fn default_snapshots_dir() -> PathBuf {
    PathBuf::from("snapshots")
}
fn default_snapshot_keep() -> usize {
    10
}
fn default_powershell_timeout() -> u64 {
    30
}
fn default_route_timeout() -> u64 {
    10
}
fn default_trace_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            profiles_dir: default_profiles_dir(),
            profile: default_profile(),
            snapshots_dir: default_snapshots_dir(),
            snapshot_keep: default_snapshot_keep(),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        CommandsConfig {
            powershell_timeout_seconds: default_powershell_timeout(),
            route_timeout_seconds: default_route_timeout(),
            trace_timeout_seconds: default_trace_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Merged configuration from all sources
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub profiles_dir: PathBuf,
    pub profile: String,
    pub snapshots_dir: PathBuf,
    pub snapshot_keep: usize,
    pub powershell_timeout: Duration,
    pub route_timeout: Duration,
    pub trace_timeout: Duration,
    pub log_level: Level,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from all sources (CLI args, config file, defaults)
    /// Priority: CLI args > Environment variables > Config file > Defaults
    pub fn load() -> anyhow::Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli_args: CliArgs) -> anyhow::Result<Self> {
        // Load config file if specified
        let config_file = if let Some(config_path) = &cli_args.config {
            let config_content = std::fs::read_to_string(config_path)?;
            toml::from_str::<ConfigFile>(&config_content)?
        } else {
            // Try loading from default locations
            let default_paths = vec![
                PathBuf::from("config.toml"),
                PathBuf::from("route-reconciler.toml"),
            ];

            let mut loaded_config = None;
            for path in default_paths {
                if path.exists() {
                    let config_content = std::fs::read_to_string(&path)?;
                    loaded_config = Some(toml::from_str::<ConfigFile>(&config_content)?);
                    break;
                }
            }

            loaded_config.unwrap_or_default()
        };

        Self::merge(cli_args, config_file)
    }

    /// Merge configuration (CLI args override config file)
    fn merge(cli_args: CliArgs, config_file: ConfigFile) -> anyhow::Result<Self> {
        let storage = config_file.storage;
        let commands = config_file.commands;

        let log_level = parse_log_level(
            cli_args
                .log_level
                .as_deref()
                .unwrap_or(&config_file.logging.level),
        )?;

        let route_timeout = cli_args
            .route_timeout
            .unwrap_or(commands.route_timeout_seconds);

        Ok(Config {
            command: cli_args.command,
            profiles_dir: cli_args.profiles_dir.unwrap_or(storage.profiles_dir),
            profile: cli_args.profile.unwrap_or(storage.profile),
            snapshots_dir: cli_args.snapshots_dir.unwrap_or(storage.snapshots_dir),
            snapshot_keep: storage.snapshot_keep,
            powershell_timeout: Duration::from_secs(commands.powershell_timeout_seconds),
            route_timeout: Duration::from_secs(route_timeout),
            trace_timeout: Duration::from_secs(commands.trace_timeout_seconds),
            log_level,
            log_file: config_file.logging.file,
        })
    }
}

fn parse_log_level(level_str: &str) -> anyhow::Result<Level> {
    match level_str.to_lowercase().as_str() {
        "error" => Ok(Level::ERROR),
        "warn" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        "trace" => Ok(Level::TRACE),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level_str)),
    }
}
