//! Configuration module for tcp-harness.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::{Endpoint, Timeouts};
use crate::matcher::ExpectationConfig;
use crate::server::Latency;
use crate::swarm::{Step, Task};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "tcp-harness")]
#[command(author = "tcp-harness authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP stub server and load-testing harness", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the TCP stub server
    Serve(ServeArgs),
    /// Drive virtual users against a TCP endpoint
    Swarm(SwarmArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Host to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum mock duration (seconds) to wait before replying
    #[arg(long)]
    pub mock_duration: Option<f64>,

    /// Always sleep exactly the mock duration instead of a random fraction of it
    #[arg(long)]
    pub fixed_latency: bool,

    /// Seed for the latency and reply RNG
    #[arg(long)]
    pub seed: Option<u64>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,
}

#[derive(Args, Debug, Default)]
pub struct SwarmArgs {
    /// Target URL (e.g., tcp://127.0.0.1:8888)
    #[arg(long)]
    pub host: Option<String>,

    /// Number of concurrent virtual users
    #[arg(short, long)]
    pub users: Option<usize>,

    /// Run duration in seconds
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// Pause between tasks of one user, in milliseconds
    #[arg(long)]
    pub wait_ms: Option<u64>,

    /// Read buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Do not emit outcome records
    #[arg(long)]
    pub no_record: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub swarm: SwarmSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Stub server configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Maximum mock latency in seconds
    #[serde(default = "default_mock_duration")]
    pub mock_duration: f64,
    #[serde(default)]
    pub fixed_latency: bool,
    pub seed: Option<u64>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Per-read timeout while receiving a request
    #[serde(default = "default_server_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            mock_duration: default_mock_duration(),
            fixed_latency: false,
            seed: None,
            backlog: default_backlog(),
            read_timeout_ms: default_server_read_timeout_ms(),
        }
    }
}

/// Connection client configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_target")]
    pub host: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_target(),
            buffer_size: default_buffer_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_io_timeout_ms(),
            read_timeout_ms: default_io_timeout_ms(),
        }
    }
}

/// Swarm (demo load driver) configuration
#[derive(Debug, Deserialize)]
pub struct SwarmSection {
    #[serde(default = "default_users")]
    pub users: usize,
    /// Run duration in seconds
    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default)]
    pub wait_ms: u64,
    #[serde(default = "default_record")]
    pub record: bool,
    #[serde(default)]
    pub tasks: Vec<TaskSection>,
}

impl Default for SwarmSection {
    fn default() -> Self {
        Self {
            users: default_users(),
            duration: default_duration(),
            wait_ms: 0,
            record: default_record(),
            tasks: Vec::new(),
        }
    }
}

/// A scenario task as written in the config file
#[derive(Debug, Deserialize)]
pub struct TaskSection {
    pub name: String,
    pub steps: Vec<StepSection>,
}

#[derive(Debug, Deserialize)]
pub struct StepSection {
    /// Span label; defaults to the payload text
    pub label: Option<String>,
    pub payload: String,
    pub expect: Option<ExpectationConfig>,
    /// Record under this name instead of the task name
    pub name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8888
}

fn default_mock_duration() -> f64 {
    0.2
}

fn default_backlog() -> i32 {
    10
}

fn default_server_read_timeout_ms() -> u64 {
    5_000
}

fn default_target() -> String {
    "tcp://127.0.0.1:8888".to_string()
}

fn default_buffer_size() -> usize {
    4096
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    10_000
}

fn default_users() -> usize {
    1
}

fn default_duration() -> u64 {
    10
}

fn default_record() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved stub server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub latency: Latency,
    pub seed: Option<u64>,
    pub backlog: i32,
    pub read_timeout: Duration,
}

impl ServerConfig {
    /// Address string to bind (`host:port`)
    pub fn listen(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolved swarm configuration
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub endpoint: Endpoint,
    pub timeouts: Timeouts,
    pub users: usize,
    pub duration: Duration,
    pub wait: Duration,
    pub record: bool,
    pub tasks: Vec<Task>,
}

/// What the binary was asked to do
#[derive(Debug, Clone)]
pub enum Mode {
    Serve(ServerConfig),
    Swarm(SwarmConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), Box::new(e)))?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level.clone()
        };

        let mode = match cli.command {
            Command::Serve(args) => Mode::Serve(resolve_server(args, toml_config.server)?),
            Command::Swarm(args) => Mode::Swarm(resolve_swarm(
                args,
                toml_config.client,
                toml_config.swarm,
            )?),
        };

        Ok(Config { log_level, mode })
    }
}

/// Merge serve flags over the `[server]` section and validate.
pub fn resolve_server(cli: ServeArgs, file: ServerSection) -> Result<ServerConfig, ConfigError> {
    let max = cli.mock_duration.unwrap_or(file.mock_duration);
    let latency = if cli.fixed_latency || file.fixed_latency {
        Latency::fixed(max)?
    } else {
        Latency::uniform(max)?
    };

    Ok(ServerConfig {
        host: cli.host.unwrap_or(file.host),
        port: cli.port.unwrap_or(file.port),
        latency,
        seed: cli.seed.or(file.seed),
        backlog: cli.backlog.unwrap_or(file.backlog),
        read_timeout: positive_millis("server read", file.read_timeout_ms)?,
    })
}

fn positive_millis(what: &'static str, ms: u64) -> Result<Duration, ConfigError> {
    if ms == 0 {
        return Err(ConfigError::ZeroTimeout(what));
    }
    Ok(Duration::from_millis(ms))
}

/// Merge swarm flags over the `[client]` and `[swarm]` sections and validate.
pub fn resolve_swarm(
    cli: SwarmArgs,
    client: ClientSection,
    swarm: SwarmSection,
) -> Result<SwarmConfig, ConfigError> {
    let target = cli.host.unwrap_or(client.host);
    let buffer_size = cli.buffer_size.unwrap_or(client.buffer_size);
    let endpoint = Endpoint::parse(&target, buffer_size)?;

    let users = cli.users.unwrap_or(swarm.users);
    if users == 0 {
        return Err(ConfigError::NoUsers);
    }

    let tasks = if swarm.tasks.is_empty() {
        Task::defaults()
    } else {
        swarm
            .tasks
            .into_iter()
            .map(resolve_task)
            .collect::<Result<Vec<_>, _>>()?
    };

    Ok(SwarmConfig {
        endpoint,
        timeouts: Timeouts {
            connect: positive_millis("connect", client.connect_timeout_ms)?,
            write: positive_millis("write", client.write_timeout_ms)?,
            read: positive_millis("read", client.read_timeout_ms)?,
        },
        users,
        duration: Duration::from_secs(cli.duration.unwrap_or(swarm.duration)),
        wait: Duration::from_millis(cli.wait_ms.unwrap_or(swarm.wait_ms)),
        record: swarm.record && !cli.no_record,
        tasks,
    })
}

fn resolve_task(section: TaskSection) -> Result<Task, ConfigError> {
    if section.steps.is_empty() {
        return Err(ConfigError::EmptyTask(section.name));
    }

    let steps = section
        .steps
        .into_iter()
        .map(|step| {
            let expect = step.expect.map(ExpectationConfig::build).transpose()?;
            let mut resolved = Step::new(
                step.label.unwrap_or_else(|| step.payload.clone()),
                step.payload.into_bytes(),
                expect,
            );
            if let Some(name) = step.name {
                resolved = resolved.record_as(name);
            }
            Ok(resolved)
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    Ok(Task::new(section.name, steps))
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] Box<toml::de::Error>),
    #[error("mock duration should be bigger than 0, got {0}")]
    InvalidLatency(f64),
    #[error("read buffer size must be positive")]
    ZeroBufferSize,
    #[error("invalid target '{target}': {reason}")]
    InvalidEndpoint { target: String, reason: String },
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: Box<regex::Error>,
    },
    #[error("{0} timeout must be bigger than 0")]
    ZeroTimeout(&'static str),
    #[error("swarm needs at least one user")]
    NoUsers,
    #[error("task '{0}' has no steps")]
    EmptyTask(String),
}
