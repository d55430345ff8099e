//! Configuration
//!
//! One [`Config`] value describes both ends of a deployment: where the
//! consumer listens, where the producer finds its source images, and where
//! each side stores what it receives. It is built once at startup and
//! passed down explicitly.
//!
//! Resolution order: defaults → `--config <file>` (TOML) → environment
//! (`PAIRLINK_SERVER_IP`, `PAIRLINK_SERVER_PORT`) → command-line flags.
//!
//! ```toml
//! server_ip = "0.0.0.0"
//! server_port = 9000
//! client_ip = "192.168.1.20"
//! visible_folder = "/data/visible"
//! thermal_folder = "/data/thermal"
//! log_file = "logs/pairlink.log"
//!
//! [processor]
//! program = "python"
//! args = ["tools/multi_infer.py", "--infer_vis_img={visible}",
//!         "--infer_ir_img={thermal}", "--output_dir={output_dir}"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default port the consumer listens on
pub const DEFAULT_PORT: u16 = 9000;

/// Default host the consumer binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default cap on concurrent outbound connections
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Producer and consumer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the consumer binds to and the producer connects to
    pub server_ip: String,
    pub server_port: u16,

    /// Local address the producer binds its sockets to. `None` = any.
    pub client_ip: Option<String>,

    /// Identity sent in the handshake. Falls back to `client_ip`.
    pub identity: Option<String>,

    /// Producer: source folders, one image per pair in each
    pub visible_folder: PathBuf,
    pub thermal_folder: PathBuf,

    /// Producer: where result images are stored
    pub results_folder: PathBuf,

    /// Consumer: root for received images, one subdirectory per modality
    pub received_folder: PathBuf,

    /// Consumer: where the processor writes its outputs
    pub output_folder: PathBuf,

    /// Consumer idle timeout, in seconds
    pub idle_timeout_secs: u64,

    /// Producer idle timeout, in seconds
    pub client_timeout_secs: u64,

    pub connect_timeout_secs: u64,

    /// Producer: maximum pairs in flight
    pub max_workers: usize,

    /// Result slots reported as failed when processing fails
    pub result_slots: usize,

    /// Producer: file streaming chunk size
    pub chunk_size: usize,

    /// Consumer: accepted handshake identities. Empty = accept anyone.
    pub allowed_clients: Vec<String>,

    /// Consumer: external processing command
    pub processor: Option<ProcessorConfig>,

    /// Also write logs to this file, appending
    pub log_file: Option<PathBuf>,
}

/// External processing command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: DEFAULT_HOST.to_string(),
            server_port: DEFAULT_PORT,
            client_ip: None,
            identity: None,
            visible_folder: PathBuf::from("images/visible"),
            thermal_folder: PathBuf::from("images/thermal"),
            results_folder: PathBuf::from("results"),
            received_folder: PathBuf::from("received"),
            output_folder: PathBuf::from("output"),
            idle_timeout_secs: 40,
            client_timeout_secs: 30,
            connect_timeout_secs: 10,
            max_workers: DEFAULT_MAX_WORKERS,
            result_slots: 2,
            chunk_size: crate::transport::DEFAULT_CHUNK_SIZE,
            allowed_clients: Vec::new(),
            processor: None,
            log_file: None,
        }
    }
}

/// What the command line asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Run(Config),
    Help,
    Version,
}

impl Config {
    /// Loads a TOML file on top of the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses command-line arguments (without the program name).
    pub fn from_args<I>(args: I) -> Result<CliCommand, ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();

        let mut config_path: Option<PathBuf> = None;
        let mut host: Option<String> = None;
        let mut port: Option<u16> = None;

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => {
                    config_path = Some(PathBuf::from(flag_value(&args, i)?));
                    i += 2;
                }
                "--host" | "-h" => {
                    host = Some(flag_value(&args, i)?.to_string());
                    i += 2;
                }
                "--port" | "-p" => {
                    let value = flag_value(&args, i)?;
                    port = Some(
                        value
                            .parse()
                            .map_err(|_| ConfigError::InvalidPort(value.to_string()))?,
                    );
                    i += 2;
                }
                "--help" => return Ok(CliCommand::Help),
                "--version" | "-v" => return Ok(CliCommand::Version),
                other => return Err(ConfigError::UnknownArgument(other.to_string())),
            }
        }

        let mut config = match config_path {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;

        if let Some(host) = host {
            config.server_ip = host;
        }
        if let Some(port) = port {
            config.server_port = port;
        }

        config.validate()?;
        Ok(CliCommand::Run(config))
    }

    /// Applies `PAIRLINK_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ip) = lookup("PAIRLINK_SERVER_IP") {
            self.server_ip = ip;
        }
        if let Some(port) = lookup("PAIRLINK_SERVER_PORT") {
            self.server_port = port
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        }
        Ok(())
    }

    /// Rejects values the transfer code can't work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0"));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be greater than 0"));
        }
        if self.idle_timeout_secs == 0 || self.client_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than 0"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid("connect_timeout_secs must be greater than 0"));
        }
        if self.client_identity().chars().any(char::is_control) {
            return Err(ConfigError::Invalid("identity must not contain control characters"));
        }
        Ok(())
    }

    /// Returns the consumer address as a string
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_ip, self.server_port)
    }

    /// Identity the producer presents in the handshake.
    pub fn client_identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| self.client_ip.clone())
            .unwrap_or_else(|| "pairlink".to_string())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Whether a handshake identity may open a session.
    pub fn is_client_allowed(&self, identity: &str) -> bool {
        self.allowed_clients.is_empty() || self.allowed_clients.iter().any(|c| c == identity)
    }
}

fn flag_value<'a>(args: &'a [String], i: usize) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue(args[i].clone()))
}

/// Errors raised while building a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0} requires a value")]
    MissingValue(String),

    #[error("invalid port number: {0}")]
    InvalidPort(String),

    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
