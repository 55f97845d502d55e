// src/utils/config.rs
//! Worker configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `ZOO_WORKER__*` environment variables. Command-line flags are
//! applied on top by the binary.

use crate::utils::errors::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Well-known port the worker listens on
pub const DEFAULT_PORT: u16 = 7432;

/// Port of the RPC service when both transports run side by side
pub const DEFAULT_RPC_PORT: u16 = 7433;

const DEFAULT_CONFIG_NAME: &str = "zoo-worker";
const ENV_PREFIX: &str = "ZOO_WORKER";

/// Which front end(s) the worker exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Authenticated single-connection listener
    Listener,
    /// Concurrent gRPC service
    Rpc,
    /// Both, sharing one registry
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Only used with `TransportKind::Both`
    pub rpc_port: u16,
    pub transport: TransportKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            rpc_port: DEFAULT_RPC_PORT,
            transport: TransportKind::Rpc,
        }
    }
}

impl ServerConfig {
    /// Address of the primary transport
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.host, self.port)
    }

    /// Address of the RPC service
    pub fn rpc_addr(&self) -> Result<SocketAddr> {
        match self.transport {
            TransportKind::Both => parse_addr(&self.host, self.rpc_port),
            _ => self.listen_addr(),
        }
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| WorkerError::ConfigError(format!("invalid address {}:{}: {}", host, port, e)))
}

/// Agent entry point
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable, resolved through `PATH` when it is a bare name
    pub program: String,

    /// Arguments placed before the startup parameters
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "zoo-agent".to_string(),
            args: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Host used to probe for free ports
    pub bind_host: String,

    /// Probe attempts before giving up with `ResourceExhausted`
    pub max_port_attempts: u32,

    /// Directory holding local agent sockets
    pub socket_dir: PathBuf,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            max_port_attempts: 64,
            socket_dir: std::env::temp_dir().join("zoo-worker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Concurrent dispatches allowed at once
    pub workers: usize,

    /// Time given to in-flight calls after a stop
    pub stop_grace_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            stop_grace_secs: 5,
        }
    }
}

impl RpcConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus exporter address; disabled when absent
    pub listen: Option<SocketAddr>,
}

/// Top-level worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub server: ServerConfig,

    /// Shared secret; empty or absent means unauthenticated
    pub auth_key: Option<String>,

    pub agent: AgentConfig,
    pub allocator: AllocatorConfig,
    pub rpc: RpcConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl WorkerConfig {
    /// Load configuration from file and environment.
    ///
    /// With `path` the file is required; otherwise `zoo-worker.toml` in the
    /// working directory is read if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let config: WorkerConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(WorkerError::ConfigError("server.port cannot be 0".into()));
        }
        if self.server.transport == TransportKind::Both && self.server.port == self.server.rpc_port {
            return Err(WorkerError::ConfigError(
                "server.port and server.rpc_port must differ when running both transports".into(),
            ));
        }
        if self.rpc.workers == 0 {
            return Err(WorkerError::ConfigError("rpc.workers must be at least 1".into()));
        }
        if self.allocator.max_port_attempts == 0 {
            return Err(WorkerError::ConfigError(
                "allocator.max_port_attempts must be at least 1".into(),
            ));
        }
        if self.agent.program.trim().is_empty() {
            return Err(WorkerError::ConfigError("agent.program cannot be empty".into()));
        }
        self.server.listen_addr()?;
        Ok(())
    }

    /// Configured auth key with empty normalised to `None`
    pub fn effective_auth_key(&self) -> Option<&str> {
        self.auth_key.as_deref().filter(|key| !key.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.server.port, 7432);
        assert_eq!(config.server.transport, TransportKind::Rpc);
        assert_eq!(config.rpc.workers, 3);
        assert!(config.effective_auth_key().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_auth_key_is_unauthenticated() {
        let config = WorkerConfig {
            auth_key: Some(String::new()),
            ..Default::default()
        };
        assert!(config.effective_auth_key().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = WorkerConfig::default();
        config.rpc.workers = 0;
        assert!(matches!(config.validate(), Err(WorkerError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_shared_port_for_both() {
        let mut config = WorkerConfig::default();
        config.server.transport = TransportKind::Both;
        config.server.rpc_port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
auth_key = "secret"

[server]
port = 9100
transport = "listener"

[agent]
program = "python3"
args = ["run_agent.py"]
"#
        )
        .unwrap();

        let config = WorkerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.transport, TransportKind::Listener);
        assert_eq!(config.effective_auth_key(), Some("secret"));
        assert_eq!(config.agent.args, vec!["run_agent.py".to_string()]);
        // untouched sections keep their defaults
        assert_eq!(config.rpc.workers, 3);
    }

    #[test]
    fn test_rpc_addr_for_both() {
        let mut config = WorkerConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.transport = TransportKind::Both;
        assert_eq!(config.server.rpc_addr().unwrap().port(), DEFAULT_RPC_PORT);
        config.server.transport = TransportKind::Rpc;
        assert_eq!(config.server.rpc_addr().unwrap().port(), DEFAULT_PORT);
    }
}
