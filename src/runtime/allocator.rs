// src/runtime/allocator.rs
//! Free-resource allocator
//!
//! Finds an unbound TCP port for networked agents or builds a fresh socket
//! path for local agents. The allocator itself is stateless; the set of
//! resources already handed out lives in the registry and is passed in, so
//! allocation always happens under the registry lock.

use crate::utils::config::AllocatorConfig;
use crate::utils::errors::{Result, WorkerError};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use tracing::{debug, trace};
use ulid::Ulid;

const MAX_SOCKET_PATH_ATTEMPTS: u32 = 16;

/// Free-resource allocator
#[derive(Debug, Clone)]
pub struct ResourceAllocator {
    bind_ip: IpAddr,
    max_port_attempts: u32,
    socket_dir: PathBuf,
}

impl ResourceAllocator {
    /// Create an allocator from configuration
    pub fn new(config: &AllocatorConfig) -> Result<Self> {
        let bind_ip = config.bind_host.parse().map_err(|e| {
            WorkerError::ConfigError(format!(
                "invalid allocator.bind_host '{}': {}",
                config.bind_host, e
            ))
        })?;

        Ok(Self {
            bind_ip,
            max_port_attempts: config.max_port_attempts,
            socket_dir: config.socket_dir.clone(),
        })
    }

    pub fn socket_dir(&self) -> &PathBuf {
        &self.socket_dir
    }

    /// Find a port that is unbound right now and not in `reserved`.
    ///
    /// The probe socket is released before returning; the caller keeps the
    /// port in its reserved set until the agent is gone.
    pub fn allocate_port(&self, reserved: &HashSet<u16>) -> Result<u16> {
        for attempt in 1..=self.max_port_attempts {
            let listener = match TcpListener::bind(SocketAddr::new(self.bind_ip, 0)) {
                Ok(listener) => listener,
                Err(e) => {
                    trace!("Port probe {} failed to bind: {}", attempt, e);
                    continue;
                }
            };

            let port = match listener.local_addr() {
                Ok(addr) => addr.port(),
                Err(e) => {
                    trace!("Port probe {} has no local address: {}", attempt, e);
                    continue;
                }
            };

            if reserved.contains(&port) {
                trace!("Port {} already reserved, probing again", port);
                continue;
            }

            debug!("Allocated port {} after {} probe(s)", port, attempt);
            return Ok(port);
        }

        Err(WorkerError::ResourceExhausted(format!(
            "no free port found after {} attempts",
            self.max_port_attempts
        )))
    }

    /// Build a socket path unique among `reserved` and the filesystem
    pub fn allocate_socket_path(&self, reserved: &HashSet<String>) -> Result<String> {
        std::fs::create_dir_all(&self.socket_dir).map_err(|e| {
            WorkerError::ResourceExhausted(format!(
                "cannot create socket directory {:?}: {}",
                self.socket_dir, e
            ))
        })?;

        for _ in 0..MAX_SOCKET_PATH_ATTEMPTS {
            let path = self
                .socket_dir
                .join(format!("agent-{}.sock", Ulid::new().to_string().to_lowercase()));

            if path.exists() {
                continue;
            }

            let path = path.to_string_lossy().into_owned();
            if reserved.contains(&path) {
                continue;
            }

            debug!("Allocated socket path {}", path);
            return Ok(path);
        }

        Err(WorkerError::ResourceExhausted(format!(
            "no unique socket path available in {:?}",
            self.socket_dir
        )))
    }
}

impl Default for ResourceAllocator {
    fn default() -> Self {
        let config = AllocatorConfig::default();
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_port_attempts: config.max_port_attempts,
            socket_dir: config.socket_dir,
        }
    }
}
