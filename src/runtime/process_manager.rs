// src/runtime/process_manager.rs
//! Process manager for spawning and reaping agent processes
//!
//! Every agent is a separate OS process started from the configured entry
//! point. Startup parameters travel on the command line:
//! - networked agents: `--port <N> --auth_key <KEY>`
//! - local agents: `--socket_file <PATH> --auth_key <KEY>`

use crate::dispatch::messages::{AgentRole, ResourceDescriptor};
use crate::utils::config::AgentConfig;
use crate::utils::errors::{Result, WorkerError};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Configuration for spawning agent processes
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Agent entry point
    pub program: String,

    /// Arguments placed before the startup parameters
    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<PathBuf>,

    /// Extra environment variables
    pub env_vars: Vec<(String, String)>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        AgentConfig::default().into()
    }
}

impl From<AgentConfig> for SpawnConfig {
    fn from(config: AgentConfig) -> Self {
        Self {
            program: config.program,
            args: config.args,
            work_dir: None,
            env_vars: vec![],
        }
    }
}

/// A freshly started agent process, not yet registered
#[derive(Debug)]
pub struct SpawnedAgent {
    pub child: Child,
    pub pid: u32,
    pub role: AgentRole,
    pub resource: ResourceDescriptor,
    pub started_at: DateTime<Utc>,
}

/// Process manager for spawning agent processes
#[derive(Debug, Clone)]
pub struct ProcessManager {
    config: SpawnConfig,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }

    /// Locate the agent executable.
    ///
    /// Not cached: a missing binary may be installed while the worker runs.
    fn find_executable(&self) -> Result<PathBuf> {
        let program = &self.config.program;

        if program.contains(std::path::MAIN_SEPARATOR) {
            let path = PathBuf::from(program);
            return if path.is_file() {
                Ok(path)
            } else {
                Err(WorkerError::SpawnFailure(format!(
                    "executable '{}' does not exist",
                    program
                )))
            };
        }

        which::which(program).map_err(|e| {
            WorkerError::SpawnFailure(format!("executable '{}' not found in PATH: {}", program, e))
        })
    }

    /// Startup parameters for one agent
    fn startup_args(resource: &ResourceDescriptor, auth_key: &str) -> Vec<String> {
        let mut args = match resource {
            ResourceDescriptor::Port(port) => vec!["--port".to_string(), port.to_string()],
            ResourceDescriptor::SocketPath(path) => vec!["--socket_file".to_string(), path.clone()],
        };
        args.push("--auth_key".to_string());
        args.push(auth_key.to_string());
        args
    }

    /// Spawn one agent bound to `resource`
    pub fn spawn(
        &self,
        role: AgentRole,
        resource: ResourceDescriptor,
        auth_key: &str,
    ) -> Result<SpawnedAgent> {
        let executable = self.find_executable()?;

        debug!("Spawning {} agent {:?} on {}", role.label(), executable, resource);

        let mut command = Command::new(&executable);
        command
            .args(&self.config.args)
            .args(Self::startup_args(&resource, auth_key));

        if let Some(work_dir) = &self.config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &self.config.env_vars {
            command.env(key, value);
        }

        // Agents stay in our process group so an outer group kill reaches them.
        command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| WorkerError::SpawnFailure(format!("{:?}: {}", executable, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| WorkerError::SpawnFailure("agent exited before reporting a PID".into()))?;

        info!("Spawned {} agent PID {} on {}", role.label(), pid, resource);

        Ok(SpawnedAgent {
            child,
            pid,
            role,
            resource,
            started_at: Utc::now(),
        })
    }

    /// Check if a process is running
    pub fn is_running(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(SpawnConfig::default())
    }
}

/// SIGKILL a child and reap it.
///
/// A child that already exited is only reaped; that is not an error.
pub async fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        debug!("Agent had already exited with {}", status);
        return Ok(status);
    }

    if let Err(e) = child.start_kill() {
        warn!("Failed to signal agent, waiting for it anyway: {}", e);
    }

    let status = child.wait().await?;
    debug!("Agent reaped with {}", status);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper() -> ProcessManager {
        ProcessManager::new(SpawnConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "exec sleep 30".into(), "zoo-agent".into()],
            ..Default::default()
        })
    }

    #[test]
    fn test_startup_args() {
        assert_eq!(
            ProcessManager::startup_args(&ResourceDescriptor::Port(4000), "k"),
            vec!["--port", "4000", "--auth_key", "k"]
        );
        assert_eq!(
            ProcessManager::startup_args(&ResourceDescriptor::SocketPath("/tmp/a.sock".into()), ""),
            vec!["--socket_file", "/tmp/a.sock", "--auth_key", ""]
        );
    }

    #[test]
    fn test_find_executable() {
        assert!(sleeper().find_executable().is_ok());
    }

    #[tokio::test]
    async fn test_spawn_and_kill() {
        let manager = sleeper();
        let mut agent = manager
            .spawn(AgentRole::NetworkedAgent, ResourceDescriptor::Port(4001), "key")
            .unwrap();

        assert!(agent.pid > 0);
        assert!(ProcessManager::is_running(agent.pid));

        let status = kill_and_reap(&mut agent.child).await.unwrap();
        assert!(!status.success());
        assert!(!ProcessManager::is_running(agent.pid));
    }

    #[tokio::test]
    async fn test_kill_already_exited_child() {
        let manager = ProcessManager::new(SpawnConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 0".into(), "zoo-agent".into()],
            ..Default::default()
        });
        let mut agent = manager
            .spawn(AgentRole::LocalAgent, ResourceDescriptor::SocketPath("/tmp/x.sock".into()), "")
            .unwrap();

        agent.child.wait().await.unwrap();
        let status = kill_and_reap(&mut agent.child).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let manager = ProcessManager::new(SpawnConfig {
            program: "zoo-agent-that-does-not-exist-12345".into(),
            ..Default::default()
        });
        let result = manager.spawn(AgentRole::NetworkedAgent, ResourceDescriptor::Port(4002), "");
        assert!(matches!(result, Err(WorkerError::SpawnFailure(_))));
    }

    #[tokio::test]
    async fn test_spawn_missing_absolute_path() {
        let manager = ProcessManager::new(SpawnConfig {
            program: "/nonexistent/bin/zoo-agent".into(),
            ..Default::default()
        });
        let result = manager.spawn(AgentRole::NetworkedAgent, ResourceDescriptor::Port(4003), "");
        assert!(matches!(result, Err(WorkerError::SpawnFailure(_))));
    }
}
