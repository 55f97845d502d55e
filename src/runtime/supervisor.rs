// src/runtime/supervisor.rs
//! Shutdown supervisor
//!
//! Guarantees that no agent outlives the worker:
//! - `drain_and_kill` SIGKILLs and reaps every registered agent
//! - `ProcessGroupGuard` SIGKILLs a whole process group when dropped
//! - `wait_for_signal` resolves on SIGINT or SIGTERM

use crate::runtime::process_manager::kill_and_reap;
use crate::runtime::registry::Registry;
use crate::utils::errors::Result;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgrp, setpgid, Pid};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Drains the registry on shutdown
#[derive(Debug, Clone)]
pub struct ShutdownSupervisor {
    registry: Registry,
}

impl ShutdownSupervisor {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Kill and reap every registered agent, returning how many were drained.
    ///
    /// Holds the registry lock throughout, so an insert racing with the
    /// drain either lands before it (and is killed here) or sees the
    /// shutdown flag and kills its own agent. Calling it again is a no-op.
    pub async fn drain_and_kill(&self) -> usize {
        let mut state = self.registry.lock().await;

        if state.begin_shutdown() {
            info!("Draining {} agent process(es)", state.len());
        } else {
            debug!("Drain requested again, {} agent(s) left", state.len());
        }

        let mut drained = 0;
        for id in state.ids() {
            let Some(entry) = state.get_mut(id) else {
                continue;
            };

            let pid = entry.pid;
            match kill_and_reap(&mut entry.child).await {
                Ok(status) => debug!("Agent #{} (PID {}) terminated: {}", id, pid, status),
                // the process is gone either way; keep draining
                Err(e) => error!("Failed to reap agent #{} (PID {}): {}", id, pid, e),
            }

            state.remove_reaped(id);

            metrics::counter!("zoo_worker_agents_killed_total").increment(1);
            drained += 1;
        }

        if drained > 0 {
            info!("Drained {} agent process(es)", drained);
        }
        drained
    }
}

/// Wait for SIGINT or SIGTERM and return the signal name
pub async fn wait_for_signal() -> Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

/// Kills an entire process group when dropped.
///
/// Records the group id at creation; teardown happens on every exit path,
/// including unwinding.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pgid: Pid,
    armed: bool,
}

impl ProcessGroupGuard {
    /// Make the current process the leader of a new group and guard it.
    ///
    /// Dropping this guard kills the current process as well. Children
    /// spawned afterwards join the new group and leave the caller's original
    /// one, so group signals aimed at the old group miss them.
    pub fn lead() -> Result<Self> {
        setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(std::io::Error::from)?;
        let pgid = getpgrp();
        info!("Leading process group {}", pgid);
        Ok(Self { pgid, armed: true })
    }

    /// Guard an existing process group
    pub fn for_group(pgid: u32) -> Self {
        Self {
            pgid: Pid::from_raw(pgid as i32),
            armed: true,
        }
    }

    pub fn pgid(&self) -> u32 {
        self.pgid.as_raw() as u32
    }

    /// Release the group without killing it
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        debug!("Killing process group {}", self.pgid);
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(nix::errno::Errno::ESRCH) => debug!("Process group {} already gone", self.pgid),
            Err(e) => warn!("Failed to kill process group {}: {}", self.pgid, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::messages::AgentRole;
    use crate::runtime::allocator::ResourceAllocator;
    use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
    use crate::utils::config::AllocatorConfig;
    use std::os::unix::process::ExitStatusExt;

    async fn registry_with_agents(dir: &std::path::Path, count: usize) -> (Registry, Vec<u32>) {
        let allocator = ResourceAllocator::new(&AllocatorConfig {
            socket_dir: dir.to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let registry = Registry::new(allocator);
        let manager = ProcessManager::new(SpawnConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "exec sleep 30".into(), "zoo-agent".into()],
            ..Default::default()
        });

        let mut pids = vec![];
        for i in 0..count {
            let role = if i % 2 == 0 {
                AgentRole::NetworkedAgent
            } else {
                AgentRole::LocalAgent
            };
            let reservation = registry.reserve(role).await.unwrap();
            let agent = manager.spawn(role, reservation.resource.clone(), "").unwrap();
            pids.push(agent.pid);
            registry.insert(agent, reservation).await.unwrap();
        }
        (registry, pids)
    }

    #[tokio::test]
    async fn test_drain_kills_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, pids) = registry_with_agents(dir.path(), 4).await;
        let supervisor = ShutdownSupervisor::new(registry.clone());

        assert_eq!(supervisor.drain_and_kill().await, 4);
        assert!(registry.is_empty().await);
        assert_eq!(registry.reserved_count().await, 0);
        for pid in pids {
            assert!(!ProcessManager::is_running(pid), "PID {} survived the drain", pid);
        }
    }

    #[tokio::test]
    async fn test_drain_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry_with_agents(dir.path(), 2).await;
        let supervisor = ShutdownSupervisor::new(registry.clone());

        assert_eq!(supervisor.drain_and_kill().await, 2);
        assert_eq!(supervisor.drain_and_kill().await, 0);
        assert!(registry.is_shutting_down().await);
    }

    #[tokio::test]
    async fn test_drain_tolerates_dead_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, pids) = registry_with_agents(dir.path(), 1).await;

        // kill behind the registry's back
        nix::sys::signal::kill(Pid::from_raw(pids[0] as i32), Signal::SIGKILL).unwrap();

        let supervisor = ShutdownSupervisor::new(registry.clone());
        assert_eq!(supervisor.drain_and_kill().await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_process_group_guard_kills_group() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30 & exec sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = child.id().unwrap();

        let guard = ProcessGroupGuard::for_group(pgid);
        assert_eq!(guard.pgid(), pgid);
        drop(guard);

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_group() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "exec sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = child.id().unwrap();

        ProcessGroupGuard::for_group(pgid).disarm();
        assert!(child.try_wait().unwrap().is_none());

        child.kill().await.unwrap();
    }
}
