// src/main.rs
//! Zoo Worker
//!
//! Listens for requests to allocate agents and runs them on demand. Every
//! agent is killed and reaped before the worker exits.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use zoo_worker::dispatch::{AuthContext, Dispatcher};
use zoo_worker::grpc::RpcService;
use zoo_worker::observability::{init_metrics, init_tracing};
use zoo_worker::runtime::supervisor::wait_for_signal;
use zoo_worker::runtime::{ProcessGroupGuard, ProcessManager, Registry, ResourceAllocator};
use zoo_worker::transport::SingleConnectionListener;
use zoo_worker::utils::config::{TransportKind, WorkerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "zoo-worker",
    version,
    about = "Listens for requests to allocate agents and executes them on-demand"
)]
struct Cli {
    /// Configuration file (defaults to ./zoo-worker.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Authentication key callers and agents must present
    #[arg(long = "auth-key", alias = "auth_key", env = "ZOO_WORKER_AUTH_KEY")]
    auth_key: Option<String>,

    /// Front end(s) to expose
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    /// Lead a new process group and SIGKILL the whole group on exit.
    ///
    /// Agents then join that group, so a group kill sent by an outer
    /// runner to the worker's original group no longer reaches them. Use
    /// only when nothing outside signals the worker by group.
    #[arg(long)]
    own_process_group: bool,
}

impl Cli {
    fn apply(&self, config: &mut WorkerConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(auth_key) = &self.auth_key {
            config.auth_key = Some(auth_key.clone());
        }
        if let Some(transport) = self.transport {
            config.server.transport = transport;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = WorkerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    info!("Starting Zoo Worker v{}", env!("CARGO_PKG_VERSION"));

    // Dropped last: takes every process in the group down with it.
    let _group = if cli.own_process_group {
        Some(ProcessGroupGuard::lead().context("failed to create process group")?)
    } else {
        None
    };

    let allocator = ResourceAllocator::new(&config.allocator)?;
    let spawner = ProcessManager::new(config.agent.clone().into());
    let auth = AuthContext::new(config.effective_auth_key());
    if !auth.is_configured() {
        info!("No auth key configured, accepting unauthenticated requests");
    }
    let dispatcher = Dispatcher::new(Registry::new(allocator), spawner, auth);

    // Binding is the only fatal failure.
    let transport = config.server.transport;
    let listener = match transport {
        TransportKind::Listener | TransportKind::Both => Some(
            SingleConnectionListener::bind(config.server.listen_addr()?, dispatcher.clone())
                .await
                .context("failed to start listener")?,
        ),
        TransportKind::Rpc => None,
    };
    let rpc = match transport {
        TransportKind::Rpc | TransportKind::Both => Some(
            RpcService::bind(config.server.rpc_addr()?, dispatcher.clone(), &config.rpc)
                .await
                .context("failed to start RPC service")?,
        ),
        TransportKind::Listener => None,
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(name) => info!("Received {}, shutting down", name),
                Err(e) => error!("Failed to listen for signals, shutting down: {}", e),
            }
            shutdown.cancel();
        });
    }

    let (listener_result, rpc_result) = tokio::join!(
        async {
            let Some(listener) = listener else {
                return Ok(());
            };
            let result = listener.run(shutdown.clone()).await;
            // a transport that ends takes the other one down too
            shutdown.cancel();
            result
        },
        async {
            let Some(rpc) = rpc else {
                return Ok(());
            };
            let result = rpc.run(shutdown.clone()).await;
            shutdown.cancel();
            result
        }
    );

    dispatcher.supervisor().drain_and_kill().await;

    listener_result?;
    rpc_result?;

    info!("Zoo Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_own_process_group_is_opt_in() {
        let cli = Cli::parse_from(["zoo-worker"]);
        assert!(!cli.own_process_group);

        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("no longer reaches them"));
    }
}
