// src/grpc/server.rs
//! Concurrent gRPC front end
//!
//! Many clients may call `Allocate` at once; a semaphore bounds how many
//! dispatches run together. `Stop` (or the shared cancellation token)
//! moves the service through
//!
//! ```text
//! Starting ─▶ Serving ─▶ Stopping ─▶ Stopped
//! ```
//!
//! The registry is drained as soon as stopping begins, while the listening
//! socket is still open. In-flight calls then get a grace period to finish.

use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::messages::{AllocationRequest, AllocationResult, ResourceDescriptor};
use crate::grpc::proto::agent_worker_server::{AgentWorker, AgentWorkerServer};
use crate::grpc::proto::{allocate_response, AllocateRequest, AllocateResponse, StopRequest, StopResponse};
use crate::utils::config::RpcConfig;
use crate::utils::errors::{Result, WorkerError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// RPC service lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Serving,
    Stopping,
    Stopped,
}

impl From<AllocationResult> for AllocateResponse {
    fn from(result: AllocationResult) -> Self {
        match result {
            AllocationResult::Success { resource } => {
                let resource = match resource {
                    ResourceDescriptor::Port(port) => allocate_response::Resource::Port(port.into()),
                    ResourceDescriptor::SocketPath(path) => {
                        allocate_response::Resource::SocketFile(path)
                    }
                };
                AllocateResponse {
                    result: "success".to_string(),
                    msg: None,
                    resource: Some(resource),
                }
            }
            AllocationResult::Failure { message } => AllocateResponse {
                result: "error".to_string(),
                msg: Some(message),
                resource: None,
            },
        }
    }
}

impl From<AllocateResponse> for AllocationResult {
    fn from(response: AllocateResponse) -> Self {
        if response.result != "success" {
            return AllocationResult::Failure {
                message: response.msg.unwrap_or_default(),
            };
        }

        match response.resource {
            Some(allocate_response::Resource::Port(port)) => match u16::try_from(port) {
                Ok(port) => AllocationResult::Success {
                    resource: ResourceDescriptor::Port(port),
                },
                Err(_) => AllocationResult::Failure {
                    message: format!("port {} out of range", port),
                },
            },
            Some(allocate_response::Resource::SocketFile(path)) => AllocationResult::Success {
                resource: ResourceDescriptor::SocketPath(path),
            },
            None => AllocationResult::Failure {
                message: "success response without a resource".to_string(),
            },
        }
    }
}

/// gRPC handler shared by every connection
pub struct WorkerService {
    dispatcher: Dispatcher,
    permits: Arc<Semaphore>,
    stop: CancellationToken,
}

impl WorkerService {
    pub fn new(dispatcher: Dispatcher, workers: usize, stop: CancellationToken) -> Self {
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(workers)),
            stop,
        }
    }
}

#[tonic::async_trait]
impl AgentWorker for WorkerService {
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> std::result::Result<Response<AllocateResponse>, Status> {
        let peer = request.remote_addr();
        let message = request.into_inner();

        // wait for a free worker slot
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Status::unavailable("worker is stopping"))?;

        debug!("Allocate '{}' from {:?}", message.role, peer);

        // tonic drops this future when the caller goes away; the dispatch
        // runs on its own task so a started spawn always finishes
        let dispatcher = self.dispatcher.clone();
        let request = AllocationRequest::new(message.role, message.auth_key);
        let result = tokio::spawn(async move {
            let _permit = permit;
            dispatcher.handle(request).await
        })
        .await
        .map_err(|e| Status::internal(format!("allocation task failed: {}", e)))?;

        Ok(Response::new(result.into()))
    }

    async fn stop(
        &self,
        request: Request<StopRequest>,
    ) -> std::result::Result<Response<StopResponse>, Status> {
        let message = request.into_inner();

        if let Err(e) = self.dispatcher.auth().verify(message.auth_key.as_deref()) {
            warn!("Rejected stop request with a bad auth key");
            metrics::counter!("zoo_worker_auth_failures_total").increment(1);
            return Ok(Response::new(StopResponse {
                result: "error".to_string(),
                msg: Some(e.client_message()),
            }));
        }

        info!("Stop requested over RPC");
        self.stop.cancel();

        Ok(Response::new(StopResponse {
            result: "success".to_string(),
            msg: None,
        }))
    }
}

/// Concurrent RPC transport
pub struct RpcService {
    listener: TcpListener,
    dispatcher: Dispatcher,
    workers: usize,
    stop_grace: Duration,
    state: Arc<watch::Sender<ServiceState>>,
}

impl RpcService {
    /// Bind the service port; failure here aborts startup
    pub async fn bind(addr: SocketAddr, dispatcher: Dispatcher, config: &RpcConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WorkerError::TransportError(format!("failed to bind {}: {}", addr, e)))?;

        let (state, _) = watch::channel(ServiceState::Starting);

        Ok(Self {
            listener,
            dispatcher,
            workers: config.workers,
            stop_grace: config.stop_grace(),
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Serve until `shutdown` is cancelled (locally or through `Stop`)
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        let supervisor = self.dispatcher.supervisor();

        let service = WorkerService::new(self.dispatcher.clone(), self.workers, shutdown.clone());

        let signal = {
            let shutdown = shutdown.clone();
            let supervisor = supervisor.clone();
            let state = Arc::clone(&self.state);
            async move {
                shutdown.cancelled().await;
                state.send_replace(ServiceState::Stopping);
                info!("RPC service on {} stopping", addr);
                supervisor.drain_and_kill().await;
            }
        };

        let server = tonic::transport::Server::builder()
            .add_service(AgentWorkerServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(self.listener), signal);
        tokio::pin!(server);

        self.state.send_replace(ServiceState::Serving);
        info!("RPC service listening on {}", addr);

        let outcome = tokio::select! {
            outcome = &mut server => outcome,
            _ = shutdown.cancelled() => {
                match tokio::time::timeout(self.stop_grace, &mut server).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("In-flight calls did not finish within {:?}, abandoning them", self.stop_grace);
                        Ok(())
                    }
                }
            }
        };

        self.state.send_replace(ServiceState::Stopping);
        // also covers a server that failed before any stop was requested
        supervisor.drain_and_kill().await;
        self.state.send_replace(ServiceState::Stopped);
        info!("RPC service on {} stopped", addr);

        outcome.map_err(|e| WorkerError::TransportError(format!("RPC server failed: {}", e)))
    }
}
