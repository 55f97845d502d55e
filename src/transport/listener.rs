// src/transport/listener.rs
//! Authenticated single-connection listener
//!
//! Serves one connection at a time:
//!
//! ```text
//! WaitingForConnection ──accept──▶ Serving ──peer closed / error──▶ Closing
//!          ▲                                                          │
//!          └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The first frame on a connection carries the auth key; every later frame
//! is one allocation request answered by one response. A malformed request
//! is answered with an error and the connection keeps going. On shutdown
//! the registry is drained before the listening socket is dropped.

use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::messages::{AllocationRequest, AllocationRequestMessage, AllocationResponse};
use crate::transport::frame::{self, ConnectionHello, JsonFramed};
use crate::utils::errors::{Result, WorkerError};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    WaitingForConnection,
    Serving,
    Closing,
}

/// Single-connection listener
pub struct SingleConnectionListener {
    listener: TcpListener,
    dispatcher: Dispatcher,
    state: watch::Sender<ListenerState>,
}

impl SingleConnectionListener {
    /// Bind the listening socket; failure here aborts startup
    pub async fn bind(addr: SocketAddr, dispatcher: Dispatcher) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WorkerError::TransportError(format!("failed to bind {}: {}", addr, e)))?;

        let (state, _) = watch::channel(ListenerState::WaitingForConnection);

        Ok(Self {
            listener,
            dispatcher,
            state,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Watch the listener's state
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Serve until `shutdown` is cancelled, then drain the registry
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Listener accepting connections on {}", addr);

        loop {
            self.state.send_replace(ListenerState::WaitingForConnection);

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            debug!("Accepted connection from {}", peer);
            self.state.send_replace(ListenerState::Serving);

            if let Err(e) = self.serve_connection(stream, peer, &shutdown).await {
                warn!("Connection from {} ended with error: {}", peer, e);
            }

            self.state.send_replace(ListenerState::Closing);
            debug!("Closed connection from {}", peer);
        }

        self.state.send_replace(ListenerState::Closing);
        info!("Listener on {} stopping", addr);

        self.dispatcher.supervisor().drain_and_kill().await;
        drop(self.listener);

        info!("Listener on {} stopped", addr);
        Ok(())
    }

    async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut framed = frame::framed(stream);

        let Some(connection_key) = self.authenticate(&mut framed, peer, shutdown).await? else {
            return Ok(());
        };

        loop {
            // only the wait for the next request is cancellable
            let frame = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                frame = frame::recv_frame(&mut framed) => frame?,
            };

            let Some(frame) = frame else {
                return Ok(());
            };

            let response = match serde_json::from_slice::<AllocationRequestMessage>(&frame) {
                Ok(message) => {
                    debug!("Received request {:?} from {}", message.role, peer);
                    let mut request = AllocationRequest::from(message);
                    if request.auth_key.is_none() {
                        request.auth_key = connection_key.clone();
                    }
                    AllocationResponse::from(self.dispatcher.handle(request).await)
                }
                Err(e) => {
                    warn!("Malformed request from {}: {}", peer, e);
                    AllocationResponse::error("malformed request")
                }
            };

            debug!("Responding to {} with {:?}", peer, response);
            frame::send_json(&mut framed, &response).await?;
        }
    }

    /// Run the connection handshake.
    ///
    /// Returns the key the connection authenticated with, or `None` when the
    /// peer left or shutdown began first.
    async fn authenticate(
        &self,
        framed: &mut JsonFramed<TcpStream>,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) -> Result<Option<Option<Vec<u8>>>> {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            frame = frame::recv_frame(framed) => frame?,
        };

        let Some(frame) = frame else {
            return Ok(None);
        };

        let hello: ConnectionHello = match serde_json::from_slice(&frame) {
            Ok(hello) => hello,
            Err(e) => {
                frame::send_json(framed, &AllocationResponse::error("malformed request")).await?;
                return Err(e.into());
            }
        };

        let key = hello.auth_key.map(String::into_bytes);
        if let Err(e) = self.dispatcher.auth().verify(key.as_deref()) {
            warn!("Rejected connection from {}: bad auth key", peer);
            metrics::counter!("zoo_worker_auth_failures_total").increment(1);
            frame::send_json(framed, &AllocationResponse::error(e.client_message())).await?;
            return Err(e);
        }

        frame::send_json(framed, &AllocationResponse::ok()).await?;
        debug!("Authenticated connection from {}", peer);
        Ok(Some(key))
    }
}
