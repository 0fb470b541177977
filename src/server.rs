//! Gateway lifecycle and accept loop.
//!
//! [`Gateway::start`] binds the listener, spawns the backend and waits for it
//! to accept connections. [`Gateway::serve`] runs the accept loop until the
//! shutdown token fires, drains open connections and stops the backend.
//! The backend is stopped on every exit path of `serve`; a gateway dropped
//! without serving kills it through `kill_on_drop`.

use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Service, ServiceBuilder, ServiceExt};
use tracing::{debug, error, info, warn};

use crate::auth::{AuthGateway, AuthSetupError};
use crate::config::{GatewayConfig, ServerConfig};
use crate::error::BackendError;
use crate::forwarder::Forwarder;
use crate::gateway_service::GatewayService;
use crate::logging_layer::LoggingLayer;
use crate::supervisor::ProcessSupervisor;

/// Grace period for an individual connection after shutdown is requested.
const CONNECTION_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Fatal errors while bringing the gateway up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Auth(#[from] AuthSetupError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A started gateway: listener bound, backend spawned.
pub struct Gateway {
    listener: TcpListener,
    service: GatewayService,
    supervisor: Arc<ProcessSupervisor>,
    config: ServerConfig,
}

impl Gateway {
    /// Bind, spawn the backend and wait up to the startup timeout for it.
    ///
    /// A backend that fails to spawn is fatal. One that spawns but does not
    /// become ready in time is not: the gateway serves gateway errors until
    /// a later probe succeeds.
    pub async fn start(config: GatewayConfig) -> Result<Self, StartupError> {
        let auth = Arc::new(AuthGateway::from_config(&config)?);

        let listener = TcpListener::bind(config.server.listen)
            .await
            .map_err(|source| StartupError::Bind {
                addr: config.server.listen,
                source,
            })?;

        let supervisor = Arc::new(ProcessSupervisor::new(config.backend.clone()));
        let handle = supervisor.start().await?;
        info!(
            pid = ?handle.pid,
            backend = %handle.authority,
            startup_timeout = ?config.backend.startup_timeout,
            "Waiting for backend to become ready"
        );
        if supervisor.probe_ready(config.backend.startup_timeout).await {
            info!(backend = %handle.authority, "Backend ready");
        } else {
            warn!(
                backend = %handle.authority,
                state = %supervisor.state(),
                "Backend not ready after startup timeout; requests will fail until it recovers"
            );
        }

        let forwarder = Forwarder::new(
            Arc::clone(&supervisor),
            config.forward.clone(),
            config.session.cookie_name.clone(),
        );
        let service = GatewayService::new(auth, forwarder);

        Ok(Self {
            listener,
            service,
            supervisor,
            config: config.server,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Serve until `shutdown` is cancelled, then drain and stop the backend.
    pub async fn serve(self, shutdown: CancellationToken) {
        let Gateway {
            listener,
            service,
            supervisor,
            config,
        } = self;

        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            max_connections = config.max_connections,
            "AuthGate listening"
        );

        let service_stack = ServiceBuilder::new().layer(LoggingLayer).service(service);
        let semaphore = Arc::new(Semaphore::new(config.max_connections));
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                        warn!(
                            peer = %peer_addr,
                            max_connections = config.max_connections,
                            "Rejected connection: connection limit reached"
                        );
                        tokio::spawn(async move {
                            let _ = send_503_response(stream).await;
                        });
                        continue;
                    };

                    if let Err(e) = configure_tcp_stream(&stream, &config) {
                        debug!(error = %e, "Failed to configure socket");
                    }

                    let service_stack = service_stack.clone();
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        handle_connection(stream, peer_addr, service_stack, shutdown).await;
                        drop(permit);
                    });
                }

                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping new connections");
                    break;
                }
            }
        }

        drop(listener);
        tracker.close();
        info!(
            active_connections = tracker.len(),
            timeout = ?config.shutdown_timeout,
            "Waiting for active connections to drain"
        );
        if tokio::time::timeout(config.shutdown_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                active_connections = tracker.len(),
                "Shutdown timeout reached, forcing exit"
            );
        } else {
            info!("All connections drained");
        }

        supervisor.terminate().await;
        info!("AuthGate stopped");
    }
}

/// Serve HTTP/1 or HTTP/2 on one accepted connection.
async fn handle_connection<S>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    shutdown: CancellationToken,
) where
    S: Service<
            Request<Incoming>,
            Response = hyper::Response<crate::forwarder::GatewayBody>,
            Error = std::convert::Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let io = TokioIo::new(stream);
    let svc_fn = hyper::service::service_fn(move |req| service.clone().oneshot(req));

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            debug!(peer = %peer_addr, "Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(CONNECTION_CLOSE_GRACE, conn).await;
        }
    }
}

/// Apply socket options to an accepted connection.
fn configure_tcp_stream(stream: &TcpStream, config: &ServerConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(config.tcp_keepalive);
    socket.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Answer a connection over the limit without handing it to hyper.
async fn send_503_response(mut stream: TcpStream) -> std::io::Result<()> {
    let body = "503 Service Unavailable\n\n\
                The gateway has reached its connection limit.\n\
                Please retry your request in a moment.";
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         Retry-After: 1\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
