//! HTTP ingress server.

use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::error::ServerError;
use crate::handler::IngressHandler;
use crate::http::{text_response, HttpResponse};
use crate::metrics::Metrics;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use walbuf_wal::Wal;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest request body read into memory.
    pub max_body_bytes: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 1000,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Sets the connection limit.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the request body limit.
    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
}

/// HTTP server accepting writes into the WAL.
pub struct Server {
    config: ServerConfig,
    handler: Arc<IngressHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, wal: Arc<Wal>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handler = IngressHandler::new(wal).with_max_body_bytes(config.max_body_bytes);
        if let Some(ref metrics) = config.metrics {
            handler = handler.with_metrics(metrics.clone());
        }
        Self {
            config,
            handler: Arc::new(handler),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    ///
    /// In-flight requests are allowed to finish before this returns.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Ingress listening on http://{}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(ref metrics) = self.config.metrics {
                                metrics.connections_active.inc();
                            }

                            let handler = self.handler.clone();
                            let stats = self.stats.clone();
                            let metrics = self.config.metrics.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            connections.spawn(async move {
                                Self::handle_connection(stream, addr, handler, conn_shutdown).await;

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(ref metrics) = metrics {
                                    metrics.connections_active.dec();
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    tracing::info!("Ingress shutting down, draining {} connection(s)", connections.len());
                    break;
                }
            }
        }

        while connections.join_next().await.is_some() {}

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Serves HTTP/1.1 on one connection, finishing the current request on shutdown.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        handler: Arc<IngressHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::debug!("Client connected: {}", addr);

        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(Self::dispatch(req, &handler).await) }
        });
        let conn = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };

        if let Err(e) = result {
            if !e.is_incomplete_message() {
                tracing::debug!("Connection {} error: {}", addr, e);
            }
        }
        tracing::debug!("Client disconnected: {}", addr);
    }

    /// Collects the request body, up to the configured limit, and hands the
    /// request to the ingress handler.
    async fn dispatch(req: Request<Incoming>, handler: &IngressHandler) -> HttpResponse {
        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, handler.max_body_bytes()).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => return handler.reject_oversized(&parts.uri),
            Err(e) => {
                tracing::debug!("Failed to read request body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "Invalid payload");
            }
        };
        handler.handle(&parts.method, &parts.uri, body).await
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver notified when shutdown starts, for auxiliary listeners.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
