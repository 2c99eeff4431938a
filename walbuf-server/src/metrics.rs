//! Prometheus metrics for the walbuf server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use crate::http::{text_response, HttpResponse};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Append duration histogram buckets (in seconds). Appends fsync, so the
/// interesting range starts around a tenth of a millisecond.
const DURATION_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0,
];

/// Prometheus metrics for the walbuf server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// HTTP requests by route and status code.
    pub requests_total: CounterVec,
    /// Failed appends by error kind.
    pub append_errors_total: CounterVec,
    /// Time spent inside the WAL append, lock wait included.
    pub append_duration: Histogram,
    /// Records acknowledged.
    pub records_appended_total: Counter,
    /// Segment currently being written.
    pub current_segment: Gauge,
    /// Segment rotations triggered by appends.
    pub rotations_total: Counter,
    /// Currently open ingress connections.
    pub connections_active: Gauge,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("walbuf_requests_total", "HTTP requests by route and status"),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let append_errors_total = CounterVec::new(
            Opts::new("walbuf_append_errors_total", "Failed appends by error kind"),
            &["kind"],
        )?;
        registry.register(Box::new(append_errors_total.clone()))?;

        let append_duration = Histogram::with_opts(
            HistogramOpts::new(
                "walbuf_append_duration_seconds",
                "WAL append duration in seconds, including lock wait",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let records_appended_total = Counter::with_opts(Opts::new(
            "walbuf_records_appended_total",
            "Records durably appended",
        ))?;
        registry.register(Box::new(records_appended_total.clone()))?;

        let current_segment = Gauge::with_opts(Opts::new(
            "walbuf_current_segment",
            "Index of the segment currently being written",
        ))?;
        registry.register(Box::new(current_segment.clone()))?;

        let rotations_total = Counter::with_opts(Opts::new(
            "walbuf_rotations_total",
            "Segment rotations",
        ))?;
        registry.register(Box::new(rotations_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "walbuf_connections_active",
            "Number of currently active ingress connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            append_errors_total,
            append_duration,
            records_appended_total,
            current_segment,
            rotations_total,
            connections_active,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { Ok::<_, Infallible>(handle_request(req, &metrics)) }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Handles an HTTP request to the metrics server.
fn handle_request<B>(req: Request<B>, metrics: &Metrics) -> HttpResponse {
    match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = Response::new(Full::new(Bytes::from(body)));
                response.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static(
                        "text/plain; version=0.0.4; charset=utf-8",
                    ),
                );
                response
            }
            Err(e) => {
                tracing::error!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
            }
        },
        "/health" | "/healthz" => text_response(StatusCode::OK, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}
