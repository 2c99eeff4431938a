//! Ingress request handling.
//!
//! Routes:
//! - `POST /write?topic=<name>` appends a JSON object to the WAL
//! - `GET /health` reports whether the WAL can accept writes

use crate::config::DEFAULT_MAX_BODY_BYTES;
use crate::http::{json_response, query_param, text_response, HttpResponse};
use crate::metrics::Metrics;
use bytes::Bytes;
use hyper::{Method, StatusCode, Uri};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use walbuf_wal::entry::topic_or_default;
use walbuf_wal::{AppendOutcome, Wal, WalError};

const WRITE_ROUTE: &str = "/write";
const HEALTH_ROUTE: &str = "/health";

const WRITE_OK_MESSAGE: &str = "Log entry written successfully";

/// Body of a successful write.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponse<'a> {
    offset: u64,
    segment: u64,
    topic: &'a str,
    payload: &'a Map<String, Value>,
    message: &'static str,
    /// Path of the segment the record went to.
    file_size: String,
}

/// Handles ingress requests against a shared WAL.
pub struct IngressHandler {
    wal: Arc<Wal>,
    metrics: Option<Arc<Metrics>>,
    max_body_bytes: usize,
}

impl IngressHandler {
    /// Creates a new ingress handler.
    pub fn new(wal: Arc<Wal>) -> Self {
        Self {
            wal,
            metrics: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Sets the largest request body accepted.
    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    /// Returns the largest request body accepted.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        metrics.current_segment.set(self.wal.current_segment() as f64);
        self.metrics = Some(metrics);
        self
    }

    /// Returns the WAL this handler writes to.
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Dispatches a request whose body has already been collected.
    pub async fn handle(&self, method: &Method, uri: &Uri, body: Bytes) -> HttpResponse {
        let response = match uri.path() {
            WRITE_ROUTE if method == Method::POST => self.handle_write(uri, body).await,
            WRITE_ROUTE => text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
            HEALTH_ROUTE if method == Method::GET => self.handle_health(),
            HEALTH_ROUTE => text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"),
            _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
        };
        self.record_request(uri, response)
    }

    /// Answers a request whose body outgrew the limit while being read.
    pub fn reject_oversized(&self, uri: &Uri) -> HttpResponse {
        tracing::debug!(
            "Rejected request to {}: body exceeds {} bytes",
            uri.path(),
            self.max_body_bytes
        );
        self.record_request(uri, payload_too_large())
    }

    fn record_request(&self, uri: &Uri, response: HttpResponse) -> HttpResponse {
        if let Some(ref metrics) = self.metrics {
            let route = match uri.path() {
                route @ (WRITE_ROUTE | HEALTH_ROUTE) => route,
                _ => "other",
            };
            metrics
                .requests_total
                .with_label_values(&[route, response.status().as_str()])
                .inc();
        }
        response
    }

    async fn handle_write(&self, uri: &Uri, body: Bytes) -> HttpResponse {
        if body.len() > self.max_body_bytes {
            tracing::debug!(
                "Rejected write: {} byte body exceeds {} bytes",
                body.len(),
                self.max_body_bytes
            );
            return payload_too_large();
        }

        let payload = match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(payload)) => payload,
            Ok(other) => {
                tracing::debug!("Rejected write: body is not an object: {}", other);
                return text_response(StatusCode::BAD_REQUEST, "Invalid payload");
            }
            Err(e) => {
                tracing::debug!("Rejected write: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "Invalid payload");
            }
        };
        let topic = topic_or_default(query_param(uri.query(), "topic").as_deref()).to_string();

        // Append blocks on fsync; keep it off the async workers.
        let wal = self.wal.clone();
        let started = Instant::now();
        let joined = tokio::task::spawn_blocking(move || {
            let result = wal.append(&topic, &payload);
            (topic, payload, result)
        })
        .await;
        let elapsed = started.elapsed();
        self.update_segment_gauge();

        let (topic, payload, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!("Append task failed: {}", e);
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to write log");
            }
        };

        match result {
            Ok(outcome) => {
                self.record_success(&outcome, elapsed.as_secs_f64());
                tracing::debug!(
                    "Wrote offset {} to segment {} (topic '{}')",
                    outcome.offset,
                    outcome.segment,
                    topic
                );
                json_response(
                    StatusCode::CREATED,
                    &WriteResponse {
                        offset: outcome.offset,
                        segment: outcome.segment,
                        topic: &topic,
                        payload: &payload,
                        message: WRITE_OK_MESSAGE,
                        file_size: outcome.path.display().to_string(),
                    },
                )
            }
            Err(e) => {
                self.record_failure(&e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to write log")
            }
        }
    }

    fn handle_health(&self) -> HttpResponse {
        if self.wal.is_closed() {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "Closed")
        } else if self.wal.is_degraded() {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "Degraded")
        } else {
            text_response(StatusCode::OK, "OK")
        }
    }

    /// Mirrors the engine's writable segment, which can move on a failed
    /// append too (a degraded writer reopening).
    fn update_segment_gauge(&self) {
        if let Some(ref metrics) = self.metrics {
            metrics.current_segment.set(self.wal.current_segment() as f64);
        }
    }

    fn record_success(&self, outcome: &AppendOutcome, seconds: f64) {
        if let Some(ref metrics) = self.metrics {
            metrics.records_appended_total.inc();
            metrics.append_duration.observe(seconds);
            if outcome.rotated {
                metrics.rotations_total.inc();
            }
        }
    }

    fn record_failure(&self, error: &WalError) {
        match error.committed_offset() {
            Some(offset) => tracing::error!(
                "Offset {} is durable but the write is reported failed ({}): {}",
                offset,
                error.kind(),
                error
            ),
            None => tracing::error!("Failed to write log ({}): {}", error.kind(), error),
        }

        if let Some(ref metrics) = self.metrics {
            metrics
                .append_errors_total
                .with_label_values(&[error.kind()])
                .inc();
            if error.committed_offset().is_some() {
                metrics.records_appended_total.inc();
            }
        }
    }
}

fn payload_too_large() -> HttpResponse {
    text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tempfile::TempDir;
    use walbuf_wal::WalConfig;

    fn test_handler(segment_size: u64) -> (TempDir, IngressHandler, Arc<Metrics>) {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(WalConfig::new(dir.path().join("wal_data")).with_segment_size(segment_size))
            .unwrap();
        let metrics = Arc::new(Metrics::new().unwrap());
        let handler = IngressHandler::new(Arc::new(wal)).with_metrics(metrics.clone());
        (dir, handler, metrics)
    }

    async fn body_bytes(response: HttpResponse) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    async fn post(handler: &IngressHandler, uri: &str, body: &str) -> HttpResponse {
        let uri: Uri = uri.parse().unwrap();
        handler
            .handle(&Method::POST, &uri, Bytes::from(body.to_string()))
            .await
    }

    #[tokio::test]
    async fn test_write_created() {
        let (dir, handler, _metrics) = test_handler(4096);

        let response = post(&handler, "/write?topic=orders", r#"{"id":1}"#).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["content-type"], "application/json");

        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["offset"], 1);
        assert_eq!(body["segment"], 1);
        assert_eq!(body["topic"], "orders");
        assert_eq!(body["payload"], json!({"id": 1}));
        assert_eq!(body["message"], WRITE_OK_MESSAGE);
        let expected_path = dir.path().join("wal_data").join("wal_1.log");
        assert_eq!(body["fileSize"], expected_path.display().to_string());

        let response = post(&handler, "/write?topic=orders", r#"{"id":2}"#).await;
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["offset"], 2);
        assert_eq!(body["segment"], 1);
    }

    #[tokio::test]
    async fn test_write_default_topic() {
        let (_dir, handler, _metrics) = test_handler(4096);

        for uri in ["/write", "/write?topic="] {
            let response = post(&handler, uri, r#"{"k":"v"}"#).await;
            assert_eq!(response.status(), StatusCode::CREATED);
            let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
            assert_eq!(body["topic"], "default");
        }
    }

    #[tokio::test]
    async fn test_write_rejects_non_objects() {
        let (_dir, handler, metrics) = test_handler(4096);

        for body in ["", "not json", "[1,2]", "42", "\"str\"", "null", "{\"a\":1} trailing"] {
            let response = post(&handler, "/write", body).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {:?}", body);
            assert_eq!(body_bytes(response).await, "Invalid payload");
        }

        assert_eq!(handler.wal().next_offset(), 1);
        assert_eq!(
            metrics
                .requests_total
                .with_label_values(&["/write", "400"])
                .get(),
            7.0
        );
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (_dir, handler, _metrics) = test_handler(4096);
        let uri: Uri = "/write".parse().unwrap();

        for method in [Method::GET, Method::PUT, Method::DELETE] {
            let response = handler.handle(&method, &uri, Bytes::new()).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        }

        let response = handler.handle(&Method::GET, &"/read".parse().unwrap(), Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_write_failure_is_generic_500() {
        let (_dir, handler, metrics) = test_handler(4096);
        handler.wal().close().unwrap();

        let response = post(&handler, "/write", r#"{"id":1}"#).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_bytes(response).await, "Failed to write log");
        assert_eq!(
            metrics
                .append_errors_total
                .with_label_values(&["closed"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_rotation_updates_metrics() {
        let (_dir, handler, metrics) = test_handler(1);

        let response = post(&handler, "/write?topic=t", r#"{"id":1}"#).await;
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["segment"], 1, "record lands in the pre-rotation segment");

        assert_eq!(metrics.rotations_total.get(), 1.0);
        assert_eq!(metrics.current_segment.get(), 2.0);
        assert_eq!(handler.wal().current_segment(), 2);
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_body() {
        let (_dir, handler, metrics) = test_handler(4096);
        let handler = handler.with_max_body_bytes(1024);

        let body = format!(r#"{{"pad":"{}"}}"#, "x".repeat(2048));
        let response = post(&handler, "/write", &body).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(handler.wal().next_offset(), 1);
        assert_eq!(
            std::fs::metadata(handler.wal().current_segment_path())
                .unwrap()
                .len(),
            0
        );

        let body = format!(r#"{{"pad":"{}"}}"#, "x".repeat(512));
        let response = post(&handler, "/write", &body).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let uri: Uri = "/write".parse().unwrap();
        let response = handler.reject_oversized(&uri);
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            metrics
                .requests_total
                .with_label_values(&["/write", "413"])
                .get(),
            2.0
        );
    }

    #[tokio::test]
    async fn test_segment_gauge_follows_degraded_recovery() {
        let (dir, handler, metrics) = test_handler(150);
        let blocker = dir.path().join("wal_data").join("wal_2.log");
        std::fs::create_dir(&blocker).unwrap();

        let body = format!(r#"{{"pad":"{}"}}"#, "x".repeat(200));
        let response = post(&handler, "/write", &body).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(handler.wal().is_degraded());
        assert_eq!(metrics.current_segment.get(), 1.0);
        assert_eq!(metrics.records_appended_total.get(), 1.0, "record was committed");

        std::fs::remove_dir(&blocker).unwrap();
        let response = post(&handler, "/write", r#"{"id":2}"#).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["offset"], 2);
        assert_eq!(body["segment"], 2);

        assert_eq!(handler.wal().current_segment(), 2);
        assert_eq!(
            metrics.current_segment.get(),
            handler.wal().current_segment() as f64
        );
        assert_eq!(metrics.rotations_total.get(), 0.0);
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, handler, _metrics) = test_handler(4096);
        let uri: Uri = "/health".parse().unwrap();

        let response = handler.handle(&Method::GET, &uri, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);

        handler.wal().close().unwrap();
        let response = handler.handle(&Method::GET, &uri, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
