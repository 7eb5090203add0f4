//! Prometheus metrics for export and import latency and import claims

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{FleetError, Result};

/// Bucket boundaries in milliseconds
const DURATION_BUCKETS_MS: [f64; 6] = [1000.0, 2500.0, 5000.0, 10000.0, 25000.0, 50000.0];
/// Observations are capped at this value
const DURATION_RIGHT_BOUND_MS: f64 = 100000.0;
/// Observations at or below zero are recorded as this value
const DURATION_FLOOR_MS: f64 = 1000.0;

/// Outcomes of an import claim, as recorded by the hub
pub const CLAIM_GRANTED: &str = "granted";
pub const CLAIM_RELEASED: &str = "released";
pub const CLAIM_CONFLICT: &str = "conflict";

/// Metrics collector shared by the networking controllers. Clones share the registry.
#[derive(Clone)]
pub struct FleetMetrics {
    /// Time from an EndpointSlice change in its origin cluster to its import elsewhere
    pub endpoint_slice_export_import_duration: HistogramVec,
    /// Time from a Service export request to the hub conflict resolution result
    pub service_export_duration: HistogramVec,
    /// ServiceImport claims by outcome
    pub service_import_claims: IntCounterVec,
    pub registry: Arc<Registry>,
}

impl FleetMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let endpoint_slice_export_import_duration = HistogramVec::new(
            HistogramOpts::new(
                "fleet_networking_endpointslice_export_import_duration_milliseconds",
                "The duration of an endpointslice export",
            )
            .buckets(DURATION_BUCKETS_MS.to_vec()),
            &["originClusterID", "destinationClusterID"],
        )?;

        let service_export_duration = HistogramVec::new(
            HistogramOpts::new(
                "fleet_networking_service_export_duration_milliseconds",
                "The duration of a service export",
            )
            .buckets(DURATION_BUCKETS_MS.to_vec()),
            &["originClusterID"],
        )?;

        let service_import_claims = IntCounterVec::new(
            Opts::new(
                "fleet_networking_service_import_claims_total",
                "Total number of service import claims by outcome",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(endpoint_slice_export_import_duration.clone()))?;
        registry.register(Box::new(service_export_duration.clone()))?;
        registry.register(Box::new(service_import_claims.clone()))?;

        Ok(Self {
            endpoint_slice_export_import_duration,
            service_export_duration,
            service_import_claims,
            registry,
        })
    }

    pub fn observe_endpoint_slice_export_import(
        &self,
        origin_cluster: &str,
        destination_cluster: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.endpoint_slice_export_import_duration
            .with_label_values(&[origin_cluster, destination_cluster])
            .observe(clamp_duration_ms(since, now));
    }

    pub fn observe_service_export(&self, origin_cluster: &str, since: DateTime<Utc>, now: DateTime<Utc>) {
        self.service_export_duration
            .with_label_values(&[origin_cluster])
            .observe(clamp_duration_ms(since, now));
    }

    pub fn observe_claim(&self, outcome: &str) {
        self.service_import_claims.with_label_values(&[outcome]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| FleetError::Internal(e.to_string()))
    }
}

/// Serves `/metrics` and `/healthz` until the task is dropped.
pub async fn serve_metrics(addr: SocketAddr, metrics: FleetMetrics) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| FleetError::Internal(format!("failed to bind metrics address {addr}: {e}")))?;
    info!(%addr, "Metrics server listening");

    let metrics = Arc::new(metrics);
    loop {
        let (stream, peer_addr) = listener
            .accept()
            .await
            .map_err(|e| FleetError::Internal(format!("failed to accept metrics connection: {e}")))?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(handle_request(&req, &metrics)) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer_addr, error = %e, "Metrics connection closed with error");
            }
        });
    }
}

fn handle_request<B>(req: &Request<B>, metrics: &FleetMetrics) -> Response<Full<Bytes>> {
    let (status, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match metrics.gather() {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => {
                warn!(error = %e, "Failed to gather metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n".to_string())
            }
        },
        (&Method::GET, "/healthz") => (StatusCode::OK, "ok\n".to_string()),
        _ => (StatusCode::NOT_FOUND, "Not Found\n".to_string()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
    response
}

/// Milliseconds between `since` and `now`. Clock skew between clusters can make the value
/// negative; those are floored, and outliers are capped at the right bound.
pub fn clamp_duration_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let ms = (now - since).num_milliseconds() as f64;
    if ms <= 0.0 {
        DURATION_FLOOR_MS
    } else {
        ms.min(DURATION_RIGHT_BOUND_MS)
    }
}
