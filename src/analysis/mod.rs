// Analysis sink - normalized observation feed for pluggable analyzers
//
// Every finished transaction is flattened into an ObservedRequest and
// handed to a registry of analyzers. Analyzers are stateless at the
// interface boundary; whatever they accumulate lives behind their own
// mutex. The same adapter serves live traffic and historical replay from
// a loaded snapshot, so aggregates survive restarts.

mod analyzers;

pub use analyzers::{
    ClientFingerprintAnalyzer, ErrorTransitionAnalyzer, OutcomeAnalyzer,
    ResponseProfileAnalyzer, RouteLatencyAnalyzer, SizeAnalyzer, TemporalAnalyzer,
};

use crate::capture::{Capture, HeaderMap};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Coarse classification of how a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    #[serde(rename = "2xx")]
    Success2xx,
    #[serde(rename = "3xx")]
    Redirect3xx,
    #[serde(rename = "4xx")]
    ClientError4xx,
    #[serde(rename = "5xx")]
    ServerError5xx,
    #[serde(rename = "network-error")]
    NetworkError,
    #[serde(rename = "other")]
    Other,
}

impl Outcome {
    /// Classify from a response status; 0 means nothing was received.
    pub fn from_status(status: u16, transport_error: bool) -> Outcome {
        if transport_error || status == 0 {
            return Outcome::NetworkError;
        }
        match status / 100 {
            2 => Outcome::Success2xx,
            3 => Outcome::Redirect3xx,
            4 => Outcome::ClientError4xx,
            5 => Outcome::ServerError5xx,
            _ => Outcome::Other,
        }
    }
}

/// Who sent the request, as far as headers can tell
#[derive(Debug, Clone, Default)]
pub struct ClientDescriptor {
    pub ip: String,
    pub user_agent: String,
    /// Low-entropy client hint (sec-ch-ua), when present
    pub client_hint: String,
}

/// Where the request went: the analyzer identity triple
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub host: String,
    pub path: String,
    pub method: String,
}

/// One normalized observation
#[derive(Debug, Clone)]
pub struct ObservedRequest {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub client: ClientDescriptor,
    pub route: RouteKey,
    pub outcome: Outcome,
    pub latency_ms: u64,
    pub status: u16,
    pub request_size: usize,
    pub response_size: usize,
    pub request_headers: HeaderMap,
    pub response_headers: HeaderMap,
    /// SHA-256 prefix of Authorization/Cookie material, never the raw value
    pub auth_fingerprint: Option<String>,
    pub server_addr: String,
}

/// An independent aggregator fed by the sink
pub trait RequestAnalyzer: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_request(&self, event: &ObservedRequest);
    /// JSON view of the accumulated state, for the REST surface
    fn snapshot(&self) -> serde_json::Value;
}

/// Fan-out point between the recorder and the analyzers
pub struct AnalysisSink {
    analyzers: Vec<Arc<dyn RequestAnalyzer>>,
}

impl AnalysisSink {
    pub fn new(analyzers: Vec<Arc<dyn RequestAnalyzer>>) -> Self {
        AnalysisSink { analyzers }
    }

    /// Default registry: every built-in aggregator.
    pub fn with_defaults() -> Self {
        AnalysisSink::new(vec![
            Arc::new(RouteLatencyAnalyzer::new()),
            Arc::new(OutcomeAnalyzer::new()),
            Arc::new(TemporalAnalyzer::new()),
            Arc::new(ErrorTransitionAnalyzer::new()),
            Arc::new(SizeAnalyzer::new()),
            Arc::new(ClientFingerprintAnalyzer::new()),
            Arc::new(ResponseProfileAnalyzer::new()),
        ])
    }

    pub fn on_request(&self, event: &ObservedRequest) {
        for analyzer in &self.analyzers {
            analyzer.on_request(event);
        }
    }

    /// Adapt a finished capture and feed it through.
    pub fn observe_capture(&self, capture: &Capture, transport_error: bool) {
        self.on_request(&observed_from_capture(capture, transport_error));
    }

    /// Re-feed historical captures (e.g. a loaded snapshot).
    pub fn replay(&self, captures: &[Capture]) {
        for capture in captures {
            self.observe_capture(capture, false);
        }
        if !captures.is_empty() {
            tracing::debug!("Replayed {} captures into analyzers", captures.len());
        }
    }

    /// Named snapshots of every analyzer, for the REST surface.
    pub fn snapshots(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for analyzer in &self.analyzers {
            out.insert(analyzer.name().to_string(), analyzer.snapshot());
        }
        serde_json::Value::Object(out)
    }
}

/// Flatten a capture into the normalized observation shape.
pub fn observed_from_capture(capture: &Capture, transport_error: bool) -> ObservedRequest {
    let first = |headers: &HeaderMap, name: &str| -> String {
        headers
            .get(name)
            .and_then(|v| v.first())
            .cloned()
            .unwrap_or_default()
    };

    ObservedRequest {
        id: capture.id,
        timestamp: capture.timestamp,
        client: ClientDescriptor {
            ip: first(&capture.request_headers, "x-forwarded-for"),
            user_agent: first(&capture.request_headers, "user-agent"),
            client_hint: first(&capture.request_headers, "sec-ch-ua"),
        },
        route: RouteKey {
            host: capture.host(),
            path: capture.path(),
            method: capture.method.clone(),
        },
        outcome: Outcome::from_status(capture.response_status, transport_error),
        latency_ms: capture.duration_ms,
        status: capture.response_status,
        request_size: capture.request_body.len(),
        response_size: capture.response_body.len(),
        request_headers: capture.request_headers.clone(),
        response_headers: capture.response_headers.clone(),
        auth_fingerprint: auth_fingerprint(&capture.request_headers),
        server_addr: capture.connection.remote_addr.clone(),
    }
}

/// Hash credential-bearing headers down to a short tracking fingerprint;
/// the raw value never leaves the request.
fn auth_fingerprint(headers: &HeaderMap) -> Option<String> {
    let mut material = String::new();
    for name in ["authorization", "cookie", "x-api-key"] {
        if let Some(values) = headers.get(name) {
            material.push_str(name);
            material.push('=');
            material.push_str(&values.join(","));
            material.push(';');
        }
    }
    if material.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    let hash = hasher.finalize();
    Some(format!("{:x}", hash)[..16].to_string())
}
