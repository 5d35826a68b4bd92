// Capture model - one recorded HTTP transaction
//
// A Capture is the unit everything else operates on: the store rings them,
// the broker fans them out, the filter evaluator matches them, and the SSE
// stream serializes them verbatim. Control events (pause/resume/clear) reuse
// the same shape with a sentinel in `notes` so the wire format stays a single
// schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Appended to any captured body that exceeded the configured cap.
pub const TRUNCATION_SENTINEL: &str = "\n--truncated--";

/// Stored in place of a request body that could not be read.
pub const REQ_BODY_READ_ERROR: &str = "--body-read-error--";

/// Stored in place of a response body that could not be read.
pub const RESP_BODY_READ_ERROR: &str = "--resp-body-read-error--";

/// Header multimap: canonical (lowercased) name to every value seen.
pub type HeaderMap = HashMap<String, Vec<String>>;

/// One proxied HTTP transaction, as recorded by the capture pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capture {
    /// Monotonic identity assigned by the store
    #[serde(default)]
    pub id: u64,
    /// Human label; defaults to "METHOD URL [STATUS]" when not renamed
    #[serde(default)]
    pub name: String,
    /// When the request entered the proxy (UTC)
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub method: String,
    /// Absolute request URL
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub request_headers: HeaderMap,
    #[serde(default)]
    pub request_body: String,
    /// 0 means no response was received (transport error stub)
    #[serde(default)]
    pub response_status: u16,
    #[serde(default)]
    pub response_headers: HeaderMap,
    #[serde(default)]
    pub response_body: String,
    /// Recorder wall clock, request entry to response completion
    #[serde(default)]
    pub duration_ms: u64,
    /// Free-form note; also carries control sentinels on the event stream
    #[serde(default)]
    pub notes: String,
    /// Deletion tombstone, only meaningful on the event stream
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default)]
    pub timings: CaptureTimings,
    #[serde(default)]
    pub connection: ConnectionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<GrpcCapture>,
}

/// Phase spans folded in from the tracer. Zero means the phase was not
/// observed (connection reuse skips DNS/connect/TLS entirely).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CaptureTimings {
    #[serde(default)]
    pub dns_ms: u64,
    #[serde(default)]
    pub connect_ms: u64,
    #[serde(default)]
    pub tls_ms: u64,
    /// Request write, first byte out to body sent
    #[serde(default)]
    pub write_ms: u64,
    /// Time to first byte of the response
    #[serde(default)]
    pub ttfb_ms: u64,
    /// Response read, first byte to last byte
    #[serde(default)]
    pub read_ms: u64,
    /// Tracer round trip, dial start to last body byte
    #[serde(default)]
    pub total_ms: u64,
}

/// Where the transaction actually went
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Origin socket address, empty if the dial never completed
    #[serde(default)]
    pub remote_addr: String,
    /// Whether an existing upstream transport served this exchange
    #[serde(default)]
    pub reused: bool,
    /// Whether ALPN negotiated HTTP/2 upstream
    #[serde(default)]
    pub http2: bool,
}

/// gRPC view of a transaction whose bodies are length-prefixed frames
/// rather than display-safe text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpcCapture {
    /// Service-method path, e.g. "/pkg.Service/Method"
    #[serde(default)]
    pub path: String,
    /// Value of the grpc-encoding header, if any
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub request_frames: Vec<GrpcFrame>,
    #[serde(default)]
    pub response_frames: Vec<GrpcFrame>,
    /// grpc-status trailer, -1 when never seen
    #[serde(default = "default_grpc_status")]
    pub status: i32,
    /// URL-unescaped grpc-message trailer
    #[serde(default)]
    pub message: String,
}

fn default_grpc_status() -> i32 {
    -1
}

impl Default for GrpcCapture {
    fn default() -> Self {
        GrpcCapture {
            path: String::new(),
            encoding: String::new(),
            request_frames: Vec::new(),
            response_frames: Vec::new(),
            status: default_grpc_status(),
            message: String::new(),
        }
    }
}

/// One sampled gRPC frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrpcFrame {
    /// Compressed flag byte from the frame header
    pub compressed: bool,
    /// Payload length after decompression (or raw length if not compressed)
    pub length: usize,
    /// Base64 of the decoded payload, capped to the per-frame budget
    pub preview: String,
}

impl Capture {
    /// Default display name: "METHOD URL [STATUS]", or without the status
    /// bracket when no response was received.
    pub fn default_name(&self) -> String {
        if self.response_status == 0 {
            format!("{} {}", self.method, self.url)
        } else {
            format!("{} {} [{}]", self.method, self.url, self.response_status)
        }
    }

    /// Host portion of the request URL (authority without userinfo)
    pub fn host(&self) -> String {
        self.url
            .parse::<axum::http::Uri>()
            .ok()
            .and_then(|u| u.authority().map(|a| a.as_str().to_string()))
            .unwrap_or_default()
    }

    /// Path portion of the request URL
    pub fn path(&self) -> String {
        self.url
            .parse::<axum::http::Uri>()
            .ok()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "/".to_string())
    }

    /// Build a control-plane event carried on the capture schema.
    /// The `notes` sentinel ("paused", "resumed", "cleared") is what the UI
    /// dispatches on.
    pub fn control(note: &str) -> Self {
        Capture {
            notes: note.to_string(),
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    /// Build a deletion tombstone event for the given identity.
    pub fn tombstone(id: u64) -> Self {
        Capture {
            id,
            deleted: true,
            timestamp: Utc::now(),
            ..Default::default()
        }
    }
}

/// Apply the body cap: bodies longer than `max_body` are cut there and
/// marked with the truncation sentinel.
pub fn cap_body(body: String, max_body: usize) -> String {
    if body.len() <= max_body {
        return body;
    }
    // Back off to a UTF-8 character boundary so the slice stays valid
    let mut end = max_body;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATION_SENTINEL.len());
    out.push_str(&body[..end]);
    out.push_str(TRUNCATION_SENTINEL);
    out
}
