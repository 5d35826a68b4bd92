// Capture recorder - builds a Capture around every proxied exchange
//
// The engine sits between the dispatcher (or the MITM bridge) and the
// upstream connector. On the way in it buffers the request body, keeps a
// capped display copy, and files a partial capture under the request's
// token. On the way out it tees the streamed response into a bounded
// accumulator (or the gRPC sampler), and when the last byte has passed it
// folds the phase record in, finishes the capture, and submits it to the
// store, the broker, and the analysis sink.
//
// Recording is strictly passive: the forwarded bytes are the original
// bytes, and a recording failure must look exactly like a successful
// passthrough to the client.

use super::error::ProxyError;
use super::grpc;
use super::origin::{is_hop_by_hop, Origin};
use super::phases::PhaseTracer;
use crate::analysis::AnalysisSink;
use crate::broker::EventBroker;
use crate::capture::{
    cap_body, Capture, ConnectionInfo, GrpcCapture, REQ_BODY_READ_ERROR, RESP_BODY_READ_ERROR,
};
use crate::store::CaptureStore;
use axum::body::Body;
use axum::http::{HeaderMap as HttpHeaderMap, Request, Response, Uri};
use bytes::Bytes;
use chrono::Utc;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Note carried by a partial capture until the response lands
const PENDING_NOTE: &str = "pending";

/// Shared recorder for every proxied exchange
pub struct ProxyEngine {
    store: Arc<CaptureStore>,
    broker: Arc<EventBroker>,
    sink: Arc<AnalysisSink>,
    pub(crate) tracer: PhaseTracer,
    /// Partial captures keyed by request token
    partials: Mutex<HashMap<u64, Capture>>,
    max_body: usize,
    paused: Arc<AtomicBool>,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<CaptureStore>,
        broker: Arc<EventBroker>,
        sink: Arc<AnalysisSink>,
        max_body: usize,
        paused: Arc<AtomicBool>,
    ) -> Self {
        ProxyEngine {
            store,
            broker,
            sink,
            tracer: PhaseTracer::new(),
            partials: Mutex::new(HashMap::new()),
            max_body,
            paused,
        }
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Proxy one exchange toward `origin`. `url` is the absolute request
    /// URL as the client meant it (reconstructed from SNI + path on the
    /// MITM path).
    pub(crate) async fn proxy_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        origin: Arc<Origin>,
        url: Uri,
    ) -> Result<Response<Body>, ProxyError> {
        let started = Instant::now();
        let method = req.method().clone();
        let req_headers = req.headers().clone();

        tracing::debug!("Proxying {} {}", method, url);

        // Buffer the request body. The forwarded bytes are always the
        // original bytes; a read failure forwards an empty body and
        // records the sentinel.
        let (body_bytes, body_read_failed) = match req.into_body().collect().await {
            Ok(collected) => (collected.to_bytes(), false),
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                (Bytes::new(), true)
            }
        };

        let forward_headers = filter_forward_headers(&req_headers);

        // Paused: pure passthrough, nothing is registered or recorded.
        // Token 0 is never a registered phase key, so the connector's
        // stamps land nowhere.
        if self.is_paused() {
            let response = origin
                .send(
                    method,
                    url,
                    forward_headers,
                    body_bytes,
                    &self.tracer,
                    0,
                )
                .await
                .map_err(|e| ProxyError::Upstream(format!("{:#}", e)))?;
            let (parts, body) = response.into_parts();
            let mut builder = Response::builder().status(parts.status);
            for (name, value) in parts.headers.iter() {
                if !is_client_response_dropped(name.as_str()) {
                    builder = builder.header(name, value);
                }
            }
            return builder
                .body(Body::new(body))
                .map_err(|e| ProxyError::ResponseBuild(e.to_string()));
        }

        let token = self.tracer.register();

        // gRPC bodies never land in the display fields; they go through
        // the frame sampler instead
        let content_type = header_value(&req_headers, "content-type");
        let is_grpc = content_type.starts_with("application/grpc");
        let grpc_encoding = header_value(&req_headers, "grpc-encoding");

        let request_body = if body_read_failed {
            REQ_BODY_READ_ERROR.to_string()
        } else if is_grpc {
            String::new()
        } else {
            decode_display_body(
                &body_bytes,
                &header_value(&req_headers, "content-encoding"),
                self.max_body,
            )
        };

        let grpc_path = url.path().to_string();
        let grpc_aggregate: Option<grpc::SharedGrpc> = is_grpc.then(|| {
            Arc::new(Mutex::new(GrpcCapture {
                path: grpc_path.clone(),
                encoding: grpc_encoding.clone(),
                request_frames: grpc::sample_buffered(&body_bytes, grpc_encoding == "gzip"),
                ..Default::default()
            }))
        });

        let partial = Capture {
            timestamp: Utc::now(),
            method: method.to_string(),
            url: url.to_string(),
            request_headers: header_multimap(&req_headers),
            request_body,
            notes: PENDING_NOTE.to_string(),
            ..Default::default()
        };
        self.partials
            .lock()
            .expect("partials lock poisoned")
            .insert(token, partial);

        let response = match origin
            .send(method, url, forward_headers, body_bytes, &self.tracer, token)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Upstream failure: {:#}", e);
                self.finalize_transport_error(token, started);
                return Err(ProxyError::Upstream(format!("{:#}", e)));
            }
        };

        let (parts, upstream_body) = response.into_parts();
        let status = parts.status.as_u16();
        let resp_headers = parts.headers.clone();

        // A transaction can also turn out to be gRPC on the response side
        // only (the request had no body worth marking)
        let grpc_aggregate = grpc_aggregate.or_else(|| {
            header_value(&resp_headers, "content-type")
                .starts_with("application/grpc")
                .then(|| {
                    Arc::new(Mutex::new(GrpcCapture {
                        path: grpc_path.clone(),
                        encoding: header_value(&resp_headers, "grpc-encoding"),
                        ..Default::default()
                    }))
                })
        });

        // Trailers-only gRPC responses put the status in the headers
        if let Some(aggregate) = &grpc_aggregate {
            grpc::fold_trailers(aggregate, &resp_headers);
        }

        let resp_encoding = header_value(&resp_headers, "content-encoding");
        let sampler = grpc_aggregate.as_ref().map(|aggregate| {
            grpc::ResponseSampler::spawn(
                aggregate.clone(),
                header_value(&resp_headers, "grpc-encoding") == "gzip"
                    || grpc_encoding == "gzip",
            )
        });

        // Tee the response through to the client while the forward task
        // accumulates the capped display copy
        let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(32);
        let engine = self.clone();
        let finalize = FinalizeCtx {
            token,
            started,
            status,
            resp_headers: header_multimap(&resp_headers),
            resp_encoding,
            grpc_aggregate,
        };
        tokio::spawn(async move {
            engine
                .forward_response(upstream_body, tx, sampler, finalize)
                .await;
        });

        let mut builder = Response::builder().status(parts.status);
        for (name, value) in parts.headers.iter() {
            if !is_client_response_dropped(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        builder
            .body(Body::new(StreamBody::new(ReceiverStream::new(rx))))
            .map_err(|e| ProxyError::ResponseBuild(e.to_string()))
    }

    /// Drive the upstream body toward the client, teeing data into the
    /// bounded accumulator (or the gRPC sampler) and trailers into the
    /// aggregate. Finalizes the capture when the stream ends.
    async fn forward_response(
        &self,
        mut upstream: Incoming,
        tx: mpsc::Sender<Result<Frame<Bytes>, std::io::Error>>,
        mut sampler: Option<grpc::ResponseSampler>,
        ctx: FinalizeCtx,
    ) {
        // Raw prefix kept for display; one extra byte marks truncation
        let mut captured: Vec<u8> = Vec::new();
        let budget = self.max_body + 1;

        loop {
            match upstream.frame().await {
                None => {
                    self.tracer
                        .record(ctx.token, |p| p.body_end = Some(Instant::now()));
                    if let Some(sampler) = sampler.take() {
                        // The stream is complete; let the sampler catch up
                        // so the capture sees every frame it kept
                        sampler.finish().await;
                    }
                    self.finalize(ctx, captured, false);
                    return;
                }
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        if let Some(sampler) = sampler.as_mut() {
                            sampler.push(data);
                        } else if captured.len() < budget {
                            let take = (budget - captured.len()).min(data.len());
                            captured.extend_from_slice(&data[..take]);
                        }
                    }
                    if let Some(trailers) = frame.trailers_ref() {
                        if let Some(aggregate) = &ctx.grpc_aggregate {
                            grpc::fold_trailers(aggregate, trailers);
                        }
                    }
                    if tx.send(Ok(frame)).await.is_err() {
                        // Client went away mid-exchange: drop the
                        // ephemeral state, record nothing
                        tracing::debug!("client disconnected mid-response");
                        self.discard(ctx.token);
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!("Upstream body error: {}", e);
                    self.tracer
                        .record(ctx.token, |p| p.body_end = Some(Instant::now()));
                    if let Some(sampler) = sampler.take() {
                        sampler.finish().await;
                    }
                    self.finalize(ctx, captured, true);
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    return;
                }
            }
        }
    }

    /// Fold everything into the final capture and hand it downstream.
    fn finalize(&self, ctx: FinalizeCtx, captured: Vec<u8>, read_error: bool) {
        let FinalizeCtx {
            token,
            started,
            status,
            resp_headers,
            resp_encoding,
            grpc_aggregate,
        } = ctx;

        let Some(mut capture) = self
            .partials
            .lock()
            .expect("partials lock poisoned")
            .remove(&token)
        else {
            self.tracer.take(token);
            return;
        };

        if let Some(phases) = self.tracer.take(token) {
            capture.timings = phases.spans();
            capture.connection = ConnectionInfo {
                remote_addr: phases.remote_addr,
                reused: phases.reused,
                http2: phases.alpn_h2,
            };
        }

        capture.response_status = status;
        capture.response_headers = resp_headers;
        capture.response_body = if read_error {
            RESP_BODY_READ_ERROR.to_string()
        } else if grpc_aggregate.is_some() {
            String::new()
        } else {
            decode_display_body(&captured, &resp_encoding, self.max_body)
        };
        capture.grpc = grpc_aggregate.map(|aggregate| {
            aggregate
                .lock()
                .map(|agg| agg.clone())
                .unwrap_or_default()
        });
        capture.duration_ms = started.elapsed().as_millis() as u64;
        capture.notes.clear();
        if capture.name.is_empty() {
            capture.name = capture.default_name();
        }

        self.submit(capture, false);
    }

    /// Stub capture for a transaction that never got a response.
    fn finalize_transport_error(&self, token: u64, started: Instant) {
        let Some(mut capture) = self
            .partials
            .lock()
            .expect("partials lock poisoned")
            .remove(&token)
        else {
            self.tracer.take(token);
            return;
        };
        if let Some(phases) = self.tracer.take(token) {
            capture.timings = phases.spans();
            capture.connection = ConnectionInfo {
                remote_addr: phases.remote_addr,
                reused: phases.reused,
                http2: phases.alpn_h2,
            };
        }
        capture.duration_ms = started.elapsed().as_millis() as u64;
        capture.notes.clear();
        capture.name = capture.default_name();
        self.submit(capture, true);
    }

    /// Store, publish, observe. Never fails the proxy path.
    fn submit(&self, capture: Capture, transport_error: bool) {
        let stored = self.store.add(capture);
        self.broker.publish(&stored);
        self.sink.observe_capture(&stored, transport_error);
    }

    /// Remove ephemeral state for a request that will never finalize.
    fn discard(&self, token: u64) {
        self.partials
            .lock()
            .expect("partials lock poisoned")
            .remove(&token);
        self.tracer.take(token);
    }

    #[cfg(test)]
    pub(crate) fn pending_partials(&self) -> usize {
        self.partials.lock().expect("partials lock poisoned").len()
    }
}

/// Context carried from the response header phase to finalization
struct FinalizeCtx {
    token: u64,
    started: Instant,
    status: u16,
    resp_headers: crate::capture::HeaderMap,
    resp_encoding: String,
    grpc_aggregate: Option<grpc::SharedGrpc>,
}

/// Clone headers into the capture's multimap shape: lowercase names,
/// every value kept.
pub fn header_multimap(headers: &HttpHeaderMap) -> crate::capture::HeaderMap {
    let mut out: crate::capture::HeaderMap = HashMap::new();
    for (name, value) in headers.iter() {
        out.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).to_string());
    }
    out
}

fn header_value(headers: &HttpHeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Hop-by-hop headers never travel upstream.
fn filter_forward_headers(headers: &HttpHeaderMap) -> HttpHeaderMap {
    let mut out = HttpHeaderMap::new();
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            out.append(name, value.clone());
        }
    }
    out
}

/// Headers dropped from the client-facing response. The body is re-framed
/// by our server side, so transport framing headers cannot be passed
/// through; content-length survives because the bytes are unmodified.
fn is_client_response_dropped(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection" | "transfer-encoding" | "keep-alive"
    )
}

/// Display-side decode: bounded raw prefix, optional gzip/deflate
/// inflation, lossy UTF-8, capped with the truncation sentinel. The wire
/// bytes are untouched; this string is only ever shown.
fn decode_display_body(raw: &[u8], encoding: &str, max_body: usize) -> String {
    let capped_raw = &raw[..raw.len().min(max_body + 1)];

    let decoded: Vec<u8> = match encoding {
        "gzip" | "x-gzip" => bounded_inflate(GzDecoder::new(capped_raw), max_body)
            .unwrap_or_else(|| capped_raw.to_vec()),
        "deflate" => bounded_inflate(ZlibDecoder::new(capped_raw), max_body)
            .or_else(|| bounded_inflate(DeflateDecoder::new(capped_raw), max_body))
            .unwrap_or_else(|| capped_raw.to_vec()),
        _ => capped_raw.to_vec(),
    };

    cap_body(String::from_utf8_lossy(&decoded).into_owned(), max_body)
}

/// Inflate at most max_body + 1 bytes; None when the stream is not valid
/// for this decoder (e.g. a truncated gzip prefix).
fn bounded_inflate<R: Read>(decoder: R, max_body: usize) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut limited = decoder.take(max_body as u64 + 1);
    match limited.read_to_end(&mut out) {
        Ok(_) => Some(out),
        // A short read may still have produced the full cap's worth
        Err(_) if out.len() > max_body => Some(out),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TRUNCATION_SENTINEL;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn display_body_plain_under_cap() {
        assert_eq!(decode_display_body(b"hello", "", 100), "hello");
    }

    #[test]
    fn display_body_over_cap_gets_sentinel() {
        let raw = vec![b'A'; 250];
        let decoded = decode_display_body(&raw, "", 100);
        assert_eq!(decoded.len(), 100 + TRUNCATION_SENTINEL.len());
        assert!(decoded.ends_with(TRUNCATION_SENTINEL));
    }

    #[test]
    fn display_body_gunzips_for_display() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"compressed payload").unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(
            decode_display_body(&gz, "gzip", 1024),
            "compressed payload"
        );
    }

    #[test]
    fn display_body_caps_inflated_output() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&vec![b'B'; 5000]).unwrap();
        let gz = enc.finish().unwrap();
        let decoded = decode_display_body(&gz, "gzip", 100);
        assert_eq!(decoded.len(), 100 + TRUNCATION_SENTINEL.len());
        assert!(decoded.ends_with(TRUNCATION_SENTINEL));
    }

    #[test]
    fn display_body_bad_gzip_falls_back_to_raw() {
        let decoded = decode_display_body(b"not actually gzip", "gzip", 100);
        assert_eq!(decoded, "not actually gzip");
    }

    #[test]
    fn multimap_keeps_every_value() {
        let mut headers = HttpHeaderMap::new();
        headers.append("Set-Cookie", "a=1".parse().unwrap());
        headers.append("Set-Cookie", "b=2".parse().unwrap());
        let map = header_multimap(&headers);
        assert_eq!(map["set-cookie"], vec!["a=1", "b=2"]);
    }

    #[test]
    fn forward_filter_strips_hop_by_hop() {
        let mut headers = HttpHeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("content-type", "text/plain".parse().unwrap());
        let filtered = filter_forward_headers(&headers);
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("content-type").is_some());
    }
}
