// gRPC frame sampler - bounded inspection of length-prefixed frame streams
//
// gRPC bodies are protobuf frames, not display-safe text, so the recorder
// never dumps them into a capture. Instead the forwarded stream is teed
// into this parser, which walks the wire format
//
//   [1 byte: compressed flag][4 bytes: big-endian length][payload]
//
// under a per-direction frame count and byte budget, gunzips flagged
// frames, and keeps a base64 preview per frame. The tee is lossy by
// design: once the sampler falls behind or the budget is spent, the
// remainder of the stream goes unobserved while forwarding continues
// untouched.

use crate::capture::{GrpcCapture, GrpcFrame};
use base64::Engine as _;
use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Most frames sampled per direction
pub const MAX_SAMPLED_FRAMES: usize = 8;

/// Base64 preview input cap per frame
pub const FRAME_PREVIEW_BYTES: usize = 1024;

/// Most wire bytes parsed per direction
pub const DIRECTION_BYTE_BUDGET: usize = 256 * 1024;

/// Frames larger than this are treated as a framing error and stop the
/// sampler; gRPC messages this size never belong in a preview anyway.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Incremental parser over one direction of a gRPC stream
pub struct FrameSampler {
    buf: Vec<u8>,
    frames: Vec<GrpcFrame>,
    consumed: usize,
    /// grpc-encoding advertised gzip for compressed frames
    gzip: bool,
    done: bool,
}

impl FrameSampler {
    pub fn new(gzip: bool) -> Self {
        FrameSampler {
            buf: Vec::new(),
            frames: Vec::new(),
            consumed: 0,
            gzip,
            done: false,
        }
    }

    /// Feed a chunk of the stream; parses every complete frame available
    /// within the budgets.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }
        self.buf.extend_from_slice(chunk);

        while !self.done {
            if self.buf.len() < 5 {
                break;
            }
            let compressed = self.buf[0] != 0;
            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
                as usize;
            if len > MAX_FRAME_LEN {
                tracing::debug!("grpc sampler: implausible frame length {}, stopping", len);
                self.finish();
                break;
            }
            if self.buf.len() < 5 + len {
                break;
            }

            let payload = &self.buf[5..5 + len];
            self.frames.push(sample_frame(compressed, payload, self.gzip));
            self.buf.drain(..5 + len);
            self.consumed += 5 + len;

            if self.frames.len() >= MAX_SAMPLED_FRAMES || self.consumed >= DIRECTION_BYTE_BUDGET
            {
                self.finish();
            }
        }
    }

    /// Stop sampling and drop any buffered partial frame.
    pub fn finish(&mut self) {
        self.done = true;
        self.buf = Vec::new();
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn into_frames(self) -> Vec<GrpcFrame> {
        self.frames
    }
}

/// Decode one frame into its sampled form. A compressed frame that fails
/// to gunzip keeps its raw preview and wire length.
fn sample_frame(compressed: bool, payload: &[u8], gzip: bool) -> GrpcFrame {
    let decoded: Vec<u8> = if compressed && gzip {
        let mut out = Vec::new();
        // Bounded read: the preview never needs more than its cap, but the
        // decoded length is worth reporting in full when cheap
        match GzDecoder::new(payload).read_to_end(&mut out) {
            Ok(_) => out,
            Err(e) => {
                tracing::debug!("grpc sampler: frame gunzip failed: {}", e);
                payload.to_vec()
            }
        }
    } else {
        payload.to_vec()
    };

    let preview_len = decoded.len().min(FRAME_PREVIEW_BYTES);
    GrpcFrame {
        compressed,
        length: decoded.len(),
        preview: base64::engine::general_purpose::STANDARD.encode(&decoded[..preview_len]),
    }
}

/// Parse a fully buffered body (the request side, which the recorder holds
/// in memory anyway).
pub fn sample_buffered(body: &[u8], gzip: bool) -> Vec<GrpcFrame> {
    let mut sampler = FrameSampler::new(gzip);
    sampler.push(body);
    sampler.into_frames()
}

/// Shared aggregate the response-side sampler task writes into while the
/// forward path races ahead.
pub type SharedGrpc = Arc<Mutex<GrpcCapture>>;

/// Handle to the response-side sampler task. The forward loop tees data
/// chunks in; a full queue cuts the sampler short rather than ever slowing
/// the forwarded stream.
pub struct ResponseSampler {
    tx: Option<mpsc::Sender<Bytes>>,
    handle: tokio::task::JoinHandle<()>,
}

impl ResponseSampler {
    /// Spawn the sampler task writing into `aggregate`.
    pub fn spawn(aggregate: SharedGrpc, gzip: bool) -> Self {
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        let handle = tokio::spawn(async move {
            let mut sampler = FrameSampler::new(gzip);
            while let Some(chunk) = rx.recv().await {
                sampler.push(&chunk);
                if sampler.is_done() {
                    break;
                }
            }
            let frames = sampler.into_frames();
            if let Ok(mut agg) = aggregate.lock() {
                agg.response_frames = frames;
            }
        });
        ResponseSampler {
            tx: Some(tx),
            handle,
        }
    }

    /// Offer a chunk; a full or closed queue permanently detaches the tee.
    pub fn push(&mut self, chunk: &Bytes) {
        if let Some(tx) = &self.tx {
            if tx.try_send(chunk.clone()).is_err() {
                tracing::debug!("grpc sampler lagging, cutting it short");
                self.tx = None;
            }
        }
    }

    /// Close the tee and wait for the sampler to write its frames, so a
    /// finalizing capture sees everything sampled from a completed stream.
    pub async fn finish(mut self) {
        self.tx = None;
        let _ = self.handle.await;
    }
}

/// Merge trailers into the aggregate: grpc-status parses as an integer,
/// grpc-message arrives percent-encoded.
pub fn fold_trailers(aggregate: &SharedGrpc, trailers: &axum::http::HeaderMap) {
    let mut agg = match aggregate.lock() {
        Ok(agg) => agg,
        Err(_) => return,
    };
    if let Some(status) = trailers
        .get("grpc-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i32>().ok())
    {
        agg.status = status;
    }
    if let Some(message) = trailers.get("grpc-message").and_then(|v| v.to_str().ok()) {
        agg.message = percent_encoding::percent_decode_str(message)
            .decode_utf8_lossy()
            .to_string();
    }
}
