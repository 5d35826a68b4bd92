// Upstream connector - hand-driven origin connections with phase timing
//
// reqwest-style pooled clients hide exactly the things the capture pipeline
// wants to see, so the dial is done by hand: DNS lookup, TCP connect,
// optional TLS handshake (verification off - the operator installed our CA
// knowingly), then a hyper client connection. Each step stamps the phase
// record for the owning request. ALPN offers h2 explicitly; whatever gets
// negotiated decides whether the hyper h1 or h2 connection driver runs.
//
// One Origin holds at most one live connection. The MITM engine keeps an
// Origin per CONNECT tunnel so consecutive inner exchanges reuse the
// transport; the plaintext path makes a throwaway Origin per request.

use super::phases::PhaseTracer;
use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, Method, Uri};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Upstream endpoint plus its (at most one) live connection
pub struct Origin {
    host: String,
    port: u16,
    tls: bool,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    conn: tokio::sync::Mutex<Option<Conn>>,
}

struct Conn {
    send: Sender,
    h2: bool,
    remote: SocketAddr,
}

enum Sender {
    H1(http1::SendRequest<Full<Bytes>>),
    H2(http2::SendRequest<Full<Bytes>>),
}

impl Sender {
    fn is_closed(&self) -> bool {
        match self {
            Sender::H1(s) => s.is_closed(),
            Sender::H2(s) => s.is_closed(),
        }
    }
}

impl Origin {
    pub fn new(host: String, port: u16, tls: bool) -> Self {
        let tls_config = tls.then(|| Arc::new(upstream_tls_config()));
        Origin {
            host,
            port,
            tls,
            tls_config,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    /// Send one exchange, dialing or re-dialing as needed. Stamps the phase
    /// record for `token` along the way.
    pub async fn send(
        &self,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        tracer: &PhaseTracer,
        token: u64,
    ) -> Result<hyper::Response<Incoming>> {
        let mut guard = self.conn.lock().await;

        let mut reused = true;
        if guard.as_ref().map_or(true, |c| c.send.is_closed()) {
            *guard = Some(self.dial(tracer, token).await?);
            reused = false;
        }
        let conn = guard.as_mut().expect("connection just established");

        tracer.record(token, |p| {
            p.reused = reused;
            p.alpn_h2 = conn.h2;
            p.remote_addr = conn.remote.to_string();
        });

        let request = build_wire_request(&method, &uri, &headers, &body, conn.h2, &self.host)?;

        let result = match &mut conn.send {
            Sender::H1(send) => {
                send.ready().await.context("Upstream connection not ready")?;
                tracer.record(token, |p| p.wrote_request = Some(Instant::now()));
                send.send_request(request).await
            }
            Sender::H2(send) => {
                send.ready().await.context("Upstream connection not ready")?;
                tracer.record(token, |p| p.wrote_request = Some(Instant::now()));
                send.send_request(request).await
            }
        };

        match result {
            Ok(response) => {
                tracer.record(token, |p| p.first_byte = Some(Instant::now()));
                Ok(response)
            }
            Err(e) => {
                // The transport is unusable either way
                *guard = None;
                Err(e).context("Upstream request failed")
            }
        }
    }

    /// DNS, TCP, optional TLS, hyper handshake. Every step stamps the
    /// phase record.
    async fn dial(&self, tracer: &PhaseTracer, token: u64) -> Result<Conn> {
        let target = format!("{}:{}", self.host, self.port);

        tracer.record(token, |p| p.dns_start = Some(Instant::now()));
        let addr = tokio::net::lookup_host(&target)
            .await
            .with_context(|| format!("DNS lookup failed for {}", target))?
            .next()
            .with_context(|| format!("DNS returned no addresses for {}", target))?;
        tracer.record(token, |p| p.dns_end = Some(Instant::now()));

        tracer.record(token, |p| p.connect_start = Some(Instant::now()));
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        let remote = tcp.peer_addr().unwrap_or(addr);
        tcp.set_nodelay(true).ok();
        tracer.record(token, |p| p.connect_end = Some(Instant::now()));

        if !self.tls {
            let io = TokioIo::new(tcp);
            let (send, conn) = http1::Builder::new()
                .handshake(io)
                .await
                .context("HTTP handshake with origin failed")?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!("origin connection ended: {}", e);
                }
            });
            return Ok(Conn {
                send: Sender::H1(send),
                h2: false,
                remote,
            });
        }

        let config = self
            .tls_config
            .clone()
            .expect("TLS origin without a client config");
        let server_name = ServerName::try_from(self.host.clone())
            .with_context(|| format!("Invalid SNI hostname {}", self.host))?;

        tracer.record(token, |p| p.tls_start = Some(Instant::now()));
        let tls = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {} failed", target))?;
        tracer.record(token, |p| p.tls_end = Some(Instant::now()));

        let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
        let io = TokioIo::new(tls);

        let send = if h2 {
            let (send, conn) = http2::Builder::new(TokioExecutor::new())
                .handshake(io)
                .await
                .context("HTTP/2 handshake with origin failed")?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!("origin h2 connection ended: {}", e);
                }
            });
            Sender::H2(send)
        } else {
            let (send, conn) = http1::Builder::new()
                .handshake(io)
                .await
                .context("HTTP handshake with origin failed")?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!("origin connection ended: {}", e);
                }
            });
            Sender::H1(send)
        };

        Ok(Conn {
            send,
            h2,
            remote,
        })
    }
}

/// Shape the request for the negotiated protocol: h2 wants the absolute
/// URI (hyper derives the pseudo headers) and no Host header; h1 wants
/// origin-form plus Host.
fn build_wire_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    h2: bool,
    host: &str,
) -> Result<Request<Full<Bytes>>> {
    let wire_uri: Uri = if h2 {
        uri.clone()
    } else {
        uri.path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .context("Invalid request path")?
    };

    let mut builder = Request::builder().method(method.clone()).uri(wire_uri);
    for (name, value) in headers.iter() {
        if name == header::HOST {
            continue;
        }
        builder = builder.header(name, value);
    }
    if !h2 {
        let host_value = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| host.to_string());
        builder = builder.header(header::HOST, host_value);
    }
    builder
        .body(Full::new(body.clone()))
        .context("Failed to build upstream request")
}

/// Strip hop-by-hop headers before forwarding either direction.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "proxy-authorization"
            | "keep-alive"
            | "upgrade"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "content-length"
    )
}

/// Client config for the upstream leg: verification disabled, ALPN offers
/// h2 then http/1.1.
fn upstream_tls_config() -> rustls::ClientConfig {
    crate::ca::init_crypto();
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

/// The operator installed our CA on the client side knowingly; the origin
/// side presents real certificates we deliberately do not check, since the
/// point is observation rather than end-to-end authentication.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
