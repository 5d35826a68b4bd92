// Proxy module - the dual-role listener
//
// One socket serves two personalities. Every accepted connection runs
// through the dispatcher: CONNECT goes to the MITM engine, absolute-form
// request targets (the mark of a forward proxy client) go to the plaintext
// proxy path, and everything else is control-plane traffic for the axum
// router. The dispatcher is the only place that decision is made.
//
// The accept loop is hand-rolled rather than axum::serve because CONNECT
// upgrades need hyper's connection builder; the router still handles all
// control-plane routing.

pub mod engine;
pub(crate) mod error;
pub mod grpc;
mod mitm;
pub mod origin;
pub mod phases;

use crate::ca::CertificateAuthority;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Router;
use engine::ProxyEngine;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use origin::Origin;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Everything a connection needs, cloned per accept
#[derive(Clone)]
pub struct ProxyState {
    pub engine: Arc<ProxyEngine>,
    pub ca: Arc<CertificateAuthority>,
    pub mitm_enabled: bool,
}

/// Accept loop. Runs until the shutdown signal flips, detaching one task
/// per connection.
pub async fn serve(
    listener: TcpListener,
    state: ProxyState,
    app: Router,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let tower_service = tower::service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let app = app.clone();
        async move { Ok::<_, Infallible>(dispatch(req, state, app).await) }
    });
    let hyper_service = TowerToHyperService::new(tower_service);

    tracing::info!("Proxy listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        stream.set_nodelay(true).ok();
                        let service = hyper_service.clone();
                        tokio::spawn(async move {
                            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                                .await
                            {
                                tracing::debug!("connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("accept failed: {}", e),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Proxy listener shut down");
    Ok(())
}

/// The routing decision: proxy verb, proxy target, or control plane.
async fn dispatch(req: Request<Incoming>, state: ProxyState, app: Router) -> Response<Body> {
    if req.method() == Method::CONNECT {
        return mitm::handle_connect(req, state).await;
    }
    // Absolute-form request targets are how forward-proxy clients speak
    if req.uri().scheme().is_some() {
        return proxy_plain(req, state).await;
    }
    match app.oneshot(req.map(Body::new)).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// Plaintext proxy path: dial per request, record, forward.
async fn proxy_plain(req: Request<Incoming>, state: ProxyState) -> Response<Body> {
    let uri = req.uri().clone();
    let Some(host) = uri.host().map(str::to_string) else {
        return (StatusCode::BAD_REQUEST, "request target has no host").into_response();
    };
    let tls = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

    let origin = Arc::new(Origin::new(host, port, tls));
    state
        .engine
        .proxy_request(req, origin, uri)
        .await
        .unwrap_or_else(|e| e.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisSink;
    use crate::api::{self, AppState};
    use crate::broker::EventBroker;
    use crate::capture::{Capture, TRUNCATION_SENTINEL};
    use crate::rules::ColorRuleStore;
    use crate::search::SearchHistoryStore;
    use crate::store::CaptureStore;
    use axum::routing::get;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    const TEST_MAX_BODY: usize = 1024;

    struct Harness {
        addr: SocketAddr,
        state: AppState,
        engine: Arc<ProxyEngine>,
        ca: Arc<CertificateAuthority>,
        _shutdown_tx: tokio::sync::watch::Sender<bool>,
    }

    /// Spin up a full proxy (dispatcher + engine + control plane) on an
    /// ephemeral port.
    async fn spawn_proxy(mitm_enabled: bool) -> Harness {
        let store = Arc::new(CaptureStore::new(100));
        let broker = Arc::new(EventBroker::new());
        let sink = Arc::new(AnalysisSink::with_defaults());
        let paused = Arc::new(AtomicBool::new(false));
        let engine = Arc::new(ProxyEngine::new(
            store.clone(),
            broker.clone(),
            sink.clone(),
            TEST_MAX_BODY,
            paused.clone(),
        ));
        let ca = Arc::new(CertificateAuthority::ephemeral().unwrap());

        let app_state = AppState {
            store,
            broker,
            rules: Arc::new(ColorRuleStore::with_defaults()),
            searches: Arc::new(SearchHistoryStore::new()),
            sink,
            paused,
        };
        let proxy_state = ProxyState {
            engine: engine.clone(),
            ca: ca.clone(),
            mitm_enabled,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let app = api::router(app_state.clone());
        tokio::spawn(serve(listener, proxy_state, app, shutdown_rx));

        Harness {
            addr,
            state: app_state,
            engine,
            ca,
            _shutdown_tx: shutdown_tx,
        }
    }

    /// Plain HTTP origin used as the upstream in most scenarios.
    async fn spawn_origin() -> SocketAddr {
        let app = Router::new()
            .route("/", get(|| async { StatusCode::NO_CONTENT }))
            .route(
                "/json",
                get(|| async {
                    ([("content-type", "application/json")], "{\"ok\":true}")
                }),
            )
            .route("/big", get(|| async { "A".repeat(TEST_MAX_BODY * 3) }))
            .route(
                "/grpc",
                get(|| async {
                    let mut frame = vec![0u8];
                    frame.extend_from_slice(&7u32.to_be_bytes());
                    frame.extend_from_slice(b"payload");
                    ([("content-type", "application/grpc")], frame)
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        addr
    }

    /// TLS origin for the MITM scenario: self-signed certificate, HTTP/1.1.
    async fn spawn_tls_origin() -> SocketAddr {
        use hyper::service::service_fn;

        crate::ca::init_crypto();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["127.0.0.1".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![cert.der().clone()],
                rustls::pki_types::PrivateKeyDer::Pkcs8(
                    rustls::pki_types::PrivatePkcs8KeyDer::from(key.serialize_der()),
                ),
            )
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(tls) = acceptor.accept(stream).await else {
                        return;
                    };
                    let service = service_fn(|_req: Request<Incoming>| async {
                        Response::builder()
                            .status(StatusCode::OK)
                            .header("content-type", "application/json")
                            .body(Body::from("{\"ok\":true}"))
                    });
                    hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(tls), service)
                        .await
                        .ok();
                });
            }
        });
        addr
    }

    fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", proxy)).unwrap())
            .no_gzip()
            .build()
            .unwrap()
    }

    /// Finalization runs in the forward task, so the capture can land a
    /// beat after the client sees the last byte.
    async fn wait_for_captures(store: &CaptureStore, count: usize) -> Vec<Capture> {
        for _ in 0..100 {
            let captures = store.list();
            if captures.len() >= count {
                return captures;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} captures, have {}", count, store.list().len());
    }

    /// Basic GET through the plaintext proxy path: one capture, default
    /// name, and an SSE-visible event.
    #[tokio::test]
    async fn plain_get_records_one_capture() {
        let origin = spawn_origin().await;
        let proxy = spawn_proxy(false).await;
        let mut sub = proxy.state.broker.subscribe();

        let url = format!("http://{}/", origin);
        let response = proxied_client(proxy.addr).get(&url).send().await.unwrap();
        assert_eq!(response.status(), 204);

        let captures = wait_for_captures(&proxy.state.store, 1).await;
        let capture = &captures[0];
        assert_eq!(capture.method, "GET");
        assert_eq!(capture.url, url);
        assert_eq!(capture.response_status, 204);
        assert_eq!(capture.request_body, "");
        assert_eq!(capture.name, format!("GET {} [204]", url));
        assert!(capture.notes.is_empty());
        assert!(!capture.connection.remote_addr.is_empty());

        let event = tokio::time::timeout(Duration::from_secs(1), sub.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, capture.id);
    }

    /// HTTPS MITM: the decrypted exchange is captured while the client
    /// talks TLS end to end.
    #[tokio::test]
    async fn mitm_captures_decrypted_https() {
        let origin = spawn_tls_origin().await;
        let proxy = spawn_proxy(true).await;

        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", proxy.addr)).unwrap())
            .add_root_certificate(
                reqwest::Certificate::from_pem(proxy.ca.ca_cert_pem().as_bytes()).unwrap(),
            )
            .use_rustls_tls()
            .build()
            .unwrap();

        let url = format!("https://127.0.0.1:{}/x", origin.port());
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "{\"ok\":true}");

        let captures = wait_for_captures(&proxy.state.store, 1).await;
        let capture = &captures[0];
        assert_eq!(capture.response_status, 200);
        assert_eq!(capture.response_body, "{\"ok\":true}");
        assert_eq!(capture.url, url);
        // The stub origin negotiated no ALPN, so the upstream leg is h1
        assert!(!capture.connection.http2);
        assert!(capture.timings.tls_ms > 0);
        assert!(capture.timings.total_ms > 0);
    }

    /// Truncation: the stored body is capped with the sentinel while the
    /// client receives every byte.
    #[tokio::test]
    async fn oversized_response_truncates_stored_body_only() {
        let origin = spawn_origin().await;
        let proxy = spawn_proxy(false).await;

        let body = proxied_client(proxy.addr)
            .get(format!("http://{}/big", origin))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body.len(), TEST_MAX_BODY * 3);
        assert!(body.chars().all(|c| c == 'A'));

        let captures = wait_for_captures(&proxy.state.store, 1).await;
        let stored = &captures[0].response_body;
        assert_eq!(stored.len(), TEST_MAX_BODY + TRUNCATION_SENTINEL.len());
        assert!(stored.ends_with(TRUNCATION_SENTINEL));
    }

    /// Pause: no capture appears while paused; resuming restores recording.
    #[tokio::test]
    async fn pause_suspends_recording() {
        let origin = spawn_origin().await;
        let proxy = spawn_proxy(false).await;
        let client = proxied_client(proxy.addr);
        let control = reqwest::Client::new();

        let pause_url = format!("http://{}/api/pause", proxy.addr);
        control
            .post(&pause_url)
            .json(&serde_json::json!({ "paused": true }))
            .send()
            .await
            .unwrap();

        let response = client
            .get(format!("http://{}/", origin))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(proxy.state.store.is_empty());

        control
            .post(&pause_url)
            .json(&serde_json::json!({ "paused": false }))
            .send()
            .await
            .unwrap();
        client
            .get(format!("http://{}/", origin))
            .send()
            .await
            .unwrap();
        wait_for_captures(&proxy.state.store, 1).await;
    }

    /// gRPC sampling idempotence: the client's bytes are identical while
    /// the capture holds sampled frames instead of a body dump.
    #[tokio::test]
    async fn grpc_body_forwards_bitwise_and_samples_frames() {
        let origin = spawn_origin().await;
        let proxy = spawn_proxy(false).await;

        let bytes = proxied_client(proxy.addr)
            .get(format!("http://{}/grpc", origin))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();

        let mut expected = vec![0u8];
        expected.extend_from_slice(&7u32.to_be_bytes());
        expected.extend_from_slice(b"payload");
        assert_eq!(bytes.as_ref(), expected.as_slice());

        let captures = wait_for_captures(&proxy.state.store, 1).await;
        let capture = &captures[0];
        assert_eq!(capture.response_body, "");
        let grpc = capture.grpc.as_ref().expect("grpc sub-record");
        assert_eq!(grpc.response_frames.len(), 1);
        assert_eq!(grpc.response_frames[0].length, 7);
    }

    /// An unreachable origin records a stub capture and feeds the sink a
    /// network-error observation; the client sees 502.
    #[tokio::test]
    async fn transport_error_records_stub() {
        let proxy = spawn_proxy(false).await;

        // A port that nothing listens on
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let response = proxied_client(proxy.addr)
            .get(format!("http://{}/x", dead_addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);

        let captures = wait_for_captures(&proxy.state.store, 1).await;
        let capture = &captures[0];
        assert_eq!(capture.response_status, 0);
        assert_eq!(capture.name, format!("GET http://{}/x", dead_addr));
        assert_eq!(proxy.state.sink.snapshots()["outcomes"]["network-error"], 1);
    }

    /// The dispatcher keeps control-plane traffic out of the proxy path.
    #[tokio::test]
    async fn control_plane_answers_origin_form_requests() {
        let proxy = spawn_proxy(false).await;
        let response = reqwest::Client::new()
            .get(format!("http://{}/api/captures", proxy.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.json::<Vec<Capture>>().await.unwrap().len(), 0);
    }

    /// Ephemeral request state is cleaned up after every exchange.
    #[tokio::test]
    async fn no_phase_or_partial_leaks() {
        let origin = spawn_origin().await;
        let proxy = spawn_proxy(false).await;
        let client = proxied_client(proxy.addr);

        for _ in 0..3 {
            client
                .get(format!("http://{}/", origin))
                .send()
                .await
                .unwrap();
        }
        wait_for_captures(&proxy.state.store, 3).await;

        // Give the forward tasks a beat to finish their cleanup
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(proxy.engine.tracer.in_flight(), 0);
        assert_eq!(proxy.engine.pending_partials(), 0);
    }
}
