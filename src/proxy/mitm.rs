// MITM engine - CONNECT interception and the TLS bridge
//
// A CONNECT either becomes an opaque byte tunnel (MITM off) or a decrypting
// bridge (MITM on): we answer the client's handshake with a leaf minted for
// the requested host, dial the origin with our own TLS session, and serve
// the decrypted inner exchanges through the capture engine. One upstream
// connection lives per tunnel, so consecutive inner requests reuse the
// transport and the phase record marks them as such.
//
// The client-side handshake failing is fatal for the connection and records
// nothing: the client either does not trust our CA or never meant to speak
// TLS, and in both cases there is no exchange to capture.

use super::ProxyState;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Entry point for CONNECT requests. Replies 200 immediately and finishes
/// the tunnel on the upgraded connection.
pub(super) async fn handle_connect(req: Request<Incoming>, state: ProxyState) -> Response<Body> {
    let Some((host, port)) = connect_target(req.uri()) else {
        tracing::warn!("CONNECT with unusable target: {}", req.uri());
        return (StatusCode::BAD_REQUEST, "CONNECT requires host:port").into_response();
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if state.mitm_enabled {
                    if let Err(e) = bridge(upgraded, host.clone(), port, state).await {
                        tracing::debug!("MITM bridge for {}:{} ended: {:#}", host, port, e);
                    }
                } else if let Err(e) = tunnel(upgraded, &host, port).await {
                    tracing::debug!("tunnel to {}:{} ended: {}", host, port, e);
                }
            }
            Err(e) => tracing::warn!("CONNECT upgrade failed: {}", e),
        }
    });

    Response::new(Body::empty())
}

fn connect_target(uri: &Uri) -> Option<(String, u16)> {
    let authority = uri.authority()?;
    Some((
        authority.host().to_string(),
        authority.port_u16().unwrap_or(443),
    ))
}

/// Opaque splice: no TLS termination, no inner HTTP, no capture.
async fn tunnel(upgraded: Upgraded, host: &str, port: u16) -> std::io::Result<()> {
    let mut origin = TcpStream::connect((host, port)).await?;
    let mut client = TokioIo::new(upgraded);
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut origin).await?;
    tracing::debug!(
        "tunnel {}:{} closed ({} bytes up, {} bytes down)",
        host,
        port,
        sent,
        received
    );
    Ok(())
}

/// Decrypting bridge: terminate the client's TLS with a minted leaf, then
/// serve every inner exchange through the capture engine against a single
/// per-tunnel origin connection.
async fn bridge(
    upgraded: Upgraded,
    host: String,
    port: u16,
    state: ProxyState,
) -> anyhow::Result<()> {
    let config = state.ca.server_config(&host)?;
    let tls = TlsAcceptor::from(config)
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| anyhow::anyhow!("client TLS handshake for {} failed: {}", host, e))?;

    let origin = Arc::new(super::origin::Origin::new(host.clone(), port, true));
    let engine = state.engine.clone();

    let service = service_fn(move |req: Request<Incoming>| {
        let engine = engine.clone();
        let origin = origin.clone();
        let host = host.clone();
        async move {
            let url = inner_url(&host, port, req.uri());
            let response = match url {
                Ok(url) => engine
                    .proxy_request(req, origin, url)
                    .await
                    .unwrap_or_else(|e| e.into_response()),
                Err(e) => {
                    tracing::warn!("unusable inner request target: {}", e);
                    (StatusCode::BAD_REQUEST, "bad request target").into_response()
                }
            };
            Ok::<_, Infallible>(response)
        }
    });

    // auto negotiates h1 vs h2 from what the client actually speaks; the
    // acceptor offered both via ALPN
    auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(|e| anyhow::anyhow!("inner connection ended: {}", e))?;
    Ok(())
}

/// Reconstruct the absolute URL the client meant: SNI host + inner path.
fn inner_url(host: &str, port: u16, uri: &Uri) -> anyhow::Result<Uri> {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = if port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, port, path)
    };
    url.parse::<Uri>()
        .map_err(|e| anyhow::anyhow!("invalid inner URL {}: {}", url, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_target_parses_host_port() {
        let uri: Uri = "example.test:8443".parse().unwrap();
        assert_eq!(
            connect_target(&uri),
            Some(("example.test".to_string(), 8443))
        );

        let uri: Uri = "example.test:443".parse().unwrap();
        assert_eq!(connect_target(&uri), Some(("example.test".to_string(), 443)));
    }

    #[test]
    fn inner_url_omits_default_port() {
        let uri: Uri = "/x?y=1".parse().unwrap();
        assert_eq!(
            inner_url("example.test", 443, &uri).unwrap().to_string(),
            "https://example.test/x?y=1"
        );
        assert_eq!(
            inner_url("example.test", 8443, &uri).unwrap().to_string(),
            "https://example.test:8443/x?y=1"
        );
    }
}
