//! WebSocket tunnel forwarding, including the Socket.IO handshake mode.
//!
//! The forwarder upgrades the client connection, dials a matching WebSocket
//! to the upstream, and pumps frames in both directions until either side
//! closes. Header preparation for the dial is implemented as pure functions
//! over a header map so the rewrite rules can be tested in isolation.
use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::body::Body;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest, protocol::CloseFrame, protocol::Role, Error as WsError, Message,
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::models::{ProtocolHint, ServiceConfig},
    core::error::GatewayError,
    tracing_setup,
};

/// Client-side upgrade must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Hard cap on the upstream dial (connect + websocket handshake).
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-step deadline of the Socket.IO pre-pump exchange.
const SOCKETIO_STEP_TIMEOUT: Duration = Duration::from_secs(5);
/// At most this many bytes of a failed dial's response body are logged.
const DIAL_ERROR_BODY_LIMIT: usize = 1024;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The four canonical WebSocket headers re-added verbatim to the dial.
const CANONICAL_WS_HEADERS: [&str; 4] = [
    "Sec-WebSocket-Key",
    "Sec-WebSocket-Version",
    "Sec-WebSocket-Extensions",
    "Sec-WebSocket-Protocol",
];

/// RFC 6455 upgrade detection: `Upgrade: websocket` plus a connection
/// upgrade, key and version.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    let has_connection = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        });

    has_upgrade
        && has_connection
        && headers.contains_key("sec-websocket-key")
        && headers.contains_key("sec-websocket-version")
}

/// Build the header map deposited for the dial: every inbound header except
/// the upgrade mechanics, then the canonical WebSocket headers verbatim,
/// plus the proxy identity headers.
pub fn prepare_forward_headers(
    headers: &HeaderMap,
    client_ip: &str,
    raw_query: Option<&str>,
) -> HashMap<String, String> {
    let mut prepared = HashMap::new();

    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        if value.is_empty() {
            continue;
        }
        let lower = name.as_str().to_ascii_lowercase();
        if lower.starts_with("sec-websocket-") || lower == "upgrade" || lower == "connection" {
            continue;
        }
        // Re-set below under their canonical names.
        if lower == "x-forwarded-for" || lower == "x-real-ip" || lower == "x-original-query" {
            continue;
        }
        prepared.insert(name.as_str().to_string(), value.to_string());
    }

    for canonical in CANONICAL_WS_HEADERS {
        if let Some(value) = headers.get(canonical).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                prepared.insert(canonical.to_string(), value.to_string());
            }
        }
    }

    prepared.insert("X-Real-IP".to_string(), client_ip.to_string());
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip.to_string(),
    };
    prepared.insert("X-Forwarded-For".to_string(), forwarded_for);

    if let Some(query) = raw_query {
        if !query.is_empty() {
            prepared.insert("X-Original-Query".to_string(), query.to_string());
        }
    }

    prepared
}

/// Split a bracketed `"[a, b]"` header value into its cleaned entries.
/// Non-bracketed values are returned as a single entry.
fn split_bracketed_list(value: &str) -> Vec<String> {
    if value.starts_with('[') && value.ends_with(']') {
        value
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
            .collect()
    } else {
        vec![value.to_string()]
    }
}

fn is_socketio(hint: ProtocolHint, upstream_path: &str) -> bool {
    match hint {
        ProtocolHint::Auto => upstream_path.contains("/socket.io/"),
        ProtocolHint::Socketio => true,
        ProtocolHint::Raw => false,
    }
}

/// Compose the dial request for the upstream WebSocket per the header
/// hygiene rules. `path` may carry an embedded query, which wins over any
/// `X-Original-Query` entry; the latter never reaches the upstream.
fn build_dial_request(
    target: &str,
    path: &str,
    mut headers: HashMap<String, String>,
    hint: ProtocolHint,
    cx: &opentelemetry::Context,
) -> Result<(Request<()>, bool), GatewayError> {
    let origin =
        Url::parse(target).map_err(|e| GatewayError::BadTarget(format!("{target}: {e}")))?;
    let host = origin
        .host_str()
        .ok_or_else(|| GatewayError::BadTarget(format!("{target}: missing host")))?;
    let authority = match origin.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let ws_scheme = if origin.scheme() == "https" { "wss" } else { "ws" };

    let mut path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let mut query = headers.remove("X-Original-Query").unwrap_or_default();
    if let Some(idx) = path.find('?') {
        let embedded = path[idx + 1..].to_string();
        path.truncate(idx);
        if !embedded.is_empty() {
            query = embedded;
        }
    }

    let ws_url = if query.is_empty() {
        format!("{ws_scheme}://{authority}{path}")
    } else {
        format!("{ws_scheme}://{authority}{path}?{query}")
    };
    let socketio = is_socketio(hint, &path);

    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| GatewayError::RequestBuild(e.to_string()))?;

    for (name, value) in &headers {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("sec-websocket-") || lower == "upgrade" || lower == "connection" {
            continue;
        }
        let Ok(header_name) = name.parse::<HeaderName>() else {
            continue;
        };
        for entry in split_bracketed_list(value) {
            if let Ok(header_value) = HeaderValue::from_str(&entry) {
                request.headers_mut().append(header_name.clone(), header_value);
            }
        }
    }

    request.headers_mut().insert(
        "X-Source",
        HeaderValue::from_static("api-gateway"),
    );
    let host_value = HeaderValue::from_str(&authority)
        .map_err(|e| GatewayError::RequestBuild(format!("invalid host header: {e}")))?;
    request.headers_mut().insert(http::header::HOST, host_value);

    tracing_setup::inject_context(cx, request.headers_mut());

    for canonical in CANONICAL_WS_HEADERS {
        if let Some(value) = headers.get(canonical) {
            if let (Ok(name), Ok(val)) = (
                canonical.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                request.headers_mut().insert(name, val);
            }
        }
    }

    if socketio {
        // Socket.IO upstreams reject subprotocol offers, and frames must not
        // be compressed.
        request.headers_mut().remove("sec-websocket-protocol");
        request.headers_mut().remove("sec-websocket-extensions");
    } else if let Some(proto) = headers.get("Sec-WebSocket-Protocol") {
        let offered = split_bracketed_list(proto).join(", ");
        if let Ok(val) = HeaderValue::from_str(&offered) {
            request
                .headers_mut()
                .insert("sec-websocket-protocol", val);
        }
    }

    Ok((request, socketio))
}

/// Outcome of one pump direction.
enum PumpEnd {
    /// The peer closed; carries the close code when one was received.
    Closed(Option<u16>),
    Error(WsError),
}

fn close_code(frame: &Option<CloseFrame>) -> Option<u16> {
    frame.as_ref().map(|f| u16::from(f.code))
}

/// Close codes treated as normal termination: 1000 (normal), 1001 (going
/// away), 1005 (no status), 1006 (abnormal, peer vanished).
fn is_normal_close_code(code: Option<u16>) -> bool {
    matches!(code, None | Some(1000) | Some(1001) | Some(1005) | Some(1006))
}

fn is_normal_close_error(error: &WsError) -> bool {
    matches!(
        error,
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_)
    )
}

/// Bidirectional WebSocket forwarder with a Socket.IO-aware handshake.
#[derive(Default)]
pub struct WsForwarder;

impl WsForwarder {
    pub fn new() -> Self {
        Self
    }

    /// Upgrade the client connection and start the tunnel. Returns the `101
    /// Switching Protocols` response to write back; the tunnel itself runs on
    /// a spawned task for the lifetime of the connection.
    pub fn handle_upgrade(
        &self,
        req: Request<Body>,
        svc: &ServiceConfig,
        target: &str,
        path: &str,
        prepared_headers: HashMap<String, String>,
        cx: opentelemetry::Context,
    ) -> Result<Response<Body>, GatewayError> {
        let ws_key = req
            .headers()
            .get("sec-websocket-key")
            .and_then(|key| key.to_str().ok())
            .ok_or_else(|| {
                GatewayError::RequestBuild("missing Sec-WebSocket-Key header".to_string())
            })?;

        let mut hasher = Sha1::new();
        hasher.update(ws_key.as_bytes());
        hasher.update(WS_GUID.as_bytes());
        let ws_accept = BASE64.encode(hasher.finalize());

        let (dial_request, socketio) =
            build_dial_request(target, path, prepared_headers, svc.protocol_hint, &cx)?;

        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(http::header::UPGRADE, "websocket")
            .header(http::header::CONNECTION, "Upgrade")
            .header("Sec-WebSocket-Accept", ws_accept)
            .body(Body::empty())
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        let service = svc.name.clone();
        let upstream_url = dial_request.uri().to_string();
        tokio::spawn(async move {
            match run_tunnel(req, dial_request, socketio).await {
                Ok(()) => {
                    tracing::debug!(service = %service, upstream = %upstream_url, "websocket tunnel closed");
                }
                Err(e) => {
                    tracing::error!(service = %service, upstream = %upstream_url, error = %e, "websocket tunnel failed");
                }
            }
        });

        Ok(response)
    }
}

/// Upgrade the client side, dial the upstream, run the optional Socket.IO
/// handshake, then pump frames until the first error or close.
async fn run_tunnel(
    req: Request<Body>,
    dial_request: Request<()>,
    socketio: bool,
) -> Result<(), GatewayError> {
    let upstream_url = dial_request.uri().to_string();

    let upgraded = timeout(HANDSHAKE_TIMEOUT, hyper::upgrade::on(req))
        .await
        .map_err(|_| GatewayError::UpstreamTimeout(HANDSHAKE_TIMEOUT))?
        .map_err(|e| GatewayError::Internal(format!("client upgrade failed: {e}")))?;

    let mut client_ws =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    let mut upstream_ws = match dial_upstream(dial_request).await {
        Ok(ws) => ws,
        Err(e) => {
            // The client was already upgraded; close it before bailing.
            let _ = client_ws.close(None).await;
            return Err(e);
        }
    };

    tracing::debug!(upstream = %upstream_url, socketio, "websocket connection established");

    if socketio {
        socketio_handshake(&mut client_ws, &mut upstream_ws).await?;
    }

    let (upstream_tx, upstream_rx) = upstream_ws.split();
    let (client_tx, client_rx) = client_ws.split();

    let done = CancellationToken::new();
    let (end_tx, mut end_rx) = mpsc::channel::<(&'static str, PumpEnd)>(2);

    let c2u = tokio::spawn(pump(
        client_rx,
        upstream_tx,
        "client->upstream",
        done.clone(),
        end_tx.clone(),
    ));
    let u2c = tokio::spawn(pump(
        upstream_rx,
        client_tx,
        "upstream->client",
        done.clone(),
        end_tx,
    ));

    let first = end_rx.recv().await;
    done.cancel();
    let _ = tokio::join!(c2u, u2c);

    match first {
        Some((direction, PumpEnd::Closed(code))) if is_normal_close_code(code) => {
            tracing::debug!(direction, code = ?code, "websocket closed");
            Ok(())
        }
        Some((direction, PumpEnd::Closed(code))) => {
            tracing::error!(direction, code = ?code, upstream = %upstream_url, "websocket closed with abnormal code");
            Err(GatewayError::Upstream(format!(
                "websocket closed abnormally ({direction}): code {code:?}"
            )))
        }
        Some((direction, PumpEnd::Error(e))) if is_normal_close_error(&e) => {
            tracing::debug!(direction, error = %e, "websocket closed");
            Ok(())
        }
        Some((direction, PumpEnd::Error(e))) => {
            tracing::error!(direction, error = %e, upstream = %upstream_url, "websocket proxy error");
            Err(GatewayError::Upstream(format!(
                "websocket proxy error ({direction}): {e}"
            )))
        }
        None => Ok(()),
    }
}

async fn dial_upstream(
    dial_request: Request<()>,
) -> Result<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, GatewayError> {
    let url = dial_request.uri().to_string();
    let connector = Connector::Rustls(Arc::new(insecure_tls_config()));

    match timeout(
        DIAL_TIMEOUT,
        connect_async_tls_with_config(dial_request, None, false, Some(connector)),
    )
    .await
    {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => {
            if let WsError::Http(response) = &e {
                let body = response
                    .body()
                    .as_deref()
                    .map(|b| &b[..b.len().min(DIAL_ERROR_BODY_LIMIT)])
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default()
                    .into_owned();
                tracing::error!(
                    status = response.status().as_u16(),
                    headers = ?response.headers(),
                    body = %body,
                    url = %url,
                    "websocket dial rejected by upstream"
                );
            } else {
                tracing::error!(error = %e, url = %url, "websocket dial failed");
            }
            Err(GatewayError::Upstream(format!(
                "failed to connect to upstream websocket {url}: {e}"
            )))
        }
        Err(_) => Err(GatewayError::UpstreamTimeout(DIAL_TIMEOUT)),
    }
}

/// TLS verification is disabled for upstream dials: targets live on a
/// trusted internal network, frequently behind self-signed certificates.
fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification(
            rustls::crypto::aws_lc_rs::default_provider(),
        )))
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoVerification(rustls::crypto::CryptoProvider);

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Socket.IO expects a synchronous exchange before bidirectional streaming:
/// one frame upstream→client, then one frame client→upstream, each step
/// bounded by a 5s deadline. Only then do the pumps start.
async fn socketio_handshake<C, U>(client: &mut C, upstream: &mut U) -> Result<(), GatewayError>
where
    C: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    U: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let initial = timeout(SOCKETIO_STEP_TIMEOUT, upstream.next())
        .await
        .map_err(|_| GatewayError::UpstreamTimeout(SOCKETIO_STEP_TIMEOUT))?
        .ok_or_else(|| GatewayError::Upstream("upstream closed during socket.io handshake".into()))?
        .map_err(|e| GatewayError::Upstream(format!("socket.io handshake read failed: {e}")))?;

    timeout(SOCKETIO_STEP_TIMEOUT, client.send(initial))
        .await
        .map_err(|_| GatewayError::UpstreamTimeout(SOCKETIO_STEP_TIMEOUT))?
        .map_err(|e| {
            GatewayError::Upstream(format!("failed to forward socket.io handshake to client: {e}"))
        })?;

    let reply = timeout(SOCKETIO_STEP_TIMEOUT, client.next())
        .await
        .map_err(|_| GatewayError::UpstreamTimeout(SOCKETIO_STEP_TIMEOUT))?
        .ok_or_else(|| GatewayError::Upstream("client closed during socket.io handshake".into()))?
        .map_err(|e| {
            GatewayError::Upstream(format!("socket.io client handshake read failed: {e}"))
        })?;

    timeout(SOCKETIO_STEP_TIMEOUT, upstream.send(reply))
        .await
        .map_err(|_| GatewayError::UpstreamTimeout(SOCKETIO_STEP_TIMEOUT))?
        .map_err(|e| {
            GatewayError::Upstream(format!(
                "failed to forward socket.io handshake to upstream: {e}"
            ))
        })?;

    tracing::debug!("socket.io handshake completed");
    Ok(())
}

/// Read frames from `rx` and write the same (type, payload) to `tx` until
/// cancellation, close, or the first error. The first termination cause is
/// reported on `ends`.
async fn pump<R, W>(
    mut rx: R,
    mut tx: W,
    direction: &'static str,
    done: CancellationToken,
    ends: mpsc::Sender<(&'static str, PumpEnd)>,
) where
    R: Stream<Item = Result<Message, WsError>> + Unpin + Send,
    W: Sink<Message, Error = WsError> + Unpin + Send,
{
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        let code = close_code(&frame);
                        let _ = tx.send(Message::Close(frame)).await;
                        let _ = ends.send((direction, PumpEnd::Closed(code))).await;
                        break;
                    }
                    Some(Ok(message)) => {
                        if let Err(e) = tx.send(message).await {
                            let _ = ends.send((direction, PumpEnd::Error(e))).await;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = ends.send((direction, PumpEnd::Error(e))).await;
                        break;
                    }
                    // Stream ended without a close frame: the peer vanished.
                    None => {
                        let _ = ends.send((direction, PumpEnd::Closed(Some(1006)))).await;
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(direction, "forwarder stopped");
}
