use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{header, Request, Response, Version};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::{
    config::models::ProxyConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// TLS handshakes to upstreams are bounded by the connect timeout.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide upstream HTTP client backed by Hyper with Rustls.
///
/// The connection pool is built once at startup from the `proxy` config
/// section and shared across every service; it is never mutated afterwards.
/// Each request runs under the configured proxy timeout.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    request_timeout: Duration,
}

impl HttpClientAdapter {
    pub fn new(proxy: &ProxyConfig) -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // allow https upstreams
        http_connector.set_connect_timeout(Some(TLS_HANDSHAKE_TIMEOUT));
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add a native certificate to the root store");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(proxy.max_idle_conns)
            .pool_idle_timeout(proxy.idle_conn_timeout())
            .build::<_, Body>(https_connector);

        tracing::info!(
            max_idle_conns = proxy.max_idle_conns,
            idle_conn_timeout_secs = proxy.idle_conn_timeout,
            request_timeout_secs = proxy.timeout,
            "upstream HTTP client pool created"
        );

        Ok(Self {
            client,
            request_timeout: proxy.timeout(),
        })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn execute(&self, mut req: Request<Body>) -> HttpClientResult<Response<Body>> {
        if req.uri().host().is_none() {
            return Err(HttpClientError::InvalidRequest(format!(
                "outgoing URI has no host: {}",
                req.uri()
            )));
        }

        *req.version_mut() = Version::HTTP_11;

        let method = req.method().clone();
        let uri = req.uri().clone();

        match timeout(self.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                // Hyper decodes the transfer encoding; the server side frames
                // the body again itself.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, Body::new(body)))
            }
            Ok(Err(e)) => Err(HttpClientError::Connection(format!(
                "request to {method} {uri} failed: {e}"
            ))),
            Err(_) => Err(HttpClientError::Timeout(self.request_timeout)),
        }
    }

    async fn probe(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .body(Body::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        match timeout(Duration::from_secs(timeout_secs), self.client.request(request)).await {
            Ok(Ok(response)) => {
                let healthy = response.status().is_success();
                // Drain the body so the connection can return to the pool.
                let _ = response.into_body().collect().await;
                Ok(healthy)
            }
            Ok(Err(e)) => {
                tracing::debug!(url, error = %e, "health probe connection error");
                Ok(false)
            }
            Err(_) => Err(HttpClientError::Timeout(Duration::from_secs(timeout_secs))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_creation_succeeds_with_defaults() {
        let client = HttpClientAdapter::new(&ProxyConfig::default());
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn execute_rejects_relative_uri() {
        let client = HttpClientAdapter::new(&ProxyConfig::default()).unwrap();
        let req = Request::builder()
            .uri("/no-host")
            .body(Body::empty())
            .unwrap();

        match client.execute(req).await {
            Err(HttpClientError::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn probe_unreachable_host_reports_unhealthy() {
        let client = HttpClientAdapter::new(&ProxyConfig::default()).unwrap();
        // Reserved TEST-NET address; connection is refused or times out fast.
        let result = client.probe("http://127.0.0.1:1/health", 1).await;
        match result {
            Ok(false) | Err(HttpClientError::Timeout(_)) => {}
            other => panic!("expected unhealthy probe, got {other:?}"),
        }
    }
}
