//! HTTP request forwarding.
//!
//! Translates an inbound request into an equivalent outbound request against
//! the selected upstream origin, relays the response verbatim, and optionally
//! caches idempotent GETs. The forwarder never writes to the client itself:
//! it returns a fully buffered response (or an error) so the resilience
//! wrappers can re-run it safely.
use axum::body::Body;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use url::Url;

use crate::{
    config::models::ServiceConfig,
    core::{
        cache::ResponseCache,
        error::{BufferedResponse, GatewayError},
    },
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup,
};

/// Header hint emitted when a service has `enable_sticky_session` set. The
/// flag is advisory: it never influences target selection here.
const STICKY_SESSION_HEADER: &str = "x-sticky-session";

pub struct HttpForwarder {
    client: Arc<dyn HttpClient>,
    cache: Option<ResponseCache>,
}

impl HttpForwarder {
    pub fn new(client: Arc<dyn HttpClient>, cache: Option<ResponseCache>) -> Self {
        Self { client, cache }
    }

    /// Forward a buffered inbound request to `target` and return the buffered
    /// upstream response.
    ///
    /// `inbound_path` is the path as the client sent it (used for the cache
    /// key); `remainder` is the path to forward (base-path-stripped when the
    /// service asks for it).
    #[allow(clippy::too_many_arguments)]
    pub async fn forward(
        &self,
        method: &Method,
        headers: &HeaderMap,
        body: &Bytes,
        inbound_path: &str,
        raw_query: Option<&str>,
        remainder: &str,
        target: &str,
        svc: &ServiceConfig,
    ) -> Result<BufferedResponse, GatewayError> {
        // WebSocket upgrades belong to the WebSocket forwarder; never consume
        // one here.
        if headers
            .get(header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        {
            return Err(GatewayError::UpgradeRequest);
        }

        let cache_key = cache_key(inbound_path, raw_query);
        if method == Method::GET {
            if let Some(cache) = &self.cache {
                if let Some(cached) = cache.get(&cache_key) {
                    tracing::debug!(path = inbound_path, service = %svc.name, "cache hit");
                    return Ok(BufferedResponse::new(
                        StatusCode::OK,
                        HeaderMap::new(),
                        cached,
                    ));
                }
            }
        }

        let origin = Url::parse(target)
            .map_err(|e| GatewayError::BadTarget(format!("{target}: {e}")))?;
        let host = origin
            .host_str()
            .ok_or_else(|| GatewayError::BadTarget(format!("{target}: missing host")))?;
        let authority = match origin.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut request_url = format!("{}://{}", origin.scheme(), authority);
        if !origin.path().is_empty() && origin.path() != "/" {
            request_url.push_str(origin.path().trim_end_matches('/'));
        }
        if !remainder.is_empty() {
            if !remainder.starts_with('/') {
                request_url.push('/');
            }
            request_url.push_str(remainder);
        }
        if let Some(query) = raw_query {
            if !query.is_empty() {
                request_url.push('?');
                request_url.push_str(query);
            }
        }

        let mut req = Request::builder()
            .method(method.clone())
            .uri(&request_url)
            .body(Body::from(body.clone()))
            .map_err(|e| GatewayError::RequestBuild(e.to_string()))?;

        // Copy every inbound header verbatim, then override Host, then let
        // the service's configured headers win on conflict.
        *req.headers_mut() = headers.clone();
        // The outbound body is a buffered byte sequence; framing is the
        // client pool's job.
        req.headers_mut().remove(header::TRANSFER_ENCODING);
        let host_value = HeaderValue::from_str(&authority)
            .map_err(|e| GatewayError::RequestBuild(format!("invalid host header: {e}")))?;
        req.headers_mut().insert(header::HOST, host_value);

        for (name, value) in &svc.headers {
            match (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    req.headers_mut().insert(name, value);
                }
                _ => {
                    tracing::warn!(service = %svc.name, header = %name, "skipping invalid configured header");
                }
            }
        }

        if svc.enable_sticky_session {
            req.headers_mut().insert(
                HeaderName::from_static(STICKY_SESSION_HEADER),
                HeaderValue::from_static("enabled"),
            );
        }

        tracing_setup::inject_current_context(req.headers_mut());

        let response = self.client.execute(req).await.map_err(|e| match e {
            HttpClientError::InvalidRequest(msg) => GatewayError::RequestBuild(msg),
            HttpClientError::Connection(msg) => GatewayError::Upstream(msg),
            HttpClientError::Timeout(d) => {
                GatewayError::Upstream(format!("upstream did not answer within {d:?}"))
            }
        })?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let response_body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| GatewayError::BodyRead(e.to_string()))?
            .to_bytes();

        tracing::debug!(
            method = %method,
            path = inbound_path,
            target = %request_url,
            status = status.as_u16(),
            service = %svc.name,
            "proxied request"
        );

        if status.is_server_error() {
            return Err(GatewayError::UpstreamStatus {
                response: BufferedResponse::new(status, response_headers, response_body),
            });
        }

        if method == Method::GET && status == StatusCode::OK {
            if let Some(cache) = &self.cache {
                cache.set(cache_key, response_body.clone());
            }
        }

        Ok(BufferedResponse::new(status, response_headers, response_body))
    }
}

fn cache_key(path: &str, raw_query: Option<&str>) -> String {
    match raw_query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::response::Response;

    use super::*;
    use crate::ports::http_client::HttpClientResult;

    /// Records outgoing requests and replays canned responses.
    struct FakeClient {
        requests: Mutex<Vec<(Method, String, HeaderMap)>>,
        responses: Mutex<Vec<(StatusCode, &'static str)>>,
    }

    impl FakeClient {
        fn returning(responses: Vec<(StatusCode, &'static str)>) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            })
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn last_request(&self) -> (Method, String, HeaderMap) {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl HttpClient for FakeClient {
        async fn execute(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            self.requests.lock().unwrap().push((
                req.method().clone(),
                req.uri().to_string(),
                req.headers().clone(),
            ));
            let (status, body) = {
                let mut responses = self.responses.lock().unwrap();
                if responses.is_empty() {
                    (StatusCode::OK, "")
                } else {
                    responses.remove(0)
                }
            };
            Ok(Response::builder()
                .status(status)
                .header("x-upstream-header", "present")
                .body(Body::from(body))
                .unwrap())
        }

        async fn probe(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    fn service(name: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            base_path: format!("/{name}"),
            targets: vec!["http://u:9".to_string()],
            strip_base_path: true,
            enable_websocket: false,
            enable_sticky_session: false,
            headers: Default::default(),
            protocol_hint: Default::default(),
            health_check: None,
        }
    }

    async fn forward_get(
        forwarder: &HttpForwarder,
        svc: &ServiceConfig,
        inbound_path: &str,
        query: Option<&str>,
        remainder: &str,
    ) -> Result<BufferedResponse, GatewayError> {
        forwarder
            .forward(
                &Method::GET,
                &HeaderMap::new(),
                &Bytes::new(),
                inbound_path,
                query,
                remainder,
                "http://u:9",
                svc,
            )
            .await
    }

    #[tokio::test]
    async fn composes_stripped_url_with_query() {
        let client = FakeClient::returning(vec![(StatusCode::OK, "hi")]);
        let forwarder = HttpForwarder::new(client.clone(), None);
        let svc = service("a");

        let resp = forward_get(&forwarder, &svc, "/a/hello", Some("x=1"), "/hello")
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, Bytes::from_static(b"hi"));

        let (method, uri, headers) = client.last_request();
        assert_eq!(method, Method::GET);
        assert_eq!(uri, "http://u:9/hello?x=1");
        assert_eq!(headers.get(header::HOST).unwrap(), "u:9");
    }

    #[tokio::test]
    async fn origin_path_is_prefixed() {
        let client = FakeClient::returning(vec![(StatusCode::OK, "")]);
        let forwarder = HttpForwarder::new(client.clone(), None);
        let svc = service("a");

        forwarder
            .forward(
                &Method::GET,
                &HeaderMap::new(),
                &Bytes::new(),
                "/a/v1/users",
                None,
                "/v1/users",
                "http://u:9/base",
                &svc,
            )
            .await
            .unwrap();

        let (_, uri, _) = client.last_request();
        assert_eq!(uri, "http://u:9/base/v1/users");
    }

    #[tokio::test]
    async fn service_headers_override_inbound() {
        let client = FakeClient::returning(vec![(StatusCode::OK, "")]);
        let forwarder = HttpForwarder::new(client.clone(), None);
        let mut svc = service("a");
        svc.headers
            .insert("X-Tenant".to_string(), "configured".to_string());
        svc.enable_sticky_session = true;

        let mut inbound = HeaderMap::new();
        inbound.insert("x-tenant", "client-supplied".parse().unwrap());
        inbound.insert("x-request-id", "req-1".parse().unwrap());

        forwarder
            .forward(
                &Method::POST,
                &inbound,
                &Bytes::from_static(b"{}"),
                "/a/x",
                None,
                "/x",
                "http://u:9",
                &svc,
            )
            .await
            .unwrap();

        let (_, _, headers) = client.last_request();
        assert_eq!(headers.get("x-tenant").unwrap(), "configured");
        assert_eq!(headers.get("x-request-id").unwrap(), "req-1");
        assert_eq!(headers.get(STICKY_SESSION_HEADER).unwrap(), "enabled");
    }

    #[tokio::test]
    async fn cached_get_skips_upstream() {
        let client = FakeClient::returning(vec![(StatusCode::OK, "body")]);
        let cache = ResponseCache::new(Duration::from_secs(60));
        let forwarder = HttpForwarder::new(client.clone(), Some(cache.clone()));
        let svc = service("a");

        let first = forward_get(&forwarder, &svc, "/a/x", None, "/x").await.unwrap();
        let second = forward_get(&forwarder, &svc, "/a/x", None, "/x").await.unwrap();

        assert_eq!(first.body, second.body);
        assert_eq!(client.request_count(), 1);
        cache.close();
    }

    #[tokio::test]
    async fn non_200_is_not_cached() {
        let client = FakeClient::returning(vec![
            (StatusCode::NOT_FOUND, "missing"),
            (StatusCode::OK, "found"),
        ]);
        let cache = ResponseCache::new(Duration::from_secs(60));
        let forwarder = HttpForwarder::new(client.clone(), Some(cache.clone()));
        let svc = service("a");

        let first = forward_get(&forwarder, &svc, "/a/x", None, "/x").await.unwrap();
        assert_eq!(first.status, StatusCode::NOT_FOUND);

        let second = forward_get(&forwarder, &svc, "/a/x", None, "/x").await.unwrap();
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(client.request_count(), 2);
        cache.close();
    }

    #[tokio::test]
    async fn non_get_is_not_cached() {
        let client = FakeClient::returning(vec![(StatusCode::OK, "1"), (StatusCode::OK, "2")]);
        let cache = ResponseCache::new(Duration::from_secs(60));
        let forwarder = HttpForwarder::new(client.clone(), Some(cache.clone()));
        let svc = service("a");

        for _ in 0..2 {
            forwarder
                .forward(
                    &Method::POST,
                    &HeaderMap::new(),
                    &Bytes::from_static(b"data"),
                    "/a/x",
                    None,
                    "/x",
                    "http://u:9",
                    &svc,
                )
                .await
                .unwrap();
        }
        assert_eq!(client.request_count(), 2);
        assert_eq!(cache.count(), 0);
        cache.close();
    }

    #[tokio::test]
    async fn upstream_5xx_surfaces_as_error_with_response() {
        let client = FakeClient::returning(vec![(StatusCode::INTERNAL_SERVER_ERROR, "boom")]);
        let forwarder = HttpForwarder::new(client.clone(), None);
        let svc = service("a");

        let err = forward_get(&forwarder, &svc, "/a/x", None, "/x").await.unwrap_err();
        match err {
            GatewayError::UpstreamStatus { response } => {
                assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(response.body, Bytes::from_static(b"boom"));
            }
            other => panic!("expected UpstreamStatus, got {other}"),
        }
    }

    #[tokio::test]
    async fn websocket_upgrade_is_refused() {
        let client = FakeClient::returning(vec![]);
        let forwarder = HttpForwarder::new(client.clone(), None);
        let svc = service("a");

        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());

        let err = forwarder
            .forward(
                &Method::GET,
                &headers,
                &Bytes::new(),
                "/a/ws",
                None,
                "/ws",
                "http://u:9",
                &svc,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpgradeRequest));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn unparseable_target_maps_to_bad_target() {
        let client = FakeClient::returning(vec![]);
        let forwarder = HttpForwarder::new(client.clone(), None);
        let svc = service("a");

        let err = forwarder
            .forward(
                &Method::GET,
                &HeaderMap::new(),
                &Bytes::new(),
                "/a/x",
                None,
                "/x",
                "not a url",
                &svc,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::BadTarget(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
