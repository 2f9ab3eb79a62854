//! Per-request dispatch: route matching, WebSocket/HTTP split, resilience
//! wrapping, and error-to-response mapping.
use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::{
    adapters::{
        http_proxy::HttpForwarder,
        middleware::MatchedRoute,
        ws_proxy::{self, WsForwarder},
    },
    config::models::{Config, ServiceConfig},
    core::{
        cache::ResponseCache,
        error::{error_response, GatewayError},
        gateway::GatewayService,
        resilience::ResilienceChain,
    },
    ports::http_client::HttpClient,
};

/// Routes every proxied request to the right forwarder under the configured
/// resilience wrappers. One instance serves the whole process.
pub struct RequestDispatcher {
    gateway: Arc<GatewayService>,
    http: HttpForwarder,
    ws: WsForwarder,
    chain: ResilienceChain,
    cache: Option<ResponseCache>,
}

impl RequestDispatcher {
    pub fn new(
        gateway: Arc<GatewayService>,
        http_client: Arc<dyn HttpClient>,
        config: &Config,
    ) -> Self {
        let cache = config
            .proxy
            .enable_cache
            .then(|| ResponseCache::new(config.proxy.cache_ttl()));

        Self {
            gateway,
            http: HttpForwarder::new(http_client, cache.clone()),
            ws: WsForwarder::new(),
            chain: ResilienceChain::from_config(&config.resilience),
            cache,
        }
    }

    pub fn gateway(&self) -> &Arc<GatewayService> {
        &self.gateway
    }

    /// Stop background work owned by the dispatcher (the cache sweeper).
    pub fn close(&self) {
        if let Some(cache) = &self.cache {
            cache.close();
        }
    }

    /// Handle one inbound request end-to-end and produce the response.
    pub async fn handle(&self, req: Request, client_addr: Option<SocketAddr>) -> Response {
        let path = req.uri().path().to_string();

        let Some(svc) = self.gateway.find_service(&path) else {
            tracing::debug!(%path, "no route match");
            return error_response(StatusCode::NOT_FOUND, "route not found");
        };

        let template = route_template(&svc);
        let span = tracing::Span::current();
        span.record(
            "otel.name",
            format!("HTTP {} {}", req.method(), template).as_str(),
        );

        let mut response = if ws_proxy::is_websocket_upgrade(req.headers()) {
            self.handle_websocket(req, &svc, &path, client_addr)
        } else {
            self.handle_http(req, &svc, &path).await
        };

        response.extensions_mut().insert(MatchedRoute(template));
        response
    }

    fn handle_websocket(
        &self,
        req: Request,
        svc: &ServiceConfig,
        path: &str,
        client_addr: Option<SocketAddr>,
    ) -> Response {
        if !svc.enable_websocket {
            tracing::debug!(service = %svc.name, path, "websocket upgrade on non-websocket service");
            return error_response(StatusCode::NOT_FOUND, "route not found");
        }

        let target = match GatewayService::select_target(svc) {
            Ok(target) => target.to_string(),
            Err(e) => return e.into_response(),
        };

        let client_ip = client_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let raw_query = req.uri().query().map(str::to_string);

        let mut ws_path = GatewayService::rewrite_path(svc, path);
        if let Some(query) = &raw_query {
            ws_path = format!("{ws_path}?{query}");
        }

        let prepared =
            ws_proxy::prepare_forward_headers(req.headers(), &client_ip, raw_query.as_deref());
        // The dial is the forwarder's only cross-process call; hand it the
        // active trace context explicitly.
        let cx = tracing::Span::current().context();

        match self
            .ws
            .handle_upgrade(req, svc, &target, &ws_path, prepared, cx)
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(service = %svc.name, error = %e, "websocket upgrade failed");
                e.into_response()
            }
        }
    }

    async fn handle_http(&self, req: Request, svc: &ServiceConfig, path: &str) -> Response {
        let target = match GatewayService::select_target(svc) {
            Ok(target) => target.to_string(),
            Err(e) => return e.into_response(),
        };

        let (parts, body) = req.into_parts();
        // Buffer the inbound body so retries can replay it.
        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return GatewayError::Internal(format!("failed to read request body: {e}"))
                    .into_response()
            }
        };

        let raw_query = parts.uri.query().map(str::to_string);
        let remainder = GatewayService::rewrite_path(svc, path);

        let result = self
            .chain
            .execute(|| {
                self.http.forward(
                    &parts.method,
                    &parts.headers,
                    &body_bytes,
                    path,
                    raw_query.as_deref(),
                    &remainder,
                    &target,
                    svc,
                )
            })
            .await;

        match result {
            Ok(buffered) => buffered.into_response(),
            Err(relay @ GatewayError::UpstreamStatus { .. }) => relay.into_response(),
            Err(e) => {
                tracing::error!(service = %svc.name, target = %target, error = %e, "forwarding failed");
                e.into_response()
            }
        }
    }
}

/// Metric/trace label for a service route: the route template, never the
/// concrete path.
fn route_template(svc: &ServiceConfig) -> String {
    if svc.base_path == "/" {
        "/*".to_string()
    } else {
        format!("{}/*", svc.base_path)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use std::sync::Mutex;

    use super::*;
    use crate::{
        config::models::ServiceConfig,
        ports::http_client::HttpClientResult,
    };

    struct FakeClient {
        requests: Mutex<Vec<String>>,
        status: StatusCode,
    }

    #[async_trait]
    impl HttpClient for FakeClient {
        async fn execute(
            &self,
            req: http::Request<Body>,
        ) -> HttpClientResult<http::Response<Body>> {
            self.requests.lock().unwrap().push(req.uri().to_string());
            Ok(http::Response::builder()
                .status(self.status)
                .body(Body::from("upstream"))
                .unwrap())
        }

        async fn probe(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    fn dispatcher_with(services: Vec<ServiceConfig>, status: StatusCode) -> (RequestDispatcher, Arc<FakeClient>) {
        let config = Config {
            services,
            ..Default::default()
        };
        let gateway = Arc::new(GatewayService::new(&config).unwrap());
        let client = Arc::new(FakeClient {
            requests: Mutex::new(Vec::new()),
            status,
        });
        (
            RequestDispatcher::new(gateway, client.clone(), &config),
            client,
        )
    }

    fn service(name: &str, base_path: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            base_path: base_path.to_string(),
            targets: vec!["http://u:9".to_string()],
            strip_base_path: true,
            enable_websocket: false,
            enable_sticky_session: false,
            headers: Default::default(),
            protocol_hint: Default::default(),
            health_check: None,
        }
    }

    fn get_request(path: &str) -> Request {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unmatched_path_is_404_without_route_extension() {
        let (dispatcher, _) = dispatcher_with(vec![service("a", "/a")], StatusCode::OK);

        let response = dispatcher.handle(get_request("/other"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.extensions().get::<MatchedRoute>().is_none());
    }

    #[tokio::test]
    async fn matched_request_forwards_and_tags_route() {
        let (dispatcher, client) = dispatcher_with(vec![service("a", "/a")], StatusCode::OK);

        let response = dispatcher.handle(get_request("/a/hello?x=1"), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.extensions().get::<MatchedRoute>().unwrap().0,
            "/a/*"
        );
        assert_eq!(
            client.requests.lock().unwrap().as_slice(),
            ["http://u:9/hello?x=1"]
        );
    }

    #[tokio::test]
    async fn empty_targets_yield_503() {
        let mut svc = service("a", "/a");
        svc.targets.clear();
        let (dispatcher, client) = dispatcher_with(vec![svc], StatusCode::OK);

        let response = dispatcher.handle(get_request("/a/hello"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_5xx_is_relayed_after_resilience() {
        let (dispatcher, client) =
            dispatcher_with(vec![service("a", "/a")], StatusCode::BAD_GATEWAY);

        let response = dispatcher.handle(get_request("/a/x"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        // Default chain: breaker over retry with 3 attempts.
        assert_eq!(client.requests.lock().unwrap().len(), 3);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"upstream"));
    }

    #[tokio::test]
    async fn websocket_upgrade_on_plain_service_is_404() {
        let (dispatcher, client) = dispatcher_with(vec![service("a", "/a")], StatusCode::OK);

        let mut headers = HeaderMap::new();
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("connection", "Upgrade".parse().unwrap());
        headers.insert("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==".parse().unwrap());
        headers.insert("sec-websocket-version", "13".parse().unwrap());

        let mut req = get_request("/a/ws");
        *req.headers_mut() = headers;

        let response = dispatcher.handle(req, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(client.requests.lock().unwrap().is_empty());
    }
}
