//! Ingress middleware chain.
//!
//! Composable `axum::middleware::from_fn` layers applied by the server in a
//! fixed order: panic recovery and compression (tower-http), then request-id,
//! trace extraction, access logging, CORS, auth, and metrics. Each layer
//! stays stateless except for the shared configuration snapshot.
use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::HeaderValue;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

use crate::{
    config::models::Config,
    core::{error::GatewayError, rate_limiter::IpRateLimiter},
    metrics, tracing_setup,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request correlation id, stored in request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Route template the request matched (`<base_path>/*`), attached to the
/// response by the dispatcher. Its absence means no registered route matched.
#[derive(Debug, Clone)]
pub struct MatchedRoute(pub String);

/// Verified JWT claims, stashed for downstream consumers.
#[derive(Debug, Clone)]
pub struct AuthClaims(pub serde_json::Value);

/// Accept an inbound `X-Request-ID` or generate a UUID; stamp it on the
/// forwarded request headers and always echo it on the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Extract the W3C trace context from inbound headers and run the rest of
/// the chain inside a request span parented to it.
pub async fn trace_context_middleware(req: Request, next: Next) -> Response {
    let parent = tracing_setup::extract_remote_context(req.headers());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let span = tracing::info_span!(
        "request",
        otel.name = %format!("HTTP {method} {path}"),
        http.method = %method,
        http.path = %path,
        request_id = %request_id,
        http.status_code = tracing::field::Empty,
    );
    span.set_parent(parent);

    let response = next.run(req).instrument(span.clone()).await;
    span.record("http.status_code", response.status().as_u16());
    response
}

/// Structured access log, one line per completed request. `/health` and
/// `/metrics` are not logged. The level follows the response status.
pub async fn access_log_middleware(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if path == "/health" || path == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let method = req.method().to_string();
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis() as u64;
    let span_context = tracing::Span::current().context();
    let otel_span = opentelemetry::trace::TraceContextExt::span(&span_context);
    let trace_id = if otel_span.span_context().is_valid() {
        otel_span.span_context().trace_id().to_string()
    } else {
        "unknown".to_string()
    };

    if status >= 500 {
        tracing::error!(%method, %path, status, duration_ms, %request_id, %trace_id, "request completed with server error");
    } else if status >= 400 {
        tracing::warn!(%method, %path, status, duration_ms, %request_id, %trace_id, "request completed with client error");
    } else {
        tracing::info!(%method, %path, status, duration_ms, %request_id, %trace_id, "request completed");
    }

    response
}

/// Verify a `Bearer` token signed with the configured HMAC secret. Verified
/// claims are stashed in request extensions.
pub async fn jwt_auth_middleware(
    State(config): State<Arc<Config>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(auth_header) = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return GatewayError::Unauthorized("Missing authorization header".into()).into_response();
    };

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        return GatewayError::Unauthorized("Invalid authorization header format".into())
            .into_response();
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
    validation.required_spec_claims = Default::default();

    let key = DecodingKey::from_secret(config.security.jwt_secret.as_bytes());
    match decode::<serde_json::Value>(token, &key, &validation) {
        Ok(token_data) => {
            req.extensions_mut().insert(AuthClaims(token_data.claims));
            next.run(req).await
        }
        Err(e) => GatewayError::Unauthorized(format!("Invalid token: {e}")).into_response(),
    }
}

/// Require `X-API-Key` to be one of the configured keys.
pub async fn api_key_middleware(
    State(config): State<Arc<Config>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(api_key) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    else {
        return GatewayError::Unauthorized("Missing API key".into()).into_response();
    };

    if config.security.api_keys.iter().any(|key| key == api_key) {
        next.run(req).await
    } else {
        GatewayError::Unauthorized("Invalid API key".into()).into_response()
    }
}

/// Require an `X-CSRF-Token` header on state-changing methods.
pub async fn csrf_middleware(req: Request, next: Next) -> Response {
    let method = req.method();
    if method == http::Method::GET || method == http::Method::HEAD || method == http::Method::OPTIONS
    {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get("x-csrf-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if token.is_empty() {
        return GatewayError::Forbidden("CSRF token missing".into()).into_response();
    }

    next.run(req).await
}

/// Attach hardening headers to every response.
pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("X-XSS-Protection", HeaderValue::from_static("1; mode=block"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("no-referrer-when-downgrade"),
    );
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'self'"),
    );
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
    );
    response
}

/// Per-client-IP rate limiting. Requests without a resolvable peer address
/// pass through unlimited.
pub async fn rate_limit_middleware(
    State(limiter): State<IpRateLimiter>,
    req: Request,
    next: Next,
) -> Response {
    let peer_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    match peer_ip {
        Some(ip) if !limiter.check(ip) => GatewayError::RateLimited.into_response(),
        _ => next.run(req).await,
    }
}

/// Record the request counter and duration histogram, labeled with the
/// matched route template. Unmatched requests and the metrics endpoint
/// itself are not counted.
pub async fn metrics_middleware(
    State(config): State<Arc<Config>>,
    req: Request,
    next: Next,
) -> Response {
    if req.uri().path() == config.metrics.path {
        return next.run(req).await;
    }

    let start = Instant::now();
    let method = req.method().to_string();
    let response = next.run(req).await;

    if let Some(route) = response.extensions().get::<MatchedRoute>() {
        let status = response.status().as_u16();
        metrics::increment_request_total(&route.0, &method, status);
        metrics::record_request_duration(&route.0, &method, status, start.elapsed());
    }

    response
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, middleware, routing::get, Router};
    use http::StatusCode;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tower::ServiceExt; // for oneshot

    use super::*;

    fn ok_router() -> Router {
        Router::new().route("/", get(|| async { "ok" }))
    }

    #[tokio::test]
    async fn request_id_is_generated_and_echoed() {
        let app = ok_router().layer(middleware::from_fn(request_id_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(Uuid::parse_str(request_id).is_ok());
    }

    #[tokio::test]
    async fn inbound_request_id_is_preserved() {
        let app = ok_router().layer(middleware::from_fn(request_id_middleware));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "req-supplied")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            "req-supplied"
        );
    }

    fn jwt_config(secret: &str) -> Arc<Config> {
        let mut config = Config::default();
        config.security.enable_jwt = true;
        config.security.jwt_secret = secret.to_string();
        Arc::new(config)
    }

    #[tokio::test]
    async fn jwt_missing_header_rejected() {
        let app = ok_router().layer(middleware::from_fn_with_state(
            jwt_config("top-secret"),
            jwt_auth_middleware,
        ));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn jwt_valid_token_passes() {
        let secret = "top-secret";
        let token = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "user-1" }),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let app = ok_router().layer(middleware::from_fn_with_state(
            jwt_config(secret),
            jwt_auth_middleware,
        ));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn jwt_wrong_secret_rejected() {
        let token = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "user-1" }),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();

        let app = ok_router().layer(middleware::from_fn_with_state(
            jwt_config("top-secret"),
            jwt_auth_middleware,
        ));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(http::header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn api_key_validation() {
        let mut config = Config::default();
        config.security.enable_api_key = true;
        config.security.api_keys = vec!["key-1".to_string()];
        let config = Arc::new(config);

        let app = ok_router().layer(middleware::from_fn_with_state(
            config.clone(),
            api_key_middleware,
        ));

        let missing = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-api-key", "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let valid = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-api-key", "key-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(valid.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn csrf_blocks_state_changing_without_token() {
        let app = Router::new()
            .route("/", axum::routing::post(|| async { "ok" }).get(|| async { "ok" }))
            .layer(middleware::from_fn(csrf_middleware));

        let get = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(get.status(), StatusCode::OK);

        let post = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(post.status(), StatusCode::FORBIDDEN);

        let with_token = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("x-csrf-token", "tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(with_token.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn security_headers_attached() {
        let app = ok_router().layer(middleware::from_fn(security_headers_middleware));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let headers = response.headers();
        assert_eq!(headers.get("X-Content-Type-Options").unwrap(), "nosniff");
        assert_eq!(headers.get("X-Frame-Options").unwrap(), "DENY");
        assert!(headers.contains_key("Strict-Transport-Security"));
    }

    #[tokio::test]
    async fn rate_limit_rejects_after_burst() {
        let limiter = IpRateLimiter::new(&crate::config::models::RateLimitConfig {
            enable: true,
            requests: 1,
            window_secs: 60,
        })
        .unwrap();

        let app = ok_router().layer(middleware::from_fn_with_state(
            limiter,
            rate_limit_middleware,
        ));

        let addr: SocketAddr = "10.0.0.9:55555".parse().unwrap();
        let request = |app: Router| {
            let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
            req.extensions_mut().insert(ConnectInfo(addr));
            app.oneshot(req)
        };

        let first = request(app.clone()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = request(app).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
