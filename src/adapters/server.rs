//! The ingress: router assembly, built-in endpoints, and the serve loop.
//!
//! Hosts `/health` and the Prometheus exposition endpoint, applies the
//! middleware chain in its fixed order, and hands everything else to the
//! request dispatcher. Shutdown stops accepting, drains in-flight requests
//! up to the configured timeout, flushes the tracer, then force-closes.
use std::{any::Any, net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use eyre::{Context, Result};
use http::{header, HeaderName, HeaderValue, Method, StatusCode};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{AllowOrigin, Any as AnyOrigin, CorsLayer},
};

use crate::{
    adapters::{dispatch::RequestDispatcher, middleware as mw},
    config::models::Config,
    core::{error::error_response, rate_limiter::IpRateLimiter},
    tracing_setup,
    utils::graceful_shutdown::GracefulShutdown,
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<RequestDispatcher>,
    pub config: Arc<Config>,
    pub prometheus: Option<PrometheusHandle>,
}

async fn handle_health() -> Response {
    let mut response = Json(serde_json::json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response();
    // Health is a registered route; count it like any other match.
    response
        .extensions_mut()
        .insert(mw::MatchedRoute("/health".to_string()));
    response
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "metrics disabled"),
    }
}

async fn dispatch_handler(State(state): State<AppState>, req: Request) -> Response {
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    state.dispatcher.handle(req, client_addr).await
}

/// Assemble the full ingress router with the middleware chain. Layer order
/// (outermost first): panic recovery, compression, request-id, trace
/// extraction, access log, security headers, CORS, rate limit, JWT, API key,
/// CSRF, metrics.
pub fn build_router(state: AppState) -> Result<Router> {
    let config = state.config.clone();

    let mut app = Router::new().route("/health", get(handle_health));
    if config.metrics.enable {
        app = app.route(&config.metrics.path, get(handle_metrics));
    }
    let mut app = app
        .fallback(dispatch_handler)
        .with_state(state.clone());

    // Innermost layer first; every .layer() call wraps all previous ones.
    app = app.layer(middleware::from_fn_with_state(
        config.clone(),
        mw::metrics_middleware,
    ));

    if config.security.enable_csrf {
        app = app.layer(middleware::from_fn(mw::csrf_middleware));
    }
    if config.security.enable_api_key {
        app = app.layer(middleware::from_fn_with_state(
            config.clone(),
            mw::api_key_middleware,
        ));
    }
    if config.security.enable_jwt {
        app = app.layer(middleware::from_fn_with_state(
            config.clone(),
            mw::jwt_auth_middleware,
        ));
    }
    if config.rate_limit.enable {
        let limiter = IpRateLimiter::new(&config.rate_limit)
            .map_err(|e| eyre::eyre!("invalid rate limit config: {e}"))?;
        app = app.layer(middleware::from_fn_with_state(
            limiter,
            mw::rate_limit_middleware,
        ));
    }
    if config.security.enable_cors {
        app = app.layer(build_cors_layer(&config.security.cors_allow_origins));
    }
    if config.security.enable_security_headers {
        app = app.layer(middleware::from_fn(mw::security_headers_middleware));
    }

    app = app
        .layer(middleware::from_fn(mw::access_log_middleware))
        .layer(middleware::from_fn(mw::trace_context_middleware))
        .layer(middleware::from_fn(mw::request_id_middleware))
        .layer(CompressionLayer::new())
        .layer(CatchPanicLayer::custom(handle_panic));

    Ok(app)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "handler panicked");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
}

fn build_cors_layer(allow_origins: &[String]) -> CorsLayer {
    let mut layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
            Method::PATCH,
        ])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            header::CONNECTION,
            header::UPGRADE,
            HeaderName::from_static("sec-websocket-key"),
            HeaderName::from_static("sec-websocket-version"),
            HeaderName::from_static("sec-websocket-extensions"),
            HeaderName::from_static("sec-websocket-protocol"),
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([
            header::UPGRADE,
            header::CONNECTION,
            HeaderName::from_static("sec-websocket-accept"),
            HeaderName::from_static("sec-websocket-protocol"),
            HeaderName::from_static("x-request-id"),
        ]);

    if allow_origins.iter().any(|origin| origin == "*") {
        layer = layer.allow_origin(AnyOrigin);
    } else {
        let origins: Vec<HeaderValue> = allow_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "skipping invalid CORS origin");
                    None
                }
            })
            .collect();
        layer = layer.allow_origin(AllowOrigin::list(origins));
    }

    layer
}

/// Bind the listener and serve until shutdown. Returns once every in-flight
/// request has drained or the drain timeout forced the remaining
/// connections closed.
pub async fn serve(
    config: Arc<Config>,
    dispatcher: Arc<RequestDispatcher>,
    prometheus: Option<PrometheusHandle>,
    shutdown: Arc<GracefulShutdown>,
) -> Result<()> {
    let state = AppState {
        dispatcher: dispatcher.clone(),
        config: config.clone(),
        prometheus,
    };
    let app = build_router(state)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;

    tracing::info!(
        addr = %addr,
        tls = config.security.enable_tls,
        services = config.services.len(),
        "gateway listening"
    );

    let token = shutdown.token();
    let drain_timeout = shutdown.drain_timeout();

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let mut server_task = if config.security.enable_tls {
        use axum::serve::ListenerExt;

        let tls_config = load_tls_config(&config)?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));
        let tls_listener = tls_listener::TlsListener::new(acceptor, listener).tap_io(|_io| {});
        let graceful = token.clone();
        tokio::spawn(async move {
            axum::serve(tls_listener, make_service)
                .with_graceful_shutdown(graceful.cancelled_owned())
                .await
        })
    } else {
        let graceful = token.clone();
        tokio::spawn(async move {
            axum::serve(listener, make_service)
                .with_graceful_shutdown(graceful.cancelled_owned())
                .await
        })
    };

    tokio::select! {
        result = &mut server_task => {
            result.wrap_err("Server task panicked")?.wrap_err("Server error")?;
        }
        _ = token.cancelled() => {
            tracing::info!(timeout = ?drain_timeout, "draining in-flight requests");
            let drained = tokio::time::timeout(drain_timeout, &mut server_task).await;
            tracing_setup::shutdown_tracing();
            match drained {
                Ok(result) => {
                    result.wrap_err("Server task panicked")?.wrap_err("Server error")?;
                    tracing::info!("graceful shutdown completed");
                }
                Err(_) => {
                    server_task.abort();
                    tracing::warn!("drain timeout exceeded, forcing remaining connections closed");
                }
            }
        }
    }

    dispatcher.close();
    Ok(())
}

fn load_tls_config(config: &Config) -> Result<rustls::ServerConfig> {
    use std::{fs::File, io::BufReader};

    use rustls_pemfile::{certs, pkcs8_private_keys};

    let cert_file = &mut BufReader::new(
        File::open(&config.security.tls_cert_file).wrap_err("failed to open cert file")?,
    );
    let key_file = &mut BufReader::new(
        File::open(&config.security.tls_key_file).wrap_err("failed to open key file")?,
    );

    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    let key = pkcs8_private_keys(key_file)
        .next()
        .transpose()?
        .ok_or_else(|| eyre::eyre!("No PKCS#8 private key found in key file"))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .wrap_err("Failed to build TLS server config")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        core::gateway::GatewayService,
        ports::http_client::{HttpClient, HttpClientResult},
    };

    struct NoopClient;

    #[async_trait]
    impl HttpClient for NoopClient {
        async fn execute(
            &self,
            _req: http::Request<Body>,
        ) -> HttpClientResult<http::Response<Body>> {
            Ok(http::Response::new(Body::empty()))
        }

        async fn probe(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    fn test_state(config: Config) -> AppState {
        let config = Arc::new(config);
        let gateway = Arc::new(GatewayService::new(&config).unwrap());
        let dispatcher = Arc::new(RequestDispatcher::new(
            gateway,
            Arc::new(NoopClient),
            &config,
        ));
        AppState {
            dispatcher,
            config,
            prometheus: None,
        }
    }

    #[tokio::test]
    async fn health_returns_ok_json() {
        let app = build_router(test_state(Config::default())).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["time"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn metrics_endpoint_404_when_recorder_missing() {
        let app = build_router(test_state(Config::default())).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unmatched_route_is_404_with_request_id() {
        let app = build_router(test_state(Config::default())).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/nowhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(mw::REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn cors_preflight_allows_configured_origin() {
        let mut config = Config::default();
        config.security.enable_cors = true;
        config.security.cors_allow_origins = vec!["https://app.example.com".to_string()];
        let app = build_router(test_state(config)).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/health")
                    .header(header::ORIGIN, "https://app.example.com")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://app.example.com"
        );
    }

    #[tokio::test]
    async fn jwt_layer_guards_proxied_routes() {
        let mut config = Config::default();
        config.security.enable_jwt = true;
        config.security.jwt_secret = "secret".to_string();
        let app = build_router(test_state(config)).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
