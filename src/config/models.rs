//! Configuration data structures for Passage.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files and
//! are intentionally serde-friendly with defaults so that minimal configs stay
//! concise. Every section can also be overridden through `GATEWAY_`-prefixed
//! environment variables (see [`crate::config::loader`]).
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub proxy: ProxyConfig,
    pub security: SecurityConfig,
    pub resilience: ResilienceConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub tracing: TracingConfig,
    pub services: Vec<ServiceConfig>,
}

/// Listener and drain settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Read timeout in seconds.
    pub read_timeout: u64,
    /// Write timeout in seconds.
    pub write_timeout: u64,
    /// Maximum time in seconds to wait for in-flight requests on shutdown.
    pub shutdown_timeout: u64,
    pub trusted_proxies: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            read_timeout: 5,
            write_timeout: 10,
            shutdown_timeout: 5,
            trusted_proxies: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

/// HTTP forwarder settings: the shared upstream connection pool and the
/// optional response cache.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyConfig {
    /// Per-request upstream timeout in seconds.
    pub timeout: u64,
    pub max_idle_conns: usize,
    /// Idle connection timeout in seconds.
    pub idle_conn_timeout: u64,
    pub enable_cache: bool,
    /// Default cache TTL in seconds.
    pub cache_ttl: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: 30,
            max_idle_conns: 100,
            idle_conn_timeout: 90,
            enable_cache: false,
            cache_ttl: 60,
        }
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn idle_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_conn_timeout)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }
}

/// Authentication, TLS and CORS settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_jwt: bool,
    pub jwt_secret: String,
    pub enable_api_key: bool,
    pub api_keys: Vec<String>,
    pub enable_tls: bool,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub enable_cors: bool,
    pub cors_allow_origins: Vec<String>,
    /// Require an `X-CSRF-Token` header on state-changing methods.
    pub enable_csrf: bool,
    /// Attach hardening headers (X-Frame-Options etc.) to every response.
    pub enable_security_headers: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_jwt: false,
            jwt_secret: String::new(),
            enable_api_key: false,
            api_keys: Vec::new(),
            enable_tls: false,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            enable_cors: true,
            cors_allow_origins: vec!["*".to_string()],
            enable_csrf: false,
            enable_security_headers: false,
        }
    }
}

/// Circuit breaker and retry settings for upstream calls.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ResilienceConfig {
    pub enable_circuit_breaker: bool,
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before probing again.
    pub reset_timeout: u64,
    pub enable_retry: bool,
    pub max_retries: u32,
    /// Initial retry delay in milliseconds; doubles per attempt.
    pub retry_interval: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enable_circuit_breaker: true,
            failure_threshold: 5,
            reset_timeout: 30,
            enable_retry: true,
            max_retries: 3,
            retry_interval: 100,
        }
    }
}

impl ResilienceConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval)
    }
}

/// Per-client-IP request rate limiting.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enable: bool,
    /// Requests allowed per window.
    pub requests: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enable: false,
            requests: 100,
            window_secs: 60,
        }
    }
}

/// Log sink configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of debug / info / warn / error.
    pub level: String,
    /// One of json / console.
    pub format: String,
    /// stdout, stderr or a file path.
    pub output_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            output_path: "stdout".to_string(),
        }
    }
}

/// Prometheus exposition settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enable: bool,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            path: "/metrics".to_string(),
        }
    }
}

/// OTLP trace exporter settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TracingConfig {
    pub enable: bool,
    pub service_name: String,
    /// OTLP/gRPC collector endpoint, e.g. "jaeger:4317".
    pub jaeger_endpoint: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enable: false,
            service_name: "passage".to_string(),
            jaeger_endpoint: "localhost:4317".to_string(),
        }
    }
}

/// How the WebSocket forwarder decides whether an upstream speaks Socket.IO.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolHint {
    /// Detect Socket.IO by a `/socket.io/` path segment in the upstream URL.
    #[default]
    Auto,
    /// Always run the Socket.IO handshake sequence.
    Socketio,
    /// Plain WebSocket, never run the Socket.IO handshake.
    Raw,
}

/// One routed upstream service. Frozen after router construction.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    /// URL prefix identifying this service at the gateway.
    pub base_path: String,
    /// Upstream origin URLs (`scheme://host[:port]`).
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub strip_base_path: bool,
    #[serde(default)]
    pub enable_websocket: bool,
    /// Advisory only: forwarded as a header hint, never affects selection.
    #[serde(default)]
    pub enable_sticky_session: bool,
    /// Extra headers injected on every forwarded request (win on conflict).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub protocol_hint: ProtocolHint,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

/// Observational per-service health probing. Probe results are logged and
/// exported as a gauge; they never influence target selection.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub path: String,
    /// Probe interval in seconds; 0 disables the prober.
    pub interval: u64,
    /// Probe timeout in seconds.
    pub timeout: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval: 0,
            timeout: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The config crate is the production deserializer; tests go through it as
    // well to exercise the same serde path.
    fn service_from_yaml(yaml: &str) -> ServiceConfig {
        let parsed = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap();
        parsed.try_deserialize().unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.proxy.timeout, 30);
        assert_eq!(cfg.proxy.max_idle_conns, 100);
        assert!(!cfg.proxy.enable_cache);
        assert_eq!(cfg.proxy.cache_ttl, 60);
        assert!(cfg.resilience.enable_circuit_breaker);
        assert_eq!(cfg.resilience.failure_threshold, 5);
        assert_eq!(cfg.resilience.max_retries, 3);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.metrics.path, "/metrics");
        assert!(cfg.services.is_empty());
    }

    #[test]
    fn service_config_minimal_yaml() {
        let svc = service_from_yaml(
            r#"
name: users
base_path: /users
targets:
  - http://users:8081
"#,
        );
        assert_eq!(svc.name, "users");
        assert!(!svc.strip_base_path);
        assert!(!svc.enable_websocket);
        assert_eq!(svc.protocol_hint, ProtocolHint::Auto);
        assert!(svc.health_check.is_none());
    }

    #[test]
    fn protocol_hint_parses_snake_case() {
        let svc = service_from_yaml(
            r#"
name: chat
base_path: /chat
targets: ["http://chat:9000"]
enable_websocket: true
protocol_hint: socketio
"#,
        );
        assert_eq!(svc.protocol_hint, ProtocolHint::Socketio);
    }
}
