//! Passage - a reverse-proxy API gateway for HTTP and WebSocket traffic.
//!
//! Passage sits in front of a fleet of microservices, accepting inbound
//! HTTP/1.1 and WebSocket traffic at a single listening port and forwarding
//! each request to one of several configured upstream services selected by
//! URL prefix. Around the forwarding path it layers authentication, CORS,
//! rate limiting, response caching, circuit breaking with retry, structured
//! request logging, Prometheus metrics, and distributed-trace propagation.
//!
//! # Features
//! - Prefix-based routing with longest-prefix matching and optional
//!   base-path stripping
//! - HTTP forwarding over a shared connection pool, with an in-memory TTL
//!   cache for idempotent GETs
//! - Bidirectional WebSocket tunneling, including a Socket.IO-aware
//!   handshake mode
//! - Circuit breaker + bounded exponential retry around upstream calls
//!   (breaker-outer, retrier-inner)
//! - JWT and API-key authentication, CORS, per-IP rate limiting
//! - Structured JSON logging, Prometheus metrics, W3C trace propagation
//!   with an OTLP/gRPC exporter
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use passage::{
//!     adapters::{HttpClientAdapter, RequestDispatcher},
//!     config::models::Config,
//!     core::GatewayService,
//!     ports::HttpClient,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = Arc::new(passage::config::loader::load_config("config.yaml")?);
//! let gateway = Arc::new(GatewayService::new(&config)?);
//! let client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new(&config.proxy)?);
//! let dispatcher = Arc::new(RequestDispatcher::new(gateway, client, &config));
//! // Wire the dispatcher into the provided server adapter (see the binary).
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping orchestration inside `core`. End users
//! should prefer the re-exports documented below instead of reaching into
//! internal modules directly.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HttpClientAdapter, RequestDispatcher, WsForwarder},
    core::{GatewayService, ResponseCache},
    ports::HttpClient,
    utils::GracefulShutdown,
};
