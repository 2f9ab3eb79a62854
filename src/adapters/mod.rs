pub mod dispatch;
pub mod health_checker;
pub mod http_client;
pub mod http_proxy;
pub mod middleware;
pub mod server;
pub mod ws_proxy;

pub use dispatch::RequestDispatcher;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_proxy::HttpForwarder;
pub use ws_proxy::WsForwarder;
