pub mod cache;
pub mod error;
pub mod gateway;
pub mod rate_limiter;
pub mod resilience;

pub use cache::{ResponseCache, Ttl};
pub use error::{BufferedResponse, GatewayError};
pub use gateway::GatewayService;
pub use resilience::{BreakerState, CircuitBreaker, ResilienceChain, Retrier};
