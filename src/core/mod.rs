pub mod backend;
pub mod circuit_breaker;
pub mod deadline_body;
pub mod dispatcher;
pub mod gateway;
pub mod health;
pub mod rate_limiter;
pub mod retry;
pub mod service_proxy;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use dispatcher::{RouteMatch, RouteTable};
pub use gateway::GatewayService;
pub use rate_limiter::ClientRateLimiter;
pub use service_proxy::{IdentityClaims, ProxyError, ServiceProxy};
