pub mod balancer;
pub mod gateway;
pub mod rate_limit;
pub mod router;

pub use balancer::{ConnectionGuard, LoadBalancer, Target};
pub use gateway::GatewayService;
pub use rate_limit::RateLimiter;
pub use router::{Route, RouteMatch, Router};
