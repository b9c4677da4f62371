pub mod health_checker;
pub mod http_client;
pub mod proxy_handler;

pub use health_checker::{HealthChecker, HealthSupervisor};
pub use http_client::ProxyHttpClient;
pub use proxy_handler::ProxyHandler;
