pub mod registry;
pub mod usage;

pub use registry::{DEFAULT_LATENCY_BUCKETS, Histogram, InFlightGuard, Metrics};
pub use usage::{UsageStats, UsageTracker};
