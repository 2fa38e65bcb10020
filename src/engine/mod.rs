pub mod cache;
pub mod metrics;
pub mod simulator;
pub mod types;

pub use cache::{build_day_caches, DayCache};
pub use metrics::MetricsCalculator;
pub use simulator::Simulator;
pub use types::{Direction, ExitReason, OrStats, PerformanceResult, Trade};
