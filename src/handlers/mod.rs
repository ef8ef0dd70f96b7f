mod health;
mod index;
mod metrics;
mod stats;

pub use health::health_handler;
pub use index::index_handler;
pub use metrics::metrics_handler;
pub use stats::stats_handler;
