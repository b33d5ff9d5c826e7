//! Observability: Prometheus-style metrics and the aggregate health
//! snapshot consumed by the external HTTP layer.

pub mod health;
pub mod metrics;

pub use health::{Health, HealthSnapshot, OverallStatus};
pub use metrics::Metrics;
