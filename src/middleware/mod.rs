//! Tower middleware for request correlation, metrics, tracing and access
//! logs. All of them work with any `tower` based http framework, and are
//! wired together for `axum` by [`crate::server::Server`].

mod access_log;
mod metrics;
mod request_id;
mod trace;

pub use access_log::{AccessLogFuture, AccessLogLayer, AccessLogService};
pub use metrics::{MetricsFuture, MetricsLayer, MetricsService};
pub use request_id::{RequestIdFuture, RequestIdLayer, RequestIdService};
pub use trace::{RequestSpan, TraceFuture, TraceLayer, TraceService};
