use std::io;

use opentelemetry::trace::TraceError;
use tracing_subscriber::util::TryInitError;

/// Errors raised while bootstrapping a server. All of them are meant to be
/// fatal: a process should not keep running with broken observability.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value {value:?} for env var `{var}`")]
    Config { var: &'static str, value: String },

    #[error("cannot install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),

    #[error("cannot init tracer: {0}")]
    Trace(#[from] TraceError),

    #[error("cannot register metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("cannot bind server socket: {0}")]
    Bind(#[source] io::Error),
}
