//! # Server utils
//! This crate provides helpers to run instrumented http services: request
//! correlation ids, JSON access logs, Prometheus request duration metrics,
//! Jaeger trace propagation and graceful shutdown.
//!
//! ## Setup
//! Logging and tracing can be set up using [`setup::setup`]. This should
//! be the first call of any server binary. Logs are JSON when `ENV` (or
//! `GO_ENV`) is `production` and human-readable otherwise.
//!
//! ## Server
//! [`server::Server`] assembles an [`axum`] app with `GET /health`,
//! `GET /metrics` and all middleware, serves it and shuts it down on
//! SIGINT/SIGTERM, running the registered [`shutdown::ShutdownHooks`]
//! before draining in-flight requests.
//!
//! ```ignore
//! let config = Config::from_env()?;
//! let telemetry = setup::setup(&config)?;
//! let routes = Router::new().route("/hello", get(|| async { "hello" }));
//!
//! Server::initialize(config, routes)?
//!     .with_shutdown_hook("telemetry", telemetry.into_shutdown_hook())
//!     .run()
//!     .await?;
//! ```
//!
//! ## Http Trace Propagation
//! [`http_injector`] provides functions for injecting and extracting tracing
//! data into/from http headers.
//!
//! The middleware in [`middleware`] can also be used on their own with any
//! [`tower`] based http framework. Generally, they should be used on every
//! http route, this usually means that they can be registered globally.

pub mod access_log;
pub mod config;
mod error;
pub mod http_injector;
pub mod metrics;
pub mod middleware;
pub mod request_id;
pub mod server;
pub mod setup;
pub mod shutdown;

pub use config::{Config, Environment};
pub use error::Error;
pub use request_id::RequestId;
pub use server::{Server, ServerHandle};
pub use setup::Telemetry;
