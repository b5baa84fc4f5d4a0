use std::{
    borrow::Cow,
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use axum::{
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use http::{header, StatusCode};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tower::BoxError;

use crate::{
    access_log::AccessLogFormat,
    config::Config,
    error::Error,
    metrics::RequestMetrics,
    middleware::{AccessLogLayer, MetricsLayer, RequestIdLayer, TraceLayer},
    shutdown::{self, Drain, ShutdownHooks},
};

/// An instrumented http server.
///
/// [`Server::initialize`] wraps the app routes with the metrics (and, if
/// enabled, tracing) middleware, adds `GET /health` and `GET /metrics`, and
/// puts request ids and access logs around everything.
pub struct Server {
    config: Config,
    router: Router,
    metrics: RequestMetrics,
    hooks: ShutdownHooks,
}

impl Server {
    /// # Panics
    ///
    /// If `routes` defines `/health` or `/metrics` itself.
    pub fn initialize(config: Config, routes: Router) -> Result<Self, Error> {
        let metrics = RequestMetrics::new(&config.service_label())?;

        let mut instrumented = routes;
        if config.with_tracing {
            instrumented = instrumented.layer(TraceLayer);
        }
        let instrumented = instrumented.layer(MetricsLayer::new(metrics.clone()));

        let exposition = metrics.clone();
        let router = Router::new()
            .route("/health", get(|| async { "OK" }))
            .route(
                "/metrics",
                get(move || {
                    let metrics = exposition.clone();
                    async move { render_metrics(&metrics) }
                }),
            )
            .merge(instrumented)
            .layer(RequestIdLayer)
            .layer(AccessLogLayer::new(AccessLogFormat::from(config.env)));

        Ok(Server {
            config,
            router,
            metrics,
            hooks: ShutdownHooks::new(),
        })
    }

    /// Registers a hook to run on shutdown, after the ones registered before.
    pub fn with_shutdown_hook<F>(mut self, name: impl Into<Cow<'static, str>>, hook: F) -> Self
    where
        F: FnOnce() -> Result<(), BoxError> + Send + 'static,
    {
        self.hooks.register(name, hook);
        self
    }

    pub fn with_shutdown_hooks(mut self, hooks: ShutdownHooks) -> Self {
        self.hooks.append(hooks);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// The fully layered router.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Binds `0.0.0.0:port` and starts serving in the background.
    pub async fn serve(self) -> Result<(ServerHandle, ShutdownHooks), Error> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port)))
            .await
            .map_err(Error::Bind)?;
        let handle = ServerHandle::spawn(listener, self.router).map_err(Error::Bind)?;

        tracing::info!(
            service = %self.config.app_name,
            addr = %handle.local_addr(),
            "server listening"
        );

        Ok((handle, self.hooks))
    }

    /// Serves until SIGINT or SIGTERM, then shuts down gracefully.
    ///
    /// Exits the process if the server does not drain in time.
    pub async fn run(self) -> Result<(), Error> {
        let drain_timeout = self.config.drain_timeout;
        let (handle, hooks) = self.serve().await?;

        shutdown::await_and_shutdown(handle, hooks, drain_timeout).await;
        Ok(())
    }
}

fn render_metrics(metrics: &RequestMetrics) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, metrics.content_type())], body).into_response(),
        Err(err) => {
            tracing::error!(%err, "cannot encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// A running server. Draining it stops accepting connections and waits for
/// in-flight requests to finish.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    pub fn spawn(listener: TcpListener, router: Router) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (shutdown, requested) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = requested.await;
                })
                .await
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drains with a deadline, without waiting for a signal.
    pub async fn drain_within(self, timeout: Duration) -> Result<(), BoxError> {
        tokio::time::timeout(timeout, self.drain()).await?
    }
}

impl Drain for ServerHandle {
    fn drain(self) -> impl Future<Output = Result<(), BoxError>> + Send {
        async move {
            // the server may already be gone, the task result tells why
            let _ = self.shutdown.send(());
            self.task.await??;
            Ok(())
        }
    }
}
