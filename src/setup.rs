use std::io;

use opentelemetry::{global, trace::TraceError, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace::Tracer, Resource};
use tower::BoxError;
use tracing_core::{LevelFilter, Subscriber};
use tracing_subscriber::{
    fmt::{
        self,
        format::{Format, Json, JsonFields},
        MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::{config::Config, error::Error, http_injector};

/// Sets up logging and, if enabled in `config`, tracing via otlp exporter.
///
/// Logs are single-line JSON in production and human-readable otherwise. The
/// level is taken from `RUST_LOG` and defaults to `info`. Traces are exported
/// to `config.otlp_endpoint` (Jaeger accepts otlp) and propagated in Jaeger
/// `uber-trace-id` headers.
///
/// This should generally be the first statement of any server binary's main
/// function. Any error is meant to be fatal. The returned [`Telemetry`] must
/// be shut down on exit to flush pending spans, usually by registering
/// [`Telemetry::into_shutdown_hook`].
pub fn setup(config: &Config) -> Result<Telemetry, Error> {
    let tracer = config
        .with_tracing
        .then(|| init_tracer(&config.app_name, &config.otlp_endpoint))
        .transpose()?;
    let tracing_enabled = tracer.is_some();

    let (json, pretty) = if config.env.is_production() {
        (Some(json_layer(io::stdout)), None)
    } else {
        (None, Some(fmt::layer().pretty()))
    };

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
        }))
        .with(tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer)))
        .with(json)
        .with(pretty)
        .try_init()?;

    tracing::info!(
        service = %config.app_name,
        env = %config.env,
        tracing = tracing_enabled,
        "observability initialized"
    );

    Ok(Telemetry {
        tracing: tracing_enabled,
    })
}

/// The production log layer: one JSON object per line, carrying the fields
/// of the current span and of every span it is nested in, so `reqId` shows up
/// however deep the handler's own spans go.
pub fn json_layer<S, W>(make_writer: W) -> fmt::Layer<S, JsonFields, Format<Json>, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(make_writer)
}

fn init_tracer(service: &str, endpoint: &str) -> Result<Tracer, TraceError> {
    http_injector::install_propagator();

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::config().with_resource(Resource::new(vec![KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                service.to_string(),
            )])),
        )
        .install_batch(runtime::Tokio)
}

/// Handle to the installed telemetry. Created by [`setup`], closed on
/// shutdown.
#[derive(Debug)]
#[must_use = "telemetry must be shut down to flush pending spans"]
pub struct Telemetry {
    tracing: bool,
}

impl Telemetry {
    /// Flushes and shuts down the tracer provider. Blocks until pending spans
    /// are exported.
    pub fn shutdown(self) -> Result<(), BoxError> {
        if self.tracing {
            global::shutdown_tracer_provider();
        }
        Ok(())
    }

    /// [`Telemetry::shutdown`] as a shutdown hook.
    pub fn into_shutdown_hook(self) -> impl FnOnce() -> Result<(), BoxError> + Send + 'static {
        move || self.shutdown()
    }
}
