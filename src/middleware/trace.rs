use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use http::{Request, Response};
use pin_project::pin_project;
use tower::Service;
use tower_layer::Layer;
use tracing::{field::Empty, instrument::Instrumented, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::{http_injector, request_id::RequestId};

/// The span of the current request, as attached by [`TraceLayer`].
#[derive(Debug, Clone)]
pub struct RequestSpan(pub Span);

/// Opens a server span around every request.
///
/// Every request gets a span named after its path. If the request
/// carries a valid upstream trace context, the span continues that trace;
/// otherwise a warning is logged and a new root span is started. The span is
/// put into the request extensions as [`RequestSpan`], tagged with the
/// response status once the handler is done, and closed when the response
/// future completes.
///
/// The `TraceLayer` will not log http requests. For that, see
/// [`AccessLogLayer`](super::AccessLogLayer).
///
/// ```ignore
/// let app = Router::new()
///     .route("/foo", get(|| async {}))
///     .route("/bar", get(|| async {}))
///     .layer(TraceLayer);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLayer;

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TraceService { service }
    }
}

/// Runs the inner service inside the request's server span and tags the
/// span with the response status.
#[derive(Debug, Clone)]
pub struct TraceService<S> {
    service: S,
}

impl<S, Body, ResBody> Service<Request<Body>> for TraceService<S>
where
    S: Service<Request<Body>, Response = Response<ResBody>>,
{
    type Error = S::Error;
    type Future = TraceFuture<S::Future>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let span = server_span(&request);
        request
            .extensions_mut()
            .insert(RequestSpan(span.clone()));

        TraceFuture {
            inner: self.service.call(request).instrument(span),
        }
    }
}

fn server_span<B>(request: &Request<B>) -> Span {
    let path = request.uri().path();
    let request_id = request.extensions().get::<RequestId>().map(RequestId::as_str);
    let span = tracing::info_span!(
        "http.server",
        reqId = request_id,
        otel.name = path,
        otel.kind = "server",
        otel.status_code = Empty,
        http.method = %request.method(),
        http.url = %request.uri(),
        http.status_code = Empty,
    );

    match http_injector::extract_remote_context(request.headers()) {
        Some(parent) => span.set_parent(parent),
        None => tracing::warn!(path, "could not extract span from request, starting a root span"),
    }

    span
}

#[pin_project]
pub struct TraceFuture<F> {
    #[pin]
    inner: Instrumented<F>,
}

impl<F, ResBody, E> Future for TraceFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        let result = ready!(this.inner.as_mut().poll(cx));

        let span = this.inner.span();
        match &result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                if response.status().is_server_error() {
                    span.record("otel.status_code", "ERROR");
                }
            }
            Err(_) => {
                span.record("http.status_code", 500u16);
                span.record("otel.status_code", "ERROR");
            }
        }

        Poll::Ready(result)
    }
}
