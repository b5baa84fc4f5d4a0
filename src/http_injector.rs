use http::{HeaderMap, HeaderName, HeaderValue, Request};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::TraceContextExt,
    Context,
};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Installs the Jaeger propagator as the global text map propagator, so
/// trace context travels in the `uber-trace-id` header.
pub fn install_propagator() {
    global::set_text_map_propagator(opentelemetry_jaeger_propagator::Propagator::new());
}

/// Injects the current [`opentelemetry::Context`] into a [`Request`]
/// headers to allow propagation downstream.
pub fn inject_context_into_request<T>(request: &mut Request<T>) -> &mut Request<T> {
    let context = Span::current().context();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut HeaderInjector(request.headers_mut()))
    });

    request
}

/// Constructs a [`opentelemetry::Context`] from request headers using the
/// global propagator.
///
/// Returns `None` when the headers carry no valid upstream span, in which
/// case the caller should start a root span.
pub fn extract_remote_context(headers: &HeaderMap) -> Option<Context> {
    global::get_text_map_propagator(|propagator| remote_context(propagator, headers))
}

pub(crate) fn remote_context(
    propagator: &dyn TextMapPropagator,
    headers: &HeaderMap,
) -> Option<Context> {
    let context = propagator.extract(&HeaderExtractor(headers));
    let valid = context.span().span_context().is_valid();

    valid.then_some(context)
}

/// Lets the propagator write trace headers (`uber-trace-id` for Jaeger) into a
/// [`HeaderMap`]. Invalid names or values are skipped.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl<'a> Injector for HeaderInjector<'a> {
    fn set(&mut self, key: &str, value: String) {
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                self.0.insert(name, value);
            }
            _ => tracing::debug!(key, "dropping trace header that is not valid http"),
        }
    }
}

/// Lets the propagator read trace headers from a [`HeaderMap`].
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|h| h.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|s| s.as_str()).collect()
    }
}
