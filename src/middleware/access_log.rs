use std::{
    fmt,
    future::Future,
    io::{self, Write},
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Instant,
};

use http::{Method, Request, Response, StatusCode};
use pin_project::pin_project;
use tower::Service;
use tower_layer::Layer;
use tracing_subscriber::fmt::{time::FormatTime, time::SystemTime, MakeWriter};

use crate::{
    access_log::{AccessLogEntry, AccessLogFormat, ErrorMessage},
    request_id::RequestId,
};

/// Writes one access log line per request.
///
/// Lines go to a [`MakeWriter`] (stdout by default), timestamped with a
/// [`FormatTime`] (RFC 3339 by default). Register it last so it wraps the
/// whole stack and sees the final status, the [`RequestId`] and any
/// [`ErrorMessage`] attached to the response.
pub struct AccessLogLayer<W = fn() -> io::Stdout, T = SystemTime> {
    shared: Arc<Shared<W, T>>,
}

struct Shared<W, T> {
    make_writer: W,
    timer: T,
    format: AccessLogFormat,
}

impl AccessLogLayer {
    pub fn new(format: AccessLogFormat) -> Self {
        AccessLogLayer::with_writer(format, io::stdout as fn() -> io::Stdout, SystemTime)
    }
}

impl<W, T> AccessLogLayer<W, T>
where
    W: for<'w> MakeWriter<'w>,
    T: FormatTime,
{
    pub fn with_writer(format: AccessLogFormat, make_writer: W, timer: T) -> Self {
        AccessLogLayer {
            shared: Arc::new(Shared {
                make_writer,
                timer,
                format,
            }),
        }
    }
}

impl<W, T> Clone for AccessLogLayer<W, T> {
    fn clone(&self) -> Self {
        AccessLogLayer {
            shared: self.shared.clone(),
        }
    }
}

impl<W, T> fmt::Debug for AccessLogLayer<W, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessLogLayer")
            .field("format", &self.shared.format)
            .finish_non_exhaustive()
    }
}

impl<S, W, T> Layer<S> for AccessLogLayer<W, T> {
    type Service = AccessLogService<S, W, T>;

    fn layer(&self, service: S) -> Self::Service {
        AccessLogService {
            service,
            shared: self.shared.clone(),
        }
    }
}

pub struct AccessLogService<S, W, T> {
    service: S,
    shared: Arc<Shared<W, T>>,
}

impl<S: Clone, W, T> Clone for AccessLogService<S, W, T> {
    fn clone(&self) -> Self {
        AccessLogService {
            service: self.service.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S, W, T, Body, ResBody> Service<Request<Body>> for AccessLogService<S, W, T>
where
    S: Service<Request<Body>, Response = Response<ResBody>>,
    S::Error: fmt::Display,
    W: for<'w> MakeWriter<'w>,
    T: FormatTime,
{
    type Error = S::Error;
    type Future = AccessLogFuture<S::Future, W, T>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        AccessLogFuture {
            inner: self.service.call(request),
            shared: self.shared.clone(),
            start: Instant::now(),
            method,
            path,
        }
    }
}

#[pin_project]
pub struct AccessLogFuture<F, W, T> {
    #[pin]
    inner: F,
    shared: Arc<Shared<W, T>>,
    start: Instant,
    method: Method,
    path: String,
}

impl<F, W, T, ResBody, E> Future for AccessLogFuture<F, W, T>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
    E: fmt::Display,
    W: for<'w> MakeWriter<'w>,
    T: FormatTime,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        let took = this.start.elapsed();

        let (code, req_id, error) = match &result {
            Ok(response) => (
                response.status(),
                response
                    .extensions()
                    .get::<RequestId>()
                    .map(|id| id.to_string()),
                response
                    .extensions()
                    .get::<ErrorMessage>()
                    .map(|message| message.0.clone()),
            ),
            Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, None, Some(err.to_string())),
        };

        let entry = AccessLogEntry::new(
            &this.shared.timer,
            this.method.as_str(),
            this.path,
            code.as_u16(),
            took,
        )
        .with_req_id(req_id)
        .with_error(error);

        let line = entry.format(this.shared.format);
        let mut writer = this.shared.make_writer.make_writer();
        if let Err(err) = writeln!(writer, "{line}") {
            tracing::debug!(%err, "failed to write access log line");
        }

        Poll::Ready(result)
    }
}
