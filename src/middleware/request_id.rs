use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use http::{HeaderName, Request, Response};
use pin_project::pin_project;
use tower::Service;
use tower_layer::Layer;
use tracing::{instrument::Instrumented, Instrument};

use crate::request_id::{RequestId, REQUEST_ID_HEADER};

/// Gives every request a [`RequestId`].
///
/// An incoming `x-request-id` header is reused, otherwise a random id is
/// generated. The id is put into the request extensions, the inner service
/// runs inside a span carrying it as `reqId` (so every log line of the
/// request is correlated), and it is echoed in the response headers and
/// response extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdLayer;

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RequestIdService { service }
    }
}

#[derive(Debug, Clone)]
pub struct RequestIdService<S> {
    service: S,
}

impl<S, Body, ResBody> Service<Request<Body>> for RequestIdService<S>
where
    S: Service<Request<Body>, Response = Response<ResBody>>,
{
    type Error = S::Error;
    type Future = RequestIdFuture<S::Future>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(RequestId::from_header)
            .unwrap_or_else(RequestId::generate);

        request.extensions_mut().insert(request_id.clone());
        let span = tracing::info_span!("request", reqId = %request_id);

        let inner = span.in_scope(|| self.service.call(request));

        RequestIdFuture {
            inner: inner.instrument(span),
            request_id: Some(request_id),
        }
    }
}

#[pin_project]
pub struct RequestIdFuture<F> {
    #[pin]
    inner: Instrumented<F>,
    request_id: Option<RequestId>,
}

impl<F, ResBody, E> Future for RequestIdFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut response = ready!(this.inner.poll(cx))?;

        if let Some(request_id) = this.request_id.take() {
            if let Some(value) = request_id.to_header_value() {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
            response.extensions_mut().insert(request_id);
        }

        Poll::Ready(Ok(response))
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use tower::{service_fn, ServiceExt};

    use super::*;

    async fn echo(request: Request<()>) -> Result<Response<String>, Infallible> {
        let id = request
            .extensions()
            .get::<RequestId>()
            .map(|id| id.to_string())
            .unwrap_or_default();
        Ok(Response::new(id))
    }

    #[tokio::test]
    async fn generates_id_when_header_is_missing() {
        let service = RequestIdLayer.layer(service_fn(echo));

        let response = service
            .oneshot(Request::get("/").body(()).unwrap())
            .await
            .unwrap();

        let header = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        assert!(uuid::Uuid::parse_str(&header).is_ok());
        assert_eq!(response.body(), &header);
        assert_eq!(
            response.extensions().get::<RequestId>().map(RequestId::as_str),
            Some(header.as_str())
        );
    }

    #[tokio::test]
    async fn every_request_gets_its_own_id() {
        let service = RequestIdLayer.layer(service_fn(echo));

        let first = service
            .clone()
            .oneshot(Request::get("/").body(()).unwrap())
            .await
            .unwrap();
        let second = service
            .oneshot(Request::get("/").body(()).unwrap())
            .await
            .unwrap();

        assert_ne!(first.body(), second.body());
    }

    #[tokio::test]
    async fn reuses_upstream_id() {
        let service = RequestIdLayer.layer(service_fn(echo));

        let response = service
            .oneshot(
                Request::get("/")
                    .header(REQUEST_ID_HEADER, "upstream-42")
                    .body(())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.body(), "upstream-42");
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "upstream-42");
    }
}
