use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
    time::Instant,
};

use axum::extract::MatchedPath;
use http::{Request, Response, StatusCode};
use pin_project::pin_project;
use tower::Service;
use tower_layer::Layer;

use crate::metrics::RequestMetrics;

/// Records one `request_duration_seconds` observation per request, labeled
/// with the route, the final status code and the service name.
///
/// The route is the matched path template (`/users/:id`) when the router
/// provides one, the raw request path otherwise.
#[derive(Debug, Clone)]
pub struct MetricsLayer {
    metrics: RequestMetrics,
}

impl MetricsLayer {
    pub fn new(metrics: RequestMetrics) -> Self {
        MetricsLayer { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        MetricsService {
            service,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    service: S,
    metrics: RequestMetrics,
}

impl<S, Body, ResBody> Service<Request<Body>> for MetricsService<S>
where
    S: Service<Request<Body>, Response = Response<ResBody>>,
{
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let path = request
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| request.uri().path(), MatchedPath::as_str)
            .to_owned();

        MetricsFuture {
            inner: self.service.call(request),
            metrics: self.metrics.clone(),
            start: Instant::now(),
            path,
        }
    }
}

#[pin_project]
pub struct MetricsFuture<F> {
    #[pin]
    inner: F,
    metrics: RequestMetrics,
    start: Instant,
    path: String,
}

impl<F, ResBody, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ResBody>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));

        let status = match &result {
            Ok(response) => response.status(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        this.metrics
            .observe(this.path, status.as_u16(), this.start.elapsed());

        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use tower::{service_fn, ServiceExt};

    use super::*;

    #[tokio::test]
    async fn observes_once_per_request() {
        let metrics = RequestMetrics::new("orders-api").unwrap();
        let service = MetricsLayer::new(metrics.clone()).layer(service_fn(
            |request: Request<()>| async move {
                let status = if request.uri().path() == "/missing" {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::OK
                };
                Ok::<_, Infallible>(Response::builder().status(status).body(()).unwrap())
            },
        ));

        for path in ["/foo", "/foo", "/missing"] {
            service
                .clone()
                .oneshot(Request::get(path).body(()).unwrap())
                .await
                .unwrap();
        }

        assert_eq!(metrics.sample_count("/foo", 200), 2);
        assert_eq!(metrics.sample_count("/missing", 404), 1);
        assert_eq!(metrics.sample_count("/foo", 404), 0);
    }

    #[tokio::test]
    async fn errors_count_as_500() {
        let metrics = RequestMetrics::new("orders-api").unwrap();
        let service = MetricsLayer::new(metrics.clone()).layer(service_fn(|_: Request<()>| async {
            Err::<Response<()>, _>("broken")
        }));

        let _ = service.oneshot(Request::get("/foo").body(()).unwrap()).await;

        assert_eq!(metrics.sample_count("/foo", 500), 1);
    }
}
