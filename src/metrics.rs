use std::time::Duration;

use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};

use crate::error::Error;

const REQUEST_DURATION: &str = "request_duration_seconds";
const LABELS: [&str; 3] = ["path", "status", "service"];

/// Request duration metrics, exposed in the Prometheus text format.
///
/// Every instance owns its registry, so two servers in one process (or two
/// tests) never see each other's samples.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    registry: Registry,
    duration: HistogramVec,
    service: String,
}

impl RequestMetrics {
    /// `service` is used verbatim as the `service` label, see
    /// [`Config::service_label`](crate::config::Config::service_label).
    pub fn new(service: &str) -> Result<Self, Error> {
        let registry = Registry::new();
        let duration = HistogramVec::new(
            HistogramOpts::new(REQUEST_DURATION, "Handlers request duration in seconds"),
            &LABELS,
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(RequestMetrics {
            registry,
            duration,
            service: service.to_string(),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn observe(&self, path: &str, status: u16, elapsed: Duration) {
        self.duration
            .with_label_values(&[path, status.to_string().as_str(), self.service.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    /// Current snapshot in the text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    #[cfg(test)]
    pub(crate) fn sample_count(&self, path: &str, status: u16) -> u64 {
        self.duration
            .with_label_values(&[path, status.to_string().as_str(), self.service.as_str()])
            .get_sample_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_observations() {
        let metrics = RequestMetrics::new("billing_api").unwrap();
        metrics.observe("/users/:id", 200, Duration::from_millis(12));

        let text = metrics.render().unwrap();
        assert!(text.contains("# HELP request_duration_seconds Handlers request duration in seconds"));
        assert!(text.contains(
            r#"request_duration_seconds_count{path="/users/:id",service="billing_api",status="200"} 1"#
        ));
    }

    #[test]
    fn registries_are_isolated() {
        let a = RequestMetrics::new("a").unwrap();
        let b = RequestMetrics::new("b").unwrap();
        a.observe("/", 200, Duration::ZERO);

        assert_eq!(a.sample_count("/", 200), 1);
        assert!(!b.render().unwrap().contains("request_duration_seconds_count"));
    }
}
