use std::fmt;

use axum::{async_trait, extract::FromRequestParts};
use http::{request::Parts, HeaderValue, StatusCode};
use uuid::Uuid;

/// Header carrying the correlation id, both inbound and on the response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id of a single request.
///
/// Set by [`RequestIdLayer`](crate::middleware::RequestIdLayer) and handed to
/// handlers as an extractor:
///
/// ```ignore
/// async fn handler(request_id: RequestId) -> String {
///     format!("handling {request_id}")
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// A fresh random (v4) id.
    pub fn generate() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }

    /// Reuses an upstream id if it is non-empty visible ASCII.
    pub fn from_header(value: &HeaderValue) -> Option<Self> {
        let value = value.to_str().ok()?.trim();
        (!value.is_empty()).then(|| RequestId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_header_value(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.0).ok()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<RequestId>().cloned().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            "request id middleware is not installed",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_uuids() {
        let a = RequestId::generate();
        let b = RequestId::generate();

        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn blank_header_is_ignored() {
        assert_eq!(RequestId::from_header(&HeaderValue::from_static("  ")), None);
        assert_eq!(
            RequestId::from_header(&HeaderValue::from_static("abc-123")),
            Some(RequestId("abc-123".to_string()))
        );
    }
}
