//! Correlation ID middleware.
//!
//! Every request runs inside an `http_request` span carrying a correlation
//! id taken from `X-Correlation-ID`, else the trace id of a W3C
//! `traceparent` header, else a fresh UUID. The id is echoed back on the
//! response.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

const TRACEPARENT_HEADER: &str = "traceparent";

/// Correlation id of the current request, available as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trace id field of a `traceparent` value (`version-traceid-parentid-flags`).
fn trace_id(traceparent: &str) -> Option<&str> {
    let mut parts = traceparent.split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    (trace_id.len() == 32 && trace_id.bytes().all(|b| b.is_ascii_hexdigit())).then_some(trace_id)
}

fn correlation_id(request: &Request) -> CorrelationId {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    header(CORRELATION_ID_HEADER)
        .or_else(|| header(TRACEPARENT_HEADER).and_then(trace_id))
        .map(|id| CorrelationId(id.to_string()))
        .unwrap_or_else(|| CorrelationId(Uuid::new_v4().to_string()))
}

pub async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let id = correlation_id(&request);
    let span = tracing::info_span!(
        "http_request",
        correlation_id = %id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    request.extensions_mut().insert(id.clone());

    async move {
        let mut response = next.run(request).await;
        if let Ok(value) = HeaderValue::from_str(&id.0) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        tracing::debug!(status = response.status().as_u16(), "Request completed");
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri("/health");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_explicit_header_wins() {
        let req = request(&[
            ("X-Correlation-ID", "abc-123"),
            ("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
        ]);
        assert_eq!(correlation_id(&req).0, "abc-123");
    }

    #[test]
    fn test_traceparent_fallback() {
        let req = request(&[(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )]);
        assert_eq!(correlation_id(&req).0, "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn test_malformed_traceparent_generates_uuid() {
        let req = request(&[("traceparent", "garbage")]);
        assert!(Uuid::parse_str(&correlation_id(&req).0).is_ok());
        assert_eq!(trace_id("00-xyz-01"), None);
    }
}
