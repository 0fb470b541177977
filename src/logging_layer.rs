//! Tower layer for structured request/response logging.
//!
//! Every request gets an `x-request-id` (taken from the client or generated)
//! that is attached to the request span, passed on to the backend and echoed
//! on the response.

use http::{HeaderMap, HeaderValue, Request, Response};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};
use tracing::{Instrument, debug, info, info_span};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Headers that are redacted from logs. Session tokens travel in cookies.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "proxy-authorization",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
];

/// Layer that wraps a service with request logging.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingLayer;

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

/// Service produced by [`LoggingLayer`].
#[derive(Clone, Debug)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for LoggingService<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display,
    ReqB: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqB>) -> Self::Future {
        // Use the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let request_id = ensure_request_id(req.headers_mut());
        let span = info_span!(
            "request",
            method = %req.method(),
            path = %req.uri().path(),
            request_id = %request_id.to_str().unwrap_or_default(),
        );

        Box::pin(
            async move {
                let start = Instant::now();
                info!(direction = "inbound", "Request received");
                if tracing::enabled!(tracing::Level::DEBUG) {
                    debug!(
                        version = ?req.version(),
                        headers = ?sanitize_headers(req.headers()),
                        "Request details"
                    );
                }

                let result = inner.call(req).await;
                let latency_ms = start.elapsed().as_millis();
                match result {
                    Ok(mut response) => {
                        info!(
                            status = response.status().as_u16(),
                            latency_ms,
                            direction = "outbound",
                            "Response sent"
                        );
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            debug!(headers = ?sanitize_headers(response.headers()), "Response details");
                        }
                        response
                            .headers_mut()
                            .entry(REQUEST_ID_HEADER)
                            .or_insert(request_id);
                        Ok(response)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, latency_ms, direction = "error", "Request failed");
                        Err(e)
                    }
                }
            }
            .instrument(span),
        )
    }
}

/// Return the request id, generating and inserting one if absent or unusable.
fn ensure_request_id(headers: &mut HeaderMap) -> HeaderValue {
    let usable = headers
        .get(REQUEST_ID_HEADER)
        .filter(|v| v.to_str().is_ok_and(|s| !s.is_empty() && s.len() <= 128));
    if let Some(existing) = usable {
        return existing.clone();
    }
    let generated = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    headers.insert(REQUEST_ID_HEADER, generated.clone());
    generated
}

/// Debug view of a header map with sensitive values redacted.
pub struct SanitizedHeaders<'a>(pub &'a HeaderMap);

impl fmt::Debug for SanitizedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX_HEADERS_TO_LOG: usize = 50;
        const MAX_VALUE_LEN: usize = 256;

        let mut map = f.debug_map();
        for (idx, (name, value)) in self.0.iter().enumerate() {
            if idx >= MAX_HEADERS_TO_LOG {
                map.entry(&"...", &format!("({} more headers)", self.0.len() - idx));
                break;
            }
            let name = name.as_str();
            if SENSITIVE_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
                map.entry(&name, &"[REDACTED]");
                continue;
            }
            match value.to_str() {
                Ok(v) if v.len() <= MAX_VALUE_LEN => map.entry(&name, &v),
                Ok(v) => map.entry(&name, &format!("<{} bytes>", v.len())),
                Err(_) => map.entry(&name, &format!("<binary: {} bytes>", value.len())),
            };
        }
        map.finish()
    }
}

pub fn sanitize_headers(headers: &HeaderMap) -> SanitizedHeaders<'_> {
    SanitizedHeaders(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use tower::{ServiceBuilder, ServiceExt, service_fn};

    #[test]
    fn test_sensitive_headers_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", HeaderValue::from_static("user=secret-token"));
        headers.insert("Set-Cookie", HeaderValue::from_static("user=secret-token"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        let rendered = format!("{:?}", sanitize_headers(&headers));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(rendered.contains("text/html"));
    }

    #[tokio::test]
    async fn test_request_id_generated_and_echoed() {
        let svc = ServiceBuilder::new()
            .layer(LoggingLayer)
            .service(service_fn(|req: Request<()>| async move {
                let seen = req.headers().get(REQUEST_ID_HEADER).cloned();
                assert!(seen.is_some());
                Ok::<_, Infallible>(Response::new(seen))
            }));

        let resp = svc.oneshot(Request::new(())).await.unwrap();
        let echoed = resp.headers().get(REQUEST_ID_HEADER).unwrap();
        assert_eq!(Some(echoed), resp.body().as_ref());
        assert!(uuid::Uuid::parse_str(echoed.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_client_request_id_preserved() {
        let svc = LoggingLayer.layer(service_fn(|_req: Request<()>| async {
            Ok::<_, Infallible>(Response::new(()))
        }));
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "abc-123")
            .body(())
            .unwrap();
        let resp = svc.oneshot(req).await.unwrap();
        assert_eq!(resp.headers()[REQUEST_ID_HEADER], "abc-123");
    }
}
