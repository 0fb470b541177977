//! Reverse proxy forwarder.
//!
//! Forwards an authenticated request to the supervised backend and streams
//! the response back. The request body is buffered up to a limit so the
//! outbound request is built from an immutable snapshot; the response body is
//! streamed through [`TimeoutBody`] without buffering.

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Request, Response, Uri};
use http_body::Body;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ForwardConfig;
use crate::error::{BackendError, GatewayError, GatewayResult};
use crate::supervisor::ProcessSupervisor;
use crate::timeout::{StreamDeadlines, TimeoutBody};

/// Response body type produced by the gateway.
pub type GatewayBody = UnsyncBoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Box a buffered response into the gateway body type.
pub fn full_response(resp: Response<Full<Bytes>>) -> Response<GatewayBody> {
    resp.map(|body| body.map_err(|never| match never {}).boxed_unsync())
}

/// Request headers passed through to the backend. Everything else is dropped.
const FORWARDED_REQUEST_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "content-encoding",
    "content-type",
    "cookie",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-unmodified-since",
    "origin",
    "range",
    "referer",
    "user-agent",
    "x-request-id",
    "x-requested-with",
];

/// Check if a header is hop-by-hop (should not be forwarded).
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy `source` into `target`, dropping hop-by-hop headers and any header
/// named in `source`'s `Connection` field.
pub fn copy_end_to_end_headers(source: &HeaderMap, target: &mut HeaderMap) {
    let listed: Vec<String> = source
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for (name, value) in source {
        if is_hop_by_hop_header(name.as_str()) || listed.iter().any(|t| t == name.as_str()) {
            continue;
        }
        target.append(name, value.clone());
    }
}

/// Immutable snapshot of an inbound request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    /// Snapshot a request, buffering at most `limit` body bytes.
    pub async fn from_request<B>(req: Request<B>, limit: usize) -> GatewayResult<Self>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let body = Limited::new(body, limit)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    GatewayError::PayloadTooLarge { limit }
                } else {
                    GatewayError::BadRequest(format!("failed to read request body: {e}"))
                }
            })?
            .to_bytes();

        Ok(Self {
            method: parts.method,
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body,
        })
    }

    /// Path plus query string, as sent on the request line.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

/// Remove one cookie from a `Cookie` header value, keeping the rest.
fn strip_cookie(value: &HeaderValue, name: &str) -> Option<HeaderValue> {
    let value = value.to_str().ok()?;
    let kept: Vec<&str> = value
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split_once('=').is_none_or(|(k, _)| k.trim() != name))
        .collect();
    if kept.is_empty() {
        return None;
    }
    HeaderValue::from_str(&kept.join("; ")).ok()
}

/// Forwards authenticated traffic to the supervised backend.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    supervisor: Arc<ProcessSupervisor>,
    config: ForwardConfig,
    authority: String,
    session_cookie: String,
}

impl Forwarder {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        config: ForwardConfig,
        session_cookie: impl Into<String>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(config.request_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);

        let authority = supervisor.config().authority();
        Self {
            client,
            supervisor,
            config,
            authority,
            session_cookie: session_cookie.into(),
        }
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Forward `request` on behalf of `subject`.
    ///
    /// Fails with a [`BackendError`] when the backend is not ready, refuses
    /// the connection or does not answer within the request timeout. Failures
    /// are reported to the supervisor and are never retried here.
    pub async fn forward(
        &self,
        request: ProxyRequest,
        subject: &str,
    ) -> GatewayResult<Response<GatewayBody>> {
        self.supervisor.ensure_ready().await?;

        let outbound = self.build_outbound(&request, subject)?;
        debug!(
            method = %request.method,
            path = %request.path,
            subject = %subject,
            backend = %self.authority,
            "Forwarding request"
        );

        let result = match timeout(self.config.request_timeout, self.client.request(outbound)).await
        {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) if e.is_connect() => Err(BackendError::ConnectionRefused(e.to_string())),
            Ok(Err(e)) => Err(BackendError::Connection(e.to_string())),
            Err(_) => Err(BackendError::Timeout(self.config.request_timeout)),
        };

        let upstream = match result {
            Ok(resp) => {
                self.supervisor.record_success().await;
                resp
            }
            Err(e) => {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    error = %e,
                    "Backend request failed"
                );
                self.supervisor.record_failure().await;
                return Err(e.into());
            }
        };

        let (parts, body) = upstream.into_parts();
        let mut response = Response::builder().status(parts.status);
        if let Some(headers) = response.headers_mut() {
            copy_end_to_end_headers(&parts.headers, headers);
        }
        let body = TimeoutBody::new(body, StreamDeadlines::from(&self.config)).boxed_unsync();
        response
            .body(body)
            .map_err(|e| GatewayError::from(BackendError::Connection(e.to_string())))
    }

    /// Build the outbound request: same method, path, query and body, with a
    /// filtered header set and `Host` set to the backend.
    fn build_outbound(
        &self,
        request: &ProxyRequest,
        subject: &str,
    ) -> GatewayResult<Request<Full<Bytes>>> {
        let uri: Uri = format!("http://{}{}", self.authority, request.path_and_query())
            .parse()
            .map_err(|e| GatewayError::BadRequest(format!("invalid request target: {e}")))?;

        let mut builder = Request::builder().method(request.method.clone()).uri(uri);
        let headers = builder
            .headers_mut()
            .ok_or_else(|| GatewayError::BadRequest("invalid request".to_string()))?;

        for (name, value) in &request.headers {
            if !FORWARDED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if *name == header::COOKIE {
                if let Some(rest) = strip_cookie(value, &self.session_cookie) {
                    headers.append(name, rest);
                }
                continue;
            }
            headers.append(name, value.clone());
        }

        if let Some(identity) = &self.config.identity_header {
            headers.remove(identity);
            let value = HeaderValue::from_str(subject)
                .map_err(|_| GatewayError::BadRequest("subject not representable".to_string()))?;
            headers.insert(identity.clone(), value);
        }

        let host = HeaderValue::from_str(&self.authority)
            .map_err(|e| GatewayError::BadRequest(format!("invalid backend authority: {e}")))?;
        headers.insert(header::HOST, host);

        builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| GatewayError::BadRequest(e.to_string()))
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("authority", &self.authority)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
