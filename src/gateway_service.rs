//! Request routing for the gateway.
//!
//! `/login` and `/logout` are served locally. Every other path requires a
//! valid session and is forwarded to the backend; a request without one is
//! redirected to the login page before anything reaches the backend.

use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, header};
use http_body::Body;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, error, warn};

use crate::auth::{
    AuthGateway, LOGIN_PATH, LOGOUT_PATH, MAX_LOGIN_FORM_BYTES, parse_login_form, redirect,
};
use crate::error::{GatewayError, GatewayResult};
use crate::forwarder::{Forwarder, GatewayBody, ProxyRequest, full_response};

/// Top-level gateway service.
#[derive(Clone, Debug)]
pub struct GatewayService {
    auth: Arc<AuthGateway>,
    forwarder: Forwarder,
}

impl GatewayService {
    pub fn new(auth: Arc<AuthGateway>, forwarder: Forwarder) -> Self {
        Self { auth, forwarder }
    }

    pub fn auth(&self) -> &AuthGateway {
        &self.auth
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Route and handle one request. Never fails: errors become responses.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let result = match (&method, path.as_str()) {
            (&Method::GET | &Method::HEAD, LOGIN_PATH) => {
                Ok(full_response(self.auth.login_page(req.uri().query())))
            }
            (&Method::POST, LOGIN_PATH) => self.login(req).await,
            (_, LOGIN_PATH) => Err(GatewayError::MethodNotAllowed),
            (&Method::GET, LOGOUT_PATH) => Ok(full_response(self.auth.handle_logout())),
            (_, LOGOUT_PATH) => Err(GatewayError::MethodNotAllowed),
            _ => self.proxy(req).await,
        };

        result.unwrap_or_else(|e| {
            if e.is_backend_failure() {
                warn!(method = %method, path = %path, error = %e, "Gateway error");
            } else if e.status().is_server_error() {
                error!(method = %method, path = %path, error = %e, "Internal error");
            } else {
                debug!(method = %method, path = %path, error = %e, "Request rejected");
            }
            let mut resp = e.to_response();
            if matches!(e, GatewayError::MethodNotAllowed) {
                let allow = if path == LOGIN_PATH { "GET, HEAD, POST" } else { "GET" };
                resp.headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static(allow));
            }
            full_response(resp)
        })
    }

    async fn login<B>(&self, req: Request<B>) -> GatewayResult<Response<GatewayBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let form = Limited::new(req.into_body(), MAX_LOGIN_FORM_BYTES)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    GatewayError::PayloadTooLarge {
                        limit: MAX_LOGIN_FORM_BYTES,
                    }
                } else {
                    GatewayError::BadRequest(format!("failed to read login form: {e}"))
                }
            })?
            .to_bytes();

        let (username, password) = parse_login_form(&form);
        Ok(full_response(self.auth.login_response(&username, &password)))
    }

    async fn proxy<B>(&self, req: Request<B>) -> GatewayResult<Response<GatewayBody>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let session = match self.auth.require_session(req.headers()) {
            Ok(session) => session,
            Err(e) => {
                debug!(path = %req.uri().path(), reason = %e, "Redirecting to login");
                return Ok(full_response(redirect(LOGIN_PATH, None)));
            }
        };

        let snapshot =
            ProxyRequest::from_request(req, self.forwarder.config().max_request_body).await?;
        self.forwarder.forward(snapshot, session.subject()).await
    }
}

impl<B> Service<Request<B>> for GatewayService
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<GatewayBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}
