//! Error types for the AuthGate gateway.
//!
//! Three families of failure exist:
//!
//! - [`AuthError`] - login and session failures. These are always recovered
//!   into redirects by the gateway service and never reach the client as a
//!   raw error status.
//! - [`BackendError`] - supervisor and forwarding failures. These surface to
//!   the client as a gateway error response with a generic body.
//! - [`GatewayError`] - the umbrella type returned by request handling.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Authentication failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Username unknown or secret mismatched. Deliberately carries no detail.
    #[error("Login incorrect")]
    InvalidCredentials,

    /// Missing, malformed, tampered or expired session cookie.
    #[error("Unauthenticated")]
    Unauthenticated,
}

/// Failures of the supervised backend or of a forwarded exchange.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The backend process could not be created. Fatal at startup.
    #[error("Failed to spawn backend '{program}': {reason}")]
    SpawnFailed {
        /// Program that failed to start (logged, never sent to clients)
        program: String,
        /// Underlying OS error
        reason: String,
    },

    /// Backend is not accepting traffic and a bounded re-probe did not help.
    #[error("Backend not ready")]
    NotReady,

    /// Backend did not answer within the per-request timeout.
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// TCP connection to the backend was refused or could not be established.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Any other transport failure on an established exchange.
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Session codec failures. Only issuing can fail; validation yields `None`.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The signing key is shorter than the minimum length.
    #[error("session secret must be at least {min} bytes, got {actual}")]
    SecretTooShort { min: usize, actual: usize },

    /// Token encoding failed.
    #[error("failed to encode session token: {0}")]
    Encode(#[from] jsonwebtoken::errors::Error),
}

/// Errors produced while handling a single inbound request.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// Request body exceeded the configured limit.
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Request could not be interpreted (bad form encoding, unreadable body).
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Route exists but does not accept this method.
    #[error("Method not allowed")]
    MethodNotAllowed,
}

impl GatewayError {
    /// HTTP status this error is reported with.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Backend(BackendError::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Backend(BackendError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Backend(
                BackendError::ConnectionRefused(_) | BackendError::Connection(_),
            ) => StatusCode::BAD_GATEWAY,
            GatewayError::Backend(BackendError::SpawnFailed { .. }) | GatewayError::Session(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Convert error to an HTTP response with a fixed, generic body.
    ///
    /// Bodies never include backend addresses, commands or error chains.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let message = match self {
            GatewayError::Backend(BackendError::NotReady) => {
                "Proxy error: backend is not ready. Please retry shortly."
            }
            GatewayError::Backend(BackendError::Timeout(_)) => {
                "Proxy error: backend did not respond in time."
            }
            GatewayError::Backend(
                BackendError::ConnectionRefused(_) | BackendError::Connection(_),
            ) => "Proxy error: backend unavailable.",
            GatewayError::Backend(BackendError::SpawnFailed { .. }) | GatewayError::Session(_) => {
                "Internal gateway error."
            }
            GatewayError::Auth(_) => "Unauthenticated.",
            GatewayError::PayloadTooLarge { .. } => "Request body too large.",
            GatewayError::BadRequest(_) => "Bad request.",
            GatewayError::MethodNotAllowed => "Method not allowed.",
        };

        Response::builder()
            .status(self.status())
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Cache-Control", "no-store")
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("500 Internal Server Error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }

    /// Whether this failure should count against the backend's health.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Backend(
                BackendError::NotReady
                    | BackendError::Timeout(_)
                    | BackendError::ConnectionRefused(_)
                    | BackendError::Connection(_)
            )
        )
    }
}

/// Result type alias for request handling.
pub type GatewayResult<T> = Result<T, GatewayError>;
