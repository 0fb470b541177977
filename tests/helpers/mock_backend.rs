//! Mock backend application for integration testing.
//!
//! Serves a few fixed routes and records what reached it, so tests can
//! assert both on what the client got back and on what the gateway sent.

#![allow(dead_code)]

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::IntoResponse,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

pub const DASHBOARD_BODY: &str = "<html><body><h1>Dashboard</h1></body></html>";

/// A request as seen by the backend.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Default)]
struct MockState {
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Handle to a running mock backend.
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<MockState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MockBackend {
    /// Start on an ephemeral local port.
    pub async fn start() -> Self {
        Self::start_on(0).await
    }

    /// Start on a given local port, e.g. to come back where a stopped
    /// backend used to listen.
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState::default());

        let app = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&state));

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn request_count(&self) -> usize {
        self.state.requests.lock().await.len()
    }

    pub async fn last_request(&self) -> Option<RecordedRequest> {
        self.state.requests.lock().await.last().cloned()
    }

    /// Stop listening and wait for the server to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    state.requests.lock().await.push(RecordedRequest {
        method: method.clone(),
        uri: uri.clone(),
        headers: headers.clone(),
        body: body.clone(),
    });

    match uri.path() {
        "/dashboard" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html"), (header::ETAG, "\"v1\"")],
            DASHBOARD_BODY,
        )
            .into_response(),
        "/teapot" => (StatusCode::IM_A_TEAPOT, "short and stout").into_response(),
        "/echo" => {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .cloned()
                .unwrap_or_else(|| header::HeaderValue::from_static("application/octet-stream"));
            (StatusCode::CREATED, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            (StatusCode::OK, "too late").into_response()
        }
        _ => (StatusCode::NOT_FOUND, "backend 404").into_response(),
    }
}
