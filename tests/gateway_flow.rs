//! End-to-end tests: real gateway over TCP, supervised stand-in backend
//! process, mock backend application.
//!
//! The supervised process is `sleep`, which lets the supervisor own a real
//! child; the HTTP side of the backend is an in-process axum server on the
//! port the supervisor probes.

#![cfg(unix)]

mod helpers;

use authgate::config::{
    BackendConfig, ForwardConfig, GatewayConfig, LogFormat, ServerConfig, SessionConfig,
};
use authgate::credentials::Credential;
use authgate::server::Gateway;
use authgate::supervisor::{BackendProcessState, ProcessSupervisor};
use helpers::mock_backend::{DASHBOARD_BODY, MockBackend};
use http::HeaderName;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SECRET: &[u8] = b"integration-test-secret-0123456789";
const IDENTITY_HEADER: &str = "x-authgate-user";

struct TestGateway {
    addr: SocketAddr,
    supervisor: Arc<ProcessSupervisor>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    client: reqwest::Client,
}

impl TestGateway {
    async fn start(backend_port: u16) -> Self {
        Self::start_with_respawns(backend_port, 0).await
    }

    async fn start_with_respawns(backend_port: u16, max_respawns: u32) -> Self {
        let config = GatewayConfig {
            server: ServerConfig {
                listen: "127.0.0.1:0".parse().unwrap(),
                shutdown_timeout: Duration::from_secs(2),
                ..ServerConfig::default()
            },
            backend: BackendConfig {
                command: vec!["sleep".to_string(), "300".to_string()],
                port: backend_port,
                startup_timeout: Duration::from_secs(5),
                reprobe_timeout: Duration::from_millis(300),
                probe_interval: Duration::from_millis(20),
                stop_grace: Duration::from_secs(1),
                max_respawns,
                ..BackendConfig::default()
            },
            session: SessionConfig {
                secret: Some(SECRET.to_vec()),
                ..SessionConfig::default()
            },
            forward: ForwardConfig {
                request_timeout: Duration::from_secs(1),
                identity_header: Some(HeaderName::from_static(IDENTITY_HEADER)),
                ..ForwardConfig::default()
            },
            credentials: vec![
                Credential::new("admin", "Admin@123", "admin"),
                Credential::new("normal", "User@123", "normal"),
            ],
            login_template: None,
            log_format: LogFormat::Json,
        };

        let gateway = Gateway::start(config).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        let supervisor = Arc::clone(gateway.supervisor());
        assert_eq!(supervisor.state(), BackendProcessState::Ready);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(gateway.serve(shutdown.clone()));
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            addr,
            supervisor,
            shutdown,
            task,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn login(&self, username: &str, password: &str) -> reqwest::Response {
        self.client
            .post(self.url("/login"))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(format!(
                "username={}&password={}",
                urlencoding::encode(username),
                urlencoding::encode(password)
            ))
            .send()
            .await
            .unwrap()
    }

    /// Log in and return the `name=value` pair to send back as a cookie.
    async fn session_cookie(&self, username: &str, password: &str) -> String {
        let resp = self.login(username, password).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        let set_cookie = resp.headers()[SET_COOKIE].to_str().unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    async fn get(&self, path: &str, cookie: Option<&str>) -> reqwest::Response {
        let mut req = self.client.get(self.url(path));
        if let Some(cookie) = cookie {
            req = req.header(COOKIE, cookie);
        }
        req.send().await.unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.task).await;
    }
}

#[tokio::test]
async fn test_login_then_dashboard_returns_backend_response() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;

    let resp = gw.login("admin", "Admin@123").await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[LOCATION], "/");
    let set_cookie = resp.headers()[SET_COOKIE].to_str().unwrap().to_string();
    assert!(set_cookie.starts_with("user="));
    assert!(set_cookie.contains("HttpOnly"));
    let cookie = set_cookie.split(';').next().unwrap().to_string();

    let resp = gw.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["etag"], "\"v1\"");
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(resp.text().await.unwrap(), DASHBOARD_BODY);

    let seen = backend.last_request().await.unwrap();
    assert_eq!(seen.uri.path(), "/dashboard");
    assert_eq!(
        seen.headers["host"],
        format!("127.0.0.1:{}", backend.port()).as_str()
    );
    assert_eq!(seen.headers[IDENTITY_HEADER], "admin");
    // The session token stays between browser and gateway.
    assert!(!seen.headers.contains_key("cookie"));

    gw.stop().await;
}

#[tokio::test]
async fn test_wrong_password_redirects_with_error() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;

    let resp = gw.login("admin", "wrong").await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[LOCATION], "/login?error=Login%20incorrect");
    assert!(!resp.headers().contains_key(SET_COOKIE));

    let page = gw.get("/login?error=Login%20incorrect", None).await;
    assert_eq!(page.status(), StatusCode::OK);
    assert!(page.text().await.unwrap().contains("Login incorrect"));

    gw.stop().await;
}

#[tokio::test]
async fn test_login_page_escapes_error_parameter() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;

    let page = gw
        .get("/login?error=%3Cscript%3Ealert(1)%3C%2Fscript%3E", None)
        .await;
    let html = page.text().await.unwrap();
    assert!(!html.contains("<script>"));
    assert!(html.contains("&lt;script&gt;"));

    gw.stop().await;
}

#[tokio::test]
async fn test_requests_without_session_never_reach_backend() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;

    let resp = gw.get("/dashboard", None).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[LOCATION], "/login");

    let resp = gw
        .client
        .post(gw.url("/echo"))
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);

    // A cookie holding just a username is not a session.
    let resp = gw.get("/dashboard", Some("user=admin")).await;
    assert_eq!(resp.status(), StatusCode::FOUND);

    assert_eq!(backend.request_count().await, 0);
    gw.stop().await;
}

#[tokio::test]
async fn test_backend_status_and_body_passed_through() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;
    let cookie = gw.session_cookie("normal", "User@123").await;

    let resp = gw.get("/teapot", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(resp.text().await.unwrap(), "short and stout");

    let resp = gw.get("/missing?x=1", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.text().await.unwrap(), "backend 404");
    assert_eq!(backend.last_request().await.unwrap().uri.query(), Some("x=1"));

    let resp = gw
        .client
        .post(gw.url("/echo"))
        .header(COOKIE, &cookie)
        .header(CONTENT_TYPE, "application/json")
        .body(r#"{"plot":[1,2,3]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
    assert_eq!(resp.text().await.unwrap(), r#"{"plot":[1,2,3]}"#);
    assert_eq!(
        backend.last_request().await.unwrap().headers[IDENTITY_HEADER],
        "normal"
    );

    gw.stop().await;
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;
    let cookie = gw.session_cookie("admin", "Admin@123").await;

    let started = Instant::now();
    let resp = gw.get("/slow", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(gw.supervisor.state(), BackendProcessState::Degraded);

    gw.stop().await;
}

#[tokio::test]
async fn test_backend_killed_externally_yields_bad_gateway() {
    let mut backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;
    let cookie = gw.session_cookie("admin", "Admin@123").await;

    let pid = gw.supervisor.pid().await.unwrap();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
    backend.stop().await;

    let resp = gw.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body = resp.text().await.unwrap();
    assert!(body.starts_with("Proxy error"));
    assert!(!body.contains(&backend.port().to_string()));
    assert!(!body.contains("sleep"));
    assert_eq!(gw.supervisor.state(), BackendProcessState::Degraded);

    gw.stop().await;
}

#[tokio::test]
async fn test_killed_backend_is_respawned_and_recovers() {
    let mut backend = MockBackend::start().await;
    let port = backend.port();
    let gw = TestGateway::start_with_respawns(port, 1).await;
    let cookie = gw.session_cookie("admin", "Admin@123").await;

    let first_pid = gw.supervisor.pid().await.unwrap();
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(first_pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
    backend.stop().await;

    let resp = gw.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(gw.supervisor.state(), BackendProcessState::Degraded);

    // The application comes back on its port; the next request respawns
    // the dead process and is served once the probe succeeds.
    let backend = MockBackend::start_on(port).await;
    let resp = gw.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), DASHBOARD_BODY);
    assert_eq!(gw.supervisor.state(), BackendProcessState::Ready);

    let second_pid = gw.supervisor.pid().await.unwrap();
    assert_ne!(second_pid, first_pid);
    assert_eq!(backend.request_count().await, 1);

    gw.stop().await;
}

#[tokio::test]
async fn test_terminated_backend_fails_fast() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;
    let cookie = gw.session_cookie("admin", "Admin@123").await;

    gw.supervisor.terminate().await;
    assert_eq!(gw.supervisor.state(), BackendProcessState::Terminated);

    let started = Instant::now();
    let resp = gw.get("/dashboard", Some(&cookie)).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(backend.request_count().await, 0);

    gw.stop().await;
}

#[tokio::test]
async fn test_logout_clears_session_cookie() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;

    let resp = gw.get("/logout", None).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers()[LOCATION], "/login");
    let cleared = resp.headers()[SET_COOKIE].to_str().unwrap();
    assert!(cleared.starts_with("user=;"));
    assert!(cleared.contains("Max-Age=0"));

    gw.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_backend_process() {
    let backend = MockBackend::start().await;
    let gw = TestGateway::start(backend.port()).await;
    let pid = gw.supervisor.pid().await.unwrap();
    let supervisor = Arc::clone(&gw.supervisor);

    gw.stop().await;

    assert_eq!(supervisor.state(), BackendProcessState::Terminated);
    assert!(supervisor.pid().await.is_none());
    // Reaped: the pid no longer exists.
    assert!(nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err());
}
