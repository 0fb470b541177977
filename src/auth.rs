//! Login, logout and session enforcement.
//!
//! Authentication failures never surface as raw error statuses. A failed
//! login redirects back to the form with a generic message, and a request
//! without a valid session is redirected to the form so the browser always
//! has a way forward.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use http_body_util::Full;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::credentials::CredentialStore;
use crate::error::{AuthError, SessionError};
use crate::login_page::LoginPage;
use crate::session::{Session, SessionCodec};

pub const LOGIN_PATH: &str = "/login";
pub const LOGOUT_PATH: &str = "/logout";
pub const HOME_PATH: &str = "/";

/// Message shown for every failed login, whatever the cause.
pub const LOGIN_ERROR_MESSAGE: &str = "Login incorrect";

/// Upper bound on a login form body.
pub const MAX_LOGIN_FORM_BYTES: usize = 16 * 1024;

/// Find a cookie value across all `Cookie` headers.
pub fn extract_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().trim_matches('"'))
}

/// Parse `username` and `password` from an urlencoded form. Missing fields
/// are empty, which never verifies.
pub fn parse_login_form(body: &[u8]) -> (String, String) {
    let mut username = String::new();
    let mut password = String::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        match key.as_ref() {
            "username" if username.is_empty() => username = value.into_owned(),
            "password" if password.is_empty() => password = value.into_owned(),
            _ => {}
        }
    }
    (username, password)
}

/// Value of the `error` query parameter, if any.
pub fn error_param(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, _)| k == "error")
        .map(|(_, v)| v.into_owned())
}

/// Build a `302 Found` redirect, optionally setting a cookie.
pub fn redirect(location: &str, set_cookie: Option<&str>) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .header(header::CACHE_CONTROL, "no-store");
    if let Some(cookie) = set_cookie {
        builder = builder.header(header::SET_COOKIE, cookie);
    }
    builder.body(Full::new(Bytes::new())).unwrap_or_else(|_| {
        let mut resp = Response::new(Full::new(Bytes::new()));
        *resp.status_mut() = StatusCode::FOUND;
        resp.headers_mut()
            .insert(header::LOCATION, HeaderValue::from_static(LOGIN_PATH));
        resp
    })
}

/// Authentication front end: credential checks, session issue and
/// enforcement, login page.
#[derive(Debug, Clone)]
pub struct AuthGateway {
    credentials: CredentialStore,
    codec: SessionCodec,
    page: LoginPage,
    cookie_name: String,
    secure_cookies: bool,
}

impl AuthGateway {
    pub fn new(
        credentials: CredentialStore,
        codec: SessionCodec,
        page: LoginPage,
        cookie_name: impl Into<String>,
        secure_cookies: bool,
    ) -> Self {
        Self {
            credentials,
            codec,
            page,
            cookie_name: cookie_name.into(),
            secure_cookies,
        }
    }

    /// Build from validated configuration.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, AuthSetupError> {
        let credentials = CredentialStore::new(config.credentials.iter().cloned())?;
        let codec = match &config.session.secret {
            Some(secret) => SessionCodec::new(secret, config.session.ttl)?,
            None => {
                warn!("No session secret configured, generated a random one; sessions end on restart");
                SessionCodec::random(config.session.ttl)?
            }
        };
        Ok(Self::new(
            credentials,
            codec,
            LoginPage::new(config.login_template.clone()),
            config.session.cookie_name.clone(),
            config.session.secure_cookies,
        ))
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Check credentials and issue a session.
    ///
    /// Returns the `Set-Cookie` value carrying the new session token.
    pub fn handle_login(&self, username: &str, secret: &str) -> Result<String, AuthError> {
        if !self.credentials.verify(username, secret) {
            warn!(username = %username, "Login failed");
            return Err(AuthError::InvalidCredentials);
        }
        let session = self.codec.issue(username).map_err(|e| {
            warn!(error = %e, "Failed to issue session");
            AuthError::InvalidCredentials
        })?;
        info!(
            username = %username,
            role = self.credentials.role(username).unwrap_or_default(),
            "Login succeeded"
        );
        Ok(self.session_cookie(&session))
    }

    /// Complete a login form submission as a redirect.
    pub fn login_response(&self, username: &str, secret: &str) -> Response<Full<Bytes>> {
        match self.handle_login(username, secret) {
            Ok(cookie) => redirect(HOME_PATH, Some(&cookie)),
            Err(e) => redirect(&login_error_location(&e), None),
        }
    }

    /// Clear the session cookie and return to the login page.
    pub fn handle_logout(&self) -> Response<Full<Bytes>> {
        redirect(LOGIN_PATH, Some(&self.clear_cookie()))
    }

    /// Validate the session cookie on a request.
    pub fn require_session(&self, headers: &HeaderMap) -> Result<Session, AuthError> {
        let token = extract_cookie(headers, &self.cookie_name).ok_or(AuthError::Unauthenticated)?;
        self.codec.validate(token).ok_or(AuthError::Unauthenticated)
    }

    /// Render the login form.
    pub fn login_page(&self, query: Option<&str>) -> Response<Full<Bytes>> {
        let html = self.page.render(error_param(query).as_deref());
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-store")
            .body(Full::new(Bytes::from(html)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
    }

    fn session_cookie(&self, session: &Session) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; Max-Age={}",
            self.cookie_name,
            session.token(),
            self.codec.ttl().as_secs()
        );
        if self.secure_cookies {
            cookie.push_str("; Secure; SameSite=Lax");
        }
        cookie
    }

    fn clear_cookie(&self) -> String {
        let mut cookie = format!(
            "{}=; Path=/; HttpOnly; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
            self.cookie_name
        );
        if self.secure_cookies {
            cookie.push_str("; Secure; SameSite=Lax");
        }
        cookie
    }
}

/// Where a failed login is sent.
fn login_error_location(err: &AuthError) -> String {
    let message = match err {
        AuthError::InvalidCredentials | AuthError::Unauthenticated => LOGIN_ERROR_MESSAGE,
    };
    format!("{LOGIN_PATH}?error={}", urlencoding::encode(message))
}

/// Errors building an [`AuthGateway`] from configuration.
#[derive(Debug, thiserror::Error)]
pub enum AuthSetupError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
