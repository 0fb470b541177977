//! Centralized configuration for the AuthGate gateway.
//!
//! Every option can be given on the command line or through an
//! `AUTHGATE_*` environment variable. [`GatewayArgs::into_config`] validates
//! the raw arguments and produces the immutable [`GatewayConfig`] shared by
//! all components.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::{Credential, CredentialStore};
use crate::session::MIN_SECRET_LEN;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No credentials configured; the gateway would reject every login.
    #[error("no credentials configured (use --credentials or --user)")]
    NoCredentials,

    /// A `--user` entry is not `username:secret[:role]`.
    #[error("invalid user entry '{entry}', expected username:secret[:role]")]
    InvalidUserEntry { entry: String },

    /// Same username configured twice.
    #[error("duplicate username: '{username}'")]
    DuplicateUser { username: String },

    /// Credential file missing, unreadable or malformed.
    #[error("credential file {path}: {reason}")]
    CredentialFile { path: PathBuf, reason: String },

    /// `${VAR}` referenced in a credential file but not set.
    #[error("environment variable '{var}' not set")]
    MissingEnvVar { var: String },

    /// Backend command is empty.
    #[error("backend command is empty")]
    EmptyBackendCommand,

    /// Session secret shorter than the minimum.
    #[error("session secret must be at least {min} bytes")]
    WeakSessionSecret { min: usize },

    /// Login template missing or lacking the error placeholder.
    #[error("login template {path}: {reason}")]
    LoginTemplate { path: PathBuf, reason: String },

    /// Identity header name is not a valid HTTP header name.
    #[error("invalid identity header name '{0}'")]
    InvalidHeaderName(String),

    /// A numeric or duration option is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Command-line arguments for the `authgate` binary.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct GatewayArgs {
    /// Address the gateway listens on
    #[arg(long, env = "AUTHGATE_LISTEN", default_value = "0.0.0.0:5006")]
    pub listen: SocketAddr,

    /// Command line of the backend process. `{host}` and `{port}` are
    /// replaced with the backend bind address.
    #[arg(long, env = "AUTHGATE_BACKEND_COMMAND")]
    pub backend_command: String,

    /// Host the backend binds to
    #[arg(long, env = "AUTHGATE_BACKEND_HOST", default_value = "127.0.0.1")]
    pub backend_host: String,

    /// Port the backend binds to
    #[arg(long, env = "AUTHGATE_BACKEND_PORT", default_value = "5007")]
    pub backend_port: u16,

    /// YAML credential file
    #[arg(long, env = "AUTHGATE_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Inline account as username:secret[:role] (repeatable)
    #[arg(long = "user", env = "AUTHGATE_USERS", value_delimiter = ',')]
    pub users: Vec<String>,

    /// HMAC key for session tokens. Random per process when unset.
    #[arg(long, env = "AUTHGATE_SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,

    /// Session lifetime
    #[arg(long, env = "AUTHGATE_SESSION_TTL", default_value = "12h", value_parser = humantime::parse_duration)]
    pub session_ttl: Duration,

    /// Session cookie name
    #[arg(long, env = "AUTHGATE_COOKIE_NAME", default_value = "user")]
    pub cookie_name: String,

    /// Mark the session cookie Secure and SameSite=Lax
    #[arg(long, env = "AUTHGATE_SECURE_COOKIES")]
    pub secure_cookies: bool,

    /// Login page template containing a {{errormessage}} placeholder
    #[arg(long, env = "AUTHGATE_LOGIN_TEMPLATE")]
    pub login_template: Option<PathBuf>,

    /// Header carrying the authenticated username to the backend
    #[arg(long, env = "AUTHGATE_IDENTITY_HEADER")]
    pub identity_header: Option<String>,

    /// Timeout for a forwarded request to produce response headers
    #[arg(long, env = "AUTHGATE_REQUEST_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// Idle timeout between chunks of a streamed backend response
    #[arg(long, env = "AUTHGATE_CHUNK_TIMEOUT", default_value = "60s", value_parser = humantime::parse_duration)]
    pub chunk_timeout: Duration,

    /// Overall timeout for streaming a backend response
    #[arg(long, env = "AUTHGATE_STREAM_TIMEOUT", default_value = "1h", value_parser = humantime::parse_duration)]
    pub stream_timeout: Duration,

    /// How long to wait for the backend to accept connections at startup
    #[arg(long, env = "AUTHGATE_STARTUP_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub startup_timeout: Duration,

    /// Bounded re-probe before forwarding to a backend that is not ready
    #[arg(long, env = "AUTHGATE_REPROBE_TIMEOUT", default_value = "2s", value_parser = humantime::parse_duration)]
    pub reprobe_timeout: Duration,

    /// Interval between readiness probe attempts
    #[arg(long, env = "AUTHGATE_PROBE_INTERVAL", default_value = "250ms", value_parser = humantime::parse_duration)]
    pub probe_interval: Duration,

    /// Grace period between SIGTERM and SIGKILL when stopping the backend
    #[arg(long, env = "AUTHGATE_STOP_GRACE", default_value = "5s", value_parser = humantime::parse_duration)]
    pub stop_grace: Duration,

    /// Maximum number of backend respawns over the gateway lifetime
    #[arg(long, env = "AUTHGATE_MAX_RESPAWNS", default_value = "3")]
    pub max_respawns: u32,

    /// Consecutive forward failures before the backend is marked degraded
    #[arg(long, env = "AUTHGATE_FAILURE_THRESHOLD", default_value = "1")]
    pub failure_threshold: u32,

    /// Consecutive failed re-probes of a live backend before it is restarted
    #[arg(long, env = "AUTHGATE_UNRESPONSIVE_BUDGET", default_value = "3")]
    pub unresponsive_budget: u32,

    /// Maximum size of a proxied request body in bytes
    #[arg(long, env = "AUTHGATE_MAX_REQUEST_BODY", default_value = "10485760")]
    pub max_request_body: usize,

    /// Maximum concurrent client connections
    #[arg(long, env = "AUTHGATE_MAX_CONNECTIONS", default_value = "1024")]
    pub max_connections: usize,

    /// Time allowed for in-flight connections to drain on shutdown
    #[arg(long, env = "AUTHGATE_SHUTDOWN_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,

    /// Log output format
    #[arg(long, env = "AUTHGATE_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

/// Backend process settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Program followed by its arguments, placeholders unexpanded
    pub command: Vec<String>,
    pub host: String,
    pub port: u16,
    pub startup_timeout: Duration,
    pub reprobe_timeout: Duration,
    pub probe_interval: Duration,
    pub stop_grace: Duration,
    pub max_respawns: u32,
    pub failure_threshold: u32,
    pub unresponsive_budget: u32,
}

impl BackendConfig {
    /// `host:port` authority used for probing, forwarding and the Host header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: 5007,
            startup_timeout: Duration::from_secs(30),
            reprobe_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_millis(250),
            stop_grace: Duration::from_secs(5),
            max_respawns: 3,
            failure_threshold: 1,
            unresponsive_budget: 3,
        }
    }
}

/// Session and cookie settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Signing key; `None` means generate one per process
    pub secret: Option<Vec<u8>>,
    pub ttl: Duration,
    pub cookie_name: String,
    pub secure_cookies: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl: Duration::from_secs(12 * 60 * 60),
            cookie_name: "user".to_string(),
            secure_cookies: false,
        }
    }
}

/// Forwarding settings.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub request_timeout: Duration,
    pub chunk_timeout: Duration,
    pub stream_timeout: Duration,
    pub max_request_body: usize,
    pub identity_header: Option<http::HeaderName>,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(60),
            stream_timeout: Duration::from_secs(3600),
            max_request_body: 10 * 1024 * 1024,
            identity_header: None,
        }
    }
}

/// Accept-loop settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub shutdown_timeout: Duration,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5006)),
            max_connections: 1024,
            shutdown_timeout: Duration::from_secs(30),
            tcp_nodelay: true,
            tcp_keepalive: Duration::from_secs(60),
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub forward: ForwardConfig,
    pub credentials: Vec<Credential>,
    /// Login page template contents, already checked for the placeholder
    pub login_template: Option<String>,
    pub log_format: LogFormat,
}

impl GatewayArgs {
    /// Validate arguments and load referenced files.
    pub fn into_config(self) -> Result<GatewayConfig, ConfigError> {
        let command: Vec<String> = self
            .backend_command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if command.is_empty() {
            return Err(ConfigError::EmptyBackendCommand);
        }

        let mut credentials = match &self.credentials {
            Some(path) => CredentialStore::load(path)?,
            None => Vec::new(),
        };
        for entry in &self.users {
            credentials.push(Credential::parse_entry(entry)?);
        }
        if credentials.is_empty() {
            return Err(ConfigError::NoCredentials);
        }

        let secret = match self.session_secret {
            Some(s) if s.len() < MIN_SECRET_LEN => {
                return Err(ConfigError::WeakSessionSecret {
                    min: MIN_SECRET_LEN,
                });
            }
            Some(s) => Some(s.into_bytes()),
            None => None,
        };

        let login_template = match &self.login_template {
            Some(path) => Some(crate::login_page::load_template(path)?),
            None => None,
        };

        let identity_header = match self.identity_header {
            Some(name) => Some(
                http::HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| ConfigError::InvalidHeaderName(name))?,
            ),
            None => None,
        };

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_connections",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "probe_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.session_ttl.as_secs() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session_ttl",
                reason: "must be at least one second".to_string(),
            });
        }

        Ok(GatewayConfig {
            server: ServerConfig {
                listen: self.listen,
                max_connections: self.max_connections,
                shutdown_timeout: self.shutdown_timeout,
                ..ServerConfig::default()
            },
            backend: BackendConfig {
                command,
                host: self.backend_host,
                port: self.backend_port,
                startup_timeout: self.startup_timeout,
                reprobe_timeout: self.reprobe_timeout,
                probe_interval: self.probe_interval,
                stop_grace: self.stop_grace,
                max_respawns: self.max_respawns,
                failure_threshold: self.failure_threshold.max(1),
                unresponsive_budget: self.unresponsive_budget.max(1),
            },
            session: SessionConfig {
                secret,
                ttl: self.session_ttl,
                cookie_name: self.cookie_name,
                secure_cookies: self.secure_cookies,
            },
            forward: ForwardConfig {
                request_timeout: self.request_timeout,
                chunk_timeout: self.chunk_timeout,
                stream_timeout: self.stream_timeout,
                max_request_body: self.max_request_body,
                identity_header,
            },
            credentials,
            login_template,
            log_format: self.log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> GatewayArgs {
        let mut argv = vec!["authgate", "--backend-command", "app serve --port {port}"];
        argv.extend_from_slice(extra);
        GatewayArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--user", "admin:Admin@123:admin"])
            .into_config()
            .unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:5006".parse().unwrap());
        assert_eq!(config.backend.authority(), "127.0.0.1:5007");
        assert_eq!(config.backend.command, vec!["app", "serve", "--port", "{port}"]);
        assert_eq!(config.session.cookie_name, "user");
        assert_eq!(config.session.ttl, Duration::from_secs(12 * 3600));
        assert_eq!(config.forward.request_timeout, Duration::from_secs(10));
        assert_eq!(config.backend.probe_interval, Duration::from_millis(250));
        assert!(config.session.secret.is_none());
        assert_eq!(config.credentials.len(), 1);
    }

    #[test]
    fn test_durations_use_humantime() {
        let config = parse(&[
            "--user",
            "a:b",
            "--request-timeout",
            "1m 30s",
            "--stop-grace",
            "500ms",
        ])
        .into_config()
        .unwrap();
        assert_eq!(config.forward.request_timeout, Duration::from_secs(90));
        assert_eq!(config.backend.stop_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_no_credentials_rejected() {
        let err = parse(&[]).into_config().unwrap_err();
        assert!(matches!(err, ConfigError::NoCredentials));
    }

    #[test]
    fn test_weak_secret_rejected() {
        let err = parse(&["--user", "a:b", "--session-secret", "short"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::WeakSessionSecret { .. }));
    }

    #[test]
    fn test_users_are_comma_delimited() {
        let config = parse(&["--user", "a:b,c:d:ops"]).into_config().unwrap();
        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.credentials[1].role, "ops");
    }

    #[test]
    fn test_identity_header_validated() {
        let err = parse(&["--user", "a:b", "--identity-header", "bad header"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHeaderName(_)));

        let config = parse(&["--user", "a:b", "--identity-header", "X-Forwarded-User"])
            .into_config()
            .unwrap();
        assert_eq!(
            config.forward.identity_header.unwrap().as_str(),
            "x-forwarded-user"
        );
    }

    #[test]
    fn test_ipv6_authority() {
        let backend = BackendConfig {
            host: "::1".to_string(),
            port: 8080,
            ..BackendConfig::default()
        };
        assert_eq!(backend.authority(), "[::1]:8080");
    }
}
