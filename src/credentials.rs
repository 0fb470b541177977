//! Static credential store.
//!
//! Maps username to secret and role. The mapping is fixed at startup and is
//! never mutated while serving. Verification fails closed and does not
//! distinguish between an unknown user and a wrong secret.

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use subtle::ConstantTimeEq;

use crate::config::ConfigError;

/// Role assigned when a credential does not name one.
pub const DEFAULT_ROLE: &str = "user";

/// A single configured account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(rename = "password")]
    pub secret: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

impl Credential {
    pub fn new(
        username: impl Into<String>,
        secret: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            role: role.into(),
        }
    }

    /// Parse a `username:secret[:role]` command-line entry.
    ///
    /// The secret may itself contain `:` only when a role is given, since the
    /// role is taken from the last segment.
    pub fn parse_entry(entry: &str) -> Result<Self, ConfigError> {
        let (username, rest) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidUserEntry {
                entry: redact_entry(entry),
            })?;
        let (secret, role) = match rest.rsplit_once(':') {
            Some((secret, role)) if !role.is_empty() => (secret, role),
            _ => (rest, DEFAULT_ROLE),
        };
        if username.is_empty() || secret.is_empty() {
            return Err(ConfigError::InvalidUserEntry {
                entry: redact_entry(entry),
            });
        }
        Ok(Self::new(username, secret, role))
    }
}

/// Keep only the username part of an entry for error messages.
fn redact_entry(entry: &str) -> String {
    match entry.split_once(':') {
        Some((user, _)) => format!("{user}:***"),
        None => "***".to_string(),
    }
}

/// On-disk credential file layout.
#[derive(Debug, Deserialize)]
struct CredentialFile {
    users: Vec<Credential>,
}

/// Fixed, process-wide username to credential mapping.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, Credential>,
}

impl CredentialStore {
    /// Build a store, rejecting duplicate usernames.
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Result<Self, ConfigError> {
        let mut users = HashMap::new();
        for credential in credentials {
            if users.contains_key(&credential.username) {
                return Err(ConfigError::DuplicateUser {
                    username: credential.username,
                });
            }
            users.insert(credential.username.clone(), credential);
        }
        Ok(Self { users })
    }

    /// Load credentials from a YAML file.
    ///
    /// `${VAR}` and `${VAR:-default}` references are substituted from the
    /// environment before parsing, so secrets need not be written to disk.
    pub fn load(path: &Path) -> Result<Vec<Credential>, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::CredentialFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if contents.trim().is_empty() {
            return Err(ConfigError::CredentialFile {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            });
        }
        let contents = substitute_env_vars(&contents)?;
        let file: CredentialFile =
            serde_yml::from_str(&contents).map_err(|e| ConfigError::CredentialFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(file.users)
    }

    /// Check a username/secret pair.
    ///
    /// Unknown usernames are compared against a dummy secret so both failure
    /// modes take the same path.
    pub fn verify(&self, username: &str, secret: &str) -> bool {
        match self.users.get(username) {
            Some(credential) => credential.secret.as_bytes().ct_eq(secret.as_bytes()).into(),
            None => {
                let _ = b"\0invalid-credential-placeholder"
                    .as_slice()
                    .ct_eq(secret.as_bytes())
                    .unwrap_u8();
                false
            }
        }
    }

    /// Role of a known user. Informational only; access is authenticated or not.
    pub fn role(&self, username: &str) -> Option<&str> {
        self.users.get(username).map(|c| c.role.as_str())
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

// Matches ${VAR} and ${VAR:-default}
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid regex")
});

/// Substitute environment variables in credential file contents.
///
/// - `${VAR}` - required, fails if unset
/// - `${VAR:-default}` - falls back to `default`
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let result = ENV_VAR_PATTERN.replace_all(content, |caps: &regex::Captures<'_>| {
        let var = &caps[1];
        match (std::env::var(var), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| var.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(var) => Err(ConfigError::MissingEnvVar { var }),
        None => Ok(result.into_owned()),
    }
}
