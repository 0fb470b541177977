//! Session codec.
//!
//! Sessions are held entirely client-side. The token is an HS256-signed JWT
//! carrying the subject, issue time and expiry, so a client cannot forge or
//! extend a session by editing the cookie. There is no server-side session
//! table and therefore no server-side revocation: logging out clears the
//! cookie, and a copied token stays valid until it expires.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::SessionError;

/// Minimum signing key length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Claims carried inside the session token.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// An authenticated session.
///
/// Only [`SessionCodec`] constructs sessions, either by issuing a new one or
/// by validating a presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    subject: String,
    issued_at: i64,
    expires_at: i64,
    token: String,
}

impl Session {
    /// Username the session was issued to.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Unix timestamp of the login that created the session.
    pub fn issued_at(&self) -> i64 {
        self.issued_at
    }

    /// Unix timestamp after which the token no longer validates.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Opaque cookie value.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Issues and validates session tokens.
#[derive(Clone)]
pub struct SessionCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for SessionCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCodec")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionCodec {
    /// Create a codec signing with `secret`.
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, SessionError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SessionError::SecretTooShort {
                min: MIN_SECRET_LEN,
                actual: secret.len(),
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub", "iat"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
        })
    }

    /// Create a codec with a freshly generated key.
    ///
    /// Sessions issued by this codec do not survive a gateway restart.
    pub fn random(ttl: Duration) -> Result<Self, SessionError> {
        let mut secret = [0u8; MIN_SECRET_LEN];
        rand::rng().fill_bytes(&mut secret);
        Self::new(&secret, ttl)
    }

    /// Session lifetime, also used as the cookie `Max-Age`.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a session for `subject`.
    pub fn issue(&self, subject: &str) -> Result<Session, SessionError> {
        self.issue_at(subject, Utc::now().timestamp())
    }

    pub(crate) fn issue_at(&self, subject: &str, issued_at: i64) -> Result<Session, SessionError> {
        let ttl_secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: subject.to_string(),
            iat: issued_at,
            exp: issued_at.saturating_add(ttl_secs),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(Session {
            subject: claims.sub,
            issued_at: claims.iat,
            expires_at: claims.exp,
            token,
        })
    }

    /// Validate a presented token.
    ///
    /// Returns `None` for anything that is not an unmodified, unexpired token
    /// signed with this codec's key.
    pub fn validate(&self, token: &str) -> Option<Session> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(Session {
                subject: data.claims.sub,
                issued_at: data.claims.iat,
                expires_at: data.claims.exp,
                token: token.to_string(),
            }),
            Err(e) => {
                debug!(error = %e, "Rejected session token");
                None
            }
        }
    }
}
