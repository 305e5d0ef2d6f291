#![forbid(unsafe_code)]

//! Shared security helpers: the not-root guard used by the binaries, secret
//! generation/validation, and the JWT manager that guards admin-only routes.

use anyhow::{Result, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use nix::unistd::Uid;
use rand_core::{OsRng, RngCore};
use serde_json::{Map, Value};
use thiserror::Error;

pub const MIN_SECRET_LENGTH: usize = 32;
pub const DEFAULT_TOKEN_EXPIRY_MINUTES: i64 = 30;

const WEAK_SECRET_KEYS: &[&str] = &[
    "your-secret-key-here",
    "test-secret-key",
    "development-secret-key",
    "changeme",
];

const WEAK_JWT_SECRETS: &[&str] = &[
    "your-jwt-secret-key-here",
    "test-jwt-secret-key",
    "development-jwt-secret",
    "changeme",
];

/// Fails fast when a binary is started as root. Running as a regular
/// unprivileged user keeps downloads out of system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// 32 random bytes encoded as URL-safe base64 (43 characters).
pub fn generate_secret_key() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn generate_jwt_secret() -> String {
    generate_secret_key()
}

pub fn validate_secret_key(secret_key: &str) -> bool {
    secret_key.len() >= MIN_SECRET_LENGTH && !WEAK_SECRET_KEYS.contains(&secret_key)
}

pub fn validate_jwt_secret(jwt_secret: &str) -> bool {
    jwt_secret.len() >= MIN_SECRET_LENGTH && !WEAK_JWT_SECRETS.contains(&jwt_secret)
}

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Could not validate credentials")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),
    #[error("could not sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),
}

/// Issues and verifies HS256 access tokens.
#[derive(Clone)]
pub struct SecurityManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expire_minutes: i64,
}

impl SecurityManager {
    pub fn new(jwt_secret_key: &str) -> Self {
        Self::with_expiry(jwt_secret_key, DEFAULT_TOKEN_EXPIRY_MINUTES)
    }

    pub fn with_expiry(jwt_secret_key: &str, expire_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(jwt_secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(jwt_secret_key.as_bytes()),
            expire_minutes,
        }
    }

    /// Signs `claims` with an `exp` claim `expires_in` from now (or the
    /// manager default).
    pub fn create_access_token(
        &self,
        claims: Map<String, Value>,
        expires_in: Option<Duration>,
    ) -> Result<String, SecurityError> {
        let expires_in = expires_in.unwrap_or_else(|| Duration::minutes(self.expire_minutes));
        let mut claims = claims;
        let exp = (Utc::now() + expires_in).timestamp();
        claims.insert("exp".to_string(), Value::from(exp));
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(SecurityError::Signing)
    }

    pub fn verify_token(&self, token: &str) -> Result<Map<String, Value>, SecurityError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Map<String, Value>>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(SecurityError::InvalidToken)
    }
}
