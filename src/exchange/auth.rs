//! Request signing for the exchange REST API.
//!
//! Every private request carries four headers: the access key, a
//! base64 HMAC-SHA256 signature, the unix-second timestamp it was
//! computed at, and the account passphrase. The signed message is the
//! exact concatenation `timestamp + METHOD + request_path + body`.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret, SecretString};
use sha2::Sha256;
use std::fmt;

use crate::types::BalancerError;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_KEY: &str = "CB-ACCESS-KEY";
pub const HEADER_SIGN: &str = "CB-ACCESS-SIGN";
pub const HEADER_TIMESTAMP: &str = "CB-ACCESS-TIMESTAMP";
pub const HEADER_PASSPHRASE: &str = "CB-ACCESS-PASSPHRASE";

/// API credentials. The secret is decoded once, at construction.
pub struct Credentials {
    access_key: String,
    secret: Secret<Vec<u8>>,
    passphrase: SecretString,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret", &"[REDACTED]")
            .field("passphrase", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a base64-encoded secret.
    ///
    /// A secret that is not valid base64 is a configuration error.
    pub fn new(
        access_key: impl Into<String>,
        secret_b64: &str,
        passphrase: impl Into<String>,
    ) -> Result<Self, BalancerError> {
        let secret = STANDARD
            .decode(secret_b64.trim())
            .map_err(|e| BalancerError::Config(format!("API secret is not valid base64: {e}")))?;
        if secret.is_empty() {
            return Err(BalancerError::Config("API secret is empty".into()));
        }

        Ok(Self {
            access_key: access_key.into(),
            secret: Secret::new(secret),
            passphrase: SecretString::new(passphrase.into()),
        })
    }

    /// Resolve credentials from the named environment variables.
    pub fn from_env(key_env: &str, secret_env: &str, passphrase_env: &str) -> Result<Self> {
        let key = std::env::var(key_env)
            .with_context(|| format!("Environment variable not set: {key_env}"))?;
        let secret = std::env::var(secret_env)
            .with_context(|| format!("Environment variable not set: {secret_env}"))?;
        let passphrase = std::env::var(passphrase_env)
            .with_context(|| format!("Environment variable not set: {passphrase_env}"))?;

        Ok(Self::new(key, &secret, passphrase)?)
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Compute the base64 signature over `timestamp + method + path + body`.
    pub fn sign(
        &self,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<String, BalancerError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret())
            .map_err(|e| BalancerError::Config(format!("HMAC init failed: {e}")))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(request_path.as_bytes());
        mac.update(body.as_bytes());

        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Authentication headers for a request signed at `timestamp`.
    pub fn headers(
        &self,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<Vec<(&'static str, String)>, BalancerError> {
        let signature = self.sign(timestamp, method, request_path, body)?;
        Ok(vec![
            (HEADER_KEY, self.access_key.clone()),
            (HEADER_SIGN, signature),
            (HEADER_TIMESTAMP, timestamp.to_string()),
            (HEADER_PASSPHRASE, self.passphrase.expose_secret().clone()),
        ])
    }
}

/// Current unix time in whole seconds, as the exchange expects it.
pub fn unix_timestamp() -> String {
    chrono::Utc::now().timestamp().to_string()
}
