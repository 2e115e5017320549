//! Bearer tokens, password hashing, and the signed-request scheme.
//!
//! Tokens are HS256 JWTs over a symmetric deployment secret. Passwords are
//! Argon2id PHC strings with per-user random salts. Request signatures are
//! HMAC-SHA256 with timestamp tolerance and single-use nonces burned into
//! the key-value cache.
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod password;
pub mod session;
pub mod signature;

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("token rejected")]
    TokenRejected(#[from] jsonwebtoken::errors::Error),
    #[error("password hash error: {0}")]
    PasswordHash(String),
    #[error("signature rejected: {0}")]
    SignatureRejected(&'static str),
    #[error(transparent)]
    Storage(#[from] parley_storage::StorageError),
}

/// Default token lifetime: 24 hours.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(86_400);

/// Claims embedded in every bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user_id: u64,
    pub user_uuid: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub issuer: String,
    pub ttl: Duration,
    /// Clock-skew allowance for verification, in seconds.
    pub leeway: u64,
}

impl TokenConfig {
    pub fn new(secret: impl Into<String>, issuer: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: issuer.into(),
            ttl: DEFAULT_TOKEN_TTL,
            leeway: 5,
        }
    }
}

/// Mints and verifies bearer tokens with one symmetric secret.
pub struct TokenKeeper {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    ttl: Duration,
    leeway: u64,
}

impl TokenKeeper {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            ttl: config.ttl,
            leeway: config.leeway,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn mint(&self, user_id: u64, user_uuid: &str, username: &str) -> Result<String> {
        let now = now_epoch_seconds();
        let claims = Claims {
            user_id,
            user_uuid: user_uuid.to_string(),
            username: username.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
            iss: self.issuer.clone(),
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(token)
    }

    /// Signature, expiry, and issuer checks; returns the claims on success.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.leeway = self.leeway;
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }
}

pub(crate) fn now_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keeper() -> TokenKeeper {
        TokenKeeper::new(&TokenConfig::new("unit-test-secret", "parley"))
    }

    #[test]
    fn mint_and_verify_round_trip() {
        let keeper = keeper();
        let token = keeper.mint(7, "u-7", "alice").expect("mint");
        let claims = keeper.verify(&token).expect("verify");
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.user_uuid, "u-7");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.iss, "parley");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let token = keeper().mint(7, "u-7", "alice").expect("mint");
        let other = TokenKeeper::new(&TokenConfig::new("different-secret", "parley"));
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn verify_rejects_wrong_issuer() {
        let mut config = TokenConfig::new("unit-test-secret", "someone-else");
        let token = TokenKeeper::new(&config).mint(7, "u-7", "alice").expect("mint");
        config.issuer = "parley".into();
        assert!(TokenKeeper::new(&config).verify(&token).is_err());
    }

    #[test]
    fn verify_rejects_expired_token() {
        let config = TokenConfig {
            secret: "unit-test-secret".into(),
            issuer: "parley".into(),
            ttl: Duration::ZERO,
            leeway: 0,
        };
        let keeper = TokenKeeper::new(&config);
        let token = keeper.mint(7, "u-7", "alice").expect("mint");
        assert!(keeper.verify(&token).is_err());
    }
}
