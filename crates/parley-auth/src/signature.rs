//! Signed-request verification: timestamp window, single-use nonce, and a
//! hex HMAC-SHA256 over the sorted `{timestamp, nonce, secret}` triple.
use crate::{AuthError, Result, now_epoch_seconds};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use parley_storage::{KvCache, keys};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Default timestamp tolerance either side of now, in seconds.
pub const DEFAULT_TIMESTAMP_TOLERANCE: i64 = 300;

/// Default nonce retention; replays inside this window are rejected.
pub const DEFAULT_NONCE_TTL: Duration = Duration::from_secs(600);

/// Compute the request signature for a timestamp/nonce pair.
///
/// The three parts are sorted lexicographically and concatenated before
/// MAC-ing, so client and server never disagree on ordering.
pub fn sign(secret: &str, timestamp: i64, nonce: &str) -> String {
    let mut parts = [timestamp.to_string(), nonce.to_string(), secret.to_string()];
    parts.sort();
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(parts.concat().as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

/// Generate a random 16-byte hex nonce.
pub fn new_nonce() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex_encode(&raw)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct SignatureVerifier {
    secret: String,
    tolerance: i64,
    nonce_ttl: Duration,
    cache: Arc<dyn KvCache>,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, cache: Arc<dyn KvCache>) -> Self {
        Self {
            secret: secret.into(),
            tolerance: DEFAULT_TIMESTAMP_TOLERANCE,
            nonce_ttl: DEFAULT_NONCE_TTL,
            cache,
        }
    }

    pub fn with_tolerance(mut self, tolerance: i64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonce_ttl = ttl;
        self
    }

    /// Check the timestamp window, burn the nonce, and compare signatures.
    /// The nonce is burned before the signature comparison so a replayed
    /// request fails even if it carries a valid signature.
    pub async fn verify(&self, timestamp: i64, nonce: &str, provided: &str) -> Result<()> {
        let now = now_epoch_seconds();
        if (now - timestamp).abs() > self.tolerance {
            return Err(AuthError::SignatureRejected("timestamp outside tolerance"));
        }

        let fresh = self
            .cache
            .put_if_absent(&keys::nonce(nonce), Bytes::from_static(b"1"), Some(self.nonce_ttl))
            .await?;
        if !fresh {
            return Err(AuthError::SignatureRejected("nonce already used"));
        }

        let expected = sign(&self.secret, timestamp, nonce);
        if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            return Err(AuthError::SignatureRejected("signature mismatch"));
        }
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
