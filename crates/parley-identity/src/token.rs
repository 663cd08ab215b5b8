//! HMAC-SHA256 signed bearer credentials.
//!
//! Token format: `base64url(user_id|expires_unix_secs|hex(hmac_signature))`.
//! The token binds a user id to a time window, so it can be neither
//! retargeted at another user nor replayed after expiry.

use crate::IdentityError;
use base64::Engine;
use hmac::{Hmac, Mac};
use parley_types::UserId;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// 32-byte HMAC key for credential signing.
#[derive(Clone)]
pub struct TokenSecret([u8; 32]);

impl TokenSecret {
    /// Derives a key from operator-supplied secret material.
    ///
    /// SHA-256 with a domain-separation prefix, so the same material used
    /// elsewhere yields an unrelated key here.
    pub fn derive(material: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"parley-token-v1:");
        hasher.update(material.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self(key)
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.0).expect("HMAC key length is valid")
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSecret(..)")
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Issues a credential for `user_id` valid for `ttl_secs` seconds.
pub fn issue_token(user_id: UserId, secret: &TokenSecret, ttl_secs: u64) -> String {
    issue_token_expiring(user_id, secret, now_unix() + ttl_secs)
}

fn issue_token_expiring(user_id: UserId, secret: &TokenSecret, expires: u64) -> String {
    let payload = format!("{}|{}", user_id, expires);
    let mut mac = secret.mac();
    mac.update(payload.as_bytes());
    let signature = mac.finalize().into_bytes();

    let token = format!("{}|{}", payload, hex::encode(signature));
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(token.as_bytes())
}

/// Verifies a credential and returns the user id it was issued for.
///
/// # Errors
///
/// [`IdentityError::Malformed`], [`IdentityError::BadSignature`] or
/// [`IdentityError::Expired`].
pub fn verify_token(token: &str, secret: &TokenSecret) -> Result<UserId, IdentityError> {
    verify_token_at(token, secret, now_unix())
}

fn verify_token_at(token: &str, secret: &TokenSecret, now: u64) -> Result<UserId, IdentityError> {
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token.as_bytes())
        .map_err(|_| IdentityError::Malformed)?;
    let token_str = String::from_utf8(decoded).map_err(|_| IdentityError::Malformed)?;

    let mut parts = token_str.splitn(3, '|');
    let (Some(user_str), Some(expires_str), Some(sig_hex)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(IdentityError::Malformed);
    };

    let provided_sig = hex::decode(sig_hex).map_err(|_| IdentityError::Malformed)?;
    let mut mac = secret.mac();
    mac.update(format!("{}|{}", user_str, expires_str).as_bytes());
    mac.verify_slice(&provided_sig)
        .map_err(|_| IdentityError::BadSignature)?;

    let expires: u64 = expires_str.parse().map_err(|_| IdentityError::Malformed)?;
    if now > expires {
        return Err(IdentityError::Expired);
    }

    user_str.parse().map_err(|_| IdentityError::Malformed)
}
