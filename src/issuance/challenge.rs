//! DNS-01 challenge values (RFC 8555 §8.1, §8.4).
//!
//! Every digest published to DNS goes through [`compute_dns01_value`]; callers
//! never hash key authorizations themselves.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("challenge token is empty")]
    EmptyToken,
    #[error("account key thumbprint is empty")]
    EmptyThumbprint,
    #[error("key authorization does not start with token '{0}'")]
    KeyAuthorizationMismatch(String),
}

pub fn key_authorization(token: &str, thumbprint: &str) -> Result<String, ChallengeError> {
    if token.trim().is_empty() {
        return Err(ChallengeError::EmptyToken);
    }
    if thumbprint.trim().is_empty() {
        return Err(ChallengeError::EmptyThumbprint);
    }
    Ok(format!("{token}.{thumbprint}"))
}

/// TXT value the CA expects at `_acme-challenge.<domain>`.
pub fn compute_dns01_value(token: &str, thumbprint: &str) -> Result<String, ChallengeError> {
    let key_auth = key_authorization(token, thumbprint)?;
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes())))
}

/// Splits the account thumbprint back out of a `token.thumbprint` key authorization.
pub fn thumbprint_from_key_authorization<'a>(
    token: &str,
    key_authorization: &'a str,
) -> Result<&'a str, ChallengeError> {
    key_authorization
        .strip_prefix(token)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|thumbprint| !thumbprint.is_empty())
        .ok_or_else(|| ChallengeError::KeyAuthorizationMismatch(token.to_string()))
}
