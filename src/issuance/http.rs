use std::time::Duration;

use log::warn;
use reqwest::{Client, StatusCode};

use crate::issuance::dns_providers::DnsError;

const USER_AGENT: &str = concat!("certpilot/", env!("CARGO_PKG_VERSION"));

/// Builds the async client used for DNS-over-HTTPS lookups.
pub fn build_client(timeout: Duration) -> Client {
    let timeout = if timeout.is_zero() {
        warn!("[http] invalid timeout value; using default");
        Duration::from_secs(15)
    } else {
        timeout
    };
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|err| {
            warn!("[http] failed to build client: {err}");
            Client::new()
        })
}

/// Maps a non-success HTTP status to a DNS error, keeping rate limits and
/// server errors retryable.
pub fn status_error(provider: &str, status: StatusCode, body: Option<String>) -> DnsError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return DnsError::Provider(format!("{provider} authentication failed"));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return DnsError::Transient(format!("{provider} rate limit exceeded"));
    }
    let detail = match body.filter(|body| !body.trim().is_empty()) {
        Some(body) => format!("{provider} API error ({status}): {body}"),
        None => format!("{provider} API error: {status}"),
    };
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        DnsError::Transient(detail)
    } else if status == StatusCode::BAD_REQUEST {
        DnsError::MalformedQuery(detail)
    } else {
        DnsError::Provider(detail)
    }
}

/// Classifies a transport failure from reqwest.
pub fn transport_error(provider: &str, err: &reqwest::Error) -> DnsError {
    if err.is_decode() {
        return DnsError::Provider(format!("{provider} returned an unreadable response: {err}"));
    }
    DnsError::Transient(format!("{provider} request failed: {err}"))
}
