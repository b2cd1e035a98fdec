use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MAX_TXT_TTL_SECS;
use crate::issuance::retry::Retryable;
use crate::secrets::types::DnsCredentials;

mod memory;
mod route53;

pub use memory::{MemoryDnsManager, StaticDnsFactory, TxtRecord};
pub use route53::{Route53Factory, Route53Manager};

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no hosted zone matches {0}")]
    ZoneNotFound(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Provider(String),
    #[error("malformed DNS query: {0}")]
    MalformedQuery(String),
}

impl Retryable for DnsError {
    fn is_transient(&self) -> bool {
        matches!(self, DnsError::Transient(_))
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        DnsError::Transient(format!("{operation} timed out after {}s", after.as_secs()))
    }
}

/// Hosted zone that owns a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneHandle {
    pub id: String,
    /// Zone apex, without the trailing dot.
    pub name: String,
}

/// Provider reference for a submitted record change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeHandle {
    pub id: String,
}

/// Writes challenge TXT records into the tenant's DNS provider.
///
/// Every call must be safe to repeat: the orchestrator retries transient
/// failures and cleans up after records that may or may not exist.
#[async_trait]
pub trait DnsRecordManager: Send + Sync {
    /// Finds the hosted zone with the longest name that contains `domain`.
    async fn resolve_hosted_zone(&self, domain: &str) -> Result<ZoneHandle, DnsError>;

    /// Creates or replaces the TXT record `name` so it holds exactly `value`.
    async fn upsert_txt(
        &self,
        zone: &ZoneHandle,
        name: &str,
        value: &str,
        ttl: u32,
    ) -> Result<ChangeHandle, DnsError>;

    /// Removes `value` from the TXT record `name`. Missing records are not an error.
    async fn delete_txt(&self, zone: &ZoneHandle, name: &str, value: &str) -> Result<(), DnsError>;
}

/// Builds one record manager per credential set, so tenants never share a client.
#[async_trait]
pub trait DnsManagerFactory: Send + Sync {
    async fn manager_for(
        &self,
        credentials: &DnsCredentials,
    ) -> Result<Arc<dyn DnsRecordManager>, DnsError>;
}

pub fn clamp_ttl(ttl: u32) -> u32 {
    ttl.clamp(1, MAX_TXT_TTL_SECS)
}

/// Quotes a TXT value the way zone files and the Route 53 API expect it.
pub(crate) fn format_txt_value(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed.to_string()
    } else {
        format!("\"{}\"", trimmed.trim_matches('"'))
    }
}

pub(crate) fn normalize_txt_value(value: &str) -> String {
    value.trim().trim_matches('"').trim().to_string()
}

pub(crate) fn normalize_record_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}
