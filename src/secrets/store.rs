use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use super::types::DnsCredentials;

/// Errors produced by secret providers.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("no DNS credentials configured for tenant {0}")]
    CredentialsNotFound(String),
    #[error("secret provider unavailable: {0}")]
    Unavailable(String),
}

/// Single source of DNS provider credentials, looked up per tenant at the
/// start of each issuance.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_credentials(&self, tenant_id: &str) -> Result<DnsCredentials, SecretError>;
}

/// Credentials held in process memory, keyed by tenant.
#[derive(Default)]
pub struct MemorySecretProvider {
    credentials: RwLock<HashMap<String, DnsCredentials>>,
}

impl MemorySecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: impl Into<String>, credentials: DnsCredentials) {
        let mut guard = self
            .credentials
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(tenant_id.into(), credentials);
    }

    pub fn with_tenant(self, tenant_id: impl Into<String>, credentials: DnsCredentials) -> Self {
        self.insert(tenant_id, credentials);
        self
    }
}

#[async_trait]
impl SecretProvider for MemorySecretProvider {
    async fn get_credentials(&self, tenant_id: &str) -> Result<DnsCredentials, SecretError> {
        let guard = self
            .credentials
            .read()
            .map_err(|err| SecretError::Unavailable(format!("credential map poisoned: {err}")))?;
        guard
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| SecretError::CredentialsNotFound(tenant_id.to_string()))
    }
}
