use async_trait::async_trait;
use log::debug;

use super::store::{SecretError, SecretProvider};
use super::types::{DEFAULT_AWS_REGION, DnsCredentials};

const ACCESS_KEY_VAR: &str = "CERTPILOT_AWS_ACCESS_KEY_ID";
const SECRET_KEY_VAR: &str = "CERTPILOT_AWS_SECRET_ACCESS_KEY";
const REGION_VAR: &str = "CERTPILOT_AWS_REGION";

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads Route 53 credentials from the environment.
///
/// A tenant-scoped variable (`CERTPILOT_AWS_ACCESS_KEY_ID__<TENANT>`, tenant
/// upper-cased with non-alphanumerics as `_`) takes precedence over the
/// unscoped one.
pub struct EnvSecretProvider {
    lookup: Lookup,
}

impl EnvSecretProvider {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn scoped(&self, key: &str, tenant_id: &str) -> Option<String> {
        let suffix: String = tenant_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        (self.lookup)(&format!("{key}__{suffix}"))
            .or_else(|| (self.lookup)(key))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn get_credentials(&self, tenant_id: &str) -> Result<DnsCredentials, SecretError> {
        let access_key = self.scoped(ACCESS_KEY_VAR, tenant_id);
        let secret_key = self.scoped(SECRET_KEY_VAR, tenant_id);
        let (Some(access_key), Some(secret_key)) = (access_key, secret_key) else {
            return Err(SecretError::CredentialsNotFound(tenant_id.to_string()));
        };
        let region = self
            .scoped(REGION_VAR, tenant_id)
            .unwrap_or_else(|| DEFAULT_AWS_REGION.to_string());
        debug!("[secrets] loaded DNS credentials for tenant {tenant_id} ({region})");
        Ok(DnsCredentials::new(access_key, secret_key).with_region(region))
    }
}
