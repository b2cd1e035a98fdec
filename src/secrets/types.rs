use std::fmt;

use zeroize::Zeroizing;

pub const DEFAULT_AWS_REGION: &str = "us-east-1";

/// DNS provider API credentials for one tenant.
#[derive(Clone)]
pub struct DnsCredentials {
    pub access_key_id: String,
    pub secret_access_key: Zeroizing<String>,
    pub region: String,
}

impl DnsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
            region: DEFAULT_AWS_REGION.to_string(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

impl fmt::Debug for DnsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}
