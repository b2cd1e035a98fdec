//! Runtime settings read from `CERTPILOT_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use log::warn;

use crate::issuance::retry::RetryPolicy;

pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

const DEFAULT_CERT_DIR: &str = "/etc/certpilot/certificates";
const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_MAX_WORKERS: u64 = 4;
/// Challenge records never live longer than this in resolver caches.
pub const MAX_TXT_TTL_SECS: u32 = 60;

/// What the orchestrator does when the TXT record never became visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Wait the grace period, then notify the CA anyway.
    Proceed,
    /// Fail the request with `PropagationTimeout`.
    Fail,
}

impl FromStr for PropagationPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proceed" => Ok(PropagationPolicy::Proceed),
            "fail" => Ok(PropagationPolicy::Fail),
            other => Err(anyhow!("unknown propagation policy '{other}'")),
        }
    }
}

/// Timing knobs for one issuance run.
#[derive(Debug, Clone)]
pub struct IssuancePolicy {
    pub txt_ttl: u32,
    pub propagation_prewait: Duration,
    pub propagation_attempts: u32,
    pub propagation_interval: Duration,
    pub propagation_policy: PropagationPolicy,
    pub propagation_grace: Duration,
    pub validation_timeout: Duration,
    pub validation_poll: Duration,
    pub certificate_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for IssuancePolicy {
    fn default() -> Self {
        Self {
            txt_ttl: MAX_TXT_TTL_SECS,
            propagation_prewait: Duration::from_secs(90),
            propagation_attempts: 10,
            propagation_interval: Duration::from_secs(15),
            propagation_policy: PropagationPolicy::Proceed,
            propagation_grace: Duration::from_secs(30),
            validation_timeout: Duration::from_secs(120),
            validation_poll: Duration::from_secs(5),
            certificate_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub acme_directory: String,
    pub cert_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Root for `DirectoryInstaller` targets; installation is disabled when unset.
    pub install_dir: Option<PathBuf>,
    pub http_timeout: Duration,
    pub max_workers: usize,
    pub policy: IssuancePolicy,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let acme_directory = resolve_acme_directory(&lookup)?;
        let http_timeout = Duration::from_secs(positive_u64(
            &lookup,
            "CERTPILOT_HTTP_TIMEOUT_SECS",
            DEFAULT_HTTP_TIMEOUT_SECS,
        ));
        let defaults = IssuancePolicy::default();

        let mut txt_ttl =
            positive_u64(&lookup, "CERTPILOT_TXT_TTL_SECS", u64::from(MAX_TXT_TTL_SECS));
        if txt_ttl > u64::from(MAX_TXT_TTL_SECS) {
            warn!("[config] CERTPILOT_TXT_TTL_SECS={txt_ttl} exceeds {MAX_TXT_TTL_SECS}; clamping");
            txt_ttl = u64::from(MAX_TXT_TTL_SECS);
        }

        let propagation_policy = match lookup("CERTPILOT_PROPAGATION_POLICY") {
            Some(raw) => raw.parse()?,
            None => defaults.propagation_policy,
        };

        let policy = IssuancePolicy {
            txt_ttl: u32::try_from(txt_ttl).unwrap_or(MAX_TXT_TTL_SECS),
            propagation_prewait: secs_allow_zero(
                &lookup,
                "CERTPILOT_PROPAGATION_PREWAIT_SECS",
                defaults.propagation_prewait,
            ),
            propagation_attempts: positive_u32(
                &lookup,
                "CERTPILOT_PROPAGATION_ATTEMPTS",
                defaults.propagation_attempts,
            ),
            propagation_interval: secs(
                &lookup,
                "CERTPILOT_PROPAGATION_INTERVAL_SECS",
                defaults.propagation_interval,
            ),
            propagation_policy,
            propagation_grace: secs_allow_zero(
                &lookup,
                "CERTPILOT_PROPAGATION_GRACE_SECS",
                defaults.propagation_grace,
            ),
            validation_timeout: secs(
                &lookup,
                "CERTPILOT_VALIDATION_TIMEOUT_SECS",
                defaults.validation_timeout,
            ),
            validation_poll: secs(
                &lookup,
                "CERTPILOT_VALIDATION_POLL_SECS",
                defaults.validation_poll,
            ),
            certificate_timeout: secs(
                &lookup,
                "CERTPILOT_CERTIFICATE_TIMEOUT_SECS",
                defaults.certificate_timeout,
            ),
            retry: RetryPolicy {
                max_attempts: positive_u32(
                    &lookup,
                    "CERTPILOT_RETRY_ATTEMPTS",
                    defaults.retry.max_attempts,
                ),
                base_delay: Duration::from_millis(positive_u64(
                    &lookup,
                    "CERTPILOT_RETRY_BASE_MS",
                    u64::try_from(defaults.retry.base_delay.as_millis()).unwrap_or(u64::MAX),
                )),
                max_delay: defaults.retry.max_delay,
                attempt_timeout: http_timeout,
            },
        };

        Ok(Self {
            acme_directory,
            cert_dir: lookup("CERTPILOT_CERT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CERT_DIR)),
            data_dir: lookup("CERTPILOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            install_dir: lookup("CERTPILOT_INSTALL_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            http_timeout,
            max_workers: usize::try_from(positive_u64(
                &lookup,
                "CERTPILOT_MAX_WORKERS",
                DEFAULT_MAX_WORKERS,
            ))
            .unwrap_or(usize::MAX),
            policy,
        })
    }
}

// Production is never the silent default: its rate limits make repeated test runs destructive.
fn resolve_acme_directory<F>(lookup: &F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("CERTPILOT_ACME_DIRECTORY").filter(|url| !url.trim().is_empty()) {
        return Ok(url.trim().to_string());
    }
    match lookup("CERTPILOT_ACME_ENV").as_deref().map(str::trim) {
        Some("staging") => Ok(LETSENCRYPT_STAGING.to_string()),
        Some("production") => Ok(LETSENCRYPT_PRODUCTION.to_string()),
        Some(other) => Err(anyhow!(
            "CERTPILOT_ACME_ENV must be 'staging' or 'production', got '{other}'"
        )),
        None => Err(anyhow!(
            "no ACME directory configured; set CERTPILOT_ACME_DIRECTORY or CERTPILOT_ACME_ENV"
        )),
    }
}

fn positive_u64<F>(lookup: &F, key: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => {
            warn!("[config] invalid {key} value '{raw}'; using default {default}");
            default
        }
        Ok(value) => value,
    }
}

fn positive_u32<F>(lookup: &F, key: &str, default: u32) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    let value = positive_u64(lookup, key, u64::from(default));
    u32::try_from(value).unwrap_or_else(|_| {
        warn!("[config] {key}={value} is out of range; using default {default}");
        default
    })
}

fn secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(positive_u64(lookup, key, default.as_secs()))
}

fn secs_allow_zero<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(value) => Duration::from_secs(value),
        Err(_) => {
            warn!("[config] invalid {key} value '{raw}'; using default");
            default
        }
    }
}
