use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a [`CertificateRequest`].
///
/// The in-flight states (`Pending` through `Finalizing`) only move forward;
/// any of them may drop to `Error`. `Issued`, `Installed`, `Error` and
/// `Expired` are terminal for the issuance workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    DnsChallengePublished,
    AwaitingPropagation,
    AwaitingCaValidation,
    Finalizing,
    Issued,
    Installed,
    Error,
    Expired,
}

impl RequestStatus {
    pub const ACTIVE: [RequestStatus; 5] = [
        RequestStatus::Pending,
        RequestStatus::DnsChallengePublished,
        RequestStatus::AwaitingPropagation,
        RequestStatus::AwaitingCaValidation,
        RequestStatus::Finalizing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::DnsChallengePublished => "dns_challenge_published",
            RequestStatus::AwaitingPropagation => "awaiting_propagation",
            RequestStatus::AwaitingCaValidation => "awaiting_ca_validation",
            RequestStatus::Finalizing => "finalizing",
            RequestStatus::Issued => "issued",
            RequestStatus::Installed => "installed",
            RequestStatus::Error => "error",
            RequestStatus::Expired => "expired",
        }
    }

    /// True while the issuance workflow still owns the request.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    fn rank(&self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::DnsChallengePublished => 1,
            RequestStatus::AwaitingPropagation => 2,
            RequestStatus::AwaitingCaValidation => 3,
            RequestStatus::Finalizing => 4,
            RequestStatus::Issued => 5,
            RequestStatus::Installed => 6,
            RequestStatus::Error | RequestStatus::Expired => u8::MAX,
        }
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        match next {
            RequestStatus::Error => self.is_active(),
            RequestStatus::Expired => {
                matches!(self, RequestStatus::Issued | RequestStatus::Installed)
            }
            RequestStatus::Issued => *self == RequestStatus::Finalizing,
            RequestStatus::Installed => *self == RequestStatus::Issued,
            // A reused authorization lets the workflow skip the DNS states.
            _ => self.is_active() && next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let status = match value {
            "pending" => RequestStatus::Pending,
            "dns_challenge_published" => RequestStatus::DnsChallengePublished,
            "awaiting_propagation" => RequestStatus::AwaitingPropagation,
            "awaiting_ca_validation" => RequestStatus::AwaitingCaValidation,
            "finalizing" => RequestStatus::Finalizing,
            "issued" => RequestStatus::Issued,
            "installed" => RequestStatus::Installed,
            "error" => RequestStatus::Error,
            "expired" => RequestStatus::Expired,
            other => return Err(anyhow!("unknown request status '{other}'")),
        };
        Ok(status)
    }
}

/// Renewal bookkeeping for an issued certificate, independent of its
/// issuance status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalStatus {
    #[default]
    NotScheduled,
    /// Inside the renewal window, waiting for a replacement issuance.
    Scheduled,
    /// A replacement request is running.
    InProgress,
    /// The last replacement request ended in `error`.
    Failed,
}

impl RenewalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalStatus::NotScheduled => "not_scheduled",
            RenewalStatus::Scheduled => "scheduled",
            RenewalStatus::InProgress => "in_progress",
            RenewalStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RenewalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenewalStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_scheduled" => Ok(RenewalStatus::NotScheduled),
            "scheduled" => Ok(RenewalStatus::Scheduled),
            "in_progress" => Ok(RenewalStatus::InProgress),
            "failed" => Ok(RenewalStatus::Failed),
            other => Err(anyhow!("unknown renewal status '{other}'")),
        }
    }
}

/// Stable failure codes. Stored next to the request and used as the
/// prefix of `error_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidDomain,
    CredentialsNotFound,
    AlreadyInProgress,
    ZoneNotFound,
    AuthorityUnavailable,
    ChallengeUnavailable,
    DnsPublishFailed,
    PropagationTimeout,
    ValidationFailed,
    FinalizeFailed,
    PersistenceFailed,
    Cancelled,
    Interrupted,
    Storage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidDomain => "InvalidDomain",
            ErrorCode::CredentialsNotFound => "CredentialsNotFound",
            ErrorCode::AlreadyInProgress => "AlreadyInProgress",
            ErrorCode::ZoneNotFound => "ZoneNotFound",
            ErrorCode::AuthorityUnavailable => "AuthorityUnavailable",
            ErrorCode::ChallengeUnavailable => "ChallengeUnavailable",
            ErrorCode::DnsPublishFailed => "DnsPublishFailed",
            ErrorCode::PropagationTimeout => "PropagationTimeout",
            ErrorCode::ValidationFailed => "ValidationFailed",
            ErrorCode::FinalizeFailed => "FinalizeFailed",
            ErrorCode::PersistenceFailed => "PersistenceFailed",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::Interrupted => "Interrupted",
            ErrorCode::Storage => "Storage",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let code = match value {
            "InvalidDomain" => ErrorCode::InvalidDomain,
            "CredentialsNotFound" => ErrorCode::CredentialsNotFound,
            "AlreadyInProgress" => ErrorCode::AlreadyInProgress,
            "ZoneNotFound" => ErrorCode::ZoneNotFound,
            "AuthorityUnavailable" => ErrorCode::AuthorityUnavailable,
            "ChallengeUnavailable" => ErrorCode::ChallengeUnavailable,
            "DnsPublishFailed" => ErrorCode::DnsPublishFailed,
            "PropagationTimeout" => ErrorCode::PropagationTimeout,
            "ValidationFailed" => ErrorCode::ValidationFailed,
            "FinalizeFailed" => ErrorCode::FinalizeFailed,
            "PersistenceFailed" => ErrorCode::PersistenceFailed,
            "Cancelled" => ErrorCode::Cancelled,
            "Interrupted" => ErrorCode::Interrupted,
            "Storage" => ErrorCode::Storage,
            other => return Err(anyhow!("unknown error code '{other}'")),
        };
        Ok(code)
    }
}

/// Locations of the PEM files written by the certificate store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePaths {
    pub cert_path: String,
    pub key_path: String,
    pub chain_path: String,
}

/// One issuance attempt for a single domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRequest {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// Opaque owner of the DNS credentials
    pub tenant_id: String,
    /// Normalized ASCII domain, immutable once created
    pub domain: String,
    /// Contact email used for the ACME account
    pub contact_email: String,
    pub status: RequestStatus,
    /// CA order URL, present once the order exists
    pub order_handle: Option<String>,
    pub challenge_token: Option<String>,
    pub expected_digest: Option<String>,
    /// Hosted zone and record name of the published challenge, kept for cleanup
    pub zone_id: Option<String>,
    pub zone_name: Option<String>,
    pub challenge_record: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub chain_path: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// `"<Code>: <detail>"`, set only when status is `error`
    pub error_message: Option<String>,
    pub issue_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub install_date: Option<DateTime<Utc>>,
    pub install_warnings: Vec<String>,
    /// SHA-256 of the leaf certificate DER, hex encoded
    pub fingerprint: Option<String>,
    pub renewal_status: RenewalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CertificateRequest {
    pub fn paths(&self) -> Option<CertificatePaths> {
        Some(CertificatePaths {
            cert_path: self.cert_path.clone()?,
            key_path: self.key_path.clone()?,
            chain_path: self.chain_path.clone()?,
        })
    }
}

/// Result of asking the service to cancel a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Polling was interrupted; the request ends in `error` with `Cancelled`.
    Cancelled,
    /// The request is finalizing with the CA and will run to completion.
    Deferred,
    /// Nothing in this process is working on the request.
    NotRunning,
}

/// Result of asking the service to delete a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// The row is gone; a running issuance was cancelled first.
    Deleted,
    /// The request is finalizing with the CA; it is kept until it settles.
    Deferred,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub request: CertificateRequest,
    pub installed: bool,
    pub warnings: Vec<String>,
}
