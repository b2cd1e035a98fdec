pub mod acme;
pub mod challenge;
pub mod csr;
pub mod dns;
pub mod dns_providers;
pub mod flow;
pub mod http;
pub mod retry;

use thiserror::Error;

use crate::core::types::ErrorCode;

/// Failure of one issuance, classified so operators can tell a request that
/// never reached the CA from a certificate that was issued but not saved.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IssuanceError {
    #[error("InvalidDomain: {0}")]
    InvalidDomain(String),
    #[error("CredentialsNotFound: {0}")]
    CredentialsNotFound(String),
    #[error("AlreadyInProgress: {0}")]
    AlreadyInProgress(String),
    #[error("ZoneNotFound: {0}")]
    ZoneNotFound(String),
    #[error("AuthorityUnavailable: {0}")]
    AuthorityUnavailable(String),
    #[error("ChallengeUnavailable: {0}")]
    ChallengeUnavailable(String),
    #[error("DnsPublishFailed: {0}")]
    DnsPublishFailed(String),
    #[error("PropagationTimeout: {0}")]
    PropagationTimeout(String),
    #[error("ValidationFailed: {0}")]
    ValidationFailed(String),
    #[error("FinalizeFailed: {0}")]
    FinalizeFailed(String),
    #[error("PersistenceFailed: {0}")]
    PersistenceFailed(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Interrupted: {0}")]
    Interrupted(String),
    #[error("Storage: {0}")]
    Storage(String),
}

impl IssuanceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IssuanceError::InvalidDomain(_) => ErrorCode::InvalidDomain,
            IssuanceError::CredentialsNotFound(_) => ErrorCode::CredentialsNotFound,
            IssuanceError::AlreadyInProgress(_) => ErrorCode::AlreadyInProgress,
            IssuanceError::ZoneNotFound(_) => ErrorCode::ZoneNotFound,
            IssuanceError::AuthorityUnavailable(_) => ErrorCode::AuthorityUnavailable,
            IssuanceError::ChallengeUnavailable(_) => ErrorCode::ChallengeUnavailable,
            IssuanceError::DnsPublishFailed(_) => ErrorCode::DnsPublishFailed,
            IssuanceError::PropagationTimeout(_) => ErrorCode::PropagationTimeout,
            IssuanceError::ValidationFailed(_) => ErrorCode::ValidationFailed,
            IssuanceError::FinalizeFailed(_) => ErrorCode::FinalizeFailed,
            IssuanceError::PersistenceFailed(_) => ErrorCode::PersistenceFailed,
            IssuanceError::Cancelled(_) => ErrorCode::Cancelled,
            IssuanceError::Interrupted(_) => ErrorCode::Interrupted,
            IssuanceError::Storage(_) => ErrorCode::Storage,
        }
    }

    /// `"<Code>: <detail>"`, the form stored in `error_message`.
    pub fn error_message(&self) -> String {
        self.to_string()
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        IssuanceError::Storage(format!("{err:#}"))
    }
}
