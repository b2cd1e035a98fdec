//! CertPilot: ACME DNS-01 certificate issuance against Route 53 hosted zones.

pub mod config;
pub mod core;
pub mod distribution;
pub mod domain;
pub mod issuance;
pub mod secrets;
pub mod storage;

pub use config::Settings;
pub use core::IssuanceService;
pub use core::types::{CertificateRequest, RequestStatus};
pub use issuance::IssuanceError;
