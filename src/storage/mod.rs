pub mod accounts;
pub mod certificates;
pub mod db;
mod migrations;
pub mod requests;

pub use accounts::{AccountStore, StoredAccount};
pub use certificates::{CertificateMaterial, CertificateStore, CertificateStoreError};
pub use db::Db;
pub use requests::{ChallengeBookkeeping, IssuedCertificate, RequestStore};
