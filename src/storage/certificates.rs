//! On-disk certificate material, one directory per domain.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Component, Path, PathBuf},
};

use log::info;
use pem::Pem;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::core::types::CertificatePaths;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

pub const CERT_FILENAME: &str = "cert.pem";
pub const KEY_FILENAME: &str = "privkey.pem";
pub const CHAIN_FILENAME: &str = "chain.pem";

const PUBLIC_MODE: u32 = 0o644;
const PRIVATE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum CertificateStoreError {
    #[error("no certificate stored for {0}")]
    NotFound(String),
    #[error("invalid certificate directory name '{0}'")]
    InvalidDomain(String),
    #[error("invalid certificate chain: {0}")]
    InvalidChain(String),
    #[error("certificate store I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Leaf certificate, its private key and the full chain as returned by the CA.
pub struct CertificateMaterial {
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
    pub chain_pem: String,
}

#[derive(Debug, Clone)]
pub struct CertificateStore {
    root: PathBuf,
}

impl CertificateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Writes `cert.pem`, `privkey.pem` and `chain.pem` under `<root>/<domain>/`,
    /// replacing any previous material for the domain.
    pub fn save(
        &self,
        domain: &str,
        material: &CertificateMaterial,
    ) -> Result<CertificatePaths, CertificateStoreError> {
        let dir = self.domain_dir(domain)?;
        fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;

        let cert_path = dir.join(CERT_FILENAME);
        let key_path = dir.join(KEY_FILENAME);
        let chain_path = dir.join(CHAIN_FILENAME);

        write_secure_file(&key_path, material.key_pem.as_bytes(), PRIVATE_MODE)?;
        write_secure_file(&cert_path, material.cert_pem.as_bytes(), PUBLIC_MODE)?;
        write_secure_file(&chain_path, material.chain_pem.as_bytes(), PUBLIC_MODE)?;

        info!("[store] wrote certificate material for {domain} to {}", dir.display());
        Ok(CertificatePaths {
            cert_path: cert_path.display().to_string(),
            key_path: key_path.display().to_string(),
            chain_path: chain_path.display().to_string(),
        })
    }

    pub fn load(&self, domain: &str) -> Result<CertificateMaterial, CertificateStoreError> {
        let dir = self.domain_dir(domain)?;
        let read = |name: &str| {
            let path = dir.join(name);
            fs::read_to_string(&path).map_err(|source| match source.kind() {
                io::ErrorKind::NotFound => CertificateStoreError::NotFound(domain.to_string()),
                _ => io_error(&path, source),
            })
        };
        Ok(CertificateMaterial {
            cert_pem: read(CERT_FILENAME)?,
            key_pem: Zeroizing::new(read(KEY_FILENAME)?),
            chain_pem: read(CHAIN_FILENAME)?,
        })
    }

    fn domain_dir(&self, domain: &str) -> Result<PathBuf, CertificateStoreError> {
        let mut components = Path::new(domain).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !domain.trim().is_empty() => {
                Ok(self.root.join(domain))
            }
            _ => Err(CertificateStoreError::InvalidDomain(domain.to_string())),
        }
    }
}

/// Returns the first certificate of `chain_pem` re-encoded as PEM, and the
/// hex SHA-256 fingerprint of its DER.
pub fn split_leaf(chain_pem: &str) -> Result<(String, String), CertificateStoreError> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|err| CertificateStoreError::InvalidChain(err.to_string()))?;
    let leaf: Pem = blocks
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| {
            CertificateStoreError::InvalidChain("no certificate PEM blocks found".to_string())
        })?;
    let fingerprint = hex::encode(Sha256::digest(leaf.contents()));
    Ok((pem::encode(&leaf), fingerprint))
}

pub(crate) fn write_secure_file(
    path: &Path,
    content: &[u8],
    mode: u32,
) -> Result<(), CertificateStoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(mode);
    }
    let mut file = options.open(path).map_err(|source| io_error(path, source))?;
    file.write_all(content)
        .and_then(|_| file.flush())
        .map_err(|source| io_error(path, source))?;
    // `mode` only applies on creation.
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|source| io_error(path, source))?;
    }
    #[cfg(not(unix))]
    {
        let _ = mode;
    }
    Ok(())
}

fn io_error(path: &Path, source: io::Error) -> CertificateStoreError {
    CertificateStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
