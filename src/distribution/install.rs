use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::info;
use pem::Pem;

use crate::core::types::CertificatePaths;
use crate::storage::certificates::write_secure_file;

const CERT_FILENAME: &str = "cert.pem";
const CHAIN_FILENAME: &str = "chain.pem";
const FULLCHAIN_FILENAME: &str = "fullchain.pem";
const PRIVKEY_FILENAME: &str = "privkey.pem";

/// Places an issued certificate onto a target host or service.
///
/// Returns non-fatal warnings; an `Err` means the target was not installed.
#[async_trait]
pub trait CertificateInstaller: Send + Sync {
    async fn install(&self, target: &str, paths: &CertificatePaths) -> Result<Vec<String>>;
}

/// Installs into `<root>/<target>/` as a web-server style PEM bundle:
/// `cert.pem`, `chain.pem` (intermediates), `fullchain.pem` and `privkey.pem`.
#[derive(Debug, Clone)]
pub struct DirectoryInstaller {
    root: PathBuf,
}

impl DirectoryInstaller {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl CertificateInstaller for DirectoryInstaller {
    async fn install(&self, target: &str, paths: &CertificatePaths) -> Result<Vec<String>> {
        validate_target_name(target)?;
        let chain_pem = fs::read_to_string(&paths.chain_path)
            .with_context(|| format!("failed to read {}", paths.chain_path))?;
        let key_pem = zeroize::Zeroizing::new(
            fs::read_to_string(&paths.key_path)
                .with_context(|| format!("failed to read {}", paths.key_path))?,
        );

        let output_dir = self.root.join(target);
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("failed to create install directory at {}", output_dir.display())
        })?;

        let bundle = split_certificate_chain(&chain_pem)?;
        let mut warnings = Vec::new();

        write_secure_file(&output_dir.join(CERT_FILENAME), bundle.leaf.as_bytes(), 0o644)?;
        write_secure_file(
            &output_dir.join(FULLCHAIN_FILENAME),
            bundle.fullchain.as_bytes(),
            0o644,
        )?;
        match &bundle.intermediates {
            Some(intermediates) => write_secure_file(
                &output_dir.join(CHAIN_FILENAME),
                intermediates.as_bytes(),
                0o644,
            )?,
            None => warnings.push(format!(
                "{target}: issuer chain is missing, {CHAIN_FILENAME} not written"
            )),
        }
        write_secure_file(&output_dir.join(PRIVKEY_FILENAME), key_pem.as_bytes(), 0o600)?;

        info!("[install] installed certificate into {}", output_dir.display());
        Ok(warnings)
    }
}

struct PemBundle {
    leaf: String,
    intermediates: Option<String>,
    fullchain: String,
}

fn split_certificate_chain(chain_pem: &str) -> Result<PemBundle> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|err| anyhow!("failed to parse certificate chain PEM: {err}"))?;
    let encoded: Vec<String> = blocks
        .into_iter()
        .filter(|block: &Pem| block.tag() == "CERTIFICATE")
        .map(|block| pem::encode(&block))
        .collect();

    let (leaf, rest) = encoded
        .split_first()
        .ok_or_else(|| anyhow!("no certificate PEM blocks found"))?;
    Ok(PemBundle {
        leaf: leaf.clone(),
        intermediates: (!rest.is_empty()).then(|| rest.join("")),
        fullchain: encoded.join(""),
    })
}

fn validate_target_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("install target cannot be empty"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(anyhow!("install target must be a single path segment")),
    }
}
