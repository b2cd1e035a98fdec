use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use zeroize::Zeroizing;

/// Fresh leaf key and the DER CSR that names only `domain`.
pub struct LeafKeyMaterial {
    pub csr_der: Vec<u8>,
    pub private_key_pem: Zeroizing<String>,
}

pub fn generate_csr(domain: &str) -> Result<LeafKeyMaterial, rcgen::Error> {
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, domain);
    params.distinguished_name = name;

    let key = KeyPair::generate()?;
    let csr = params.serialize_request(&key)?;
    Ok(LeafKeyMaterial {
        csr_der: csr.der().to_vec(),
        private_key_pem: Zeroizing::new(key.serialize_pem()),
    })
}
