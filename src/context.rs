//! Certificate-item state model: per-name, per-key-type bundles with
//! derived invariants.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::crypto::{Certificate, Chain, EcdsaCurve, KeyType, PrivateKey};
use crate::error::Result;

/// One verify target: a set of hosts to probe on a port, with an
/// optional STARTTLS upgrade and a key-type filter.
#[derive(Debug, Clone)]
pub struct VerifyTarget {
    pub hosts: Vec<String>,
    pub port: u16,
    pub starttls: Option<String>,
    pub key_types: Vec<KeyType>,
}

/// Configuration describing one logical certificate.
#[derive(Debug, Clone)]
pub struct CertificateSpec {
    pub common_name: String,
    pub alt_names: Vec<String>,
    pub key_types: Vec<KeyType>,
    pub verify: Vec<VerifyTarget>,
    pub http_challenge_directory: HashMap<String, PathBuf>,
    pub passphrase: Option<String>,
    pub must_staple: bool,
    pub renewal_window: chrono::Duration,
    pub key_rotation_interval: Option<chrono::Duration>,
    pub rsa_key_bits: u32,
    pub ecdsa_curve: EcdsaCurve,
}

impl CertificateSpec {
    pub fn http_challenge_dir_for(&self, domain: &str) -> Option<PathBuf> {
        self.http_challenge_directory
            .get(domain)
            .or_else(|| self.http_challenge_directory.get("*"))
            .cloned()
    }
}

/// One key type's material for a logical certificate: the private key,
/// the issued leaf, its chain, and a cached OCSP response.
pub struct CertificateItem {
    pub key_type: KeyType,
    pub private_key: Option<PrivateKey>,
    pub certificate: Option<Certificate>,
    pub chain: Option<Chain>,
    pub ocsp_response: Option<Vec<u8>>,
}

impl CertificateItem {
    pub fn empty(key_type: KeyType) -> Self {
        CertificateItem {
            key_type,
            private_key: None,
            certificate: None,
            chain: None,
            ocsp_response: None,
        }
    }

    /// Invariant: if `certificate` is present, its public key equals
    /// `private_key`'s public key.
    pub fn check_invariant(&self) -> Result<bool> {
        match (&self.certificate, &self.private_key) {
            (Some(cert), Some(key)) => Ok(cert.public_key_der()? == key.public_key_der()?),
            _ => Ok(true),
        }
    }

    pub fn file_stem(name: &str, key_type: KeyType) -> String {
        format!("{name}.{key_type}")
    }
}

/// A named logical certificate with a [`CertificateSpec`] and one
/// [`CertificateItem`] per requested key type.
pub struct CertificateContext {
    pub name: String,
    pub spec: CertificateSpec,
    pub items: Vec<CertificateItem>,
}

impl CertificateContext {
    pub fn new(name: String, spec: CertificateSpec) -> Self {
        let items = spec
            .key_types
            .iter()
            .map(|&kt| CertificateItem::empty(kt))
            .collect();
        CertificateContext { name, spec, items }
    }

    /// Load whatever key/certificate/chain material already exists for
    /// each requested key type under `cert_dir`.
    pub fn load(name: String, spec: CertificateSpec, cert_dir: &Path) -> Result<Self> {
        let mut ctx = CertificateContext::new(name, spec);
        for item in &mut ctx.items {
            let stem = CertificateItem::file_stem(&ctx.name, item.key_type);
            let key_path = cert_dir.join(format!("{stem}.key"));
            let cert_path = cert_dir.join(format!("{stem}.pem"));
            let ocsp_path = cert_dir.join(format!("{stem}.ocsp"));

            if let Ok(pem) = std::fs::read(&key_path) {
                let passphrase = ctx.spec.passphrase.as_deref();
                match PrivateKey::load_pem(&pem, passphrase) {
                    Ok(key) => item.private_key = Some(key),
                    Err(e) => warn!(path = %key_path.display(), error = %e, "unable to load private key"),
                }
            }
            if let Ok(pem) = std::fs::read(&cert_path) {
                match Chain::from_pem_bundle(&pem) {
                    Ok(mut bundle) if !bundle.0.is_empty() => {
                        let leaf = bundle.0.remove(0);
                        item.certificate = Some(leaf);
                        item.chain = Some(bundle);
                    }
                    Ok(_) => warn!(path = %cert_path.display(), "certificate bundle is empty"),
                    Err(e) => warn!(path = %cert_path.display(), error = %e, "unable to parse certificate bundle"),
                }
            }
            if let Ok(ocsp) = std::fs::read(&ocsp_path) {
                item.ocsp_response = Some(ocsp);
            }
        }
        Ok(ctx)
    }

    pub fn item(&self, key_type: KeyType) -> Option<&CertificateItem> {
        self.items.iter().find(|i| i.key_type == key_type)
    }

    pub fn item_mut(&mut self, key_type: KeyType) -> Option<&mut CertificateItem> {
        self.items.iter_mut().find(|i| i.key_type == key_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateItem> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CertificateSpec {
        CertificateSpec {
            common_name: "example.com".into(),
            alt_names: vec!["example.com".into()],
            key_types: vec![KeyType::Rsa],
            verify: vec![],
            http_challenge_directory: HashMap::new(),
            passphrase: None,
            must_staple: false,
            renewal_window: chrono::Duration::days(30),
            key_rotation_interval: None,
            rsa_key_bits: 2048,
            ecdsa_curve: EcdsaCurve::P256,
        }
    }

    #[test]
    fn new_context_has_one_item_per_key_type() {
        let ctx = CertificateContext::new("example.com".into(), spec());
        assert_eq!(ctx.items.len(), 1);
        assert_eq!(ctx.items[0].key_type, KeyType::Rsa);
    }

    #[test]
    fn load_from_empty_directory_yields_empty_items() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CertificateContext::load("example.com".into(), spec(), dir.path()).unwrap();
        assert!(ctx.item(KeyType::Rsa).unwrap().certificate.is_none());
    }

    #[test]
    fn http_challenge_dir_for_falls_back_to_wildcard_entry() {
        let mut s = spec();
        s.http_challenge_directory.insert("*".into(), PathBuf::from("/var/www/challenges"));
        assert_eq!(
            s.http_challenge_dir_for("example.com"),
            Some(PathBuf::from("/var/www/challenges"))
        );
    }
}
