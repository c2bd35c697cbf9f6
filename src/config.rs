//! Configuration loading: a typed tree over `serde_yaml` describing the
//! account, the certificates to manage, and the lifecycle hooks to run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::crypto::{EcdsaCurve, KeyType};
use crate::context::{CertificateSpec, VerifyTarget};
use crate::error::{Error, Result};
use crate::hooks::HookCommand;

fn default_renewal_days() -> i64 {
    30
}

fn default_retry() -> u32 {
    10
}

fn default_delay() -> u64 {
    5
}

fn default_port() -> u16 {
    443
}

fn default_max_ocsp_verify_attempts() -> u32 {
    10
}

fn default_ocsp_verify_retry_delay() -> u64 {
    5
}

fn default_rsa_key_bits() -> u32 {
    2048
}

fn default_ecdsa_curve() -> EcdsaCurve {
    EcdsaCurve::P256
}

#[derive(Debug, Deserialize)]
struct RawVerifyTarget {
    hosts: Vec<String>,
    #[serde(default = "default_port")]
    port: u16,
    starttls: Option<String>,
    #[serde(default)]
    key_types: Vec<KeyType>,
}

#[derive(Debug, Deserialize)]
struct RawCertificate {
    common_name: Option<String>,
    alt_names: Vec<String>,
    #[serde(default = "default_key_types")]
    key_types: Vec<KeyType>,
    #[serde(default)]
    verify: Vec<RawVerifyTarget>,
    #[serde(default)]
    http_challenge_directory: HashMap<String, PathBuf>,
    passphrase: Option<String>,
    #[serde(default)]
    must_staple: bool,
    #[serde(default = "default_renewal_days")]
    renewal_days: i64,
    key_rotation_days: Option<i64>,
    #[serde(default = "default_rsa_key_bits")]
    rsa_key_bits: u32,
    #[serde(default = "default_ecdsa_curve")]
    ecdsa_curve: EcdsaCurve,
}

fn default_key_types() -> Vec<KeyType> {
    vec![KeyType::Rsa]
}

/// Top-level configuration file, generalizing the original's
/// `account`/`certificates`/`commands` top-level YAML keys.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub directory_url: String,
    pub contact_email: String,
    #[serde(default)]
    pub account_passphrase: Option<String>,
    #[serde(default)]
    pub allow_tty_prompt: bool,
    pub resource_dir: PathBuf,
    pub cert_dir: PathBuf,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default = "default_retry")]
    pub retry: u32,
    #[serde(default = "default_delay")]
    pub delay: u64,
    #[serde(default = "default_max_ocsp_verify_attempts")]
    pub max_ocsp_verify_attempts: u32,
    #[serde(default = "default_ocsp_verify_retry_delay")]
    pub ocsp_verify_retry_delay: u64,
    #[serde(default)]
    pub commands: HashMap<String, HookCommand>,
    certificates: HashMap<String, RawCertificate>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let config: Config = serde_yaml::from_slice(&raw)
            .map_err(|e| Error::Config(format!("unable to parse config {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Expand the configured certificates into `(name, spec)` pairs.
    pub fn certificate_specs(&self) -> impl Iterator<Item = (String, CertificateSpec)> + '_ {
        self.certificates.iter().map(move |(name, raw)| {
            let verify = raw
                .verify
                .iter()
                .map(|v| VerifyTarget {
                    hosts: v.hosts.clone(),
                    port: v.port,
                    starttls: v.starttls.clone(),
                    key_types: v.key_types.clone(),
                })
                .collect();
            let spec = CertificateSpec {
                common_name: raw.common_name.clone().unwrap_or_else(|| name.clone()),
                alt_names: raw.alt_names.clone(),
                key_types: raw.key_types.clone(),
                verify,
                http_challenge_directory: raw.http_challenge_directory.clone(),
                passphrase: raw.passphrase.clone().or_else(|| self.account_passphrase.clone()),
                must_staple: raw.must_staple,
                renewal_window: chrono::Duration::days(raw.renewal_days),
                key_rotation_interval: raw.key_rotation_days.map(chrono::Duration::days),
                rsa_key_bits: raw.rsa_key_bits,
                ecdsa_curve: raw.ecdsa_curve,
            };
            (name.clone(), spec)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let yaml = r#"
directory_url: https://acme-v02.api.letsencrypt.org/directory
contact_email: admin@example.com
resource_dir: /tmp/resources
cert_dir: /tmp/certs
certificates:
  example.com:
    alt_names: [example.com, www.example.com]
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, yaml).unwrap();
        let config = Config::load(&path).unwrap();
        let specs: Vec<_> = config.certificate_specs().collect();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].0, "example.com");
        assert_eq!(specs[0].1.key_types, vec![KeyType::Rsa]);
    }
}
