//! Per-certificate state machine: decide issue/renew/rotate/noop, drive
//! the ACME client, commit the resulting files, fire hooks, verify.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::acme::{self, Account, DirectoryUrl, OrderSpec, ResourceLayout, Transport};
use crate::config::Config;
use crate::context::{CertificateContext, CertificateItem, CertificateSpec};
use crate::crypto::{EcdsaCurve, KeyParams, KeyType};
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::txn::{commit_file_transactions, FileOperation};
use crate::verify;

/// A sentinel file under the resource directory, held for the duration
/// of one run, so a second instance pointed at the same resource
/// directory fails fast instead of racing the first.
pub struct ResourceLock {
    path: PathBuf,
}

impl ResourceLock {
    pub fn acquire(resource_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(resource_dir)?;
        let path = resource_dir.join(".certmgr.lock");
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::Filesystem(format!(
                    "another instance appears to be running against {} ({})",
                    resource_dir.display(),
                    path.display()
                )),
                _ => Error::Io(e),
            })?;
        Ok(ResourceLock { path })
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// What the orchestrator decided to do with one `CertificateItem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Issue,
    Renew,
    RotateKey,
    Noop,
}

fn key_params_for(key_type: KeyType, spec: &CertificateSpec) -> KeyParams {
    match key_type {
        KeyType::Rsa => KeyParams::RsaBits(spec.rsa_key_bits),
        KeyType::Ecdsa => KeyParams::EcdsaCurve(spec.ecdsa_curve),
    }
}

/// Decide what to do with one item: issue if absent, renew inside the
/// renewal window or on a name/must-staple/key-params mismatch, rotate
/// the key once its rotation interval has elapsed, otherwise leave it
/// alone.
pub fn decide(item: &CertificateItem, spec: &CertificateSpec) -> Decision {
    let Some(cert) = &item.certificate else {
        return Decision::Issue;
    };

    let now = Utc::now();
    if now + spec.renewal_window >= cert.not_after() {
        return Decision::Renew;
    }

    let mut expected_sans = spec.alt_names.clone();
    expected_sans.sort();
    let mut actual_sans = cert.subject_alt_names();
    actual_sans.sort();
    if expected_sans != actual_sans {
        return Decision::Renew;
    }

    if cert.has_ocsp_must_staple() != spec.must_staple {
        return Decision::Renew;
    }

    if let Some(key) = &item.private_key {
        if key.params != key_params_for(item.key_type, spec) {
            return Decision::Renew;
        }
    }

    if let Some(interval) = spec.key_rotation_interval {
        if now - cert.not_before() >= interval {
            return Decision::RotateKey;
        }
    }

    Decision::Noop
}

async fn process_item(
    name: &str,
    spec: &CertificateSpec,
    item: &mut CertificateItem,
    transport: &mut Transport,
    account: &Account,
    cert_dir: &Path,
    archive_dir: Option<&Path>,
    hooks: &mut Hooks,
    retry: u32,
    delay: u64,
) -> Result<bool> {
    let decision = decide(item, spec);
    if decision == Decision::Noop {
        info!(name, key_type = %item.key_type, "up to date");
        return Ok(false);
    }
    info!(name, key_type = %item.key_type, decision = ?decision, "acting on certificate item");

    let key_params = key_params_for(item.key_type, spec);
    let http_challenge_dir = |domain: &str| spec.http_challenge_dir_for(domain);
    let order_spec = OrderSpec {
        common_name: &spec.common_name,
        alt_names: &spec.alt_names,
        must_staple: spec.must_staple,
        key_params,
    };
    let (key, leaf, chain, order_url) = acme::obtain(
        transport,
        account,
        &order_spec,
        &http_challenge_dir,
        hooks,
        retry,
        delay,
    )
    .await?;
    info!(name, key_type = %item.key_type, order = order_url, "certificate issued");

    let stem = CertificateItem::file_stem(name, item.key_type);
    let key_path = cert_dir.join(format!("{stem}.key"));
    let cert_path = cert_dir.join(format!("{stem}.pem"));

    let mut bundle = leaf.to_pem()?;
    for intermediate in &chain.0 {
        bundle.extend_from_slice(&intermediate.to_pem()?);
    }

    let mut ops = vec![
        FileOperation::archive_and_write("key", &key_path, 0o600, key.encode(spec.passphrase.as_deref())?),
        FileOperation::archive_and_write("certificate", &cert_path, 0o644, bundle),
    ];

    let mut ocsp_response = None;
    if spec.must_staple {
        if let (Some(responder), Some(first_intermediate)) = (leaf.ocsp_responder_url(), chain.0.first()) {
            match crate::crypto::request_ocsp_response(&responder, &leaf, first_intermediate).await {
                Ok(der) => {
                    let ocsp_path = cert_dir.join(format!("{stem}.ocsp"));
                    ops.push(FileOperation::archive_and_write("ocsp", &ocsp_path, 0o644, der.clone()));
                    ocsp_response = Some(der);
                }
                Err(e) => warn!(name, key_type = %item.key_type, error = %e, "unable to fetch OCSP response"),
            }
        }
    }

    commit_file_transactions(ops, archive_dir)?;

    item.private_key = Some(key);
    item.certificate = Some(leaf);
    item.chain = Some(chain);
    item.ocsp_response = ocsp_response;

    hooks.add(
        "install_cert",
        &[
            ("name", name),
            ("key_type", &item.key_type.to_string()),
            ("key_file", &key_path.to_string_lossy()),
            ("cert_file", &cert_path.to_string_lossy()),
        ],
    );
    hooks.call();

    Ok(true)
}

/// Process one configured certificate end to end: load existing state,
/// decide per key type, obtain/commit as needed, then verify.
pub async fn process_context(
    name: String,
    spec: CertificateSpec,
    config: &Config,
    transport: &mut Transport,
    account: &Account,
) -> Result<usize> {
    let mut ctx = CertificateContext::load(name.clone(), spec, &config.cert_dir)?;
    let mut hooks = Hooks::new(config.commands.clone());
    let mut any_committed = false;

    for item in &mut ctx.items {
        match process_item(
            &ctx.name,
            &ctx.spec,
            item,
            transport,
            account,
            &config.cert_dir,
            config.archive_dir.as_deref(),
            &mut hooks,
            config.retry,
            config.delay,
        )
        .await
        {
            Ok(committed) => any_committed |= committed,
            Err(e) => {
                error!(name = %ctx.name, key_type = %item.key_type, error = %e, "error processing certificate item");
                return Err(e);
            }
        }
    }

    if any_committed || !ctx.spec.verify.is_empty() {
        let name_for_verify = ctx.name.clone();
        let max_attempts = config.max_ocsp_verify_attempts;
        let retry_delay = config.ocsp_verify_retry_delay;
        let error_count = tokio::task::spawn_blocking(move || {
            verify::verify_certificate_installation(&ctx, max_attempts, retry_delay)
        })
        .await
        .map_err(|e| Error::Validation(format!("verification task panicked: {e}")))?;
        if error_count > 0 {
            warn!(name = %name_for_verify, error_count, "validation errors during verification");
        }
        return Ok(error_count);
    }

    Ok(0)
}

/// Run every configured certificate sequentially. Returns the total
/// validation error count; fatal per-context errors are logged and
/// counted separately so that one misconfigured context does not abort
/// others.
pub async fn run(config: &Config) -> Result<(usize, usize)> {
    let _lock = ResourceLock::acquire(&config.resource_dir)?;

    let directory_url = if config.directory_url == DirectoryUrl::LetsEncrypt.as_str() {
        DirectoryUrl::LetsEncrypt
    } else if config.directory_url == DirectoryUrl::LetsEncryptStaging.as_str() {
        DirectoryUrl::LetsEncryptStaging
    } else {
        DirectoryUrl::Other(config.directory_url.clone())
    };
    let layout = ResourceLayout { resource_dir: config.resource_dir.clone() };
    let (mut transport, account) = acme::connect(
        &directory_url,
        &layout,
        &config.contact_email,
        config.account_passphrase.as_deref(),
        config.allow_tty_prompt,
        config.archive_dir.as_deref(),
    )
    .await?;

    let mut fatal_errors = 0usize;
    let mut validation_errors = 0usize;
    for (name, spec) in config.certificate_specs() {
        match process_context(name.clone(), spec, config, &mut transport, &account).await {
            Ok(count) => validation_errors += count,
            Err(e) => {
                error!(name = %name, error = %e, "fatal error processing certificate context");
                fatal_errors += 1;
            }
        }
    }

    Ok((fatal_errors, validation_errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use std::time::{SystemTime, UNIX_EPOCH};

    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::x509::extension::SubjectAlternativeName;
    use openssl::x509::{X509Name, X509};

    use crate::crypto::{Certificate, PrivateKey};

    /// A minimal self-signed certificate for exercising `decide()` without
    /// a real ACME issuance round trip. `not_before_days`/`not_after_days`
    /// are offsets in days from now, negative for the past.
    fn self_signed(key: &PrivateKey, common_name: &str, alt_names: &[&str], not_before_days: i64, not_after_days: i64) -> Certificate {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let mut builder = X509::builder().unwrap();
        let mut name = X509Name::builder().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(key.pkey()).unwrap();
        builder.set_not_before(&Asn1Time::from_unix(now + not_before_days * 86400).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::from_unix(now + not_after_days * 86400).unwrap()).unwrap();

        if !alt_names.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for n in alt_names {
                san.dns(n);
            }
            let ctx = builder.x509v3_context(None, None);
            let ext = san.build(&ctx).unwrap();
            builder.append_extension(ext).unwrap();
        }
        builder.sign(key.pkey(), MessageDigest::sha256()).unwrap();
        let x509 = builder.build();
        Certificate::from_der(&x509.to_der().unwrap()).unwrap()
    }

    fn spec(alt_names: &[&str], renewal_days: i64, key_rotation_days: Option<i64>, must_staple: bool) -> CertificateSpec {
        CertificateSpec {
            common_name: "example.com".into(),
            alt_names: alt_names.iter().map(|s| s.to_string()).collect(),
            key_types: vec![KeyType::Rsa],
            verify: vec![],
            http_challenge_directory: HashMap::new(),
            passphrase: None,
            must_staple,
            renewal_window: chrono::Duration::days(renewal_days),
            key_rotation_interval: key_rotation_days.map(chrono::Duration::days),
            rsa_key_bits: 2048,
            ecdsa_curve: EcdsaCurve::P256,
        }
    }

    fn item_with(cert: Certificate) -> CertificateItem {
        let mut item = CertificateItem::empty(KeyType::Rsa);
        item.certificate = Some(cert);
        item
    }

    #[test]
    fn decide_issues_when_no_certificate_present() {
        let item = CertificateItem::empty(KeyType::Rsa);
        let s = spec(&["example.com"], 30, None, false);
        assert_eq!(decide(&item, &s), Decision::Issue);
    }

    #[test]
    fn decide_renews_inside_renewal_window() {
        let key = PrivateKey::generate_account_key().unwrap();
        // Expires in 10 days; a 30-day renewal window should trigger renewal.
        let cert = self_signed(&key, "example.com", &["example.com"], -1, 10);
        let item = item_with(cert);
        let s = spec(&["example.com"], 30, None, false);
        assert_eq!(decide(&item, &s), Decision::Renew);
    }

    #[test]
    fn decide_renews_on_san_mismatch() {
        let key = PrivateKey::generate_account_key().unwrap();
        let cert = self_signed(&key, "example.com", &["example.com"], -1, 90);
        let item = item_with(cert);
        // Certificate only covers example.com; spec now wants www too.
        let s = spec(&["example.com", "www.example.com"], 30, None, false);
        assert_eq!(decide(&item, &s), Decision::Renew);
    }

    #[test]
    fn decide_is_noop_when_current_and_unchanged() {
        let key = PrivateKey::generate_account_key().unwrap();
        let cert = self_signed(&key, "example.com", &["example.com"], -1, 90);
        let item = item_with(cert);
        let s = spec(&["example.com"], 30, None, false);
        assert_eq!(decide(&item, &s), Decision::Noop);
    }

    #[test]
    fn decide_rotates_key_after_rotation_interval_elapses() {
        let key = PrivateKey::generate_account_key().unwrap();
        // Issued 45 days ago, still valid for a long time, but rotation is every 30 days.
        let cert = self_signed(&key, "example.com", &["example.com"], -45, 90);
        let item = item_with(cert);
        let s = spec(&["example.com"], 10, Some(30), false);
        assert_eq!(decide(&item, &s), Decision::RotateKey);
    }

    #[test]
    fn key_params_for_matches_key_type() {
        let s = spec(&["example.com"], 30, None, false);
        assert_eq!(key_params_for(KeyType::Rsa, &s), KeyParams::RsaBits(2048));
        assert_eq!(
            key_params_for(KeyType::Ecdsa, &s),
            KeyParams::EcdsaCurve(EcdsaCurve::P256)
        );
    }

    #[test]
    fn decide_renews_when_key_params_changed() {
        let key = PrivateKey::generate(KeyType::Rsa, KeyParams::RsaBits(2048)).unwrap();
        let cert = self_signed(&key, "example.com", &["example.com"], -1, 90);
        let mut item = item_with(cert);
        item.private_key = Some(key);
        let mut s = spec(&["example.com"], 30, None, false);
        s.rsa_key_bits = 4096;
        assert_eq!(decide(&item, &s), Decision::Renew);
    }
}
