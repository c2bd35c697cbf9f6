//! Registration bootstrap: own the account key and registration,
//! reconciling whatever is already on disk against the configured
//! directory and passphrase.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::crypto::{KeyParams, KeyType, PrivateKey};
use crate::error::{Error, Result};
use crate::password::PasswordProvider;
use crate::txn::{commit_file_transactions, FileOperation};

use super::dir::{origin_of, Directory};
use super::req::Transport;

/// Where account resources live on disk.
pub struct ResourceLayout {
    pub resource_dir: PathBuf,
}

impl ResourceLayout {
    pub fn client_key_path(&self) -> PathBuf {
        self.resource_dir.join("client.key")
    }

    pub fn legacy_client_key_path(&self) -> PathBuf {
        self.resource_dir.join("client_key.json")
    }

    pub fn registration_path(&self) -> PathBuf {
        self.resource_dir.join("registration.json")
    }
}

/// Persisted registration descriptor, `<resource_dir>/registration.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub uri: String,
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(default)]
    pub terms_of_service_agreed: bool,
}

/// The account key plus its live registration and key ID, ready to sign
/// subsequent requests.
pub struct Account {
    pub key: PrivateKey,
    pub registration: Registration,
}

impl Account {
    pub fn kid(&self) -> &str {
        &self.registration.uri
    }
}

/// Legacy JWK RSA structure as written by older acme clients (RFC 7517,
/// restricted to the fields the migration path needs).
#[derive(Debug, Deserialize)]
struct LegacyJwk {
    n: String,
    e: String,
    d: String,
    p: String,
    q: String,
}

fn b64url_to_bignum(s: &str) -> Result<openssl::bn::BigNum> {
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, s)
        .map_err(|e| Error::Config(format!("invalid base64 in legacy client key: {e}")))?;
    Ok(openssl::bn::BigNum::from_slice(&bytes)?)
}

fn legacy_key_to_private_key(jwk: &LegacyJwk) -> Result<PrivateKey> {
    let n = b64url_to_bignum(&jwk.n)?;
    let e = b64url_to_bignum(&jwk.e)?;
    let d = b64url_to_bignum(&jwk.d)?;
    let p = b64url_to_bignum(&jwk.p)?;
    let q = b64url_to_bignum(&jwk.q)?;
    let dmp1 = &d % &(&p - &openssl::bn::BigNum::from_u32(1)?.to_owned()?);
    let dmq1 = &d % &(&q - &openssl::bn::BigNum::from_u32(1)?.to_owned()?);
    let iqmp = {
        let mut ctx = openssl::bn::BigNumContext::new()?;
        let mut r = openssl::bn::BigNum::new()?;
        r.mod_inverse(&q, &p, &mut ctx)?;
        r
    };
    let rsa = openssl::rsa::Rsa::from_private_components(n, e, d, p, q, dmp1, dmq1, iqmp)?;
    let pkey = openssl::pkey::PKey::from_rsa(rsa)?;
    PrivateKey::load_pem(&pkey.private_key_to_pem_pkcs8()?, None)
}

fn load_registration(layout: &ResourceLayout, directory: &Directory) -> Option<Registration> {
    let bytes = fs::read(layout.registration_path()).ok()?;
    let registration: Registration = serde_json::from_slice(&bytes).ok()?;
    debug!(path = %layout.registration_path().display(), "loaded registration");
    match (origin_of(&registration.uri), directory.origin()) {
        (Some(a), Some(b)) if a == b => Some(registration),
        _ => {
            info!("ACME service URL has changed, re-registering with new client key");
            None
        }
    }
}

/// Decide on the account key to use, possibly loading, migrating, or
/// generating one, queuing any resulting file operations.
fn resolve_key(
    layout: &ResourceLayout,
    provider: &mut PasswordProvider,
    have_registration: bool,
    ops: &mut Vec<FileOperation>,
) -> Result<PrivateKey> {
    let key_path = layout.client_key_path();

    if have_registration {
        if let Ok(pem) = fs::read(&key_path) {
            let cipher = provider.derive("acme_client", true);
            let passphrase = cipher.as_ref().map(|c| c.passphrase.as_str());
            if let Ok(key) = PrivateKey::load_pem(&pem, passphrase) {
                debug!(path = %key_path.display(), "loaded client key");
                return Ok(key);
            }
        }
        // Legacy migration path.
        let legacy_path = layout.legacy_client_key_path();
        if let Ok(raw) = fs::read(&legacy_path) {
            let jwk: LegacyJwk = serde_json::from_slice(&raw)?;
            let key = legacy_key_to_private_key(&jwk)?;
            debug!(path = %legacy_path.display(), "loaded old format client key");
            ops.push(FileOperation::archive("resource", &legacy_path));
            return Ok(key);
        }
    }

    info!("client key not present, generating");
    let key = PrivateKey::generate_account_key()?;
    ops.push(FileOperation::archive_and_write(
        "resource",
        &key_path,
        0o600,
        Vec::new(), // content filled in below once we know the cipher
    ));
    Ok(key)
}

/// Reconcile key encryption with configured passphrase policy. Returns
/// the key, possibly re-encoded, queuing a write if its on-disk form
/// needs to change.
fn reconcile_encryption(
    key: PrivateKey,
    layout: &ResourceLayout,
    provider: &mut PasswordProvider,
    freshly_generated: bool,
    ops: &mut Vec<FileOperation>,
) -> Result<PrivateKey> {
    let key_path = layout.client_key_path();
    let want_encrypted = provider.derive("acme_client", false).is_some();

    if freshly_generated {
        let passphrase = provider.derive("acme_client", true);
        let pem = key.encode(passphrase.as_ref().map(|c| c.passphrase.as_str()))?;
        if let Some(op) = ops.last_mut() {
            *op = FileOperation::archive_and_write("resource", &key_path, 0o600, pem);
        }
        return Ok(key);
    }

    if key.encrypted && !want_encrypted {
        debug!("client key is encrypted but config requires clear text");
        let pem = key.encode(None)?;
        ops.push(FileOperation::archive_and_write(
            "resource", &key_path, 0o600, pem,
        ));
    } else if !key.encrypted && want_encrypted {
        debug!("client key is clear text but config requires encrypted");
        let cipher = provider.derive("acme_client", false);
        let pem = key.encode(cipher.as_ref().map(|c| c.passphrase.as_str()))?;
        ops.push(FileOperation::write(&key_path, 0o600, pem));
    }

    Ok(key)
}

/// Accept (and log) the ACME server's terms of service. When stdin is a
/// TTY, prompt interactively and require an affirmative `y*` answer;
/// otherwise auto-accept with a log entry.
fn accept_terms(terms_url: &str, allow_tty_prompt: bool) -> Result<()> {
    if allow_tty_prompt && is_tty() {
        println!("ACME service has the following terms of service:");
        println!("{terms_url}");
        print!("Accept? (Y/n) ");
        io::stdout().flush().ok();
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        let answer = answer.trim();
        if !answer.is_empty() && !answer.to_lowercase().starts_with('y') {
            return Err(Error::AcmeProtocol("terms of service rejected".into()));
        }
        debug!("terms of service accepted");
    } else {
        debug!(url = terms_url, "terms of service auto-accepted");
    }
    Ok(())
}

#[cfg(unix)]
fn is_tty() -> bool {
    unsafe { libc_isatty() }
}

#[cfg(unix)]
unsafe fn libc_isatty() -> bool {
    extern "C" {
        fn isatty(fd: i32) -> i32;
    }
    isatty(0) != 0
}

#[cfg(not(unix))]
fn is_tty() -> bool {
    false
}

/// Full registration bootstrap: load or create the account key, reconcile
/// its encryption, load or register the account, and persist the result.
pub async fn bootstrap(
    transport: &mut Transport,
    layout: &ResourceLayout,
    contact_email: &str,
    passphrase: Option<&str>,
    allow_tty_prompt: bool,
    archive_dir: Option<&Path>,
) -> Result<Account> {
    let mut provider = PasswordProvider::new(passphrase.map(str::to_string));
    let registration = load_registration(layout, &transport.directory);
    let have_registration = registration.is_some();

    let mut ops = Vec::new();
    let freshly_generated = !have_registration && !layout.client_key_path().exists();
    let key = resolve_key(layout, &mut provider, have_registration, &mut ops)?;
    let key = reconcile_encryption(key, layout, &mut provider, freshly_generated, &mut ops)?;

    if !ops.is_empty() {
        commit_file_transactions(std::mem::take(&mut ops), archive_dir)?;
    }

    let registration = match registration {
        Some(r) => r,
        None => {
            info!("registering client");
            let mut payload = json!({
                "contact": [format!("mailto:{contact_email}")],
            });
            if let Some(meta) = &transport.directory.meta {
                if let Some(tos) = &meta.terms_of_service {
                    accept_terms(tos, allow_tty_prompt)?;
                    payload["termsOfServiceAgreed"] = json!(true);
                }
            }
            let new_account_url = transport.directory.new_account.clone();
            let resp = transport
                .post_signed(&key, None, &new_account_url, Some(&payload))
                .await?;
            if !resp.status().is_success() {
                return Err(Error::AcmeProtocol(format!(
                    "can't register with ACME service: {}",
                    resp.status()
                )));
            }
            let uri = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| Error::AcmeProtocol("registration response missing Location".into()))?
                .to_string();
            let registration = Registration {
                uri,
                contact: vec![format!("mailto:{contact_email}")],
                terms_of_service_agreed: true,
            };
            let op = FileOperation::archive_and_write(
                "resource",
                layout.registration_path(),
                0o600,
                serde_json::to_vec_pretty(&registration)?,
            );
            commit_file_transactions(vec![op], archive_dir)?;
            registration
        }
    };

    Ok(Account { key, registration })
}

/// RFC 5280 §5.3.1 CRL reason codes accepted by ACME's `revokeCert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
}

impl RevocationReason {
    fn code(self) -> u32 {
        match self {
            RevocationReason::Unspecified => 0,
            RevocationReason::KeyCompromise => 1,
            RevocationReason::CaCompromise => 2,
            RevocationReason::AffiliationChanged => 3,
            RevocationReason::Superseded => 4,
            RevocationReason::CessationOfOperation => 5,
        }
    }
}

/// Submit a signed revocation request for `certificate`.
pub async fn revoke(
    transport: &mut Transport,
    account: &Account,
    certificate: &crate::crypto::Certificate,
    reason: RevocationReason,
) -> Result<()> {
    let der = certificate.to_der()?;
    let cert_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(der);
    let payload = json!({
        "certificate": cert_b64,
        "reason": reason.code(),
    });
    let revoke_url = transport.directory.revoke_cert.clone();
    let resp = transport
        .post_signed(&account.key, Some(account.kid()), &revoke_url, Some(&payload))
        .await?;
    if !resp.status().is_success() {
        return Err(Error::AcmeProtocol(format!("revoke failed: {}", resp.status())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_key_roundtrips_through_pem() {
        // Build a fresh RSA key, export as raw components, and check that
        // the legacy migration path reconstitutes an equivalent key.
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let jwk = LegacyJwk {
            n: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, rsa.n().to_vec()),
            e: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, rsa.e().to_vec()),
            d: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, rsa.d().to_vec()),
            p: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, rsa.p().unwrap().to_vec()),
            q: base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, rsa.q().unwrap().to_vec()),
        };
        let key = legacy_key_to_private_key(&jwk).unwrap();
        assert_eq!(key.key_type, KeyType::Rsa);
        assert!(matches!(key.params, KeyParams::RsaBits(2048)));
    }
}
