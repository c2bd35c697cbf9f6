//! Key, certificate and chain types, and the small amount of OpenSSL
//! plumbing the rest of the crate needs: key generation/load/serialize,
//! CSR construction, certificate parsing, and OCSP response decoding.
//! Built directly on `openssl`, which the rest of the crate's JWK/JWS
//! machinery also uses.

use std::fmt;

use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::ocsp::{OcspCertId, OcspCertStatus, OcspRequest, OcspResponse};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509Name, X509Req, X509ReqBuilder, X509};

use crate::error::{Error, Result};

/// Key algorithms the orchestrator knows how to request.
///
/// This enum is extensible; today this is the set we generate and
/// serialize file names for (`<name>.<key_type>.key`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ecdsa,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyType::Rsa => "rsa",
            KeyType::Ecdsa => "ecdsa",
        })
    }
}

impl KeyType {
    pub fn all() -> &'static [KeyType] {
        &[KeyType::Rsa, KeyType::Ecdsa]
    }
}

/// Concrete key parameters requested at generation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyParams {
    RsaBits(u32),
    EcdsaCurve(EcdsaCurve),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcdsaCurve {
    P256,
    P384,
}

impl EcdsaCurve {
    fn nid(self) -> Nid {
        match self {
            EcdsaCurve::P256 => Nid::X9_62_PRIME256V1,
            EcdsaCurve::P384 => Nid::SECP384R1,
        }
    }
}

/// A private key, possibly encrypted at rest.
///
/// Invariant: `decode(encode(k, passphrase), passphrase) ≡ k` for any
/// passphrase, including `None` (clear text).
pub struct PrivateKey {
    pub key_type: KeyType,
    pub params: KeyParams,
    pub encrypted: bool,
    key: PKey<Private>,
}

impl PrivateKey {
    /// Generate a fresh key of the requested type.
    pub fn generate(key_type: KeyType, params: KeyParams) -> Result<Self> {
        let key = match (key_type, params) {
            (KeyType::Rsa, KeyParams::RsaBits(bits)) => {
                let rsa = Rsa::generate(bits)?;
                PKey::from_rsa(rsa)?
            }
            (KeyType::Ecdsa, KeyParams::EcdsaCurve(curve)) => {
                let group = EcGroup::from_curve_name(curve.nid())?;
                let ec = EcKey::generate(&group)?;
                PKey::from_ec_key(ec)?
            }
            _ => {
                return Err(Error::Config(
                    "key type and key parameters do not match".into(),
                ))
            }
        };
        Ok(PrivateKey {
            key_type,
            params,
            encrypted: false,
            key,
        })
    }

    /// Generate a 4096-bit RSA account key, used for ACME account
    /// registration and request signing.
    pub fn generate_account_key() -> Result<Self> {
        Self::generate(KeyType::Rsa, KeyParams::RsaBits(4096))
    }

    /// Load a PEM-encoded key, encrypted or not, trying `passphrase` first.
    pub fn load_pem(pem: &[u8], passphrase: Option<&str>) -> Result<Self> {
        let (key, encrypted) = match passphrase {
            Some(p) => match PKey::private_key_from_pem_passphrase(pem, p.as_bytes()) {
                Ok(k) => (k, true),
                Err(_) => (PKey::private_key_from_pem(pem)?, false),
            },
            None => (PKey::private_key_from_pem(pem)?, false),
        };
        let (key_type, params) = Self::classify(&key)?;
        Ok(PrivateKey {
            key_type,
            params,
            encrypted,
            key,
        })
    }

    fn classify(key: &PKey<Private>) -> Result<(KeyType, KeyParams)> {
        if let Ok(rsa) = key.rsa() {
            Ok((KeyType::Rsa, KeyParams::RsaBits(rsa.size() * 8)))
        } else if let Ok(ec) = key.ec_key() {
            let nid = ec
                .group()
                .curve_name()
                .ok_or_else(|| Error::Crypto(openssl::error::ErrorStack::get()))?;
            let curve = if nid == Nid::X9_62_PRIME256V1 {
                EcdsaCurve::P256
            } else {
                EcdsaCurve::P384
            };
            Ok((KeyType::Ecdsa, KeyParams::EcdsaCurve(curve)))
        } else {
            Err(Error::Config("unsupported private key type".into()))
        }
    }

    /// Encode to PEM, encrypting with `passphrase` when given.
    pub fn encode(&self, passphrase: Option<&str>) -> Result<Vec<u8>> {
        let pem = match passphrase {
            Some(p) => self
                .key
                .private_key_to_pem_pkcs8_passphrase(Cipher::aes_256_cbc(), p.as_bytes())?,
            None => self.key.private_key_to_pem_pkcs8()?,
        };
        Ok(pem)
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.key.public_key_to_der()?)
    }

    pub(crate) fn pkey(&self) -> &PKey<Private> {
        &self.key
    }

    /// Build a CSR covering `common_name` and `alt_names`, with the
    /// must-staple (TLS Feature / status_request) extension when requested.
    pub fn build_csr(
        &self,
        common_name: &str,
        alt_names: &[String],
        must_staple: bool,
    ) -> Result<X509Req> {
        let mut builder = X509ReqBuilder::new()?;
        builder.set_pubkey(&self.key)?;

        let mut name = X509Name::builder()?;
        name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
        builder.set_subject_name(&name.build())?;

        let mut extensions = Stack::new()?;
        extensions.push(BasicConstraints::new().build()?)?;
        if !alt_names.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for name in alt_names {
                san.dns(name);
            }
            let ctx = builder.x509v3_context(None);
            extensions.push(san.build(&ctx)?)?;
        }
        if must_staple {
            // TLS Feature extension, OID 1.3.6.1.5.5.7.1.24, value
            // "status_request" (30 03 02 01 05 DER-encoded as a single
            // INTEGER 5 inside a SEQUENCE). openssl-rs has no typed
            // builder for this extension, so it is added as a raw
            // extension by OID the same way openssl(1) `-addext` does.
            let value = openssl::asn1::Asn1OctetString::new_from_bytes(&[0x30, 0x03, 0x02, 0x01, 0x05])?;
            let ext = openssl::x509::X509Extension::new_from_der(
                &openssl::asn1::Asn1Object::from_str("1.3.6.1.5.5.7.1.24")?,
                false,
                &value,
            );
            if let Ok(ext) = ext {
                extensions.push(ext)?;
            }
        }
        builder.add_extensions(&extensions)?;
        builder.sign(&self.key, MessageDigest::sha256())?;
        Ok(builder.build())
    }
}

/// A parsed X.509 certificate with the derived views the orchestrator and
/// verifier need.
#[derive(Clone)]
pub struct Certificate {
    inner: X509,
    text: String,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let inner = X509::from_der(der)?;
        let text = String::from_utf8_lossy(&inner.to_text()?).into_owned();
        Ok(Certificate { inner, text })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let inner = X509::from_pem(pem)?;
        let text = String::from_utf8_lossy(&inner.to_text()?).into_owned();
        Ok(Certificate { inner, text })
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.inner.to_der()?)
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.inner.to_pem()?)
    }

    pub fn common_name(&self) -> Option<String> {
        self.inner
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string())
    }

    pub fn subject_alt_names(&self) -> Vec<String> {
        self.inner
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.dnsname().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn not_after(&self) -> chrono::DateTime<chrono::Utc> {
        asn1_time_to_chrono(self.inner.not_after())
    }

    pub fn not_before(&self) -> chrono::DateTime<chrono::Utc> {
        asn1_time_to_chrono(self.inner.not_before())
    }

    pub fn issuer_common_name(&self) -> Option<String> {
        self.inner
            .issuer_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string())
    }

    pub fn ocsp_responder_url(&self) -> Option<String> {
        let uris = self.inner.ocsp_responders().ok()?;
        uris.iter().next().map(|s| s.to_string())
    }

    /// Whether the certificate carries the TLS Feature (must-staple)
    /// extension, OID 1.3.6.1.5.5.7.1.24. openssl-rs has no typed getter
    /// for arbitrary extensions, so presence is checked against the
    /// OpenSSL text dump of the parsed certificate, the same
    /// representation `openssl x509 -text` would produce.
    pub fn has_ocsp_must_staple(&self) -> bool {
        self.text.contains("1.3.6.1.5.5.7.1.24") || self.text.contains("TLS Feature")
    }

    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.inner.public_key()?.public_key_to_der()?)
    }

    /// Subject/issuer linkage check used by [`Chain::validate_linkage`].
    fn issued_by(&self, issuer: &Certificate) -> bool {
        self.inner.issuer_name().to_der().ok() == issuer.inner.subject_name().to_der().ok()
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        match (self.to_der(), other.to_der()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name())
            .field("not_after", &self.not_after())
            .finish()
    }
}

fn asn1_time_to_chrono(t: &openssl::asn1::Asn1TimeRef) -> chrono::DateTime<chrono::Utc> {
    // openssl's Asn1Time has no direct chrono conversion; round-trip
    // through its RFC-2822-ish Display, which chrono can parse.
    let s = t.to_string();
    chrono::DateTime::parse_from_str(&format!("{s} +0000"), "%b %e %T %Y GMT %z")
        .map(|d| d.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

/// Ordered intermediates from the issued leaf (exclusive) up to but not
/// including the trust root.
#[derive(Clone, Debug, Default)]
pub struct Chain(pub Vec<Certificate>);

impl Chain {
    pub fn from_pem_bundle(pem: &[u8]) -> Result<Self> {
        let certs = X509::stack_from_pem(pem)?
            .into_iter()
            .map(|c| {
                let text = String::from_utf8_lossy(&c.to_text()?).into_owned();
                Ok(Certificate { inner: c, text })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Chain(certs))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Invariant check: adjacent pairs satisfy issuer/subject linkage.
    pub fn validate_linkage(&self) -> Result<()> {
        for pair in self.0.windows(2) {
            if !pair[0].issued_by(&pair[1]) {
                return Err(Error::Crypto(openssl::error::ErrorStack::get()));
            }
        }
        Ok(())
    }
}

/// Decode an OCSP response (DER) and extract its `(good|revoked|unknown)`
/// status for `subject`, as issued by `issuer`.
pub fn ocsp_response_status(der: &[u8], subject: &Certificate, issuer: &Certificate) -> Result<&'static str> {
    let resp = OcspResponse::from_der(der)?;
    let basic = resp.basic()?;
    let digest = openssl::hash::MessageDigest::sha1();
    let cert_id = openssl::ocsp::OcspCertId::from_cert(digest, &subject.inner, &issuer.inner)?;
    match basic.find_status(&cert_id) {
        Some(status) => {
            if status.status == OcspCertStatus::GOOD {
                Ok("good")
            } else if status.status == OcspCertStatus::REVOKED {
                Ok("revoked")
            } else {
                Ok("unknown")
            }
        }
        None => Ok("unknown"),
    }
}

/// Build and submit an OCSP request for `subject` (issued by `issuer`)
/// to `responder_url`, returning the raw DER response. Used to fetch a
/// fresh staple to persist alongside a must-staple certificate.
pub async fn request_ocsp_response(responder_url: &str, subject: &Certificate, issuer: &Certificate) -> Result<Vec<u8>> {
    let digest = MessageDigest::sha1();
    let cert_id = OcspCertId::from_cert(digest, &subject.inner, &issuer.inner)?;
    let mut request = OcspRequest::new()?;
    request.add_id(cert_id)?;
    let der = request.to_der()?;

    let client = reqwest::Client::new();
    let resp = client
        .post(responder_url)
        .header("Content-Type", "application/ocsp-request")
        .body(der)
        .send()
        .await
        .map_err(Error::Http)?;
    let body = resp.error_for_status().map_err(Error::Http)?.bytes().await.map_err(Error::Http)?;
    // Validate it decodes before handing it back to the caller.
    OcspResponse::from_der(&body)?;
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsa_key_survives_plaintext_round_trip() {
        let key = PrivateKey::generate(KeyType::Rsa, KeyParams::RsaBits(2048)).unwrap();
        let pem = key.encode(None).unwrap();
        let loaded = PrivateKey::load_pem(&pem, None).unwrap();
        assert!(!loaded.encrypted);
        assert_eq!(loaded.key_type, KeyType::Rsa);
        assert_eq!(loaded.public_key_der().unwrap(), key.public_key_der().unwrap());
    }

    #[test]
    fn ecdsa_key_survives_passphrase_round_trip() {
        let key = PrivateKey::generate(KeyType::Ecdsa, KeyParams::EcdsaCurve(EcdsaCurve::P256)).unwrap();
        let pem = key.encode(Some("hunter2")).unwrap();
        let loaded = PrivateKey::load_pem(&pem, Some("hunter2")).unwrap();
        assert!(loaded.encrypted);
        assert_eq!(loaded.key_type, KeyType::Ecdsa);
        assert_eq!(loaded.public_key_der().unwrap(), key.public_key_der().unwrap());
    }

    #[test]
    fn wrong_passphrase_falls_back_to_unencrypted_load_and_fails() {
        let key = PrivateKey::generate(KeyType::Rsa, KeyParams::RsaBits(2048)).unwrap();
        let pem = key.encode(Some("correct-horse")).unwrap();
        assert!(PrivateKey::load_pem(&pem, Some("wrong-password")).is_err());
    }

    #[test]
    fn csr_covers_requested_names_and_is_self_verifying() {
        let key = PrivateKey::generate(KeyType::Rsa, KeyParams::RsaBits(2048)).unwrap();
        let alt_names = vec!["example.com".to_string(), "www.example.com".to_string()];
        let csr = key.build_csr("example.com", &alt_names, true).unwrap();
        assert!(csr.verify(&key.pkey()).unwrap());
    }

    #[test]
    fn chain_from_empty_bundle_is_empty() {
        let chain = Chain::from_pem_bundle(b"").unwrap();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }
}
