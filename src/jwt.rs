//! JWK/JWS helpers used to sign every authenticated ACME request: turn
//! an account [`PrivateKey`](crate::crypto::PrivateKey) into a JWK, and
//! wrap a request payload into a flattened JWS, either keyed by the
//! account's JWK (pre-registration) or by its key ID (every request
//! after).

use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::sign::Signer;
use serde::Serialize;
use serde_json::{json, Value};

use crate::crypto::PrivateKey;
use crate::error::Result;

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

/// The JWK representation of an RSA account key, as required by RFC 7638
/// for ACME's `jwk` and thumbprint fields.
pub fn account_jwk(key: &PrivateKey) -> Result<Value> {
    let rsa = key.pkey().rsa()?;
    Ok(json!({
        "kty": "RSA",
        "n": b64(&rsa.n().to_vec()),
        "e": b64(&rsa.e().to_vec()),
    }))
}

/// Build a flattened JWS envelope around `payload`, signed with `key`.
/// `url` and `nonce` are mandatory protected-header fields for every
/// ACME POST. Exactly one of `kid` or the account JWK is present in the
/// protected header, matching RFC 8555 §6.2.
pub fn sign_request<T: Serialize>(
    key: &PrivateKey,
    kid: Option<&str>,
    url: &str,
    nonce: &str,
    payload: Option<&T>,
) -> Result<Value> {
    let mut protected = json!({
        "alg": "RS256",
        "nonce": nonce,
        "url": url,
    });
    match kid {
        Some(kid) => protected["kid"] = json!(kid),
        None => protected["jwk"] = account_jwk(key)?,
    }

    let protected_b64 = b64(serde_json::to_vec(&protected)?.as_slice());
    let payload_b64 = match payload {
        Some(p) => b64(serde_json::to_vec(p)?.as_slice()),
        None => String::new(),
    };

    let signing_input = format!("{protected_b64}.{payload_b64}");
    let mut signer = Signer::new(MessageDigest::sha256(), key.pkey())?;
    signer.update(signing_input.as_bytes())?;
    let signature = signer.sign_to_vec()?;

    Ok(json!({
        "protected": protected_b64,
        "payload": payload_b64,
        "signature": b64(&signature),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyParams, KeyType};

    #[test]
    fn jwk_has_expected_shape() {
        let key = PrivateKey::generate(KeyType::Rsa, KeyParams::RsaBits(2048)).unwrap();
        let jwk = account_jwk(&key).unwrap();
        assert_eq!(jwk["kty"], "RSA");
        assert!(jwk["n"].is_string());
        assert!(jwk["e"].is_string());
    }

    #[test]
    fn signed_request_carries_kid_not_jwk_when_given() {
        let key = PrivateKey::generate(KeyType::Rsa, KeyParams::RsaBits(2048)).unwrap();
        let payload = json!({"termsOfServiceAgreed": true});
        let jws = sign_request(&key, Some("https://example/acct/1"), "https://example/new-order", "nonce123", Some(&payload)).unwrap();
        let protected_json: Value = {
            let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(jws["protected"].as_str().unwrap())
                .unwrap();
            serde_json::from_slice(&raw).unwrap()
        };
        assert_eq!(protected_json["kid"], "https://example/acct/1");
        assert!(protected_json.get("jwk").is_none());
    }
}
