//! Low-level signed HTTP transport: nonce management and JWS-wrapped
//! POSTs.

use reqwest::Response;
use serde::Serialize;

use crate::crypto::PrivateKey;
use crate::error::{Error, Result};
use crate::jwt;

use super::dir::Directory;

const USER_AGENT: &str = concat!("certmgr/", env!("CARGO_PKG_VERSION"), " acme-rs");

pub struct Transport {
    client: reqwest::Client,
    pub directory: Directory,
    nonce: Option<String>,
}

impl Transport {
    pub fn new(directory: Directory) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Transport {
            client,
            directory,
            nonce: None,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    async fn fresh_nonce(&mut self) -> Result<String> {
        if let Some(nonce) = self.nonce.take() {
            return Ok(nonce);
        }
        let resp = self
            .client
            .head(&self.directory.new_nonce)
            .send()
            .await?;
        nonce_header(&resp).ok_or_else(|| {
            Error::AcmeProtocol("server did not return a Replay-Nonce header".into())
        })
    }

    fn capture_nonce(&mut self, resp: &Response) {
        if let Some(nonce) = nonce_header(resp) {
            self.nonce = Some(nonce);
        }
    }

    /// POST a JWS-wrapped `payload` (or a POST-as-GET when `payload` is
    /// `None`) to `url`, signed with `key` and keyed by `kid` once an
    /// account exists (by the account JWK beforehand).
    pub async fn post_signed<T: Serialize>(
        &mut self,
        key: &PrivateKey,
        kid: Option<&str>,
        url: &str,
        payload: Option<&T>,
    ) -> Result<Response> {
        let nonce = self.fresh_nonce().await?;
        let body = jwt::sign_request(key, kid, url, &nonce, payload)?;
        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/jose+json")
            .json(&body)
            .send()
            .await?;
        self.capture_nonce(&resp);
        Ok(resp)
    }

    pub async fn get(&mut self, url: &str) -> Result<Response> {
        let resp = self.client.get(url).send().await?;
        self.capture_nonce(&resp);
        Ok(resp)
    }
}

fn nonce_header(resp: &Response) -> Option<String> {
    resp.headers()
        .get("Replay-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Server-provided `Retry-After` in seconds, falling back to `default`.
/// Honors both the delta-seconds and HTTP-date forms per RFC 7231.
pub fn retry_after(resp: &Response, default: u64) -> u64 {
    let Some(raw) = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
    else {
        return default;
    };
    if let Ok(seconds) = raw.parse::<u64>() {
        return seconds;
    }
    if let Ok(when) = chrono::DateTime::parse_from_rfc2822(raw) {
        let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return delta.num_seconds().max(0) as u64;
    }
    default
}
