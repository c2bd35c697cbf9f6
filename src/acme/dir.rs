//! ACME directory entrypoint: resolve a [`DirectoryUrl`] to the set of
//! RFC 8555 resource URLs a client needs.

use serde::Deserialize;

use crate::error::Result;

/// Well-known ACME directory URLs, plus an escape hatch for private CAs.
#[derive(Debug, Clone)]
pub enum DirectoryUrl {
    LetsEncrypt,
    LetsEncryptStaging,
    Other(String),
}

impl DirectoryUrl {
    pub fn as_str(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => "https://acme-v02.api.letsencrypt.org/directory",
            DirectoryUrl::LetsEncryptStaging => {
                "https://acme-staging-v02.api.letsencrypt.org/directory"
            }
            DirectoryUrl::Other(url) => url,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryMeta {
    #[serde(rename = "termsOfService")]
    pub terms_of_service: Option<String>,
}

/// The resource URLs advertised by an ACME server's directory document.
#[derive(Debug, Clone, Deserialize)]
pub struct Directory {
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
    #[serde(rename = "revokeCert")]
    pub revoke_cert: String,
    #[serde(rename = "keyChange")]
    pub key_change: String,
    pub meta: Option<DirectoryMeta>,

    /// The URL this directory was fetched from, used later to detect a
    /// changed ACME service.
    #[serde(skip)]
    pub url: String,
}

impl Directory {
    pub async fn from_url(client: &reqwest::Client, url: &DirectoryUrl) -> Result<Self> {
        let url = url.as_str();
        let resp = client.get(url).send().await?;
        let mut directory: Directory = resp.error_for_status()?.json().await?;
        directory.url = url.to_string();
        Ok(directory)
    }

    /// scheme + host, used to check a stored registration against the
    /// currently configured directory: it's only valid if its
    /// `registration_uri`'s scheme+host matches this one's.
    pub fn origin(&self) -> Option<String> {
        origin_of(&self.url)
    }
}

pub fn origin_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    Some(format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_of_ignores_path() {
        assert_eq!(
            origin_of("https://acme-v2.example.com/directory"),
            origin_of("https://acme-v2.example.com/reg/42")
        );
        assert_ne!(
            origin_of("https://acme-v1.example.com/reg/42"),
            origin_of("https://acme-v2.example.com/directory")
        );
    }
}
