//! Crate-wide error type.
//!
//! Every fallible operation in `certmgr` returns [`Error`]. Variants map
//! directly onto the error kinds a deployment needs to distinguish:
//! configuration mistakes, ACME protocol failures, filesystem transaction
//! failures, and crypto/parse failures are all fatal to the
//! [`CertificateContext`](crate::context::CertificateContext) being
//! processed; [`Error::Validation`] is informational and never aborts a
//! run.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("ACME protocol error: {0}")]
    AcmeProtocol(String),

    #[error("authorization timed out for {domain} after {attempts} attempt(s)")]
    AcmeTimeout { domain: String, attempts: u32 },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("filesystem transaction error: {0}")]
    Filesystem(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for the kinds that abort processing of the current
    /// certificate context but must not abort subsequent contexts.
    pub fn is_fatal_to_context(&self) -> bool {
        !matches!(self, Error::Validation(_))
    }
}

/// Shorthand for building a [`Error::Config`].
pub fn config_error(msg: impl Into<String>) -> Error {
    Error::Config(msg.into())
}

/// Shorthand for building a [`Error::AcmeProtocol`].
pub fn acme_error(msg: impl Into<String>) -> Error {
    Error::AcmeProtocol(msg.into())
}
