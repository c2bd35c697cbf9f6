//! ACME client adapter: registration, order, authorization, finalize,
//! and revoke, split across account/directory/order/request submodules.

pub mod account;
pub mod dir;
pub mod order;
pub mod req;

use std::path::PathBuf;

use tracing::info;

use crate::crypto::{Certificate, Chain, KeyParams, PrivateKey};
use crate::error::Result;
use crate::hooks::Hooks;

pub use account::{Account, ResourceLayout, RevocationReason};
pub use dir::{Directory, DirectoryUrl};
pub use req::Transport;

/// Everything an order needs to know about the identifiers and the
/// fresh leaf key it should be issued against.
pub struct OrderSpec<'a> {
    pub common_name: &'a str,
    pub alt_names: &'a [String],
    pub must_staple: bool,
    pub key_params: KeyParams,
}

/// Connect to `directory_url`, bootstrap (or reuse) the account, and
/// return a ready [`Transport`] + [`Account`] pair.
pub async fn connect(
    directory_url: &DirectoryUrl,
    layout: &ResourceLayout,
    contact_email: &str,
    passphrase: Option<&str>,
    allow_tty_prompt: bool,
    archive_dir: Option<&std::path::Path>,
) -> Result<(Transport, Account)> {
    let http = reqwest::Client::new();
    info!(url = directory_url.as_str(), "fetching ACME directory");
    let directory = Directory::from_url(&http, directory_url).await?;
    let mut transport = Transport::new(directory)?;
    let account = account::bootstrap(&mut transport, layout, contact_email, passphrase, allow_tty_prompt, archive_dir).await?;
    Ok((transport, account))
}

/// Drive a full order → authorize → finalize cycle for `spec`, generating
/// a fresh key of the requested type. Returns the fresh key, leaf
/// certificate, chain, and order URL.
pub async fn obtain(
    transport: &mut Transport,
    account: &Account,
    spec: &OrderSpec<'_>,
    http_challenge_dir: &dyn Fn(&str) -> Option<PathBuf>,
    hooks: &mut Hooks,
    retry: u32,
    delay: u64,
) -> Result<(PrivateKey, Certificate, Chain, String)> {
    let key_type = match spec.key_params {
        KeyParams::RsaBits(_) => crate::crypto::KeyType::Rsa,
        KeyParams::EcdsaCurve(_) => crate::crypto::KeyType::Ecdsa,
    };
    let cert_key = PrivateKey::generate(key_type, spec.key_params)?;

    let order = order::new_order(transport, account, spec.alt_names).await?;
    order::handle_authorizations(transport, account, &order, http_challenge_dir, hooks, retry, delay).await?;
    let (leaf, chain) = order::finalize(
        transport,
        account,
        &order,
        &cert_key,
        spec.common_name,
        spec.alt_names,
        spec.must_staple,
        retry,
        delay,
    )
    .await?;

    Ok((cert_key, leaf, chain, order.url))
}

pub use account::revoke;
