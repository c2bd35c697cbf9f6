//! Deployed-certificate verification: TLS dialing with STARTTLS upgrade,
//! SNI, OCSP stapling retrieval, and chain comparison against local
//! state.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use openssl::ssl::{Ssl, SslConnector, SslMethod, SslVerifyMode};
use tracing::{debug, error, info};

use crate::context::{CertificateContext, CertificateItem};
use crate::crypto::{ocsp_response_status, Certificate, KeyType};
use crate::error::{Error, Result};

const STARTTLS_TIMEOUT: Duration = Duration::from_secs(30);

fn recv(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf)?;
    Ok(buf[..n].to_vec())
}

/// STARTTLS upgrade state machines, one per supported protocol. All
/// carry a 30-second socket timeout during the upgrade, cleared
/// afterwards.
fn send_starttls(ty: &str, stream: &mut TcpStream, host_name: &str) -> Result<()> {
    stream.set_read_timeout(Some(STARTTLS_TIMEOUT))?;
    stream.set_write_timeout(Some(STARTTLS_TIMEOUT))?;

    match ty.to_lowercase().as_str() {
        "smtp" => {
            debug!(proto = "smtp", banner = ?recv(stream)?, "banner");
            stream.write_all(b"ehlo certmgr.local\r\n")?;
            let buffer = recv(stream)?;
            debug!(proto = "smtp", response = ?buffer, "ehlo response");
            if !buffer.windows(8).any(|w| w == b"STARTTLS") {
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return Err(Error::Validation("STARTTLS not supported on server".into()));
            }
            stream.write_all(b"starttls\r\n")?;
            debug!(proto = "smtp", response = ?recv(stream)?, "starttls response");
        }
        "pop3" => {
            debug!(proto = "pop3", banner = ?recv(stream)?, "banner");
            stream.write_all(b"STLS\r\n")?;
            debug!(proto = "pop3", response = ?recv(stream)?, "stls response");
        }
        "imap" => {
            debug!(proto = "imap", banner = ?recv(stream)?, "banner");
            stream.write_all(b"a001 STARTTLS\r\n")?;
            debug!(proto = "imap", response = ?recv(stream)?, "starttls response");
        }
        "ftp" => {
            debug!(proto = "ftp", banner = ?recv(stream)?, "banner");
            stream.write_all(b"AUTH TLS\r\n")?;
            debug!(proto = "ftp", response = ?recv(stream)?, "auth response");
        }
        "xmpp" => {
            let open = format!(
                "<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" xmlns=\"jabber:client\" to=\"{host_name}\" version=\"1.0\">\n"
            );
            stream.write_all(open.as_bytes())?;
            debug!(proto = "xmpp", response = ?recv(stream)?, "stream open response");
            stream.write_all(b"<starttls xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>")?;
            debug!(proto = "xmpp", response = ?recv(stream)?, "starttls response");
        }
        "sieve" => {
            let buffer = recv(stream)?;
            debug!(proto = "sieve", banner = ?buffer, "banner");
            if !buffer.windows(10).any(|w| w == b"\"STARTTLS\"") {
                let _ = stream.shutdown(std::net::Shutdown::Both);
                return Err(Error::Validation("STARTTLS not supported on server".into()));
            }
            stream.write_all(b"StartTls\r\n")?;
            debug!(proto = "sieve", response = ?recv(stream)?, "starttls response");
        }
        other => {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return Err(Error::Validation(format!("Unsupported STARTTLS type: {other}")));
        }
    }

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    Ok(())
}

/// Cipher-list string selecting only ciphers whose name contains the
/// key-type tag, so the server presents the bundle matching that item.
fn cipher_list_for_key_type(key_type: KeyType) -> Result<String> {
    let tag = match key_type {
        KeyType::Rsa => "RSA",
        KeyType::Ecdsa => "ECDSA",
    };
    let ctx = SslConnector::builder(SslMethod::tls())?.build();
    let ssl = Ssl::new(ctx.context())?;
    let names: Vec<String> = ssl
        .ciphers()
        .map(|list| list.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    Ok(names.into_iter().filter(|n| n.contains(tag)).collect::<Vec<_>>().join(":"))
}

/// Dial one address, optionally STARTTLS-upgrading, then negotiate TLS
/// with SNI set to `host_name` and an OCSP staple requested.
fn fetch_tls_info(
    addr: std::net::SocketAddr,
    host_name: &str,
    starttls: Option<&str>,
    cipher_list: &str,
) -> Result<(Vec<Certificate>, Option<Vec<u8>>)> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_cipher_list(cipher_list)?;
    builder.set_verify(SslVerifyMode::NONE);

    // The staple arrives via a status callback during the handshake;
    // captured here and read back once it completes.
    let staple: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let staple_cb = staple.clone();
    builder.set_status_callback(move |ssl| {
        if let Some(resp) = ssl.ocsp_status() {
            *staple_cb.borrow_mut() = Some(resp.to_vec());
        }
        true
    })?;
    let connector = builder.build();

    let mut stream = TcpStream::connect(addr)?;
    if let Some(proto) = starttls {
        send_starttls(proto, &mut stream, host_name)?;
    }

    let config = connector
        .configure()?
        .verify_hostname(false)
        .use_server_name_indication(true);
    let mut ssl_stream = config
        .connect(host_name, stream)
        .map_err(|e| Error::Validation(format!("TLS handshake failed: {e}")))?;

    let peer_chain: Vec<Certificate> = ssl_stream
        .ssl()
        .peer_cert_chain()
        .map(|stack| {
            stack
                .iter()
                .filter_map(|x509| x509.to_der().ok().and_then(|der| Certificate::from_der(&der).ok()))
                .collect()
        })
        .unwrap_or_default();

    let ocsp = staple.borrow_mut().take();
    info!(
        host = host_name,
        ocsp = ocsp.as_ref().map(|_| "present").unwrap_or("missing"),
        "connected"
    );

    let _ = ssl_stream.shutdown();
    Ok((peer_chain, ocsp))
}

fn resolve_addresses(host_name: &str, port: u16) -> Result<Vec<std::net::SocketAddr>> {
    let probe_host = if let Some(rest) = host_name.strip_prefix("*.") {
        format!("wildcard-test.{rest}")
    } else {
        host_name.to_string()
    };
    let addrs: Vec<_> = (probe_host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| Error::Validation(format!("unable to get address for {host_name}: {e}")))?
        .collect();
    Ok(addrs)
}

fn verify_one_address(
    item: &CertificateItem,
    name: &str,
    host_name: &str,
    addr: std::net::SocketAddr,
    starttls: Option<&str>,
    cipher_list: &str,
    max_ocsp_verify_attempts: u32,
    ocsp_verify_retry_delay: u64,
) -> usize {
    let host_desc = format!(
        "{host_name} at {}:{}",
        if addr.is_ipv6() { format!("[{}]", addr.ip()) } else { addr.ip().to_string() },
        addr.port()
    );
    let mut errors = 0usize;

    let result = (|| -> Result<(Vec<Certificate>, Option<Vec<u8>>)> {
        let must_staple = item.certificate.as_ref().map(|c| c.has_ocsp_must_staple()).unwrap_or(false);
        let (mut chain, mut ocsp) = fetch_tls_info(addr, host_name, starttls, cipher_list)?;
        if must_staple {
            let mut attempts = 1;
            while ocsp.is_none() && attempts < max_ocsp_verify_attempts {
                std::thread::sleep(Duration::from_secs(ocsp_verify_retry_delay));
                debug!("retry to fetch OCSP staple");
                let retried = fetch_tls_info(addr, host_name, starttls, cipher_list)?;
                chain = retried.0;
                ocsp = retried.1;
                attempts += 1;
            }
        }
        Ok((chain, ocsp))
    })();

    let (installed_chain, ocsp_staple) = match result {
        Ok(v) => v,
        Err(e) => {
            error!(name, key_type = %item.key_type, host = %host_desc, error = %e, "VALIDATION ERROR: unable to connect");
            return 1;
        }
    };

    if installed_chain.is_empty() {
        error!(name, key_type = %item.key_type, host = %host_desc, "VALIDATION ERROR: server presented no certificate");
        return 1;
    }
    let installed_leaf = &installed_chain[0];
    let installed_intermediates = &installed_chain[1..];

    match &item.certificate {
        Some(local) if local == installed_leaf => {
            info!(name, key_type = %item.key_type, host = %host_desc, "certificate present");
        }
        Some(_) | None => {
            error!(
                name, key_type = %item.key_type, host = %host_desc,
                installed_cn = ?installed_leaf.common_name(),
                "VALIDATION ERROR: certificate mismatch"
            );
            errors += 1;
        }
    }

    match &item.chain {
        Some(local_chain) if local_chain.len() == installed_intermediates.len() => {
            for (local, installed) in local_chain.0.iter().zip(installed_intermediates) {
                if local == installed {
                    info!(name, key_type = %item.key_type, host = %host_desc, cn = ?local.common_name(), "intermediate certificate present");
                } else {
                    error!(name, key_type = %item.key_type, host = %host_desc, cn = ?installed.common_name(), "VALIDATION ERROR: intermediate certificate mismatch");
                    errors += 1;
                }
            }
        }
        Some(local_chain) => {
            error!(
                name, key_type = %item.key_type, host = %host_desc,
                got = installed_intermediates.len(), expected = local_chain.len(),
                "VALIDATION ERROR: certificate chain length mismatch"
            );
            errors += 1;
        }
        None => {}
    }

    let must_staple = item.certificate.as_ref().map(|c| c.has_ocsp_must_staple()).unwrap_or(false);
    match (&ocsp_staple, &item.certificate) {
        (Some(der), Some(local)) => {
            let issuer = item.chain.as_ref().and_then(|c| c.0.first());
            let status = issuer
                .map(|issuer| ocsp_response_status(der, local, issuer))
                .unwrap_or(Ok("unknown"));
            match status {
                Ok("good") => info!(name, key_type = %item.key_type, host = %host_desc, "OCSP staple status is GOOD"),
                Ok(other) => {
                    error!(name, key_type = %item.key_type, host = %host_desc, status = other, "ERROR: OCSP staple has bad status");
                    errors += 1;
                }
                Err(e) => {
                    error!(name, key_type = %item.key_type, host = %host_desc, error = %e, "ERROR: unable to decode OCSP staple");
                    errors += 1;
                }
            }
        }
        (None, _) if must_staple => {
            error!(name, key_type = %item.key_type, host = %host_desc, "VALIDATION ERROR: certificate has OCSP must-staple but no staple found");
            errors += 1;
        }
        _ => {}
    }

    errors
}

/// Verify every configured verify target of `context` against its
/// locally held certificate bundles. Returns the number of validation
/// errors found (zero when everything checked out); validation errors
/// are logged and otherwise non-fatal.
pub fn verify_certificate_installation(
    context: &CertificateContext,
    max_ocsp_verify_attempts: u32,
    ocsp_verify_retry_delay: u64,
) -> usize {
    if context.spec.verify.is_empty() {
        return 0;
    }

    let mut cipher_lists = std::collections::HashMap::new();
    for &key_type in &context.spec.key_types {
        match cipher_list_for_key_type(key_type) {
            Ok(list) => {
                cipher_lists.insert(key_type, list);
            }
            Err(e) => {
                error!(name = %context.name, key_type = %key_type, error = %e, "unable to compute cipher list");
            }
        }
    }

    let mut error_count = 0usize;
    for item in context.iter() {
        if item.certificate.is_none() {
            tracing::warn!(name = %context.name, key_type = %item.key_type, "certificate not found");
            continue;
        }
        if item.chain.is_none() {
            tracing::warn!(name = %context.name, key_type = %item.key_type, "chain not found");
            continue;
        }
        let Some(cipher_list) = cipher_lists.get(&item.key_type) else {
            continue;
        };

        for verify in &context.spec.verify {
            if !verify.key_types.is_empty() && !verify.key_types.contains(&item.key_type) {
                continue;
            }
            let hosts: &[String] = if verify.hosts.is_empty() { &context.spec.alt_names } else { &verify.hosts };
            for host_name in hosts {
                let addrs = match resolve_addresses(host_name, verify.port) {
                    Ok(addrs) => addrs,
                    Err(e) => {
                        error!(name = %context.name, key_type = %item.key_type, host = %host_name, error = %e, "VALIDATION ERROR");
                        error_count += 1;
                        continue;
                    }
                };
                for addr in addrs {
                    error_count += verify_one_address(
                        item,
                        &context.name,
                        host_name,
                        addr,
                        verify.starttls.as_deref(),
                        cipher_list,
                        max_ocsp_verify_attempts,
                        ocsp_verify_retry_delay,
                    );
                }
            }
        }
    }
    error_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_host_rewritten_for_resolution() {
        // resolve_addresses will fail to actually connect in a sandboxed
        // test environment, but DNS rewriting happens before resolution
        // is attempted, so this just documents the contract via the
        // substring transform used in fetch_tls_info's caller.
        let host = "*.example.com";
        let rewritten = host.strip_prefix("*.").map(|rest| format!("wildcard-test.{rest}"));
        assert_eq!(rewritten.as_deref(), Some("wildcard-test.example.com"));
    }
}
