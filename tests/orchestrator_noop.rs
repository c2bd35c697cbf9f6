//! End-to-end `orchestrator::process_context` exercise for the
//! already-up-to-date case, which never touches the network: a
//! certificate on disk that already matches the configured spec
//! should come back as zero validation errors with no ACME call made.

use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Name, X509};

use certmgr::acme::account::Registration;
use certmgr::acme::{Account, Directory, Transport};
use certmgr::config::Config;
use certmgr::crypto::{KeyParams, PrivateKey};
use certmgr::orchestrator::{self, Decision};
use certmgr::{CertificateContext, CertificateItem, KeyType};

fn self_signed_pem(key: &PrivateKey, common_name: &str, alt_names: &[&str]) -> Vec<u8> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    let mut builder = X509::builder().unwrap();
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(key.pkey()).unwrap();
    builder.set_not_before(&Asn1Time::from_unix(now - 86400).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::from_unix(now + 90 * 86400).unwrap()).unwrap();

    let mut san = SubjectAlternativeName::new();
    for n in alt_names {
        san.dns(n);
    }
    let ctx = builder.x509v3_context(None, None);
    let ext = san.build(&ctx).unwrap();
    builder.append_extension(ext).unwrap();

    builder.sign(key.pkey(), MessageDigest::sha256()).unwrap();
    builder.build().to_pem().unwrap()
}

/// Builds a [`Transport`]/[`Account`] pair without any network access —
/// `Directory` and `Account` are plain structs, and `Transport::new`
/// only builds an HTTP client, so this never dials out.
fn offline_transport_and_account() -> (Transport, Account) {
    let directory = Directory {
        new_nonce: "https://acme.example.test/new-nonce".into(),
        new_account: "https://acme.example.test/new-account".into(),
        new_order: "https://acme.example.test/new-order".into(),
        revoke_cert: "https://acme.example.test/revoke-cert".into(),
        key_change: "https://acme.example.test/key-change".into(),
        meta: None,
        url: "https://acme.example.test/directory".into(),
    };
    let transport = Transport::new(directory).unwrap();
    let account = Account {
        key: PrivateKey::generate_account_key().unwrap(),
        registration: Registration {
            uri: "https://acme.example.test/acct/1".into(),
            contact: vec!["mailto:admin@example.com".into()],
            terms_of_service_agreed: true,
        },
    };
    (transport, account)
}

#[tokio::test]
async fn process_context_is_noop_for_up_to_date_certificate() {
    let root = tempfile::tempdir().unwrap();
    let cert_dir = root.path().join("certs");
    fs::create_dir_all(&cert_dir).unwrap();

    // Matches the default `rsa_key_bits: 2048` the config below leaves
    // unset, so `decide()`'s key-params check doesn't itself force a renew.
    let key = PrivateKey::generate(KeyType::Rsa, KeyParams::RsaBits(2048)).unwrap();
    let stem = CertificateItem::file_stem("example.com", KeyType::Rsa);
    fs::write(cert_dir.join(format!("{stem}.key")), key.encode(None).unwrap()).unwrap();
    let cert_pem = self_signed_pem(&key, "example.com", &["example.com"]);
    fs::write(cert_dir.join(format!("{stem}.pem")), &cert_pem).unwrap();

    let config_yaml = format!(
        r#"
directory_url: https://acme.example.test/directory
contact_email: admin@example.com
resource_dir: {resource_dir}
cert_dir: {cert_dir}
certificates:
  example.com:
    alt_names: [example.com]
    key_types: [rsa]
"#,
        resource_dir = root.path().join("resources").display(),
        cert_dir = cert_dir.display(),
    );
    let config_path = root.path().join("config.yml");
    fs::write(&config_path, config_yaml).unwrap();
    let config = Config::load(&config_path).unwrap();

    let (name, spec) = config.certificate_specs().next().unwrap();

    // Decided independently of process_context, confirming the on-disk
    // certificate is recognized as already matching the configuration.
    let ctx = CertificateContext::load(name.clone(), spec, &cert_dir).unwrap();
    let item = ctx.item(KeyType::Rsa).unwrap();
    assert_eq!(orchestrator::decide(item, &ctx.spec), Decision::Noop);

    let (mut transport, account) = offline_transport_and_account();
    let error_count = orchestrator::process_context(ctx.name, ctx.spec, &config, &mut transport, &account)
        .await
        .unwrap();
    assert_eq!(error_count, 0);
}
