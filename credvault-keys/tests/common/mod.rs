//! Shared fixtures: a throwaway CA, leaf certificates and PKCS#12 bundles
//! built with openssl, plus small helpers for the async event tests.

#![allow(dead_code)]

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Name, X509NameBuilder, X509};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

pub fn rsa_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

fn name(cn: &str, org: &str) -> X509Name {
    let mut builder = X509NameBuilder::new().unwrap();
    builder.append_entry_by_text("O", org).unwrap();
    builder.append_entry_by_text("CN", cn).unwrap();
    builder.build()
}

fn random_serial() -> openssl::asn1::Asn1Integer {
    let mut bn = BigNum::new().unwrap();
    bn.rand(63, MsbOption::MAYBE_ZERO, false).unwrap();
    bn.to_asn1_integer().unwrap()
}

/// Self-signed CA valid for ten years.
pub fn make_ca(org: &str) -> (X509, PKey<Private>) {
    let key = rsa_key();
    let subject = name("Test Root", org);
    let now = now_unix();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(&subject).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(now - 3600).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + 10 * 365 * 86_400).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// Leaf signed by `ca`, valid over the given unix-time window.
pub fn make_leaf(
    ca: &X509,
    ca_key: &PKey<Private>,
    cn: &str,
    not_before: i64,
    not_after: i64,
) -> (X509, PKey<Private>) {
    let key = rsa_key();
    let subject = name(cn, "CredVault Test");

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&subject).unwrap();
    builder.set_issuer_name(ca.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(not_before).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(not_after).unwrap())
        .unwrap();
    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// Leaf valid from an hour ago until a year from now.
pub fn make_fresh_leaf(ca: &X509, ca_key: &PKey<Private>, cn: &str) -> (X509, PKey<Private>) {
    let now = now_unix();
    make_leaf(ca, ca_key, cn, now - 3600, now + 365 * 86_400)
}

/// PKCS#12 bundle of a leaf, its key and the issuing CA.
pub fn pkcs12_bundle(leaf: &X509, key: &PKey<Private>, ca: &X509, password: &str) -> Vec<u8> {
    let mut chain = Stack::new().unwrap();
    chain.push(ca.clone()).unwrap();
    let mut builder = Pkcs12::builder();
    builder.name("test credential");
    builder.pkey(key);
    builder.cert(leaf);
    builder.ca(chain);
    builder.build2(password).unwrap().to_der().unwrap()
}

/// PEM text holding the key, the leaf and the CA.
pub fn pem_bundle(leaf: &X509, key: &PKey<Private>, ca: &X509) -> Vec<u8> {
    let mut pem = key.private_key_to_pem_pkcs8().unwrap();
    pem.extend_from_slice(&leaf.to_pem().unwrap());
    pem.extend_from_slice(&ca.to_pem().unwrap());
    pem
}

/// Poll until `ready` returns true or the timeout expires. The event
/// delivery thread is asynchronous, so tests wait rather than assume.
pub fn wait_until(ready: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for events");
        std::thread::sleep(Duration::from_millis(10));
    }
}
