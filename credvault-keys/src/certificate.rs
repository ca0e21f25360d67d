//! X.509 certificate model.
//!
//! Parses DER-encoded certificates into a value type carrying the derived
//! fields the rest of the system keys on (issuer, subject, serial, hashes,
//! validity, usage). Derived fields are a pure function of the DER bytes;
//! the original encoding is kept verbatim so serialization is lossless.

use serde::{Deserialize, Serialize};

use openssl::hash::{hash, MessageDigest};
use openssl::x509::X509;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::error::{CredError, Result};

/// Fixed renewal-due offset: a certificate becomes due for renewal this many
/// days before its notAfter date. The renewal date is not part of the X.509
/// certificate itself.
pub const RENEWAL_WINDOW_DAYS: i64 = 30;

const SECONDS_PER_DAY: i64 = 86_400;

/// Parsed X.509 public key certificate.
///
/// Field formats follow the external contract: distinguished names are
/// rendered as comma-separated RDN sequences ("C=NO, O=Green AS, CN=..."),
/// serial numbers and hashes as capital hex with no separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    der: Vec<u8>,
    issuer: String,
    subject: String,
    subject_alternative_name: String,
    serial: String,
    public_key_md5: String,
    public_key_sha1: String,
    certificate_md5: String,
    certificate_sha1: String,
    not_before: i64,
    not_after: i64,
    key_usage: String,
    extended_key_usage: String,
    alias: Option<String>,
}

impl CertificateInfo {
    /// Parse a DER-encoded certificate.
    ///
    /// Deterministic: the same bytes always yield identical derived fields.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let (rem, parsed) = x509_parser::certificate::X509Certificate::from_der(&der)
            .map_err(|e| CredError::InvalidArgument(format!("failed to parse certificate: {e}")))?;
        if !rem.is_empty() {
            return Err(CredError::InvalidArgument(
                "trailing data after certificate".to_string(),
            ));
        }

        let issuer = parsed.issuer().to_string();
        let subject = parsed.subject().to_string();
        let serial = hex::encode(parsed.raw_serial()).to_uppercase();

        let spki: &[u8] = parsed.public_key().subject_public_key.data.as_ref();
        let public_key_md5 = hex_digest(MessageDigest::md5(), spki)?;
        let public_key_sha1 = hex_digest(MessageDigest::sha1(), spki)?;
        let certificate_md5 = hex_digest(MessageDigest::md5(), &der)?;
        let certificate_sha1 = hex_digest(MessageDigest::sha1(), &der)?;

        let not_before = parsed.validity().not_before.timestamp();
        let not_after = parsed.validity().not_after.timestamp();

        let mut subject_alternative_name = String::new();
        let mut key_usage = String::new();
        let mut extended_key_usage = String::new();
        for ext in parsed.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::SubjectAlternativeName(san) => {
                    subject_alternative_name = format_general_names(&san.general_names);
                }
                ParsedExtension::KeyUsage(ku) => {
                    key_usage = format_key_usage(ku);
                }
                ParsedExtension::ExtendedKeyUsage(eku) => {
                    extended_key_usage = format_extended_key_usage(eku);
                }
                _ => {}
            }
        }

        Ok(Self {
            der,
            issuer,
            subject,
            subject_alternative_name,
            serial,
            public_key_md5,
            public_key_sha1,
            certificate_md5,
            certificate_sha1,
            not_before,
            not_after,
            key_usage,
            extended_key_usage,
            alias: None,
        })
    }

    /// Parse a certificate and record the alias it carries in an external
    /// (device) keystore.
    pub fn from_der_with_alias(der: Vec<u8>, alias: impl Into<String>) -> Result<Self> {
        let mut info = Self::from_der(der)?;
        info.alias = Some(alias.into());
        Ok(info)
    }

    /// Original DER bytes, byte-identical to what was parsed.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// X.509 Issuer distinguished name.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// X.509 Subject distinguished name.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// X.509 Subject Alternative Name, empty if absent.
    pub fn subject_alternative_name(&self) -> &str {
        &self.subject_alternative_name
    }

    /// Serial number in capital hex with no separators, e.g. "1F2B3C4D5E6F".
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// MD5 hash of the public key, 32 capital hex characters.
    pub fn public_key_md5(&self) -> &str {
        &self.public_key_md5
    }

    /// SHA-1 hash of the public key, 40 capital hex characters.
    pub fn public_key_sha1(&self) -> &str {
        &self.public_key_sha1
    }

    /// MD5 hash of the whole certificate.
    pub fn certificate_md5(&self) -> &str {
        &self.certificate_md5
    }

    /// SHA-1 hash of the whole certificate.
    pub fn certificate_sha1(&self) -> &str {
        &self.certificate_sha1
    }

    /// Validity: Not Before, as seconds since the Unix epoch.
    pub fn not_before(&self) -> i64 {
        self.not_before
    }

    /// Validity: Not After, as seconds since the Unix epoch.
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    /// Intended key usage attributes, empty if the extension is absent.
    pub fn key_usage(&self) -> &str {
        &self.key_usage
    }

    /// Intended extended key usage attributes, empty if absent.
    pub fn extended_key_usage(&self) -> &str {
        &self.extended_key_usage
    }

    /// Alias of the certificate if it is resident in a device keystore.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Whether `at` (Unix seconds) falls within [notBefore, notAfter].
    pub fn is_valid_at(&self, at: i64) -> bool {
        at >= self.not_before && at <= self.not_after
    }

    /// Whether the system time falls within the validity window.
    pub fn is_valid_now(&self) -> bool {
        self.is_valid_at(unix_now())
    }

    /// Whole days until expiry relative to `at`. Zero the instant notAfter
    /// passes, negative afterwards.
    pub fn days_until_expiry_at(&self, at: i64) -> i64 {
        (self.not_after - at).div_euclid(SECONDS_PER_DAY)
    }

    /// Whole days until expiry relative to the system time.
    pub fn days_until_expiry(&self) -> i64 {
        self.days_until_expiry_at(unix_now())
    }

    /// Whole days until the certificate is due for renewal relative to `at`.
    /// Zero exactly [`RENEWAL_WINDOW_DAYS`] days before notAfter, negative
    /// once overdue.
    pub fn days_until_renewal_due_at(&self, at: i64) -> i64 {
        (self.not_after - RENEWAL_WINDOW_DAYS * SECONDS_PER_DAY - at).div_euclid(SECONDS_PER_DAY)
    }

    /// Whole days until renewal is due relative to the system time.
    pub fn days_until_renewal_due(&self) -> i64 {
        self.days_until_renewal_due_at(unix_now())
    }

    /// Extract a relative name component from the issuer distinguished name.
    pub fn issuer_relative_name(&self, short_code: &str) -> String {
        relative_name(&self.issuer, short_code)
    }

    /// Extract a relative name component from the subject distinguished name.
    pub fn subject_relative_name(&self, short_code: &str) -> String {
        relative_name(&self.subject, short_code)
    }
}

impl Serialize for CertificateInfo {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Derived fields are a pure function of the DER, so the DER (plus the
        // external alias, which is not part of the encoding) is the canonical
        // persisted form.
        (&self.der, &self.alias).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CertificateInfo {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (der, alias): (Vec<u8>, Option<String>) = Deserialize::deserialize(deserializer)?;
        let mut info = Self::from_der(der)
            .map_err(|e| serde::de::Error::custom(format!("failed to deserialize certificate: {e}")))?;
        info.alias = alias;
        Ok(info)
    }
}

/// Extract a relative name component (e.g. "CN") from a formatted
/// distinguished name string.
///
/// Returns an empty string if the component is absent; never errors. The
/// short code comparison is case-sensitive, matching the DN rendering used
/// throughout this crate.
pub fn relative_name(dn: &str, short_code: &str) -> String {
    for component in dn.split(',') {
        let component = component.trim();
        if let Some((key, value)) = component.split_once('=') {
            if key.trim() == short_code {
                return value.trim().to_string();
            }
        }
    }
    String::new()
}

/// Read a list of certificates from a PEM container. Non-certificate PEM
/// blocks are ignored.
pub fn certificates_from_pem(pem: &[u8]) -> Result<Vec<CertificateInfo>> {
    let stack = X509::stack_from_pem(pem)
        .map_err(|e| CredError::InvalidArgument(format!("failed to read PEM container: {e}")))?;
    let mut certs = Vec::with_capacity(stack.len());
    for cert in stack {
        certs.push(CertificateInfo::from_der(cert.to_der()?)?);
    }
    Ok(certs)
}

pub(crate) fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn hex_digest(md: MessageDigest, data: &[u8]) -> Result<String> {
    let digest = hash(md, data)?;
    Ok(hex::encode(digest).to_uppercase())
}

fn format_general_names(names: &[GeneralName]) -> String {
    let mut parts = Vec::with_capacity(names.len());
    for name in names {
        match name {
            GeneralName::DNSName(dns) => parts.push(format!("DNS:{dns}")),
            GeneralName::RFC822Name(email) => parts.push(format!("email:{email}")),
            GeneralName::URI(uri) => parts.push(format!("URI:{uri}")),
            GeneralName::IPAddress(ip) => {
                if ip.len() == 4 {
                    parts.push(format!("IP:{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]));
                } else {
                    parts.push(format!("IP:{}", hex::encode(ip).to_uppercase()));
                }
            }
            GeneralName::DirectoryName(dir) => parts.push(format!("DirName:{dir}")),
            _ => {}
        }
    }
    parts.join(", ")
}

fn format_key_usage(ku: &x509_parser::extensions::KeyUsage) -> String {
    let mut parts = Vec::new();
    if ku.digital_signature() {
        parts.push("digitalSignature");
    }
    if ku.non_repudiation() {
        parts.push("nonRepudiation");
    }
    if ku.key_encipherment() {
        parts.push("keyEncipherment");
    }
    if ku.data_encipherment() {
        parts.push("dataEncipherment");
    }
    if ku.key_agreement() {
        parts.push("keyAgreement");
    }
    if ku.key_cert_sign() {
        parts.push("keyCertSign");
    }
    if ku.crl_sign() {
        parts.push("cRLSign");
    }
    if ku.encipher_only() {
        parts.push("encipherOnly");
    }
    if ku.decipher_only() {
        parts.push("decipherOnly");
    }
    parts.join(",")
}

fn format_extended_key_usage(eku: &x509_parser::extensions::ExtendedKeyUsage) -> String {
    let mut parts = Vec::new();
    if eku.any {
        parts.push("anyExtendedKeyUsage");
    }
    if eku.server_auth {
        parts.push("serverAuth");
    }
    if eku.client_auth {
        parts.push("clientAuth");
    }
    if eku.code_signing {
        parts.push("codeSigning");
    }
    if eku.email_protection {
        parts.push("emailProtection");
    }
    if eku.time_stamping {
        parts.push("timeStamping");
    }
    if eku.ocsp_signing {
        parts.push("OCSPSigning");
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn test_cert(not_before: i64, not_after: i64) -> CertificateInfo {
        let mut params = rcgen::CertificateParams::new(vec!["unit.example.com".to_string()]);
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Unit Test Leaf");
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, "CredVault");
        params
            .distinguished_name
            .push(rcgen::DnType::CountryName, "US");
        params.not_before = (UNIX_EPOCH + Duration::from_secs(not_before as u64)).into();
        params.not_after = (UNIX_EPOCH + Duration::from_secs(not_after as u64)).into();

        let cert = rcgen::Certificate::from_params(params).expect("generate certificate");
        CertificateInfo::from_der(cert.serialize_der().expect("serialize")).expect("parse")
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn derived_fields_from_der() {
        let now = now_secs();
        let cert = test_cert(now - 1000, now + 90 * 86_400);

        assert_eq!(cert.subject_relative_name("CN"), "Unit Test Leaf");
        assert_eq!(cert.subject_relative_name("O"), "CredVault");
        assert!(cert.subject_alternative_name().contains("DNS:unit.example.com"));
        assert_eq!(cert.public_key_md5().len(), 32);
        assert_eq!(cert.public_key_sha1().len(), 40);
        assert_eq!(cert.certificate_md5().len(), 32);
        assert_eq!(cert.certificate_sha1().len(), 40);
        assert!(!cert.serial().is_empty());
        assert_eq!(cert.serial(), cert.serial().to_uppercase());
        assert!(cert.is_valid_now());
    }

    #[test]
    fn der_round_trip_is_lossless() {
        let now = now_secs();
        let cert = test_cert(now - 10, now + 86_400);
        let der = cert.der().to_vec();
        let reparsed = CertificateInfo::from_der(der.clone()).unwrap();
        assert_eq!(reparsed.der(), der.as_slice());
        assert_eq!(reparsed, cert);
    }

    #[test]
    fn expiry_boundary() {
        let now = now_secs();
        let not_after = now + 60 * 86_400;
        let cert = test_cert(now - 10, not_after);

        assert_eq!(cert.days_until_expiry_at(not_after), 0);
        assert_eq!(cert.days_until_expiry_at(not_after + 1), -1);
        assert_eq!(cert.days_until_expiry_at(not_after - 86_400), 1);
        assert_eq!(cert.days_until_expiry_at(not_after - 1), 0);
    }

    #[test]
    fn renewal_due_boundary() {
        let now = now_secs();
        let not_after = now + 60 * 86_400;
        let cert = test_cert(now - 10, not_after);

        let renewal_instant = not_after - RENEWAL_WINDOW_DAYS * 86_400;
        assert_eq!(cert.days_until_renewal_due_at(renewal_instant), 0);
        assert_eq!(cert.days_until_renewal_due_at(renewal_instant + 1), -1);
        assert_eq!(cert.days_until_renewal_due_at(renewal_instant - 86_400), 1);
    }

    #[test]
    fn relative_name_extraction() {
        let dn = "C=U.S, OU=DoD, CN=DoD EMAIL CA";
        assert_eq!(relative_name(dn, "CN"), "DoD EMAIL CA");
        assert_eq!(relative_name(dn, "OU"), "DoD");
        assert_eq!(relative_name(dn, "C"), "U.S");
        assert_eq!(relative_name(dn, "L"), "");
        // Case-sensitive short codes.
        assert_eq!(relative_name(dn, "cn"), "");
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let now = now_secs();
        let cert = test_cert(now - 10, now + 86_400);
        let mut der = cert.der().to_vec();
        der.push(0x00);
        assert!(CertificateInfo::from_der(der).is_err());
    }
}
