//! Core value types for the CredVault secure store.

use serde::{Deserialize, Serialize};

use crate::certificate::CertificateInfo;

/// Stable external key for a credential: the leaf certificate's issuer
/// distinguished name plus its serial number (capital hex, no separators).
/// Lookups are exact and case-sensitive on both fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialId {
    pub issuer: String,
    pub serial: String,
}

impl CredentialId {
    pub fn new(issuer: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            serial: serial.into(),
        }
    }
}

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.issuer, self.serial)
    }
}

/// Where a credential's private key material lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivateKeyRecord {
    /// PKCS#8 DER held inside the secure store.
    Stored(Vec<u8>),
    /// Resident in the OS-native keystore, referenced by alias. Removal from
    /// the secure store only unlinks such a key; the device copy remains.
    DeviceResident { alias: String },
}

impl PrivateKeyRecord {
    pub fn is_device_resident(&self) -> bool {
        matches!(self, PrivateKeyRecord::DeviceResident { .. })
    }
}

/// One leaf certificate, its ordered auxiliary (intermediate) certificates,
/// and the associated private key. A credential is always imported and
/// removed as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// The leaf, or user, certificate. Exactly one per credential.
    pub leaf: CertificateInfo,
    /// Auxiliary intermediate certificates, in bundle order. May be empty.
    pub aux: Vec<CertificateInfo>,
    /// The private key matching the leaf certificate's public key.
    pub key: PrivateKeyRecord,
}

impl Credential {
    /// The stable external identifier of this credential.
    pub fn id(&self) -> CredentialId {
        CredentialId::new(self.leaf.issuer(), self.leaf.serial())
    }
}

/// Symmetric content ciphers available for enveloped data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymmetricCipher {
    Aes128Cbc,
    Aes256Cbc,
    TripleDesCbc,
    /// Legacy cipher kept for interoperability with old bundles only.
    Rc2Cbc,
}

impl SymmetricCipher {
    pub(crate) fn to_openssl(self) -> openssl::symm::Cipher {
        use openssl::symm::Cipher;
        match self {
            SymmetricCipher::Aes128Cbc => Cipher::aes_128_cbc(),
            SymmetricCipher::Aes256Cbc => Cipher::aes_256_cbc(),
            SymmetricCipher::TripleDesCbc => Cipher::des_ede3_cbc(),
            SymmetricCipher::Rc2Cbc => Cipher::rc2_cbc(),
        }
    }

    /// Whether the cipher is acceptable under FIPS 140-2.
    pub fn fips_approved(self) -> bool {
        matches!(
            self,
            SymmetricCipher::Aes128Cbc | SymmetricCipher::Aes256Cbc | SymmetricCipher::TripleDesCbc
        )
    }
}
