//! Key and cipher engine.
//!
//! Wraps asymmetric primitives behind an opaque key handle plus an
//! operation-scoped context. A context is initialized for exactly one of
//! sign, verify, encrypt or decrypt; operations from the wrong state fail
//! with `InvalidArgument`. Contexts take `&mut self` for every call and are
//! not `Clone`, so exclusive single-threaded use is enforced by the borrow
//! checker rather than internal locking.
//!
//! Failure modes are kept distinct on purpose:
//! - `Ok(false)` from [`KeyContext::verify`] is a trusted negative result.
//!   The input must be rejected; this is not a fault to recover from.
//! - `Err(General)` covers operation failures such as bad padding.
//! - `Err(InvalidArgument)` covers caller contract violations.

use openssl::encrypt::{Decrypter, Encrypter};
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey, Private, Public};
use openssl::rsa::Padding;
use openssl::sign::{Signer, Verifier};
use openssl::x509::X509;

use crate::certificate::CertificateInfo;
use crate::error::{CredError, Result};
use crate::types::{Credential, PrivateKeyRecord};

/// Asymmetric key algorithm families supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Rsa,
    Ec,
}

/// The single operation a [`KeyContext`] may be initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Sign,
    Verify,
    Encrypt,
    Decrypt,
}

/// Message digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Digest {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl Digest {
    pub(crate) fn to_message_digest(self) -> MessageDigest {
        match self {
            Digest::Md5 => MessageDigest::md5(),
            Digest::Sha1 => MessageDigest::sha1(),
            Digest::Sha256 => MessageDigest::sha256(),
            Digest::Sha384 => MessageDigest::sha384(),
            Digest::Sha512 => MessageDigest::sha512(),
        }
    }

    /// Whether the digest is acceptable for signatures under FIPS 140-2.
    pub fn fips_approved(self) -> bool {
        matches!(self, Digest::Sha256 | Digest::Sha384 | Digest::Sha512)
    }
}

/// One-shot digest of a message.
pub fn digest(algorithm: Digest, data: &[u8]) -> Result<Vec<u8>> {
    let out = openssl::hash::hash(algorithm.to_message_digest(), data)?;
    Ok(out.to_vec())
}

enum KeyMaterial {
    Public(PKey<Public>),
    Private(PKey<Private>),
}

/// Opaque handle wrapping an RSA or EC key, public or private.
pub struct KeyHandle {
    material: KeyMaterial,
}

impl KeyHandle {
    /// Extract the public key from a certificate.
    pub fn public_from_certificate(cert: &CertificateInfo) -> Result<Self> {
        let x509 = X509::from_der(cert.der())?;
        let pkey = x509.public_key()?;
        Self::check_supported(pkey.id())?;
        Ok(Self {
            material: KeyMaterial::Public(pkey),
        })
    }

    /// Load a private key from PKCS#8 DER.
    pub fn private_from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let pkey = PKey::private_key_from_pkcs8(der)
            .map_err(|e| CredError::InvalidArgument(format!("failed to parse private key: {e}")))?;
        Self::check_supported(pkey.id())?;
        Ok(Self {
            material: KeyMaterial::Private(pkey),
        })
    }

    /// Load the private key held by a store credential.
    ///
    /// Device-resident keys are opaque references and cannot be materialized
    /// by this engine.
    pub fn private_from_credential(credential: &Credential) -> Result<Self> {
        match &credential.key {
            PrivateKeyRecord::Stored(der) => Self::private_from_pkcs8_der(der),
            PrivateKeyRecord::DeviceResident { alias } => Err(CredError::General(format!(
                "private key '{alias}' is resident in the device keystore"
            ))),
        }
    }

    fn check_supported(id: Id) -> Result<()> {
        match id {
            Id::RSA | Id::EC => Ok(()),
            other => Err(CredError::InvalidArgument(format!(
                "unsupported key algorithm: {other:?}"
            ))),
        }
    }

    /// The key algorithm family.
    pub fn key_type(&self) -> KeyType {
        let id = match &self.material {
            KeyMaterial::Public(k) => k.id(),
            KeyMaterial::Private(k) => k.id(),
        };
        match id {
            Id::RSA => KeyType::Rsa,
            _ => KeyType::Ec,
        }
    }

    /// Key size in bits.
    pub fn bits(&self) -> u32 {
        match &self.material {
            KeyMaterial::Public(k) => k.bits(),
            KeyMaterial::Private(k) => k.bits(),
        }
    }

    /// Maximum size in bytes of an ASN.1 encoded signature produced with
    /// this key. Callers sizing buffers ahead of a sign call can use this.
    pub fn max_signature_len(&self) -> usize {
        match &self.material {
            KeyMaterial::Public(k) => k.size(),
            KeyMaterial::Private(k) => k.size(),
        }
    }

    /// Whether the handle carries private key material.
    pub fn has_private(&self) -> bool {
        matches!(self.material, KeyMaterial::Private(_))
    }

    pub(crate) fn private_pkey(&self) -> Result<&PKey<Private>> {
        match &self.material {
            KeyMaterial::Private(k) => Ok(k),
            KeyMaterial::Public(_) => Err(CredError::InvalidArgument(
                "operation requires a private key".to_string(),
            )),
        }
    }
}

/// Operation-scoped context over a [`KeyHandle`].
///
/// Not `Clone` and all operations take `&mut self`: a context must not be
/// shared across threads, and the type system makes concurrent use of one
/// context impossible without external synchronization.
pub struct KeyContext {
    key: KeyHandle,
    operation: Option<Operation>,
    digest: Digest,
}

impl KeyContext {
    pub fn new(key: KeyHandle) -> Self {
        Self {
            key,
            operation: None,
            digest: Digest::Sha256,
        }
    }

    /// Set the message digest used when calculating or verifying signatures.
    pub fn set_digest(&mut self, digest: Digest) {
        self.digest = digest;
    }

    /// The digest currently configured for signatures.
    pub fn signature_digest(&self) -> Digest {
        self.digest
    }

    /// The key handle this context operates on.
    pub fn key(&self) -> &KeyHandle {
        &self.key
    }

    /// Initialize the context for exactly one operation.
    pub fn init(&mut self, operation: Operation) -> Result<()> {
        match operation {
            Operation::Sign | Operation::Decrypt => {
                // Fails early so the operation calls can't be reached with a
                // public-only handle.
                self.key.private_pkey()?;
            }
            Operation::Verify | Operation::Encrypt => {}
        }
        self.operation = Some(operation);
        Ok(())
    }

    fn check_initialized(&self, expected: Operation) -> Result<()> {
        match self.operation {
            Some(op) if op == expected => Ok(()),
            Some(op) => Err(CredError::InvalidArgument(format!(
                "context initialized for {op:?}, not {expected:?}"
            ))),
            None => Err(CredError::InvalidArgument(
                "context not initialized".to_string(),
            )),
        }
    }

    /// Sign a message, returning the ASN.1 DER encoded signature.
    ///
    /// The message is digested with the configured algorithm as part of the
    /// signature computation.
    pub fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.check_initialized(Operation::Sign)?;
        let pkey = self.key.private_pkey()?;
        let mut signer = Signer::new(self.digest.to_message_digest(), pkey)?;
        signer.update(message)?;
        Ok(signer.sign_to_vec()?)
    }

    /// Verify a signature over a message.
    ///
    /// Returns `Ok(false)` when the signature does not match: this is an
    /// expected outcome that must drive a reject decision, not an error.
    /// Hard faults (malformed key, unsupported digest) return `Err`.
    pub fn verify(&mut self, message: &[u8], signature: &[u8]) -> Result<bool> {
        self.check_initialized(Operation::Verify)?;
        let md = self.digest.to_message_digest();
        let matched = match &self.key.material {
            KeyMaterial::Public(k) => {
                let mut verifier = Verifier::new(md, k)?;
                verifier.update(message)?;
                verifier.verify(signature)?
            }
            KeyMaterial::Private(k) => {
                let mut verifier = Verifier::new(md, k)?;
                verifier.update(message)?;
                verifier.verify(signature)?
            }
        };
        Ok(matched)
    }

    /// Required output capacity for encrypting `plaintext`.
    pub fn encrypted_len(&mut self, plaintext: &[u8]) -> Result<usize> {
        self.check_initialized(Operation::Encrypt)?;
        match &self.key.material {
            KeyMaterial::Public(k) => {
                let mut enc = Encrypter::new(k)?;
                configure_rsa_padding_enc(&mut enc, self.key.key_type())?;
                Ok(enc.encrypt_len(plaintext)?)
            }
            KeyMaterial::Private(k) => {
                let mut enc = Encrypter::new(k)?;
                configure_rsa_padding_enc(&mut enc, self.key.key_type())?;
                Ok(enc.encrypt_len(plaintext)?)
            }
        }
    }

    /// Encrypt data with the public half of the key.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check_initialized(Operation::Encrypt)?;
        match &self.key.material {
            KeyMaterial::Public(k) => {
                let mut enc = Encrypter::new(k)?;
                configure_rsa_padding_enc(&mut enc, self.key.key_type())?;
                run_encrypt(&enc, plaintext)
            }
            KeyMaterial::Private(k) => {
                let mut enc = Encrypter::new(k)?;
                configure_rsa_padding_enc(&mut enc, self.key.key_type())?;
                run_encrypt(&enc, plaintext)
            }
        }
    }

    /// Decrypt data with the private key.
    ///
    /// A padding failure surfaces as `General`: an operation failure, not a
    /// security verdict.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_initialized(Operation::Decrypt)?;
        let pkey = self.key.private_pkey()?;
        let mut dec = Decrypter::new(pkey)?;
        if self.key.key_type() == KeyType::Rsa {
            dec.set_rsa_padding(Padding::PKCS1)?;
        }
        let buffer_len = dec.decrypt_len(ciphertext)?;
        let mut out = vec![0u8; buffer_len];
        let written = dec
            .decrypt(ciphertext, &mut out)
            .map_err(|e| CredError::General(format!("decrypt operation failed: {e}")))?;
        out.truncate(written);
        Ok(out)
    }
}

fn configure_rsa_padding_enc(enc: &mut Encrypter<'_>, key_type: KeyType) -> Result<()> {
    if key_type == KeyType::Rsa {
        enc.set_rsa_padding(Padding::PKCS1)?;
    }
    Ok(())
}

fn run_encrypt(enc: &Encrypter<'_>, plaintext: &[u8]) -> Result<Vec<u8>> {
    // Two-phase size-then-fill, as the underlying API requires.
    let buffer_len = enc.encrypt_len(plaintext)?;
    let mut out = vec![0u8; buffer_len];
    let written = enc
        .encrypt(plaintext, &mut out)
        .map_err(|e| CredError::General(format!("encrypt operation failed: {e}")))?;
    out.truncate(written);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use openssl::rsa::Rsa;

    fn rsa_private_handle() -> KeyHandle {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();
        let pkcs8 = pkey.private_key_to_pkcs8().unwrap();
        KeyHandle::private_from_pkcs8_der(&pkcs8).unwrap()
    }

    #[test]
    fn sign_then_verify() {
        let handle = rsa_private_handle();
        let pkcs8 = match &handle.material {
            KeyMaterial::Private(k) => k.private_key_to_pkcs8().unwrap(),
            _ => unreachable!(),
        };

        let mut signer = KeyContext::new(handle);
        signer.init(Operation::Sign).unwrap();
        let signature = signer.sign(b"the message").unwrap();
        assert!(signature.len() <= signer.key().max_signature_len());

        let mut verifier = KeyContext::new(KeyHandle::private_from_pkcs8_der(&pkcs8).unwrap());
        verifier.init(Operation::Verify).unwrap();
        assert!(verifier.verify(b"the message", &signature).unwrap());
    }

    #[test]
    fn verify_mismatch_is_false_not_error() {
        let handle = rsa_private_handle();
        let mut ctx = KeyContext::new(handle);
        ctx.init(Operation::Sign).unwrap();
        let mut signature = ctx.sign(b"payload").unwrap();

        // Flip one bit; the result must be a trusted negative, not a fault.
        signature[0] ^= 0x01;
        ctx.init(Operation::Verify).unwrap();
        assert!(!ctx.verify(b"payload", &signature).unwrap());
    }

    #[test]
    fn wrong_operation_is_invalid_argument() {
        let mut ctx = KeyContext::new(rsa_private_handle());
        ctx.init(Operation::Sign).unwrap();
        let err = ctx.verify(b"m", b"sig").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let mut uninit = KeyContext::new(rsa_private_handle());
        let err = uninit.sign(b"m").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let mut ctx = KeyContext::new(rsa_private_handle());
        ctx.init(Operation::Encrypt).unwrap();
        let needed = ctx.encrypted_len(b"secret payload").unwrap();
        let ciphertext = ctx.encrypt(b"secret payload").unwrap();
        assert!(ciphertext.len() <= needed);

        ctx.init(Operation::Decrypt).unwrap();
        assert_eq!(ctx.decrypt(&ciphertext).unwrap(), b"secret payload");
    }

    #[test]
    fn public_handle_cannot_sign() {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();
        let public_der = pkey.public_key_to_der().unwrap();
        let public = PKey::public_key_from_der(&public_der).unwrap();
        let handle = KeyHandle {
            material: KeyMaterial::Public(public),
        };
        let mut ctx = KeyContext::new(handle);
        assert!(ctx.init(Operation::Sign).is_err());
    }
}
