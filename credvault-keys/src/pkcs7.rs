//! PKCS7 envelope processing.
//!
//! Builds, reads and verifies signed and enveloped messages on top of the
//! certificate model and key engine. An envelope moves through an explicit
//! state machine:
//!
//! ```text
//! Empty -> PreparedSign | PreparedEncrypt -> Finalized -> Serialized
//! ```
//!
//! Preparing records the signer or recipient set; the actual cryptographic
//! computation is deferred until [`Pkcs7Envelope::finalize`]. Operations
//! attempted from the wrong state fail with `InvalidArgument` and leave the
//! envelope unchanged. Envelopes obtained from `read_der`/`read_smime` enter
//! the state machine at `Finalized`.

use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;

use crate::certificate::CertificateInfo;
use crate::cipher::{Digest, KeyHandle};
use crate::error::{CredError, Result};
use crate::types::{Credential, PrivateKeyRecord, SymmetricCipher};

/// PKCS7 content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Data,
    SignedData,
    EnvelopedData,
    SignedAndEnveloped,
    DigestData,
    EncryptedData,
}

/// Observable state of an envelope, see the module docs for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    Empty,
    PreparedSign,
    PreparedEncrypt,
    Finalized,
    Serialized,
}

enum Body {
    Empty,
    PendingSign {
        cert: X509,
        key: PKey<Private>,
        aux: Vec<X509>,
        digest: Digest,
    },
    PendingEncrypt {
        recipients: Vec<X509>,
        cipher: SymmetricCipher,
    },
    Ready(Pkcs7),
}

/// A parsed or constructed PKCS7 structure.
pub struct Pkcs7Envelope {
    body: Body,
    state: EnvelopeState,
}

impl Pkcs7Envelope {
    /// Create an empty envelope ready for [`add_signer`](Self::add_signer)
    /// or [`encrypt_for`](Self::encrypt_for).
    pub fn new() -> Self {
        Self {
            body: Body::Empty,
            state: EnvelopeState::Empty,
        }
    }

    /// Deserialize ASN.1/DER encoded PKCS7 content.
    pub fn read_der(der: &[u8]) -> Result<Self> {
        let pkcs7 = Pkcs7::from_der(der)
            .map_err(|e| CredError::InvalidArgument(format!("failed to parse PKCS7: {e}")))?;
        Ok(Self {
            body: Body::Ready(pkcs7),
            state: EnvelopeState::Finalized,
        })
    }

    /// Deserialize an S/MIME message.
    ///
    /// If cleartext signing was used the content is returned alongside the
    /// envelope, otherwise `None`.
    pub fn read_smime(message: &[u8]) -> Result<(Self, Option<Vec<u8>>)> {
        let (pkcs7, cleartext) = Pkcs7::from_smime(message)
            .map_err(|e| CredError::InvalidArgument(format!("failed to parse S/MIME: {e}")))?;
        Ok((
            Self {
                body: Body::Ready(pkcs7),
                state: EnvelopeState::Finalized,
            },
            cleartext,
        ))
    }

    /// The envelope's current state.
    pub fn state(&self) -> EnvelopeState {
        self.state
    }

    /// The content type of a finalized or parsed envelope.
    pub fn content_type(&self) -> Result<ContentType> {
        let pkcs7 = self.ready()?;
        let nid = pkcs7.type_().map(|t| t.nid());
        Ok(match nid {
            Some(Nid::PKCS7_SIGNED) => ContentType::SignedData,
            Some(Nid::PKCS7_ENVELOPED) => ContentType::EnvelopedData,
            Some(Nid::PKCS7_SIGNEDANDENVELOPED) => ContentType::SignedAndEnveloped,
            Some(Nid::PKCS7_DIGEST) => ContentType::DigestData,
            Some(Nid::PKCS7_ENCRYPTED) => ContentType::EncryptedData,
            _ => ContentType::Data,
        })
    }

    /// Record signer information for deferred signing.
    ///
    /// Only valid on an empty envelope. The signature itself is computed by
    /// [`finalize`](Self::finalize).
    pub fn add_signer(
        &mut self,
        signer: &Credential,
        aux: &[CertificateInfo],
        digest: Digest,
    ) -> Result<()> {
        self.expect_state(EnvelopeState::Empty)?;
        let key = match &signer.key {
            PrivateKeyRecord::Stored(der) => PKey::private_key_from_pkcs8(der)
                .map_err(|e| CredError::InvalidArgument(format!("bad signing key: {e}")))?,
            PrivateKeyRecord::DeviceResident { alias } => {
                return Err(CredError::General(format!(
                    "signing key '{alias}' is resident in the device keystore"
                )))
            }
        };
        let cert = X509::from_der(signer.leaf.der())?;
        let mut aux_certs = Vec::with_capacity(aux.len() + signer.aux.len());
        for info in signer.aux.iter().chain(aux.iter()) {
            aux_certs.push(X509::from_der(info.der())?);
        }
        self.body = Body::PendingSign {
            cert,
            key,
            aux: aux_certs,
            digest,
        };
        self.state = EnvelopeState::PreparedSign;
        Ok(())
    }

    /// Record a recipient list and content cipher for deferred enveloping.
    ///
    /// Only valid on an empty envelope.
    pub fn encrypt_for(
        &mut self,
        recipients: &[CertificateInfo],
        cipher: SymmetricCipher,
    ) -> Result<()> {
        self.expect_state(EnvelopeState::Empty)?;
        if recipients.is_empty() {
            return Err(CredError::InvalidArgument(
                "at least one recipient certificate is required".to_string(),
            ));
        }
        let mut certs = Vec::with_capacity(recipients.len());
        for info in recipients {
            certs.push(X509::from_der(info.der())?);
        }
        self.body = Body::PendingEncrypt {
            recipients: certs,
            cipher,
        };
        self.state = EnvelopeState::PreparedEncrypt;
        Ok(())
    }

    /// Trigger the deferred computation over `content`, producing a
    /// finalized signedData or envelopedData structure.
    pub fn finalize(&mut self, content: &[u8]) -> Result<()> {
        let pkcs7 = match &self.body {
            Body::PendingSign {
                cert, key, aux, ..
            } => {
                let mut stack = Stack::new()?;
                for c in aux {
                    stack.push(c.clone())?;
                }
                Pkcs7::sign(cert, key, &stack, content, Pkcs7Flags::BINARY)
                    .map_err(|e| CredError::General(format!("signing failed: {e}")))?
            }
            Body::PendingEncrypt { recipients, cipher } => {
                let mut stack = Stack::new()?;
                for c in recipients {
                    stack.push(c.clone())?;
                }
                Pkcs7::encrypt(&stack, content, cipher.to_openssl(), Pkcs7Flags::BINARY)
                    .map_err(|e| CredError::General(format!("enveloping failed: {e}")))?
            }
            Body::Empty | Body::Ready(_) => {
                return Err(CredError::InvalidArgument(format!(
                    "cannot finalize an envelope in state {:?}",
                    self.state
                )))
            }
        };
        self.body = Body::Ready(pkcs7);
        self.state = EnvelopeState::Finalized;
        Ok(())
    }

    /// Verify a signedData envelope.
    ///
    /// The signer's certificate is located inside `certs` and checked for
    /// consistency with the signature; the embedded signer claim is not
    /// trusted on its own. When `anchors` is `None` no chain evaluation is
    /// performed, only signature verification against the supplied set.
    /// `detached` supplies the content for detached signatures; the verified
    /// content is appended to `out` when provided.
    ///
    /// Returns `Ok(false)` when verification fails: a trusted negative that
    /// must gate a reject decision, sharply distinct from an `Err` fault.
    pub fn verify(
        &self,
        certs: &[CertificateInfo],
        anchors: Option<&[CertificateInfo]>,
        detached: Option<&[u8]>,
        out: Option<&mut Vec<u8>>,
    ) -> Result<bool> {
        let pkcs7 = self.ready()?;
        if self.content_type()? != ContentType::SignedData {
            return Err(CredError::InvalidArgument(
                "envelope is not signedData".to_string(),
            ));
        }

        let mut cert_stack = Stack::new()?;
        for info in certs {
            cert_stack.push(X509::from_der(info.der())?)?;
        }

        let mut store_builder = X509StoreBuilder::new()?;
        let mut flags = Pkcs7Flags::BINARY | Pkcs7Flags::NOINTERN;
        match anchors {
            Some(anchors) => {
                for info in anchors {
                    store_builder.add_cert(X509::from_der(info.der())?)?;
                }
            }
            None => {
                // No trust anchors supplied: signature-only verification.
                flags |= Pkcs7Flags::NOVERIFY;
            }
        }
        let store = store_builder.build();

        // Structural misuse was rejected above, so a failure here is the
        // untrusted-input verdict, not a fault to propagate.
        match pkcs7.verify(&cert_stack, &store, detached, out, flags) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Retrieve the signer certificates of a signedData envelope.
    pub fn signers(&self) -> Result<Vec<CertificateInfo>> {
        let pkcs7 = self.ready()?;
        if self.content_type()? != ContentType::SignedData {
            return Err(CredError::InvalidArgument(
                "envelope is not signedData".to_string(),
            ));
        }
        let empty = Stack::new()?;
        let stack = pkcs7
            .signers(&empty, Pkcs7Flags::empty())
            .map_err(|e| CredError::General(format!("failed to extract signers: {e}")))?;
        let mut out = Vec::with_capacity(stack.len());
        for cert in stack.iter() {
            out.push(CertificateInfo::from_der(cert.to_der()?)?);
        }
        Ok(out)
    }

    /// Decrypt an envelopedData structure with the recipient's private key.
    pub fn decrypt(&self, key: &KeyHandle, recipient: &CertificateInfo) -> Result<Vec<u8>> {
        let pkcs7 = self.ready()?;
        if self.content_type()? != ContentType::EnvelopedData {
            return Err(CredError::InvalidArgument(
                "envelope is not envelopedData".to_string(),
            ));
        }
        if !key.has_private() {
            return Err(CredError::InvalidArgument(
                "decryption requires a private key".to_string(),
            ));
        }
        let pkey = key.private_pkey()?;
        let cert = X509::from_der(recipient.der())?;
        pkcs7
            .decrypt(pkey, &cert, Pkcs7Flags::BINARY)
            .map_err(|e| CredError::General(format!("decryption failed: {e}")))
    }

    /// Serialize to ASN.1/DER encoding.
    pub fn write_der(&mut self) -> Result<Vec<u8>> {
        let der = self.ready()?.to_der()?;
        self.state = EnvelopeState::Serialized;
        Ok(der)
    }

    /// Serialize to an S/MIME message. `content` is consulted for detached
    /// or streamed payloads and may be empty otherwise.
    pub fn write_smime(&mut self, content: &[u8]) -> Result<Vec<u8>> {
        let message = self.ready()?.to_smime(content, Pkcs7Flags::BINARY)?;
        self.state = EnvelopeState::Serialized;
        Ok(message)
    }

    fn ready(&self) -> Result<&Pkcs7> {
        match &self.body {
            Body::Ready(p) => Ok(p),
            _ => Err(CredError::InvalidArgument(format!(
                "operation requires a finalized envelope, state is {:?}",
                self.state
            ))),
        }
    }

    fn expect_state(&self, expected: EnvelopeState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CredError::InvalidArgument(format!(
                "operation valid in state {:?}, envelope is {:?}",
                expected, self.state
            )))
        }
    }
}

impl std::fmt::Debug for Pkcs7Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs7Envelope")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for Pkcs7Envelope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn empty_envelope_rejects_out_of_order_operations() {
        let mut env = Pkcs7Envelope::new();
        assert_eq!(env.state(), EnvelopeState::Empty);

        let err = env.finalize(b"content").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = env.write_der().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = env.verify(&[], None, None, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        // Failed operations must leave the state machine unchanged.
        assert_eq!(env.state(), EnvelopeState::Empty);
    }

    #[test]
    fn garbage_der_is_invalid_argument() {
        let err = Pkcs7Envelope::read_der(&[0x30, 0x03, 0x01, 0x02, 0x03]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }
}
