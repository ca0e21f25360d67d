//! Service facade over the store, lifecycle, policy and crypto layers.
//!
//! `CredentialService` owns one secure container's credential machinery and
//! is the intended entry point for applications. It routes imports through
//! the profile mapper, announces lifecycle changes after commits, and gates
//! cryptographic choices through the policy layer before any key material
//! is touched.

use std::path::PathBuf;
use std::sync::Arc;

use credvault_common::{Component, Logger};

use crate::certificate::CertificateInfo;
use crate::cipher::{Digest, KeyContext, KeyHandle, Operation};
use crate::error::{CredError, Result};
use crate::pkcs7::Pkcs7Envelope;
use crate::policy::{PolicyGate, PolicySnapshot};
use crate::profile::{ProfileLifecycleManager, ProfileType};
use crate::store::{CredentialStore, ProfileRef};
use crate::types::{Credential, CredentialId, SymmetricCipher};

/// One secure container's credential service.
pub struct CredentialService {
    logger: Arc<Logger>,
    policy: Arc<PolicyGate>,
    lifecycle: Arc<ProfileLifecycleManager>,
    store: Arc<CredentialStore>,
}

impl CredentialService {
    /// Create a service for the container identified by `container_id`,
    /// with its encrypted store at `store_path` sealed under
    /// `master_secret`.
    pub fn new(
        container_id: &str,
        store_path: impl Into<PathBuf>,
        master_secret: &[u8],
    ) -> Result<Self> {
        let logger = Arc::new(Logger::new_root(Component::Service, container_id));
        let policy = Arc::new(PolicyGate::new(Arc::clone(&logger)));
        let lifecycle = Arc::new(ProfileLifecycleManager::new(&logger));
        let store = Arc::new(CredentialStore::open(
            store_path,
            master_secret,
            Arc::clone(&policy),
            &logger,
        )?);
        logger.info("credential service ready");
        Ok(Self {
            logger,
            policy,
            lifecycle,
            store,
        })
    }

    pub fn policy(&self) -> &PolicyGate {
        &self.policy
    }

    pub fn lifecycle(&self) -> &ProfileLifecycleManager {
        &self.lifecycle
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Apply a policy snapshot received from the management server.
    pub fn apply_policy(&self, snapshot: PolicySnapshot) {
        self.policy.apply(snapshot);
    }

    /// Stage a PKCS#12 bundle. The credential goes to the profile named by
    /// `profile`, or to the one whose mapping criteria accept the leaf when
    /// [`ProfileRef::Mapped`] is passed. Not yet durable; follow with
    /// [`import_done`] or [`undo_import`].
    ///
    /// [`import_done`]: Self::import_done
    /// [`undo_import`]: Self::undo_import
    pub fn import_pkcs12(
        &self,
        data: &[u8],
        password: &str,
        profile: ProfileRef<'_>,
    ) -> Result<(CredentialId, String)> {
        self.store
            .import_pkcs12(data, password, profile, self.lifecycle.as_ref())
    }

    /// Stage PEM-encoded certificates and key. See [`import_pkcs12`] for
    /// the two-phase protocol.
    ///
    /// [`import_pkcs12`]: Self::import_pkcs12
    pub fn import_pem(
        &self,
        pem: &[u8],
        password: Option<&str>,
        profile: ProfileRef<'_>,
    ) -> Result<(CredentialId, String)> {
        self.store
            .import_pem(pem, password, profile, self.lifecycle.as_ref())
    }

    /// Commit the staged import for a profile and announce the profile as
    /// imported. A no-op returning `None` when nothing is staged. When the
    /// profile can no longer accept the import, for example after a
    /// server-side deletion, the commit is rolled back so no orphaned
    /// credential stays behind.
    pub fn import_done(&self, profile_id: &str) -> Result<Option<Credential>> {
        match self.store.import_done(profile_id)? {
            Some(credential) => {
                if let Err(err) = self.lifecycle.mark_imported(profile_id) {
                    if self.store.remove(&credential.id()).is_err() {
                        self.logger.warn(format!(
                            "credential {} left behind after failed import of profile '{profile_id}'",
                            credential.id()
                        ));
                    }
                    return Err(err);
                }
                Ok(Some(credential))
            }
            None => Ok(None),
        }
    }

    /// Discard the staged import for a profile. The profile's state is
    /// untouched.
    pub fn undo_import(&self, profile_id: &str) -> Result<()> {
        self.store.undo_import(profile_id)
    }

    /// Look up a committed credential.
    pub fn find(&self, id: &CredentialId) -> Option<Credential> {
        self.store.find(id)
    }

    /// All committed credentials.
    pub fn list(&self) -> Vec<Credential> {
        self.store.list()
    }

    /// Remove a committed credential as a unit.
    pub fn remove(&self, id: &CredentialId) -> Result<()> {
        self.store.remove(id)
    }

    /// Handle a server-side profile deletion: the profile's credentials
    /// leave the store and the profile leaves the assigned set.
    pub fn delete_profile(&self, profile_id: &str) -> Result<()> {
        let removed = self.store.remove_for_profile(profile_id)?;
        if removed > 0 {
            self.logger.info(format!(
                "dropped {removed} credential(s) with deleted profile '{profile_id}'"
            ));
        }
        self.lifecycle.delete_profile(profile_id)
    }

    /// Sweep for credentials entering their renewal window or expiring
    /// without renewal, moving the owning profiles accordingly.
    pub fn evaluate_renewals(&self) -> Vec<String> {
        self.lifecycle.evaluate_renewals(&self.store)
    }

    /// Whether a reset of this profile type would remove anything.
    pub fn can_reset_type(&self, profile_type: ProfileType) -> bool {
        self.lifecycle.can_reset_type(profile_type, &self.store)
    }

    /// Destructive reset of a profile family: drops its managed
    /// credentials and returns each profile to `ImportDue`.
    pub fn reset_type(&self, profile_type: ProfileType) -> Result<usize> {
        self.lifecycle.reset_type(profile_type, &self.store)
    }

    /// Sign `data` with a stored credential's private key. The digest
    /// choice is policy-gated before the key is loaded.
    pub fn sign_data(&self, id: &CredentialId, data: &[u8], digest: Digest) -> Result<Vec<u8>> {
        self.policy.check_signature_digest(digest)?;
        let credential = self.credential(id)?;
        let mut ctx = KeyContext::new(KeyHandle::private_from_credential(&credential)?);
        ctx.set_digest(digest);
        ctx.init(Operation::Sign)?;
        ctx.sign(data)
    }

    /// Verify a signature against a certificate's public key. `Ok(false)`
    /// means the signature does not match.
    pub fn verify_data(
        &self,
        certificate: &CertificateInfo,
        data: &[u8],
        signature: &[u8],
        digest: Digest,
    ) -> Result<bool> {
        self.policy.check_signature_digest(digest)?;
        let mut ctx = KeyContext::new(KeyHandle::public_from_certificate(certificate)?);
        ctx.set_digest(digest);
        ctx.init(Operation::Verify)?;
        ctx.verify(data, signature)
    }

    /// Produce a DER-encoded signedData envelope over `content`, signed
    /// with a stored credential.
    pub fn sign_envelope(
        &self,
        id: &CredentialId,
        content: &[u8],
        digest: Digest,
    ) -> Result<Vec<u8>> {
        self.policy.check_signature_digest(digest)?;
        let credential = self.credential(id)?;
        let mut envelope = Pkcs7Envelope::new();
        envelope.add_signer(&credential, &[], digest)?;
        envelope.finalize(content)?;
        envelope.write_der()
    }

    /// Verify a DER-encoded signedData envelope. See
    /// [`Pkcs7Envelope::verify`] for the trust semantics.
    pub fn verify_envelope(
        &self,
        der: &[u8],
        certs: &[CertificateInfo],
        anchors: Option<&[CertificateInfo]>,
        detached: Option<&[u8]>,
    ) -> Result<bool> {
        let envelope = Pkcs7Envelope::read_der(der)?;
        envelope.verify(certs, anchors, detached, None)
    }

    /// Produce a DER-encoded envelopedData structure for `recipients`. The
    /// content cipher is policy-gated.
    pub fn encrypt_envelope(
        &self,
        recipients: &[CertificateInfo],
        cipher: SymmetricCipher,
        content: &[u8],
    ) -> Result<Vec<u8>> {
        self.policy.check_content_cipher(cipher)?;
        let mut envelope = Pkcs7Envelope::new();
        envelope.encrypt_for(recipients, cipher)?;
        envelope.finalize(content)?;
        envelope.write_der()
    }

    /// Decrypt a DER-encoded envelopedData structure with a stored
    /// credential.
    pub fn decrypt_envelope(&self, id: &CredentialId, der: &[u8]) -> Result<Vec<u8>> {
        let credential = self.credential(id)?;
        let key = KeyHandle::private_from_credential(&credential)?;
        let envelope = Pkcs7Envelope::read_der(der)?;
        envelope.decrypt(&key, &credential.leaf)
    }

    fn credential(&self, id: &CredentialId) -> Result<Credential> {
        self.store
            .find(id)
            .ok_or_else(|| CredError::InvalidArgument(format!("no credential with id {id}")))
    }
}
