//! Encrypted credential store.
//!
//! Holds credentials (leaf certificate, auxiliary certificates and private
//! key) keyed by issuer plus serial. Imports follow a two-phase protocol:
//! parsing and profile mapping stage the credential, and only
//! [`CredentialStore::import_done`] makes it durable. [`undo_import`]
//! discards a staged credential without a trace. At most one import may be
//! staged per profile at a time, which serializes mutations per profile.
//!
//! Durable state is serialized with bincode and sealed with AES-256-GCM
//! under a key derived from the container master secret via HKDF-SHA256.
//! Writes go to a temporary file first and are renamed into place, so a
//! crash can lose the latest update but never corrupt the store.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use openssl::error::ErrorStack;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use credvault_common::{Component, Logger};

use crate::certificate::{certificates_from_pem, CertificateInfo};
use crate::error::{CredError, Result};
use crate::policy::PolicyGate;
use crate::types::{Credential, CredentialId, PrivateKeyRecord};

const STORE_KEY_INFO: &[u8] = b"credvault:store-key:v1";
const STORE_AAD: &[u8] = b"credvault:store_state:v1";
const NONCE_LEN: usize = 12;

/// Maps a parsed leaf certificate to the identifier of an assigned
/// enrolment profile. Implemented by the profile lifecycle layer; the store
/// itself holds no profile state.
pub trait ProfileMapper: Send + Sync {
    /// The profile this credential satisfies, or `None` when no assigned
    /// profile's mapping criteria match.
    fn map_credential(&self, leaf: &CertificateInfo) -> Option<String>;

    /// Whether the profile is currently assigned to the end user.
    fn is_assigned(&self, profile_id: &str) -> bool;
}

/// How an import selects its target profile: let the mapper choose by
/// mapping criteria, or name an assigned profile outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileRef<'a> {
    Mapped,
    Explicit(&'a str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    credential: Credential,
    profile_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    entries: Vec<StoredEntry>,
}

#[derive(Debug)]
struct PendingImport {
    credential: Credential,
}

/// The secure credential store.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    sealing_key: [u8; 32],
    state: Mutex<StoreState>,
    pending: Mutex<HashMap<String, PendingImport>>,
    policy: Arc<PolicyGate>,
    logger: Arc<Logger>,
}

impl CredentialStore {
    /// Open the store at `path`, creating it if absent. `master_secret` is
    /// the container secret the sealing key is derived from.
    pub fn open(
        path: impl Into<PathBuf>,
        master_secret: &[u8],
        policy: Arc<PolicyGate>,
        logger: &Logger,
    ) -> Result<Self> {
        let path = path.into();
        let logger = Arc::new(logger.with_component(Component::Store));
        let sealing_key = derive_sealing_key(master_secret);

        let state = if path.exists() {
            let sealed = fs::read(&path)?;
            let state = unseal_state(&sealing_key, &sealed)?;
            logger.info(format!(
                "opened store with {} credential(s)",
                state.entries.len()
            ));
            state
        } else {
            logger.info("initializing empty store");
            StoreState::default()
        };

        Ok(Self {
            path,
            sealing_key,
            state: Mutex::new(state),
            pending: Mutex::new(HashMap::new()),
            policy,
            logger,
        })
    }

    /// Stage a credential from a PKCS#12 bundle.
    ///
    /// The bundle must contain exactly one private key and its matching
    /// leaf certificate; any additional certificates become the auxiliary
    /// chain. Returns the staged credential's id and the profile it mapped
    /// to. A wrong `password` is reported as `WrongPassword` so callers can
    /// re-prompt; a malformed bundle is `General`.
    pub fn import_pkcs12(
        &self,
        data: &[u8],
        password: &str,
        profile: ProfileRef<'_>,
        mapper: &dyn ProfileMapper,
    ) -> Result<(CredentialId, String)> {
        let bundle = Pkcs12::from_der(data)
            .map_err(|e| CredError::General(format!("malformed PKCS#12 bundle: {e}")))?;
        let parsed = bundle.parse2(password).map_err(|e| {
            if is_password_failure(&e) {
                CredError::WrongPassword
            } else {
                CredError::General(format!("unreadable PKCS#12 bundle: {e}"))
            }
        })?;

        let key = parsed
            .pkey
            .ok_or_else(|| CredError::General("bundle contains no private key".to_string()))?;
        let leaf = parsed.cert.ok_or_else(|| {
            CredError::General("bundle contains no leaf certificate".to_string())
        })?;
        if !leaf.public_key()?.public_eq(&key) {
            return Err(CredError::InvalidArgument(
                "private key does not match the leaf certificate".to_string(),
            ));
        }

        let mut aux = Vec::new();
        if let Some(chain) = parsed.ca {
            for cert in chain {
                aux.push(CertificateInfo::from_der(cert.to_der()?)?);
            }
        }
        let leaf = CertificateInfo::from_der(leaf.to_der()?)?;
        let credential = Credential {
            leaf,
            aux,
            key: PrivateKeyRecord::Stored(key.private_key_to_pkcs8()?),
        };
        self.stage(credential, profile, mapper)
    }

    /// Stage a credential from PEM text.
    ///
    /// Exactly one private key must be present; `password` decrypts it when
    /// it is encrypted. The certificate whose public key matches the key
    /// becomes the leaf, the rest the auxiliary chain. Certificates that
    /// can't be parsed at all make the whole input invalid, but a PEM file
    /// with no matching leaf is rejected as `InvalidArgument`.
    pub fn import_pem(
        &self,
        pem: &[u8],
        password: Option<&str>,
        profile: ProfileRef<'_>,
        mapper: &dyn ProfileMapper,
    ) -> Result<(CredentialId, String)> {
        let key = single_private_key_from_pem(pem, password)?;
        let certs = certificates_from_pem(pem)?;

        let mut leaf = None;
        let mut aux = Vec::new();
        for info in certs {
            let x509 = X509::from_der(info.der())?;
            if leaf.is_none() && x509.public_key()?.public_eq(&key) {
                leaf = Some(info);
            } else {
                aux.push(info);
            }
        }
        let leaf = leaf.ok_or_else(|| {
            CredError::InvalidArgument(
                "no certificate matches the supplied private key".to_string(),
            )
        })?;

        let credential = Credential {
            leaf,
            aux,
            key: PrivateKeyRecord::Stored(key.private_key_to_pkcs8()?),
        };
        self.stage(credential, profile, mapper)
    }

    /// Stage a credential whose private key is resident in the OS keystore,
    /// referenced by `alias`. Gated by the device keystore policy.
    pub fn import_device_resident(
        &self,
        leaf_der: Vec<u8>,
        aux_der: Vec<Vec<u8>>,
        alias: impl Into<String>,
        profile: ProfileRef<'_>,
        mapper: &dyn ProfileMapper,
    ) -> Result<(CredentialId, String)> {
        self.policy.check_device_keystore()?;
        let leaf = CertificateInfo::from_der(leaf_der)?;
        let mut aux = Vec::with_capacity(aux_der.len());
        for der in aux_der {
            aux.push(CertificateInfo::from_der(der)?);
        }
        let credential = Credential {
            leaf,
            aux,
            key: PrivateKeyRecord::DeviceResident {
                alias: alias.into(),
            },
        };
        self.stage(credential, profile, mapper)
    }

    fn stage(
        &self,
        credential: Credential,
        profile: ProfileRef<'_>,
        mapper: &dyn ProfileMapper,
    ) -> Result<(CredentialId, String)> {
        let id = credential.id();
        let profile_id = match profile {
            ProfileRef::Mapped => mapper
                .map_credential(&credential.leaf)
                .ok_or_else(|| CredError::NotMapped(id.to_string()))?,
            ProfileRef::Explicit(requested) => {
                if !mapper.is_assigned(requested) {
                    return Err(CredError::NotMapped(format!(
                        "profile '{requested}' is not assigned"
                    )));
                }
                requested.to_string()
            }
        };

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&profile_id) {
            return Err(CredError::InvalidArgument(format!(
                "an import is already staged for profile '{profile_id}'"
            )));
        }

        self.logger.info(format!(
            "staged credential {id} for profile '{profile_id}'"
        ));
        pending.insert(profile_id.clone(), PendingImport { credential });
        Ok((id, profile_id))
    }

    /// Commit the import staged for `profile_id`, making the credential
    /// durable. Returns the committed credential, or `None` when nothing
    /// was staged; committing with no pending import is a no-op, not an
    /// error.
    pub fn import_done(&self, profile_id: &str) -> Result<Option<Credential>> {
        let staged = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.remove(profile_id) {
                Some(staged) => staged,
                None => return Ok(None),
            }
        };
        let credential = staged.credential;
        let id = credential.id();

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.entries.retain(|e| e.credential.id() != id);
            state.entries.push(StoredEntry {
                credential: credential.clone(),
                profile_id: profile_id.to_string(),
            });
            self.persist(&state)?;
        }
        self.logger
            .info(format!("committed credential {id} for profile '{profile_id}'"));
        Ok(Some(credential))
    }

    /// Discard the import staged for `profile_id` without committing it.
    pub fn undo_import(&self, profile_id: &str) -> Result<()> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.remove(profile_id) {
            Some(staged) => {
                self.logger.info(format!(
                    "discarded staged credential {} for profile '{profile_id}'",
                    staged.credential.id()
                ));
                Ok(())
            }
            None => Err(CredError::InvalidArgument(format!(
                "no import staged for profile '{profile_id}'"
            ))),
        }
    }

    /// Look up a committed credential by id. Staged credentials are not
    /// visible here.
    pub fn find(&self, id: &CredentialId) -> Option<Credential> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .find(|e| &e.credential.id() == id)
            .map(|e| e.credential.clone())
    }

    /// All committed credentials.
    pub fn list(&self) -> Vec<Credential> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.iter().map(|e| e.credential.clone()).collect()
    }

    /// Committed credentials belonging to one profile.
    pub fn list_for_profile(&self, profile_id: &str) -> Vec<Credential> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .filter(|e| e.profile_id == profile_id)
            .map(|e| e.credential.clone())
            .collect()
    }

    /// The profile a committed credential belongs to.
    pub fn profile_of(&self, id: &CredentialId) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entries
            .iter()
            .find(|e| &e.credential.id() == id)
            .map(|e| e.profile_id.clone())
    }

    /// Remove a committed credential as a unit. For device-resident keys
    /// only the store's reference is removed; the key itself stays in the
    /// OS keystore.
    pub fn remove(&self, id: &CredentialId) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(position) = state.entries.iter().position(|e| &e.credential.id() == id)
        else {
            return Err(CredError::InvalidArgument(format!(
                "no credential with id {id}"
            )));
        };
        let removed = state.entries.remove(position);
        if removed.credential.key.is_device_resident() {
            self.logger.info(format!(
                "unlinked device-resident credential {id}; key stays in the OS keystore"
            ));
        } else {
            self.logger.info(format!("removed credential {id}"));
        }
        self.persist(&state)
    }

    /// Remove a committed credential by value. Equivalent to
    /// [`remove`](Self::remove) with the credential's id.
    pub fn remove_credential(&self, credential: &Credential) -> Result<()> {
        self.remove(&credential.id())
    }

    /// Remove all committed credentials of one profile, for example when
    /// the profile is deleted on the server. Returns how many were removed.
    pub fn remove_for_profile(&self, profile_id: &str) -> Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = state.entries.len();
        state.entries.retain(|e| e.profile_id != profile_id);
        let removed = before - state.entries.len();
        if removed > 0 {
            self.logger.info(format!(
                "removed {removed} credential(s) of profile '{profile_id}'"
            ));
            self.persist(&state)?;
        }
        Ok(removed)
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let sealed = seal_state(&self.sealing_key, state)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &sealed)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// MAC or key-decrypt failures mean the supplied password is wrong; any
/// other entry in the error stack means the bundle itself is unreadable.
fn is_password_failure(errors: &ErrorStack) -> bool {
    errors.errors().iter().any(|e| {
        e.reason()
            .map(|reason| reason.contains("mac verify") || reason.contains("cipherfinal"))
            .unwrap_or(false)
    })
}

fn derive_sealing_key(master_secret: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, master_secret);
    let mut okm = [0u8; 32];
    // Only fails for absurd output lengths; 32 bytes is always valid.
    hk.expand(STORE_KEY_INFO, &mut okm)
        .unwrap_or_else(|_| unreachable!("32 bytes is a valid HKDF output length"));
    okm
}

fn seal_state(key: &[u8; 32], state: &StoreState) -> Result<Vec<u8>> {
    let plaintext = bincode::serialize(state)?;
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: STORE_AAD,
            },
        )
        .map_err(|_| CredError::General("failed to seal store state".to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn unseal_state(key: &[u8; 32], sealed: &[u8]) -> Result<StoreState> {
    if sealed.len() < NONCE_LEN {
        return Err(CredError::General("store file is truncated".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: STORE_AAD,
            },
        )
        .map_err(|_| {
            CredError::General("store file is corrupt or sealed under a different key".to_string())
        })?;
    Ok(bincode::deserialize(&plaintext)?)
}

fn single_private_key_from_pem(pem: &[u8], password: Option<&str>) -> Result<PKey<Private>> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| CredError::InvalidArgument("PEM input is not valid UTF-8".to_string()))?;
    let key_blocks = text
        .lines()
        .filter(|l| l.starts_with("-----BEGIN") && l.contains("PRIVATE KEY"))
        .count();
    match key_blocks {
        0 => Err(CredError::InvalidArgument(
            "PEM input contains no private key".to_string(),
        )),
        1 => {
            let result = match password {
                Some(pw) => PKey::private_key_from_pem_passphrase(pem, pw.as_bytes()),
                None => PKey::private_key_from_pem(pem),
            };
            result.map_err(|_| match password {
                Some(_) => CredError::WrongPassword,
                None => CredError::InvalidArgument("failed to parse private key".to_string()),
            })
        }
        n => Err(CredError::General(format!(
            "PEM input contains {n} private keys, expected exactly one"
        ))),
    }
}
