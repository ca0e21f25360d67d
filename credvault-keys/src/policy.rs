//! Enterprise policy gate.
//!
//! Holds the current policy snapshot and answers allow/deny questions for
//! the rest of the crate. Updates replace the snapshot atomically; readers
//! always observe one coherent policy, never a mix of old and new fields.
//! Denials surface as `NotAllowed` with the violated constraint named in
//! the message.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use credvault_common::{Component, Logger};

use crate::cipher::Digest;
use crate::error::{CredError, Result};
use crate::types::SymmetricCipher;

/// TLS protocol versions a policy may permit for enrolment traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// One coherent set of policy values, received from the management server
/// as a unit and applied as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Restrict cryptography to FIPS 140-2 approved algorithms.
    pub fips_mode: bool,
    /// Block export paths that would copy credential material out of the
    /// secure container.
    pub prevent_data_leakage: bool,
    /// Permit credentials whose private key lives in the OS keystore.
    pub allow_device_keystore: bool,
    /// Permit credentials to be shared with other applications in the
    /// same activation group.
    pub allow_credential_sharing: bool,
    pub permitted_tls_versions: Vec<TlsVersion>,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            fips_mode: false,
            prevent_data_leakage: true,
            allow_device_keystore: true,
            allow_credential_sharing: false,
            permitted_tls_versions: vec![TlsVersion::Tls12, TlsVersion::Tls13],
        }
    }
}

/// Concurrent access point for policy decisions.
///
/// Cheap to share; every consumer sees the latest applied snapshot.
#[derive(Debug)]
pub struct PolicyGate {
    current: RwLock<Arc<PolicySnapshot>>,
    logger: Arc<Logger>,
}

impl PolicyGate {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            current: RwLock::new(Arc::new(PolicySnapshot::default())),
            logger: Arc::new(logger.with_component(Component::Policy)),
        }
    }

    /// Replace the active policy. In-flight operations that already read
    /// the previous snapshot complete under it; subsequent operations see
    /// the new one.
    pub fn apply(&self, snapshot: PolicySnapshot) {
        self.logger.info(format!(
            "applying policy update (fips_mode={}, allow_device_keystore={})",
            snapshot.fips_mode, snapshot.allow_device_keystore
        ));
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(snapshot);
    }

    /// The currently active snapshot.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Gate a signature digest choice against FIPS mode.
    pub fn check_signature_digest(&self, digest: Digest) -> Result<()> {
        let policy = self.snapshot();
        if policy.fips_mode && !digest.fips_approved() {
            self.logger
                .warn(format!("rejecting digest {digest:?} under FIPS mode"));
            return Err(CredError::NotAllowed(format!(
                "digest {digest:?} is not FIPS 140-2 approved"
            )));
        }
        Ok(())
    }

    /// Gate a symmetric content cipher choice against FIPS mode.
    pub fn check_content_cipher(&self, cipher: SymmetricCipher) -> Result<()> {
        let policy = self.snapshot();
        if policy.fips_mode && !cipher.fips_approved() {
            self.logger
                .warn(format!("rejecting cipher {cipher:?} under FIPS mode"));
            return Err(CredError::NotAllowed(format!(
                "cipher {cipher:?} is not FIPS 140-2 approved"
            )));
        }
        Ok(())
    }

    /// Gate storage of a credential whose key is resident in the OS
    /// keystore.
    pub fn check_device_keystore(&self) -> Result<()> {
        if !self.snapshot().allow_device_keystore {
            return Err(CredError::NotAllowed(
                "device keystore credentials are disabled by policy".to_string(),
            ));
        }
        Ok(())
    }

    /// Gate export of credential material to other applications.
    pub fn check_credential_sharing(&self) -> Result<()> {
        let policy = self.snapshot();
        if !policy.allow_credential_sharing || policy.prevent_data_leakage {
            return Err(CredError::NotAllowed(
                "credential sharing is disabled by policy".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a TLS version is permitted for enrolment connections.
    pub fn tls_version_permitted(&self, version: TlsVersion) -> bool {
        self.snapshot().permitted_tls_versions.contains(&version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn gate() -> PolicyGate {
        PolicyGate::new(Arc::new(Logger::new_root(Component::Service, "test")))
    }

    #[test]
    fn default_policy_is_permissive_for_crypto() {
        let gate = gate();
        assert!(gate.check_signature_digest(Digest::Md5).is_ok());
        assert!(gate.check_content_cipher(SymmetricCipher::Rc2Cbc).is_ok());
        assert!(gate.check_device_keystore().is_ok());
    }

    #[test]
    fn fips_mode_rejects_weak_algorithms() {
        let gate = gate();
        gate.apply(PolicySnapshot {
            fips_mode: true,
            ..PolicySnapshot::default()
        });

        let err = gate.check_signature_digest(Digest::Sha1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAllowed);
        let err = gate.check_content_cipher(SymmetricCipher::Rc2Cbc).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotAllowed);

        // Approved algorithms stay usable.
        assert!(gate.check_signature_digest(Digest::Sha256).is_ok());
        assert!(gate.check_content_cipher(SymmetricCipher::Aes256Cbc).is_ok());
    }

    #[test]
    fn snapshot_is_replaced_atomically() {
        let gate = gate();
        let before = gate.snapshot();
        gate.apply(PolicySnapshot {
            allow_device_keystore: false,
            ..PolicySnapshot::default()
        });

        // The old snapshot a reader already holds is unchanged.
        assert!(before.allow_device_keystore);
        assert!(!gate.snapshot().allow_device_keystore);
        assert_eq!(gate.check_device_keystore().unwrap_err().code(), ErrorCode::NotAllowed);
    }

    #[test]
    fn sharing_requires_both_flags() {
        let gate = gate();
        assert_eq!(
            gate.check_credential_sharing().unwrap_err().code(),
            ErrorCode::NotAllowed
        );

        gate.apply(PolicySnapshot {
            allow_credential_sharing: true,
            prevent_data_leakage: false,
            ..PolicySnapshot::default()
        });
        assert!(gate.check_credential_sharing().is_ok());
    }
}
