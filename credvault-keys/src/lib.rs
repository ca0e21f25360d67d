//! CredVault Keys – public API facade

pub mod certificate;
pub mod cipher;
pub mod error;
pub mod manager;
pub mod pkcs7;
pub mod policy;
pub mod profile;
pub mod store;
pub mod types;

pub use error::{CredError, ErrorCode, Result};

pub use types::{Credential, CredentialId, PrivateKeyRecord, SymmetricCipher};

pub use certificate::{
    certificates_from_pem, relative_name, CertificateInfo, RENEWAL_WINDOW_DAYS,
};

pub use cipher::{digest, Digest, KeyContext, KeyHandle, KeyType, Operation};

pub use pkcs7::{ContentType, EnvelopeState, Pkcs7Envelope};

pub use policy::{PolicyGate, PolicySnapshot, TlsVersion};

pub use profile::{
    CredentialsProfile, ListenerHandle, ProfileEvent, ProfileLifecycleManager, ProfileListener,
    ProfileState, ProfileType,
};

pub use store::{CredentialStore, ProfileMapper, ProfileRef};

pub use manager::CredentialService;
