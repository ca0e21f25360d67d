use thiserror::Error;

/// Stable discriminated codes surfaced across the API boundary.
///
/// Every fallible operation in this crate maps to exactly one of these codes,
/// alongside a free-text diagnostic carried by [`CredError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidArgument,
    NotMapped,
    WrongPassword,
    NotAllowed,
    General,
    OutOfMemory,
}

/// Error type for the credvault-keys crate
#[derive(Error, Debug)]
pub enum CredError {
    /// Caller contract violation, detectable before any I/O. Never retried
    /// automatically.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The credential doesn't match the mapping criteria of any profile
    /// assigned to the end user. Surfaced for user-facing remediation.
    #[error("credential not mapped to an assigned profile: {0}")]
    NotMapped(String),

    /// The bundle couldn't be decrypted with the supplied password. Retried
    /// only with new user-supplied input.
    #[error("wrong password")]
    WrongPassword,

    /// Rejected by enterprise policy, for example a FIPS 140-2 violation.
    #[error("not allowed by policy: {0}")]
    NotAllowed(String),

    /// Condition not covered by a specific code, such as a corrupt bundle.
    #[error("{0}")]
    General(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CredError {
    /// The stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CredError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            CredError::NotMapped(_) => ErrorCode::NotMapped,
            CredError::WrongPassword => ErrorCode::WrongPassword,
            CredError::NotAllowed(_) => ErrorCode::NotAllowed,
            CredError::General(_) => ErrorCode::General,
            CredError::OutOfMemory => ErrorCode::OutOfMemory,
            CredError::Io(_) => ErrorCode::General,
        }
    }
}

impl From<openssl::error::ErrorStack> for CredError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        CredError::General(err.to_string())
    }
}

impl From<bincode::Error> for CredError {
    fn from(err: bincode::Error) -> Self {
        CredError::General(format!("serialization error: {err}"))
    }
}

/// Result type for credvault-keys operations
pub type Result<T> = std::result::Result<T, CredError>;
