use thiserror::Error;

#[derive(Error, Debug)]
pub enum AbyssError {
    #[error("user not found")]
    UserNotFound,

    #[error("no outstanding challenge")]
    ChallengeMissing,

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("token missing or expired")]
    TokenMissing,

    #[error("token bound to a different address")]
    IpMismatch,

    #[error("privilege exceeds creator's")]
    PrivilegeExceeded,

    #[error("username must be ASCII alphanumeric")]
    UsernameInvalid,

    #[error("user already exists")]
    DuplicateUser,

    #[error("permission denied")]
    PermissionDenied,

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("tunnel authentication failed")]
    AuthFailure,

    #[error("AEAD authentication failed")]
    CryptoFailure,

    #[error("nonce counter exhausted")]
    CounterExhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
