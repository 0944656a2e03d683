//! Authentication and delegation error types.

use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("token issued in the future")]
    IssuedInFuture,

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("app claim missing or app code empty")]
    MissingAppCode,

    #[error("app is not verified")]
    AppNotVerified,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("signing key unavailable for this request")]
    SigningKeyUnavailable,

    #[error("delegation is not in the verified state")]
    NotVerified,

    #[error("signing failed: {0}")]
    Signing(String),
}
