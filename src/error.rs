#[allow(unused)]
pub use anyhow::{anyhow, bail, ensure, Error};

use crate::claims::ClaimsValidationError;

#[derive(Debug, thiserror::Error)]
pub enum JWSError {
    #[error("Malformed compact JWS token")]
    MalformedToken,
    #[error("Invalid base64 or truncated JWS segment")]
    DecodeError,
    #[error("JWS header too large")]
    HeaderTooLarge,
    #[error("Token is too long")]
    TokenTooLong,
    #[error("Signed payload is empty")]
    EmptySignedPayload,
    #[error("Missing x5c certificate chain")]
    MissingCertificateChain,
    #[error("Certificate index {index} out of range (chain length {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Certificate parse error: {0}")]
    CertParseError(String),
    #[error("Untrusted certificate chain: {0}")]
    UntrustedChain(String),
    #[error("Pinned root certificate cannot be parsed")]
    InvalidRootCertificate,
    #[error("Unsupported key type in leaf certificate")]
    UnsupportedKeyType,
    #[error("JWS algorithm mismatch")]
    AlgorithmMismatch,
    #[error("Signature didn't verify")]
    SignatureInvalid,
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid key pair")]
    InvalidKeyPair,
    #[error(transparent)]
    ClaimsValidation(#[from] ClaimsValidationError),
}

impl JWSError {
    /// Recover the kind of a failure returned by this crate.
    pub fn kind_of(err: &Error) -> Option<&JWSError> {
        err.downcast_ref::<JWSError>()
    }

    /// `true` for failures that indicate a forged or foreign token rather
    /// than malformed input.
    pub fn is_untrusted(&self) -> bool {
        matches!(
            self,
            JWSError::UntrustedChain(_)
                | JWSError::InvalidRootCertificate
                | JWSError::SignatureInvalid
                | JWSError::AlgorithmMismatch
        )
    }

    /// `true` for structural failures detected before any cryptographic work.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            JWSError::MalformedToken
                | JWSError::DecodeError
                | JWSError::HeaderTooLarge
                | JWSError::TokenTooLong
                | JWSError::EmptySignedPayload
                | JWSError::InvalidPayload(_)
        )
    }
}
