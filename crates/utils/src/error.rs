//! Error taxonomy of the encryption pipeline.
//!
//! A missing policy for a recipient is not an error, it is reported as a
//! [`SkipReason`](crate::SkipReason). Everything from
//! [`PipelineError::LicenseInvalid`] onwards is caught at the interceptor
//! boundary and handled according to the configured
//! [`FailPolicy`](crate::FailPolicy).

use thiserror::Error;

use crate::{EncryptionError, EncryptionMethod, EnvelopeError};

/// Failures that stop a matched recipient's message from being encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The license endpoint answered that the key is not valid.
    #[error("License invalid: {0}")]
    LicenseInvalid(String),

    /// The license endpoint could not be reached or gave an unusable answer.
    #[error("License unreachable: {0}")]
    LicenseUnreachable(String),

    /// The configured S/MIME certificate could not be parsed.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The configured PGP public key could not be imported.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The encryption primitive itself failed.
    #[error("{method} encryption failed: {cause}")]
    EncryptionFailure {
        method: EncryptionMethod,
        cause: String,
    },

    /// The MIME envelope could not be produced from the ciphertext.
    #[error("Envelope failure: {0}")]
    EnvelopeFailure(String),
}

impl PipelineError {
    /// Short, stable identifier used as the `kind` field in log events.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::LicenseInvalid(_) => "license_invalid",
            PipelineError::LicenseUnreachable(_) => "license_unreachable",
            PipelineError::InvalidCertificate(_) => "invalid_certificate",
            PipelineError::InvalidPublicKey(_) => "invalid_public_key",
            PipelineError::EncryptionFailure { .. } => "encryption_failure",
            PipelineError::EnvelopeFailure(_) => "envelope_failure",
        }
    }
}

impl From<EncryptionError> for PipelineError {
    fn from(error: EncryptionError) -> Self {
        match error {
            EncryptionError::InvalidCertificate(cause) => PipelineError::InvalidCertificate(cause),
            EncryptionError::InvalidPublicKey(cause) => PipelineError::InvalidPublicKey(cause),
            EncryptionError::Failure { method, cause } => {
                PipelineError::EncryptionFailure { method, cause }
            }
        }
    }
}

impl From<EnvelopeError> for PipelineError {
    fn from(error: EnvelopeError) -> Self {
        PipelineError::EnvelopeFailure(error.to_string())
    }
}
