//! Encryption primitives for outbound messages.
//!
//! An [`EncryptionEngine`] holds one [`Encryptor`] per supported
//! [`EncryptionMethod`], chosen once at startup. Encryptors only turn
//! plaintext into raw ciphertext, any MIME framing is the job of the
//! [`envelope`](crate::envelope) module.

pub mod smime;
#[cfg(feature = "pgp")]
pub mod pgp;

use std::{fmt::Display, str::FromStr};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[cfg(feature = "pgp")]
pub use pgp::*;
pub use smime::*;

/// The encryption method configured for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMethod {
    /// X.509 certificate based PKCS#7 enveloped-data.
    Smime,
    /// OpenPGP public-key encryption.
    Pgp,
}

impl EncryptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMethod::Smime => "smime",
            EncryptionMethod::Pgp => "pgp",
        }
    }
}

impl Display for EncryptionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "smime" => Ok(EncryptionMethod::Smime),
            "pgp" => Ok(EncryptionMethod::Pgp),
            other => Err(format!("Unsupported encryption method: {other}")),
        }
    }
}

/// Errors produced while encrypting a message body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    /// The key material is not a parsable X.509 certificate.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The key material is not an importable OpenPGP public key.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The primitive failed after the key was accepted.
    #[error("{method} encryption failed: {cause}")]
    Failure {
        method: EncryptionMethod,
        cause: String,
    },
}

impl EncryptionError {
    pub(crate) fn failure(method: EncryptionMethod, cause: impl Display) -> Self {
        EncryptionError::Failure {
            method,
            cause: cause.to_string(),
        }
    }
}

/// Result type for encryption operations.
pub type EncryptionResult<T> = Result<T, EncryptionError>;

/// A single encryption primitive.
///
/// Implementations validate the key material, encrypt the plaintext to it
/// and return raw ciphertext bytes. Parsed key state must not outlive the
/// call.
pub trait Encryptor: Send + Sync {
    /// Encrypts `plaintext` to the recipient described by `key_material`.
    fn encrypt(&self, plaintext: &[u8], key_material: &str) -> EncryptionResult<Vec<u8>>;

    /// Returns the method this encryptor implements.
    fn method(&self) -> EncryptionMethod;
}

/// Stand-in used when the binary is built without OpenPGP support.
///
/// Every call fails with [`EncryptionError::InvalidPublicKey`] so the
/// pipeline treats the recipient like one with an unusable key.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailablePgp;

impl Encryptor for UnavailablePgp {
    fn encrypt(&self, _plaintext: &[u8], _key_material: &str) -> EncryptionResult<Vec<u8>> {
        Err(EncryptionError::InvalidPublicKey(
            "PGP support is not available".to_string(),
        ))
    }

    fn method(&self) -> EncryptionMethod {
        EncryptionMethod::Pgp
    }
}

/// Dispatches encryption to the [`Encryptor`] registered for each method.
pub struct EncryptionEngine {
    smime: Box<dyn Encryptor>,
    pgp: Box<dyn Encryptor>,
}

impl std::fmt::Debug for EncryptionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionEngine")
            .field("smime", &self.smime.method())
            .field("pgp", &self.pgp.method())
            .finish()
    }
}

impl EncryptionEngine {
    /// Creates an engine from explicit encryptors.
    pub fn new(smime: Box<dyn Encryptor>, pgp: Box<dyn Encryptor>) -> Self {
        Self { smime, pgp }
    }

    /// Creates the engine with the primitives compiled into this build.
    ///
    /// Without the `pgp` feature the PGP slot is filled by [`UnavailablePgp`].
    pub fn detect() -> Self {
        #[cfg(feature = "pgp")]
        let pgp: Box<dyn Encryptor> = Box::new(PgpEncryptor::new());
        #[cfg(not(feature = "pgp"))]
        let pgp: Box<dyn Encryptor> = Box::new(UnavailablePgp);

        info!(
            pgp = cfg!(feature = "pgp"),
            "Encryption engine initialized"
        );
        Self::new(Box::new(SmimeEncryptor), pgp)
    }

    /// Encrypts `plaintext` with the primitive registered for `method`.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key_material: &str,
        method: EncryptionMethod,
    ) -> EncryptionResult<Vec<u8>> {
        let encryptor = match method {
            EncryptionMethod::Smime => &self.smime,
            EncryptionMethod::Pgp => &self.pgp,
        };
        let ciphertext = encryptor.encrypt(plaintext, key_material)?;
        debug!(
            method = %method,
            plaintext_len = plaintext.len(),
            ciphertext_len = ciphertext.len(),
            "Encrypted message body"
        );
        Ok(ciphertext)
    }
}

impl Default for EncryptionEngine {
    fn default() -> Self {
        Self::detect()
    }
}
