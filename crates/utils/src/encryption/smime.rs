//! S/MIME enveloped-data encryption backed by OpenSSL.

use openssl::{
    pkcs7::{Pkcs7, Pkcs7Flags},
    stack::Stack,
    symm::Cipher,
    x509::X509,
};
use tracing::debug;

use super::{EncryptionError, EncryptionMethod, EncryptionResult, Encryptor};

/// Encrypts to a PEM encoded X.509 certificate as PKCS#7 enveloped-data,
/// using AES-256-CBC for the content and binary transfer mode.
///
/// The output is the DER encoding of the PKCS#7 structure.
#[derive(Debug, Default, Clone, Copy)]
pub struct SmimeEncryptor;

impl Encryptor for SmimeEncryptor {
    fn encrypt(&self, plaintext: &[u8], key_material: &str) -> EncryptionResult<Vec<u8>> {
        let certificate = X509::from_pem(key_material.trim().as_bytes())
            .map_err(|e| EncryptionError::InvalidCertificate(e.to_string()))?;
        debug!(
            not_after = %certificate.not_after(),
            "Loaded recipient certificate"
        );

        let failure = |e| EncryptionError::failure(EncryptionMethod::Smime, e);
        let mut recipients = Stack::new().map_err(failure)?;
        recipients.push(certificate).map_err(failure)?;

        let envelope = Pkcs7::encrypt(
            &recipients,
            plaintext,
            Cipher::aes_256_cbc(),
            Pkcs7Flags::BINARY,
        )
        .map_err(failure)?;
        envelope.to_der().map_err(failure)
    }

    fn method(&self) -> EncryptionMethod {
        EncryptionMethod::Smime
    }
}
