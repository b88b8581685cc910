//! OpenPGP public-key encryption backed by Sequoia.

use std::io::Write;

use sequoia_openpgp::{
    parse::Parse,
    policy::StandardPolicy,
    serialize::stream::{Armorer, Encryptor2, LiteralWriter, Message},
    Cert,
};
use tracing::debug;

use super::{EncryptionError, EncryptionMethod, EncryptionResult, Encryptor};

/// Encrypts to an OpenPGP certificate (ASCII-armored or binary public key).
///
/// Only the recipient's encryption-capable keys valid under the standard
/// policy are used, nothing is signed. The output is ASCII-armored. The
/// certificate is parsed per call and dropped afterwards, there is no
/// keyring.
#[derive(Debug)]
pub struct PgpEncryptor {
    policy: StandardPolicy<'static>,
}

impl PgpEncryptor {
    pub fn new() -> Self {
        Self {
            policy: StandardPolicy::new(),
        }
    }
}

impl Default for PgpEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Encryptor for PgpEncryptor {
    fn encrypt(&self, plaintext: &[u8], key_material: &str) -> EncryptionResult<Vec<u8>> {
        let cert = Cert::from_bytes(key_material.trim().as_bytes())
            .map_err(|e| EncryptionError::InvalidPublicKey(e.to_string()))?;
        let fingerprint = cert.fingerprint();

        let recipients = cert
            .keys()
            .with_policy(&self.policy, None)
            .supported()
            .alive()
            .revoked(false)
            .for_transport_encryption()
            .collect::<Vec<_>>();
        if recipients.is_empty() {
            return Err(EncryptionError::InvalidPublicKey(format!(
                "No usable encryption key in {fingerprint}"
            )));
        }
        debug!(
            fingerprint = %fingerprint,
            keys = recipients.len(),
            "Imported recipient public key"
        );

        let failure = |e| EncryptionError::failure(EncryptionMethod::Pgp, e);
        let mut sink = Vec::new();
        let message = Message::new(&mut sink);
        let message = Armorer::new(message).build().map_err(failure)?;
        let message = Encryptor2::for_recipients(message, recipients)
            .build()
            .map_err(failure)?;
        let mut writer = LiteralWriter::new(message).build().map_err(failure)?;
        writer
            .write_all(plaintext)
            .map_err(|e| EncryptionError::failure(EncryptionMethod::Pgp, e))?;
        writer.finalize().map_err(failure)?;

        Ok(sink)
    }

    fn method(&self) -> EncryptionMethod {
        EncryptionMethod::Pgp
    }
}
