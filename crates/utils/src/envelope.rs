//! MIME envelopes for encrypted message bodies.
//!
//! Turns the raw ciphertext produced by an [`Encryptor`](crate::Encryptor)
//! into the final subject, body and header set of the outgoing message.
//! S/MIME bodies are base64 encoded as an `application/x-pkcs7-mime`
//! attachment, PGP bodies are already ASCII-armored and sent as 7-bit text.

use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

use crate::{EncryptionMethod, HeaderMap};

/// Subject used in place of the original when subject obscuring is enabled.
pub const OBSCURED_SUBJECT: &str = "Encrypted Message";

/// Maximum length of a base64 body line, per RFC 2045.
pub const BASE64_LINE_LENGTH: usize = 76;

/// Errors that can occur while building an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// The ciphertext was empty.
    #[error("Empty ciphertext")]
    EmptyCiphertext,

    /// PGP ciphertext was not 7-bit ASCII and cannot be sent as `7bit`.
    #[error("PGP ciphertext is not ASCII-armored")]
    NotArmored,
}

/// The replacement subject, body and headers for an encrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub subject: String,
    pub body: Vec<u8>,
    pub headers: HeaderMap,
}

/// Returns the plaintext that should be encrypted for a message.
///
/// When the subject is obscured the original subject is carried inside the
/// encrypted body as an `Original Subject:` line followed by a blank line.
pub fn prepare_plaintext(body: &[u8], subject: &str, obscure_subject: bool) -> Vec<u8> {
    if !obscure_subject {
        return body.to_vec();
    }
    let prefix = format!("Original Subject: {subject}\r\n\r\n");
    let mut plaintext = Vec::with_capacity(prefix.len() + body.len());
    plaintext.extend_from_slice(prefix.as_bytes());
    plaintext.extend_from_slice(body);
    plaintext
}

/// Builds the envelope for `ciphertext` encrypted with `method`.
pub fn build_envelope(
    ciphertext: &[u8],
    method: EncryptionMethod,
    obscure_subject: bool,
    original_subject: &str,
) -> Result<Envelope, EnvelopeError> {
    if ciphertext.is_empty() {
        return Err(EnvelopeError::EmptyCiphertext);
    }

    let subject = if obscure_subject {
        OBSCURED_SUBJECT.to_string()
    } else {
        original_subject.to_string()
    };

    let mut headers = HeaderMap::new();
    headers.append("MIME-Version", "1.0");

    let body = match method {
        EncryptionMethod::Smime => {
            headers.append(
                "Content-Type",
                "application/x-pkcs7-mime; smimetype=enveloped-data; name=\"smime.p7m\"",
            );
            headers.append(
                "Content-Disposition",
                "attachment; filename=\"smime.p7m\"",
            );
            headers.append("Content-Transfer-Encoding", "base64");
            wrap_base64(&general_purpose::STANDARD.encode(ciphertext)).into_bytes()
        }
        EncryptionMethod::Pgp => {
            if !ciphertext.is_ascii() {
                return Err(EnvelopeError::NotArmored);
            }
            headers.append("Content-Type", "text/plain; charset=utf-8");
            headers.append("Content-Transfer-Encoding", "7bit");
            ciphertext.to_vec()
        }
    };

    Ok(Envelope {
        subject,
        body,
        headers,
    })
}

/// Hard-wraps an encoded string at [`BASE64_LINE_LENGTH`] characters, ending
/// every line (the last included) with CRLF.
///
/// ```rust
/// let wrapped = mailveil_utils::wrap_base64(&"A".repeat(100));
/// assert_eq!(wrapped, format!("{}\r\n{}\r\n", "A".repeat(76), "A".repeat(24)));
/// ```
pub fn wrap_base64(encoded: &str) -> String {
    let lines = encoded.len().div_ceil(BASE64_LINE_LENGTH);
    let mut wrapped = String::with_capacity(encoded.len() + lines * 2);
    for chunk in encoded.as_bytes().chunks(BASE64_LINE_LENGTH) {
        // base64 output is ASCII so every chunk boundary is a char boundary
        wrapped.push_str(&String::from_utf8_lossy(chunk));
        wrapped.push_str("\r\n");
    }
    wrapped
}
