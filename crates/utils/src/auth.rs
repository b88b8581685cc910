//! Submission credentials and SASL decoding for the relay.

use std::{collections::HashMap, fs, io, path::Path};

use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

/// Errors raised while decoding SASL exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The client response is not valid base64 or UTF-8.
    #[error("Malformed SASL response")]
    Malformed,

    /// A PLAIN response did not carry the NUL separated fields.
    #[error("Malformed PLAIN credentials")]
    MalformedPlain,
}

/// Username to password map for SMTP AUTH.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    credentials: HashMap<String, String>,
}

impl CredentialStore {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self { credentials }
    }

    /// Loads `username:password` lines from a file, blank lines and lines
    /// starting with `#` are ignored.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn parse(content: &str) -> Self {
        let credentials = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(user, pass)| (user.trim().to_string(), pass.trim().to_string()))
            .collect();
        Self { credentials }
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.credentials
            .get(username)
            .is_some_and(|stored| stored == password)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// Decodes a base64 SASL response into text.
pub fn decode_sasl(encoded: &str) -> Result<String, AuthError> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    String::from_utf8(bytes).map_err(|_| AuthError::Malformed)
}

/// Decodes an `AUTH PLAIN` response (`authzid NUL authcid NUL passwd`)
/// into the username and password.
pub fn decode_plain(encoded: &str) -> Result<(String, String), AuthError> {
    let decoded = decode_sasl(encoded)?;
    let mut parts = decoded.splitn(3, '\0');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(username), Some(password)) if !username.is_empty() => {
            Ok((username.to_string(), password.to_string()))
        }
        _ => Err(AuthError::MalformedPlain),
    }
}
