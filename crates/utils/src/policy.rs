//! Per-recipient encryption policies.

use std::{collections::BTreeSet, fs};

use tracing::warn;

use crate::{ConfigError, EncryptionMethod, EncryptionSettings, RecipientSettings};

/// How messages to a single recipient are encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionConfig {
    pub recipient_email: String,
    pub method: EncryptionMethod,
    /// PEM certificate for S/MIME, armored public key for PGP.
    pub key_material: String,
    pub obscure_subject: bool,
}

/// Read-only snapshot of the license key and recipient policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyStore {
    api_key: String,
    entries: Vec<EncryptionConfig>,
}

impl PolicyStore {
    pub fn new(api_key: impl Into<String>, entries: Vec<EncryptionConfig>) -> Self {
        let store = Self {
            api_key: api_key.into(),
            entries,
        };
        store.warn_duplicates();
        store
    }

    /// Builds the store from the `[encryption]` settings, loading key files
    /// and dropping entries that cannot be used.
    pub fn from_settings(settings: &EncryptionSettings) -> Result<Self, ConfigError> {
        let mut entries = Vec::with_capacity(settings.recipients.len());
        for recipient in &settings.recipients {
            if let Some(entry) = sanitize(recipient)? {
                entries.push(entry);
            }
        }
        Ok(Self::new(settings.api_key.trim(), entries))
    }

    /// The license key, empty when none is configured.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn entries(&self) -> &[EncryptionConfig] {
        &self.entries
    }

    /// Returns the first policy whose address equals `recipient` exactly.
    pub fn find_config(&self, recipient: &str) -> Option<&EncryptionConfig> {
        self.entries
            .iter()
            .find(|entry| entry.recipient_email == recipient)
    }

    fn warn_duplicates(&self) {
        let mut seen = BTreeSet::new();
        let duplicates: BTreeSet<&str> = self
            .entries
            .iter()
            .map(|entry| entry.recipient_email.as_str())
            .filter(|email| !seen.insert(*email))
            .collect();
        if !duplicates.is_empty() {
            let duplicates: Vec<&str> = duplicates.into_iter().collect();
            warn!(
                recipients = %duplicates.join(", "),
                "Duplicate recipient policies, the first entry wins"
            );
        }
    }
}

/// Validates a raw recipient entry, `None` means it is skipped.
fn sanitize(recipient: &RecipientSettings) -> Result<Option<EncryptionConfig>, ConfigError> {
    let email = recipient.email.trim();
    if email.is_empty() {
        warn!("Skipping recipient policy without an email address");
        return Ok(None);
    }
    if !is_valid_email(email) {
        warn!(recipient = %email, "Skipping recipient policy with an invalid email address");
        return Ok(None);
    }

    let key_material = match (&recipient.key, &recipient.key_file) {
        (Some(key), _) => key.trim().to_string(),
        (None, Some(path)) => fs::read_to_string(path)
            .map_err(|source| ConfigError::KeyFile {
                email: email.to_string(),
                path: path.clone(),
                source,
            })?
            .trim()
            .to_string(),
        (None, None) => String::new(),
    };
    if key_material.is_empty() {
        warn!(recipient = %email, "Skipping recipient policy without key material");
        return Ok(None);
    }

    let method = recipient.method.parse::<EncryptionMethod>().unwrap_or_else(|_| {
        warn!(
            recipient = %email,
            method = %recipient.method,
            "Unknown encryption method, falling back to smime"
        );
        EncryptionMethod::Smime
    });

    Ok(Some(EncryptionConfig {
        recipient_email: email.to_string(),
        method,
        key_material,
        obscure_subject: recipient.obscure_subject,
    }))
}

/// Checks for exactly one `@` with non-empty text on both sides.
fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        }
        None => false,
    }
}
