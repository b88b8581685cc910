use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
};

use chrono::Utc;
use thiserror::Error;
use tokio::fs;

use crate::OutboundMessage;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The message was not found.
    #[error("Message not found")]
    NotFound,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound
        } else {
            StorageError::Io(e)
        }
    }
}

/// Trait for storage engines holding delivered messages.
pub trait StorageEngine: Send + Sync {
    /// Stores a message for its recipient, returning the message ID.
    fn store(&self, message: &OutboundMessage) -> impl Future<Output = StorageResult<String>> + Send;

    /// Retrieves the wire form of a stored message.
    fn retrieve(
        &self,
        recipient: &str,
        message_id: &str,
    ) -> impl Future<Output = StorageResult<Vec<u8>>> + Send;

    /// Lists the IDs of all messages stored for a recipient.
    fn list(&self, recipient: &str) -> impl Future<Output = StorageResult<Vec<String>>> + Send;
}

/// Filesystem spool of outgoing messages.
///
/// Messages are written in wire format to
/// `{base_path}/{recipient}/{message_id}.eml`, with every character of the
/// recipient that is not ASCII alphanumeric replaced by `_`.
#[derive(Debug, Clone)]
pub struct SpoolStorageEngine {
    base_path: PathBuf,
}

impl SpoolStorageEngine {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn recipient_path(&self, recipient: &str) -> PathBuf {
        let safe_recipient = recipient.replace(|c: char| !c.is_ascii_alphanumeric(), "_");
        self.base_path.join(safe_recipient)
    }

    fn message_path(&self, recipient: &str, message_id: &str) -> PathBuf {
        let safe_id = message_id.replace(['/', '\\'], "_");
        self.recipient_path(recipient)
            .join(format!("{safe_id}.eml"))
    }

    /// Returns the wire form of `message`, adding the envelope `From`, `To`
    /// and a `Date` header when the message lacks them.
    fn spool_bytes(message: &OutboundMessage) -> Vec<u8> {
        let mut message = message.clone();
        if !message.headers.contains("Date") {
            message.headers.prepend("Date", &Utc::now().to_rfc2822());
        }
        if !message.headers.contains("To") {
            message.headers.prepend("To", &message.to);
        }
        if !message.headers.contains("From") {
            message.headers.prepend("From", &message.from);
        }
        message.to_bytes()
    }
}

impl Default for SpoolStorageEngine {
    fn default() -> Self {
        Self::new(PathBuf::from("outbox"))
    }
}

impl StorageEngine for SpoolStorageEngine {
    async fn store(&self, message: &OutboundMessage) -> StorageResult<String> {
        fs::create_dir_all(self.recipient_path(&message.to)).await?;
        let path = self.message_path(&message.to, &message.message_id);
        fs::write(&path, Self::spool_bytes(message)).await?;
        Ok(message.message_id.clone())
    }

    async fn retrieve(&self, recipient: &str, message_id: &str) -> StorageResult<Vec<u8>> {
        Ok(fs::read(self.message_path(recipient, message_id)).await?)
    }

    async fn list(&self, recipient: &str) -> StorageResult<Vec<String>> {
        let recipient_dir = self.recipient_path(recipient);
        if !recipient_dir.exists() {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        let mut entries = fs::read_dir(&recipient_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "eml") {
                if let Some(stem) = path.file_stem() {
                    messages.push(stem.to_string_lossy().to_string());
                }
            }
        }
        messages.sort();
        Ok(messages)
    }
}
