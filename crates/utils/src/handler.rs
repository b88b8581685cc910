use std::{future::Future, pin::Pin};

use thiserror::Error;

use crate::OutboundMessage;

/// Result type for handler operations.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Boxed future type for handler operations, enabling object safety.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult<()>> + Send + 'a>>;

/// Errors that can occur during message handling.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A storage error occurred.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A connection error occurred.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The message or its envelope is not acceptable for delivery.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A transformer refused the message, it was not delivered.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// Trait for message handlers that deliver processed messages.
///
/// Handlers are the transport end of the pipeline: they receive each
/// per-recipient message after every transformer has run.
pub trait MessageHandler: Send + Sync {
    /// Delivers a message.
    fn handle<'a>(&'a self, message: &'a OutboundMessage) -> HandlerFuture<'a>;

    /// Returns the name of this handler.
    fn name(&self) -> &str;
}
