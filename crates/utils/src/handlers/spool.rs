//! Filesystem spool handler.
//!
//! Provides [`SpoolHandler`], a [`MessageHandler`](crate::MessageHandler)
//! that writes every processed message to a [`SpoolStorageEngine`] so it
//! can be inspected or picked up by another delivery agent.

use std::path::PathBuf;

use tracing::{debug, error, info};

use crate::{
    handler::{HandlerError, HandlerFuture, MessageHandler},
    OutboundMessage, SpoolStorageEngine, StorageEngine,
};

/// Message handler that writes messages to a spool directory.
pub struct SpoolHandler {
    engine: SpoolStorageEngine,
}

impl SpoolHandler {
    pub fn new(base_path: PathBuf) -> Self {
        info!(path = %base_path.display(), "Spool handler initialized");
        Self {
            engine: SpoolStorageEngine::new(base_path),
        }
    }

    pub fn engine(&self) -> &SpoolStorageEngine {
        &self.engine
    }
}

impl MessageHandler for SpoolHandler {
    fn handle<'a>(&'a self, message: &'a OutboundMessage) -> HandlerFuture<'a> {
        Box::pin(async move {
            debug!(
                message_id = %message.message_id,
                to = %message.to,
                "Writing message to spool"
            );
            self.engine.store(message).await.map_err(|e| {
                error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to write message to spool"
                );
                HandlerError::Storage(e.to_string())
            })?;
            info!(
                message_id = %message.message_id,
                from = %message.from,
                to = %message.to,
                "Spooled message"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "spool"
    }
}
