//! In-pipeline message transformations.
//!
//! Transformers run after a message has been split per recipient and
//! before it is handed to the delivery handler, allowing headers to be
//! injected or the body to be replaced (encrypted) in place. Concrete
//! implementations live in the [`transformers`](crate::transformers)
//! module.

use std::{future::Future, pin::Pin, sync::Arc};

use thiserror::Error;
use tracing::debug;

use crate::{OutboundMessage, PipelineError};

/// Result type for transformer operations.
pub type TransformResult = Result<(), TransformError>;

/// Boxed future type for transformer operations, enabling async transformers.
pub type TransformFuture<'a> = Pin<Box<dyn Future<Output = TransformResult> + Send + 'a>>;

/// Errors that make a transformer refuse a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// The message must not be delivered in its current form.
    #[error("{transformer} refused the message: {source}")]
    Refused {
        transformer: String,
        source: PipelineError,
    },
}

/// Trait for message transformers that modify messages in the pipeline.
///
/// Transformers may perform async operations such as license checks. A
/// transformer that returns an error must leave the message untouched.
pub trait MessageTransformer: Send + Sync {
    /// Transforms a message in place, possibly performing async operations.
    fn transform<'a>(&'a self, message: &'a mut OutboundMessage) -> TransformFuture<'a>;

    /// Returns the name of this transformer.
    fn name(&self) -> &str;

    /// Applies a list of transformers to a message in order, stopping at the
    /// first error.
    fn apply<'a>(
        transformers: &'a [Box<dyn MessageTransformer>],
        message: &'a mut OutboundMessage,
    ) -> TransformFuture<'a>
    where
        Self: Sized,
    {
        Box::pin(async move {
            for transformer in transformers {
                debug!(transformer = transformer.name(), "Applying transformer");
                transformer.transform(message).await?;
            }
            Ok(())
        })
    }
}

impl<T: MessageTransformer + ?Sized> MessageTransformer for Arc<T> {
    fn transform<'a>(&'a self, message: &'a mut OutboundMessage) -> TransformFuture<'a> {
        (**self).transform(message)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
