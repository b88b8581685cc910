use tracing::{debug, info};

use crate::{MessageTransformer, OutboundMessage, TransformFuture};

/// Transformer that ensures every message carries a `Message-ID` header.
///
/// An existing header wins and [`OutboundMessage::message_id`] is synced to
/// it. Otherwise a header is prepended from the generated id and the
/// configured domain.
pub struct MessageIdTransformer {
    domain: String,
}

impl MessageIdTransformer {
    pub fn new(domain: String) -> Self {
        info!(domain = %domain, "Message-ID transformer initialized");
        Self { domain }
    }
}

impl MessageTransformer for MessageIdTransformer {
    fn transform<'a>(&'a self, message: &'a mut OutboundMessage) -> TransformFuture<'a> {
        Box::pin(async move {
            if let Some(existing_id) = message.headers.get("Message-ID") {
                let cleaned = existing_id
                    .strip_prefix('<')
                    .and_then(|s| s.strip_suffix('>'))
                    .unwrap_or(existing_id)
                    .to_string();
                debug!(
                    old_id = %message.message_id,
                    header_id = %cleaned,
                    "Syncing message_id from existing header"
                );
                message.message_id = cleaned;
            } else {
                let value = format!("<{}@{}>", message.message_id, self.domain);
                debug!(message_id = %message.message_id, "Injecting Message-ID header");
                message.headers.prepend("Message-ID", &value);
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "message_id"
    }
}
