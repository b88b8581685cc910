//! Upstream SMTP delivery.
//!
//! Provides [`SmarthostHandler`], which forwards every processed message to
//! a configured relay using `lettre`. The message is sent exactly as the
//! pipeline left it, no re-encoding takes place.

use lettre::{
    address::Envelope, transport::smtp::authentication::Credentials, Address, AsyncSmtpTransport,
    AsyncTransport, Tokio1Executor,
};
use tracing::{debug, error, info};

use crate::{
    handler::{HandlerError, HandlerFuture, HandlerResult, MessageHandler},
    OutboundMessage,
};

/// Message handler that relays messages to an upstream SMTP server.
pub struct SmarthostHandler {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmarthostHandler {
    /// Creates a handler for `host:port`, upgrading with STARTTLS when
    /// `starttls` is set.
    pub fn new(
        host: &str,
        port: u16,
        starttls: bool,
        credentials: Option<(String, String)>,
    ) -> HandlerResult<Self> {
        let builder = if starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(|e| {
                error!(host = %host, error = %e, "Failed to configure smarthost");
                HandlerError::Connection(format!("Failed to configure smarthost: {e}"))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let builder = builder.port(port);
        let authenticated = credentials.is_some();
        let builder = match credentials {
            Some((username, password)) => builder.credentials(Credentials::new(username, password)),
            None => builder,
        };

        info!(
            host = %host,
            port = port,
            starttls = starttls,
            authenticated = authenticated,
            "Smarthost handler initialized"
        );
        Ok(Self {
            transport: builder.build(),
            host: host.to_string(),
        })
    }
}

/// Builds the SMTP envelope for a message, an empty sender becomes the
/// null reverse-path.
fn envelope(message: &OutboundMessage) -> HandlerResult<Envelope> {
    let from = if message.from.is_empty() {
        None
    } else {
        Some(message.from.parse::<Address>().map_err(|e| {
            HandlerError::InvalidMessage(format!("Invalid sender {}: {e}", message.from))
        })?)
    };
    let to = message
        .to
        .parse::<Address>()
        .map_err(|e| HandlerError::InvalidMessage(format!("Invalid recipient {}: {e}", message.to)))?;
    Envelope::new(from, vec![to]).map_err(|e| HandlerError::InvalidMessage(e.to_string()))
}

impl MessageHandler for SmarthostHandler {
    fn handle<'a>(&'a self, message: &'a OutboundMessage) -> HandlerFuture<'a> {
        Box::pin(async move {
            let envelope = envelope(message)?;
            let bytes = message.to_bytes();
            debug!(
                message_id = %message.message_id,
                host = %self.host,
                size = bytes.len(),
                "Relaying message to smarthost"
            );
            self.transport
                .send_raw(&envelope, &bytes)
                .await
                .map_err(|e| {
                    error!(
                        message_id = %message.message_id,
                        host = %self.host,
                        error = %e,
                        "Failed to relay message"
                    );
                    HandlerError::Connection(e.to_string())
                })?;
            info!(
                message_id = %message.message_id,
                from = %message.from,
                to = %message.to,
                host = %self.host,
                "Relayed message"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "smarthost"
    }
}
