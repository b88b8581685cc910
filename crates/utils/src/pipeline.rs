use std::{path::PathBuf, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    handler::{HandlerError, HandlerResult, MessageHandler},
    transformer::MessageTransformer,
    HandlerConfig, IncomingMessage, MailInterceptor, MessageIdTransformer, OutboundMessage,
    SmtpConfig, SpoolHandler, TransformerConfig,
};

/// Runs the configured transformers over each message and hands the result
/// to the delivery handler.
///
/// A transformer error stops the message: it is reported as
/// [`HandlerError::Rejected`] and never reaches the handler.
pub struct DeliveryPipeline {
    transformers: Vec<Box<dyn MessageTransformer>>,
    handler: Arc<dyn MessageHandler>,
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field(
                "transformers",
                &self.transformers.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("handler", &self.handler.name())
            .finish()
    }
}

impl DeliveryPipeline {
    pub fn new(
        transformers: Vec<Box<dyn MessageTransformer>>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            transformers,
            handler,
        }
    }

    /// Builds the pipeline described by the `[smtp]` configuration, the
    /// `encryption` transformer being served by `interceptor`.
    pub fn from_config(config: &SmtpConfig, interceptor: Arc<MailInterceptor>) -> HandlerResult<Self> {
        let handler = build_handler(&config.delivery)?;

        let mut transformers: Vec<Box<dyn MessageTransformer>> = Vec::new();
        for transformer in &config.transformers {
            match transformer {
                TransformerConfig::MessageId { domain } => {
                    transformers.push(Box::new(MessageIdTransformer::new(domain.clone())));
                }
                TransformerConfig::Encryption => {
                    transformers.push(Box::new(interceptor.clone()));
                }
            }
        }
        if !config
            .transformers
            .contains(&TransformerConfig::Encryption)
        {
            warn!("Encryption transformer is not enabled, messages are relayed as-is");
        }

        let pipeline = Self::new(transformers, handler);
        info!(pipeline = ?pipeline, "Delivery pipeline initialized");
        Ok(pipeline)
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    /// Transforms and delivers a single message.
    pub async fn deliver(&self, message: &mut OutboundMessage) -> HandlerResult<()> {
        <MessageIdTransformer as MessageTransformer>::apply(&self.transformers, message)
            .await
            .map_err(|e| {
                warn!(
                    message_id = %message.message_id,
                    to = %message.to,
                    error = %e,
                    "Message refused by transformer, not delivering"
                );
                HandlerError::Rejected(e.to_string())
            })?;
        debug!(
            message_id = %message.message_id,
            handler = self.handler.name(),
            "Dispatching message to handler"
        );
        self.handler.handle(message).await
    }

    /// Splits an incoming message per recipient and delivers each copy in
    /// turn, returning the result for every recipient.
    pub async fn deliver_incoming(
        &self,
        incoming: &IncomingMessage,
    ) -> Vec<(String, HandlerResult<()>)> {
        let mut results = Vec::with_capacity(incoming.rcpts.len());
        for rcpt in &incoming.rcpts {
            let mut message = incoming.to_outbound(rcpt);
            let result = self.deliver(&mut message).await;
            results.push((rcpt.clone(), result));
        }
        results
    }
}

/// Creates the delivery handler for a handler configuration.
pub fn build_handler(config: &HandlerConfig) -> HandlerResult<Arc<dyn MessageHandler>> {
    match config {
        HandlerConfig::Spool { path } => Ok(Arc::new(SpoolHandler::new(PathBuf::from(path)))),
        #[cfg(feature = "smarthost")]
        HandlerConfig::Smarthost {
            host,
            port,
            starttls,
            username,
            password,
        } => {
            let credentials = username
                .clone()
                .map(|username| (username, password.clone().unwrap_or_default()));
            Ok(Arc::new(crate::SmarthostHandler::new(
                host,
                *port,
                *starttls,
                credentials,
            )?))
        }
        #[cfg(not(feature = "smarthost"))]
        HandlerConfig::Smarthost { .. } => Err(HandlerError::Connection(
            "Smarthost support is not available".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use tempfile::TempDir;

    use super::*;
    use crate::{
        handler::HandlerFuture, EncryptionConfig, EncryptionEngine, EncryptionMethod, FailPolicy,
        LicenseVerifier, PolicyStore, StorageEngine, Verification, VerifyFuture,
    };

    struct RecordingHandler {
        count: AtomicUsize,
        delivered: Mutex<Vec<OutboundMessage>>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                count: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl MessageHandler for RecordingHandler {
        fn handle<'a>(&'a self, message: &'a OutboundMessage) -> HandlerFuture<'a> {
            Box::pin(async move {
                self.count.fetch_add(1, Ordering::SeqCst);
                self.delivered.lock().unwrap().push(message.clone());
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct FixedVerifier(Verification);

    impl LicenseVerifier for FixedVerifier {
        fn verify<'a>(&'a self, _key: &'a str, _domain: &'a str) -> VerifyFuture<'a> {
            Box::pin(async move { self.0.clone() })
        }
    }

    fn interceptor(verification: Verification, fail_policy: FailPolicy) -> Arc<MailInterceptor> {
        let policies = PolicyStore::new(
            "em_live_123",
            vec![EncryptionConfig {
                recipient_email: "secure@example.com".to_string(),
                method: EncryptionMethod::Smime,
                key_material: crate::testing::smime_identity().certificate_pem.clone(),
                obscure_subject: false,
            }],
        );
        Arc::new(MailInterceptor::new(
            policies,
            Arc::new(FixedVerifier(verification)),
            EncryptionEngine::detect(),
            "example.com".to_string(),
            fail_policy,
        ))
    }

    fn boxed(interceptor: Arc<MailInterceptor>) -> Vec<Box<dyn MessageTransformer>> {
        vec![Box::new(interceptor)]
    }

    fn incoming() -> IncomingMessage {
        IncomingMessage {
            from: "sender@example.com".to_string(),
            rcpts: BTreeSet::from([
                "plain@example.com".to_string(),
                "secure@example.com".to_string(),
            ]),
            raw: b"Subject: Hi\r\n\r\nsecret".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_deliver_incoming_encrypts_per_recipient() {
        let handler = Arc::new(RecordingHandler::new());
        let transformers: Vec<Box<dyn MessageTransformer>> = vec![
            Box::new(MessageIdTransformer::new("example.com".to_string())),
            Box::new(interceptor(
                Verification::Valid { plan: None },
                FailPolicy::Open,
            )),
        ];
        let pipeline = DeliveryPipeline::new(transformers, handler.clone());

        let results = pipeline.deliver_incoming(&incoming()).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| result.is_ok()));
        let delivered = handler.delivered.lock().unwrap();
        let plain = delivered.iter().find(|m| m.to == "plain@example.com").unwrap();
        let secure = delivered.iter().find(|m| m.to == "secure@example.com").unwrap();
        assert_eq!(plain.body, b"secret");
        assert!(plain.headers.contains("Message-ID"));
        assert_eq!(secure.content_type, "application/x-pkcs7-mime");
        assert!(secure.headers.contains("Message-ID"));
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_only_matched_recipient() {
        let handler = Arc::new(RecordingHandler::new());
        let pipeline = DeliveryPipeline::new(
            boxed(interceptor(
                Verification::Invalid {
                    error: "Invalid API key".to_string(),
                },
                FailPolicy::Closed,
            )),
            handler.clone(),
        );

        let results = pipeline.deliver_incoming(&incoming()).await;

        assert!(results[0].1.is_ok());
        assert_eq!(results[1].0, "secure@example.com");
        assert!(matches!(results[1].1, Err(HandlerError::Rejected(_))));
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_fail_open_delivers_original() {
        let handler = Arc::new(RecordingHandler::new());
        let pipeline = DeliveryPipeline::new(
            boxed(interceptor(
                Verification::Unreachable {
                    error: "API request failed (HTTP 500)".to_string(),
                },
                FailPolicy::Open,
            )),
            handler.clone(),
        );

        let mut message = OutboundMessage::from_raw(
            "sender@example.com",
            "secure@example.com",
            "Subject: Hi\r\n\r\nsecret",
        );
        pipeline.deliver(&mut message).await.unwrap();

        let delivered = handler.delivered.lock().unwrap();
        assert_eq!(delivered[0].body, b"secret");
        assert_eq!(delivered[0].subject, "Hi");
    }

    #[tokio::test]
    async fn test_from_config_with_spool() {
        let temp_dir = TempDir::new().unwrap();
        let config = crate::parse_config(&format!(
            "[smtp]\n\n[smtp.delivery]\ntype = \"spool\"\npath = \"{}\"\n",
            temp_dir.path().display().to_string().replace('\\', "/")
        ))
        .unwrap();
        let pipeline = DeliveryPipeline::from_config(
            &config.smtp,
            interceptor(Verification::Valid { plan: None }, FailPolicy::Open),
        )
        .unwrap();
        assert_eq!(pipeline.handler().name(), "spool");

        let mut message = OutboundMessage::from_raw(
            "sender@example.com",
            "secure@example.com",
            "Subject: Hi\r\n\r\nsecret",
        );
        pipeline.deliver(&mut message).await.unwrap();

        let spool = crate::SpoolStorageEngine::new(temp_dir.path().to_path_buf());
        let ids = spool.list("secure@example.com").await.unwrap();
        assert_eq!(ids, vec![message.message_id.clone()]);
        let content = spool
            .retrieve("secure@example.com", &message.message_id)
            .await
            .unwrap();
        let content = String::from_utf8(content).unwrap();
        assert!(content.contains("smimetype=enveloped-data"));
        assert!(!content.contains("secret"));
    }
}
