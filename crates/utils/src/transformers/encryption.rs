//! Selective per-recipient encryption of outbound messages.
//!
//! The [`MailInterceptor`] is registered as a transformer and inspects
//! every message just before delivery. Messages to recipients without a
//! policy pass through untouched. For recipients with a policy the license
//! is verified, the body is encrypted with the configured method and the
//! subject, body and MIME headers are replaced in one step. Failures leave
//! the message as it was and are handled according to the [`FailPolicy`].

use std::{fmt::Display, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    build_envelope, prepare_plaintext, EncryptionConfig, EncryptionEngine, EncryptionMethod,
    FailPolicy, LicenseVerifier, MessageTransformer, OutboundMessage, PipelineError, PolicyStore,
    ProcessingGuard, TransformError, TransformFuture,
};

/// Why a message was passed through without encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pass of the same interceptor is in progress.
    Reentrant,
    NoRecipient,
    NoLicenseKey,
    /// The recipient has no encryption policy.
    NoPolicy,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Reentrant => "reentrant",
            SkipReason::NoRecipient => "no_recipient",
            SkipReason::NoLicenseKey => "no_license_key",
            SkipReason::NoPolicy => "no_policy",
        }
    }
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single interceptor pass did to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptOutcome {
    Skipped(SkipReason),
    Encrypted(EncryptionMethod),
    /// A matched recipient's message could not be encrypted, it is unchanged.
    Failed(PipelineError),
}

/// Encrypts messages for recipients that have an encryption policy.
pub struct MailInterceptor {
    guard: ProcessingGuard,
    policies: PolicyStore,
    verifier: Arc<dyn LicenseVerifier>,
    engine: EncryptionEngine,
    domain: String,
    fail_policy: FailPolicy,
}

impl MailInterceptor {
    pub fn new(
        policies: PolicyStore,
        verifier: Arc<dyn LicenseVerifier>,
        engine: EncryptionEngine,
        domain: String,
        fail_policy: FailPolicy,
    ) -> Self {
        info!(
            recipients = policies.entries().len(),
            domain = %domain,
            fail_policy = ?fail_policy,
            "Encryption interceptor initialized"
        );
        Self {
            guard: ProcessingGuard::new(),
            policies,
            verifier,
            engine,
            domain,
            fail_policy,
        }
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub fn fail_policy(&self) -> FailPolicy {
        self.fail_policy
    }

    /// Runs one encryption pass over `message`.
    ///
    /// The message is either fully replaced by its encrypted form or left
    /// exactly as it was.
    pub async fn intercept(&self, message: &mut OutboundMessage) -> InterceptOutcome {
        let Some(_token) = self.guard.try_acquire() else {
            debug!(message_id = %message.message_id, "Encryption pass already running, skipping");
            return InterceptOutcome::Skipped(SkipReason::Reentrant);
        };

        if message.to.trim().is_empty() {
            debug!(message_id = %message.message_id, "Message has no recipient, skipping");
            return InterceptOutcome::Skipped(SkipReason::NoRecipient);
        }
        if self.policies.api_key().is_empty() {
            warn!(recipient = %message.to, "No API key configured, skipping encryption");
            return InterceptOutcome::Skipped(SkipReason::NoLicenseKey);
        }
        let Some(config) = self.policies.find_config(&message.to) else {
            debug!(recipient = %message.to, "No encryption policy for recipient");
            return InterceptOutcome::Skipped(SkipReason::NoPolicy);
        };

        match self.encrypt(message, config).await {
            Ok(()) => {
                info!(
                    message_id = %message.message_id,
                    recipient = %message.to,
                    method = %config.method,
                    obscure_subject = config.obscure_subject,
                    "Encrypted message"
                );
                InterceptOutcome::Encrypted(config.method)
            }
            Err(error) => {
                warn!(
                    message_id = %message.message_id,
                    recipient = %message.to,
                    method = %config.method,
                    kind = error.kind(),
                    error = %error,
                    fail_policy = ?self.fail_policy,
                    "Encryption failed, message left unchanged"
                );
                InterceptOutcome::Failed(error)
            }
        }
    }

    async fn encrypt(
        &self,
        message: &mut OutboundMessage,
        config: &EncryptionConfig,
    ) -> Result<(), PipelineError> {
        let plan = self
            .verifier
            .verify(self.policies.api_key(), &self.domain)
            .await
            .into_result()?;
        debug!(plan = plan.as_deref().unwrap_or("unknown"), "License verified");

        let plaintext = prepare_plaintext(&message.body, &message.subject, config.obscure_subject);
        let ciphertext = self
            .engine
            .encrypt(&plaintext, &config.key_material, config.method)?;
        let envelope = build_envelope(
            &ciphertext,
            config.method,
            config.obscure_subject,
            &message.subject,
        )?;

        // nothing below can fail
        message.subject = envelope.subject;
        message.body = envelope.body;
        // the old body's MIME description no longer applies
        message.headers.retain(|name, _| !is_content_header(name));
        for (name, value) in envelope.headers.iter() {
            message.apply_header(name, value);
        }
        Ok(())
    }
}

fn is_content_header(name: &str) -> bool {
    name.get(..8)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("content-"))
}

impl MessageTransformer for MailInterceptor {
    fn transform<'a>(&'a self, message: &'a mut OutboundMessage) -> TransformFuture<'a> {
        Box::pin(async move {
            match self.intercept(message).await {
                InterceptOutcome::Failed(source) if self.fail_policy == FailPolicy::Closed => {
                    Err(TransformError::Refused {
                        transformer: self.name().to_string(),
                        source,
                    })
                }
                _ => Ok(()),
            }
        })
    }

    fn name(&self) -> &str {
        "encryption"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, OnceLock,
    };

    use base64::{engine::general_purpose, Engine as _};

    use super::*;
    use crate::{
        testing::{decrypt_smime, smime_identity},
        EncryptionResult, Encryptor, Verification, VerifyFuture, OBSCURED_SUBJECT,
    };

    const RAW: &str = "From: sender@example.com\r\nTo: a@example.com\r\nSubject: Hi\r\n\r\nsecret";

    /// Verifier with a canned answer that can call back into an interceptor.
    struct StubVerifier {
        verification: Verification,
        calls: AtomicUsize,
        reenter: OnceLock<Arc<MailInterceptor>>,
        nested: Mutex<Option<(InterceptOutcome, OutboundMessage, OutboundMessage)>>,
    }

    impl StubVerifier {
        fn new(verification: Verification) -> Arc<Self> {
            Arc::new(Self {
                verification,
                calls: AtomicUsize::new(0),
                reenter: OnceLock::new(),
                nested: Mutex::new(None),
            })
        }

        fn valid() -> Arc<Self> {
            Self::new(Verification::Valid {
                plan: Some("pro".to_string()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl LicenseVerifier for StubVerifier {
        fn verify<'a>(&'a self, key: &'a str, domain: &'a str) -> VerifyFuture<'a> {
            Box::pin(async move {
                assert_eq!(key, "em_live_123");
                assert_eq!(domain, "example.com");
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(interceptor) = self.reenter.get() {
                    let mut message = OutboundMessage::from_raw("x@example.com", "a@example.com", RAW);
                    let before = message.clone();
                    let outcome = interceptor.intercept(&mut message).await;
                    *self.nested.lock().unwrap() = Some((outcome, before, message));
                }
                self.verification.clone()
            })
        }
    }

    struct CountingEncryptor {
        method: EncryptionMethod,
        calls: Arc<AtomicUsize>,
    }

    impl Encryptor for CountingEncryptor {
        fn encrypt(&self, _plaintext: &[u8], _key_material: &str) -> EncryptionResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"-----BEGIN PGP MESSAGE-----\n\nstub\n-----END PGP MESSAGE-----\n".to_vec())
        }

        fn method(&self) -> EncryptionMethod {
            self.method
        }
    }

    fn policy(method: EncryptionMethod, key_material: &str, obscure_subject: bool) -> PolicyStore {
        PolicyStore::new(
            "em_live_123",
            vec![EncryptionConfig {
                recipient_email: "a@example.com".to_string(),
                method,
                key_material: key_material.to_string(),
                obscure_subject,
            }],
        )
    }

    fn interceptor(
        policies: PolicyStore,
        verifier: Arc<StubVerifier>,
        fail_policy: FailPolicy,
    ) -> MailInterceptor {
        MailInterceptor::new(
            policies,
            verifier,
            EncryptionEngine::detect(),
            "example.com".to_string(),
            fail_policy,
        )
    }

    fn smime_policy(obscure_subject: bool) -> PolicyStore {
        policy(
            EncryptionMethod::Smime,
            &smime_identity().certificate_pem,
            obscure_subject,
        )
    }

    /// Log output collected by a scoped `fmt` subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    fn stub_pgp_engine() -> EncryptionEngine {
        EncryptionEngine::new(
            Box::new(CountingEncryptor {
                method: EncryptionMethod::Smime,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            Box::new(CountingEncryptor {
                method: EncryptionMethod::Pgp,
                calls: Arc::new(AtomicUsize::new(0)),
            }),
        )
    }

    fn decrypt_body(message: &OutboundMessage) -> Vec<u8> {
        let encoded: String = message.body_text().split("\r\n").collect();
        let der = general_purpose::STANDARD.decode(encoded).unwrap();
        decrypt_smime(&der, smime_identity())
    }

    #[tokio::test]
    async fn test_smime_recipient_is_encrypted() {
        let verifier = StubVerifier::valid();
        let interceptor = interceptor(smime_policy(false), verifier.clone(), FailPolicy::Open);
        let mut message = OutboundMessage::from_raw("sender@example.com", "a@example.com", RAW);

        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(outcome, InterceptOutcome::Encrypted(EncryptionMethod::Smime));
        assert_eq!(verifier.calls(), 1);
        assert_eq!(message.subject, "Hi");
        assert!(message
            .headers
            .get("Content-Type")
            .unwrap()
            .contains("smimetype=enveloped-data"));
        assert_eq!(message.content_type, "application/x-pkcs7-mime");
        assert_eq!(message.headers.get("From"), Some("sender@example.com"));
        assert_eq!(decrypt_body(&message), b"secret");
        assert!(!interceptor.guard.is_active());
    }

    #[tokio::test]
    async fn test_invalid_license_leaves_message_unchanged() {
        let verifier = StubVerifier::new(Verification::Invalid {
            error: "Invalid API key".to_string(),
        });
        let interceptor = interceptor(smime_policy(false), verifier.clone(), FailPolicy::Open);
        let mut message = OutboundMessage::from_raw("sender@example.com", "a@example.com", RAW);
        let before = message.to_bytes();
        let (logs, _guard) = capture_logs();

        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(
            outcome,
            InterceptOutcome::Failed(PipelineError::LicenseInvalid("Invalid API key".to_string()))
        );
        assert_eq!(message.to_bytes(), before);
        assert_eq!(verifier.calls(), 1);

        let logs = logs.contents();
        let event = logs
            .lines()
            .find(|line| line.contains("Encryption failed, message left unchanged"))
            .unwrap();
        assert!(event.contains("WARN"));
        assert!(event.contains("kind=\"license_invalid\""));
        assert!(event.contains("recipient=a@example.com"));
    }

    #[tokio::test]
    async fn test_unmatched_recipient_is_byte_identical() {
        let raw: &[u8] = b"Subject: Hi\r\nFrom: sender@example.com\r\nX-Long: one\r\n two\r\n\
            Content-Type: text/plain; charset=iso-8859-1\r\n\r\ncaf\xe9\r\n";
        let verifier = StubVerifier::valid();
        let interceptor = interceptor(smime_policy(false), verifier.clone(), FailPolicy::Open);
        let mut message = OutboundMessage::from_raw("sender@example.com", "b@example.com", raw);

        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(outcome, InterceptOutcome::Skipped(SkipReason::NoPolicy));
        assert_eq!(message.to_bytes(), raw);
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_eight_bit_body_round_trips() {
        let verifier = StubVerifier::valid();
        let interceptor = interceptor(smime_policy(false), verifier, FailPolicy::Open);
        let mut message = OutboundMessage::from_raw(
            "sender@example.com",
            "a@example.com",
            b"Content-Type: text/plain; charset=iso-8859-1\r\nSubject: Hi\r\n\r\ncaf\xe9 cr\xe8me\r\n",
        );

        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(outcome, InterceptOutcome::Encrypted(EncryptionMethod::Smime));
        assert_eq!(decrypt_body(&message), b"caf\xe9 cr\xe8me\r\n");
    }

    #[tokio::test]
    async fn test_stale_content_headers_are_replaced() {
        let verifier = StubVerifier::valid();
        let interceptor = MailInterceptor::new(
            policy(EncryptionMethod::Pgp, "key", false),
            verifier,
            stub_pgp_engine(),
            "example.com".to_string(),
            FailPolicy::Open,
        );
        let mut message = OutboundMessage::from_raw(
            "sender@example.com",
            "a@example.com",
            "From: sender@example.com\r\n\
            Content-Type: application/pdf; name=report.pdf\r\n\
            Content-Disposition: attachment; filename=report.pdf\r\n\
            Content-ID: <part1@example.com>\r\n\
            Content-Description: Quarterly report\r\n\
            Content-Transfer-Encoding: base64\r\n\
            Subject: Hi\r\n\r\nJVBERi0xLjQ=\r\n",
        );

        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(outcome, InterceptOutcome::Encrypted(EncryptionMethod::Pgp));
        assert_eq!(message.headers.get("From"), Some("sender@example.com"));
        assert_eq!(
            message.headers.get("Content-Type"),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(
            message.headers.get("Content-Transfer-Encoding"),
            Some("7bit")
        );
        assert_eq!(message.headers.get("MIME-Version"), Some("1.0"));
        assert!(message.headers.get("Content-Disposition").is_none());
        assert!(message.headers.get("Content-ID").is_none());
        assert!(message.headers.get("Content-Description").is_none());
        assert_eq!(message.content_type, "text/plain");
    }

    #[tokio::test]
    async fn test_unmatched_recipient_skips_license_check() {
        let verifier = StubVerifier::valid();
        let interceptor = interceptor(smime_policy(false), verifier.clone(), FailPolicy::Open);
        let mut message = OutboundMessage::from_raw("sender@example.com", "b@example.com", RAW);
        let before = message.clone();

        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(outcome, InterceptOutcome::Skipped(SkipReason::NoPolicy));
        assert_eq!(message, before);
        assert_eq!(message.to_bytes(), RAW.as_bytes());
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_obscured_subject_moves_into_body() {
        let verifier = StubVerifier::valid();
        let interceptor = interceptor(smime_policy(true), verifier, FailPolicy::Open);
        let mut message = OutboundMessage::from_raw(
            "sender@example.com",
            "a@example.com",
            "Subject: Quarterly Report\r\n\r\nNumbers are up.",
        );

        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(outcome, InterceptOutcome::Encrypted(EncryptionMethod::Smime));
        assert_eq!(message.subject, OBSCURED_SUBJECT);
        assert_eq!(
            decrypt_body(&message),
            b"Original Subject: Quarterly Report\r\n\r\nNumbers are up."
        );
    }

    #[tokio::test]
    async fn test_empty_recipient_and_missing_key_are_skipped() {
        let verifier = StubVerifier::valid();
        let interceptor = interceptor(smime_policy(false), verifier.clone(), FailPolicy::Open);
        let mut message = OutboundMessage::from_raw("sender@example.com", " ", RAW);
        assert_eq!(
            interceptor.intercept(&mut message).await,
            InterceptOutcome::Skipped(SkipReason::NoRecipient)
        );

        let keyless = MailInterceptor::new(
            PolicyStore::new("", smime_policy(false).entries().to_vec()),
            verifier.clone(),
            EncryptionEngine::detect(),
            "example.com".to_string(),
            FailPolicy::Open,
        );
        let mut message = OutboundMessage::from_raw("sender@example.com", "a@example.com", RAW);
        assert_eq!(
            keyless.intercept(&mut message).await,
            InterceptOutcome::Skipped(SkipReason::NoLicenseKey)
        );
        assert_eq!(verifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_reentrant_call_is_skipped() {
        let verifier = StubVerifier::valid();
        let smime_calls = Arc::new(AtomicUsize::new(0));
        let pgp_calls = Arc::new(AtomicUsize::new(0));
        let interceptor = Arc::new(MailInterceptor::new(
            policy(EncryptionMethod::Pgp, "key", false),
            verifier.clone(),
            EncryptionEngine::new(
                Box::new(CountingEncryptor {
                    method: EncryptionMethod::Smime,
                    calls: smime_calls.clone(),
                }),
                Box::new(CountingEncryptor {
                    method: EncryptionMethod::Pgp,
                    calls: pgp_calls.clone(),
                }),
            ),
            "example.com".to_string(),
            FailPolicy::Open,
        ));
        assert!(verifier.reenter.set(interceptor.clone()).is_ok());

        let mut message = OutboundMessage::from_raw("sender@example.com", "a@example.com", RAW);
        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(outcome, InterceptOutcome::Encrypted(EncryptionMethod::Pgp));
        let (nested, before, after) = verifier.nested.lock().unwrap().take().unwrap();
        assert_eq!(nested, InterceptOutcome::Skipped(SkipReason::Reentrant));
        assert_eq!(before, after);
        // only the outer pass reached the verifier and the engine
        assert_eq!(verifier.calls(), 1);
        assert_eq!(pgp_calls.load(Ordering::SeqCst), 1);
        assert_eq!(smime_calls.load(Ordering::SeqCst), 0);
        assert!(!interceptor.guard.is_active());
    }

    #[tokio::test]
    async fn test_invalid_certificate_fails_open() {
        let verifier = StubVerifier::valid();
        let interceptor = interceptor(
            policy(EncryptionMethod::Smime, "not a certificate", false),
            verifier,
            FailPolicy::Open,
        );
        let mut message = OutboundMessage::from_raw("sender@example.com", "a@example.com", RAW);

        let outcome = interceptor.intercept(&mut message).await;
        assert!(matches!(
            outcome,
            InterceptOutcome::Failed(PipelineError::InvalidCertificate(_))
        ));
        assert_eq!(message.to_bytes(), RAW.as_bytes());

        let mut message = OutboundMessage::from_raw("sender@example.com", "a@example.com", RAW);
        assert!(interceptor.transform(&mut message).await.is_ok());
        assert_eq!(message.to_bytes(), RAW.as_bytes());
    }

    #[tokio::test]
    async fn test_fail_closed_refuses_message() {
        let verifier = StubVerifier::new(Verification::Unreachable {
            error: "API request failed (HTTP 503)".to_string(),
        });
        let interceptor = interceptor(smime_policy(false), verifier, FailPolicy::Closed);
        let mut message = OutboundMessage::from_raw("sender@example.com", "a@example.com", RAW);

        let result = interceptor.transform(&mut message).await;

        assert_eq!(
            result,
            Err(TransformError::Refused {
                transformer: "encryption".to_string(),
                source: PipelineError::LicenseUnreachable(
                    "API request failed (HTTP 503)".to_string()
                ),
            })
        );
        assert_eq!(message.to_bytes(), RAW.as_bytes());
    }

    #[tokio::test]
    async fn test_fail_closed_passes_unmatched_recipients() {
        let verifier = StubVerifier::new(Verification::Invalid {
            error: "Invalid API key".to_string(),
        });
        let interceptor = interceptor(smime_policy(false), verifier, FailPolicy::Closed);
        let mut message = OutboundMessage::from_raw("sender@example.com", "b@example.com", RAW);

        assert!(interceptor.transform(&mut message).await.is_ok());
    }

    #[cfg(feature = "pgp")]
    #[tokio::test]
    async fn test_pgp_recipient_is_encrypted() {
        use crate::testing::{decrypt_pgp, pgp_identity};

        let identity = pgp_identity();
        let verifier = StubVerifier::valid();
        let interceptor = interceptor(
            policy(EncryptionMethod::Pgp, &identity.public_armored, false),
            verifier,
            FailPolicy::Open,
        );
        let mut message = OutboundMessage::from_raw(
            "sender@example.com",
            "a@example.com",
            "Content-Type: text/html; charset=utf-8\r\nSubject: Hi\r\n\r\n<p>secret</p>",
        );

        let outcome = interceptor.intercept(&mut message).await;

        assert_eq!(outcome, InterceptOutcome::Encrypted(EncryptionMethod::Pgp));
        assert_eq!(message.content_type, "text/plain");
        assert_eq!(
            message.headers.get("Content-Transfer-Encoding"),
            Some("7bit")
        );
        assert_eq!(decrypt_pgp(&message.body, identity), b"<p>secret</p>");
    }
}
