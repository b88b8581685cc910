mod session;

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mailveil_utils::{
    build_handler, load_config, load_tls_server_config, Config, CredentialStore,
    DeliveryPipeline, EncryptionEngine, EncryptionSettings, HeaderMap, HttpLicenseVerifier,
    IncomingMessage, InterceptOutcome, LicenseVerifier, MailInterceptor, MessageHandler,
    MessageIdTransformer, MessageTransformer, OutboundMessage, PolicyStore,
};
use tokio::{
    io::{split, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::session::{Flow, SmtpSession};

const TEST_SUBJECT: &str = "encryptmail.io Test Email";

#[derive(Debug, Parser)]
#[command(name = "mailveil-smtp", version, about = "SMTP relay that selectively encrypts outgoing mail")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the SMTP relay (default).
    Serve,
    /// Check the configured API key against the license service.
    VerifyKey,
    /// Send the standard test message to a recipient with an encryption policy.
    TestEmail { address: String },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 16)]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::VerifyKey => verify_key(&config.encryption).await,
        Command::TestEmail { address } => test_email(config, &address).await,
    }
}

fn build_verifier(settings: &EncryptionSettings) -> Result<HttpLicenseVerifier> {
    HttpLicenseVerifier::from_settings(&settings.license)
        .context("Failed to create license verification client")
}

fn build_interceptor(settings: &EncryptionSettings) -> Result<Arc<MailInterceptor>> {
    let policies =
        PolicyStore::from_settings(settings).context("Failed to load recipient policies")?;
    let verifier = build_verifier(settings)?;
    Ok(Arc::new(MailInterceptor::new(
        policies,
        Arc::new(verifier),
        EncryptionEngine::detect(),
        settings.domain.clone(),
        settings.fail_policy,
    )))
}

async fn serve(config: Config) -> Result<()> {
    let interceptor = build_interceptor(&config.encryption)?;
    let pipeline = DeliveryPipeline::from_config(&config.smtp, interceptor)
        .context("Failed to build delivery pipeline")?;

    let tls_acceptor = match &config.smtp.tls {
        Some(tls) => {
            let tls_config = load_tls_server_config(tls.cert.as_ref(), tls.key.as_ref())
                .context("Failed to load TLS configuration")?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        None => {
            warn!("No TLS certificate configured, STARTTLS disabled");
            None
        }
    };

    let credentials_file = &config.smtp.auth.credentials_file;
    let credentials = match CredentialStore::from_file(credentials_file.as_ref()) {
        Ok(credentials) => credentials,
        Err(e) if config.smtp.auth_required => {
            return Err(e).with_context(|| format!("Failed to read credentials from {credentials_file}"));
        }
        Err(e) => {
            warn!(path = %credentials_file, error = %e, "No credentials loaded");
            CredentialStore::default()
        }
    };
    let credentials = Arc::new(credentials);

    let listening = format!("{}:{}", config.smtp.host, config.smtp.port);
    let listener = TcpListener::bind(&listening)
        .await
        .with_context(|| format!("Failed to bind {listening}"))?;

    // single consumer, messages are processed one at a time
    let (tx, mut rx) = mpsc::channel::<IncomingMessage>(100);
    tokio::spawn(async move {
        while let Some(incoming) = rx.recv().await {
            for (rcpt, result) in pipeline.deliver_incoming(&incoming).await {
                if let Err(e) = result {
                    error!(from = %incoming.from, rcpt = %rcpt, error = %e, "Failed to deliver message");
                }
            }
        }
    });

    info!(
        address = %listening,
        starttls = tls_acceptor.is_some(),
        auth_required = config.smtp.auth_required,
        "Mailveil SMTP relay running"
    );

    let hostname = config.encryption.domain.clone();
    let auth_required = config.smtp.auth_required;
    loop {
        let (stream, peer) = listener.accept().await?;
        let session = SmtpSession::new(
            hostname.clone(),
            peer.to_string(),
            credentials.clone(),
            auth_required,
            tls_acceptor.is_some(),
        );
        let tls_acceptor = tls_acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, session, tls_acceptor, tx).await {
                warn!(peer = %peer, error = %e, "SMTP session ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    mut session: SmtpSession,
    tls_acceptor: Option<TlsAcceptor>,
    tx: mpsc::Sender<IncomingMessage>,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let (reader, mut writer) = split(stream);
    let mut reader = BufReader::new(reader);
    session.greet(&mut writer).await?;
    if session.run(&mut reader, &mut writer, &tx).await? == Flow::Closed {
        return Ok(());
    }

    // session only answers STARTTLS when an acceptor exists
    let Some(tls_acceptor) = tls_acceptor else {
        return Ok(());
    };
    let stream = reader.into_inner().unsplit(writer);
    let tls_stream = tls_acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;
    debug!("TLS handshake complete");
    session.start_tls();

    let (reader, mut writer) = split(tls_stream);
    let mut reader = BufReader::new(reader);
    session.run(&mut reader, &mut writer, &tx).await?;
    Ok(())
}

async fn verify_key(settings: &EncryptionSettings) -> Result<()> {
    if settings.api_key.trim().is_empty() {
        bail!("No API key configured");
    }
    let verifier = build_verifier(settings)?;
    info!(endpoint = %verifier.endpoint(), domain = %settings.domain, "Verifying API key");
    let state = verifier
        .verify(&settings.api_key, &settings.domain)
        .await
        .into_state(settings.api_key.as_str());
    println!("{}", state.summary());
    if !state.verified {
        bail!("API key verification failed");
    }
    Ok(())
}

async fn test_email(config: Config, address: &str) -> Result<()> {
    let address = address.trim();
    let interceptor = build_interceptor(&config.encryption)?;
    if interceptor.policies().find_config(address).is_none() {
        bail!("No encryption configured for {address}");
    }

    let mut message = test_message(&config.encryption.domain, address);
    MessageIdTransformer::new(config.encryption.domain.clone())
        .transform(&mut message)
        .await?;
    let outcome = interceptor.intercept(&mut message).await;
    match &outcome {
        InterceptOutcome::Encrypted(method) => {
            println!("Test message to {address} encrypted with {method}")
        }
        InterceptOutcome::Skipped(reason) => {
            println!("Test message to {address} was not encrypted ({reason})")
        }
        InterceptOutcome::Failed(e) => bail!("Failed to encrypt test message: {e}"),
    }

    let handler = build_handler(&config.smtp.delivery)
        .context("Failed to build delivery handler")?;
    handler
        .handle(&message)
        .await
        .with_context(|| format!("Failed to deliver test message via {}", handler.name()))?;
    println!("Test message {} delivered via {}", message.message_id, handler.name());
    Ok(())
}

fn test_message(domain: &str, address: &str) -> OutboundMessage {
    let body = format!(
        "This is a test email from encryptmail.io.\r\n\r\n\
        If you can read this message after decryption, encryption for this \
        recipient is working.\r\n\r\n\
        Sent at: {}\r\n\
        Recipient: {address}\r\n",
        Utc::now().to_rfc2822()
    );
    let mut headers = HeaderMap::new();
    headers.append("Date", &Utc::now().to_rfc2822());
    headers.append("From", &format!("mailveil@{domain}"));
    headers.append("To", address);
    headers.append("Content-Type", "text/plain; charset=UTF-8");
    OutboundMessage::new(
        format!("mailveil@{domain}"),
        address.to_string(),
        TEST_SUBJECT.to_string(),
        body.into_bytes(),
        headers,
    )
}
