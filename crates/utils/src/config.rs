use std::{fs, path::Path};

use serde::Deserialize;
use thiserror::Error;

/// Top-level configuration for the Mailveil relay.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub encryption: EncryptionSettings,
}

/// SMTP relay configuration.
#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub auth_required: bool,

    /// STARTTLS is offered only when a certificate is configured.
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub delivery: HandlerConfig,

    /// Transformers applied, in order, to every outbound message.
    #[serde(default = "default_transformers")]
    pub transformers: Vec<TransformerConfig>,
}

/// TLS certificate configuration.
#[derive(Debug, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert")]
    pub cert: String,

    #[serde(default = "default_key")]
    pub key: String,
}

/// Authentication configuration.
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
        }
    }
}

/// Configuration of the handler that delivers processed messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum HandlerConfig {
    /// Writes messages to a local spool directory.
    #[serde(rename = "spool")]
    Spool {
        #[serde(default = "default_spool_path")]
        path: String,
    },

    /// Forwards messages to an upstream SMTP server.
    #[serde(rename = "smarthost")]
    Smarthost {
        host: String,
        #[serde(default = "default_smarthost_port")]
        port: u16,
        #[serde(default = "default_true")]
        starttls: bool,
        username: Option<String>,
        password: Option<String>,
    },
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig::Spool {
            path: default_spool_path(),
        }
    }
}

/// Configuration for a message transformer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum TransformerConfig {
    /// Ensures a Message-ID header exists on every message.
    #[serde(rename = "message_id")]
    MessageId {
        /// Domain used when generating new Message-ID values.
        #[serde(default = "default_message_id_domain")]
        domain: String,
    },

    /// Per-recipient encryption driven by the `[encryption]` table.
    #[serde(rename = "encryption")]
    Encryption,
}

/// What happens to a matched recipient's message when encryption cannot
/// be performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailPolicy {
    /// Deliver the original, unencrypted message and log the failure.
    #[default]
    Open,
    /// Refuse delivery of the message.
    Closed,
}

/// Settings of the encryption pipeline, as supplied by the operator.
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionSettings {
    /// License key sent to the verification endpoint.
    #[serde(default)]
    pub api_key: String,

    /// Sending domain reported to the verification endpoint.
    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default)]
    pub fail_policy: FailPolicy,

    #[serde(default)]
    pub license: LicenseSettings,

    #[serde(default)]
    pub recipients: Vec<RecipientSettings>,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            domain: default_domain(),
            fail_policy: FailPolicy::default(),
            license: LicenseSettings::default(),
            recipients: Vec::new(),
        }
    }
}

/// License verification endpoint settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LicenseSettings {
    #[serde(default = "default_license_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_license_timeout")]
    pub timeout_secs: u64,
}

impl Default for LicenseSettings {
    fn default() -> Self {
        Self {
            endpoint: default_license_endpoint(),
            timeout_secs: default_license_timeout(),
        }
    }
}

/// A single recipient policy as written in the configuration file.
///
/// Values are raw, they are validated when turned into an
/// [`EncryptionConfig`](crate::EncryptionConfig) by the
/// [`PolicyStore`](crate::PolicyStore).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecipientSettings {
    #[serde(default)]
    pub email: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Inline key material (PEM certificate or armored public key).
    pub key: Option<String>,

    /// Path to a file holding the key material, used when `key` is unset.
    pub key_file: Option<String>,

    #[serde(default)]
    pub obscure_subject: bool,
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

/// Parses configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    toml::from_str(content).map_err(ConfigError::Parse)
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An I/O error occurred reading the file.
    #[error("Config I/O error: {0}")]
    Io(std::io::Error),

    /// A parse error occurred deserializing TOML.
    #[error("Config parse error: {0}")]
    Parse(toml::de::Error),

    /// A recipient's key file could not be read.
    #[error("Key file {path} for {email} could not be read: {source}")]
    KeyFile {
        email: String,
        path: String,
        source: std::io::Error,
    },
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2525
}

fn default_cert() -> String {
    "certs/server.cert.pem".to_string()
}

fn default_key() -> String {
    "certs/server.key.pem".to_string()
}

fn default_credentials_file() -> String {
    "passwords/example.txt".to_string()
}

fn default_spool_path() -> String {
    "outbox".to_string()
}

fn default_smarthost_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_message_id_domain() -> String {
    "localhost".to_string()
}

fn default_transformers() -> Vec<TransformerConfig> {
    vec![
        TransformerConfig::MessageId {
            domain: default_message_id_domain(),
        },
        TransformerConfig::Encryption,
    ]
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_license_endpoint() -> String {
    "https://api.encryptmail.io/v1/verify".to_string()
}

fn default_license_timeout() -> u64 {
    15
}

fn default_method() -> String {
    "smime".to_string()
}
