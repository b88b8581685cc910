//! License verification against the remote endpoint.
//!
//! Every send performs a live check, there is no cache. Transport problems
//! never surface as errors to the caller, they become a
//! [`Verification::Unreachable`] outcome instead.

use std::{future::Future, pin::Pin, time::Duration};

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{LicenseSettings, PipelineError};

/// Error text used when the endpoint rejects a key without saying why.
pub const DEFAULT_INVALID_ERROR: &str = "Invalid API key";

/// Error text used when the endpoint cannot be used.
pub const REQUEST_FAILED_ERROR: &str = "API request failed";

/// Boxed future type for license checks, enabling object safety.
pub type VerifyFuture<'a> = Pin<Box<dyn Future<Output = Verification> + Send + 'a>>;

/// Outcome of a single license check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid { plan: Option<String> },
    Invalid { error: String },
    Unreachable { error: String },
    /// The endpoint answered 200 with a body that could not be understood.
    Malformed { error: String },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid { .. })
    }

    /// Turns the outcome into the plan name or the matching pipeline error.
    pub fn into_result(self) -> Result<Option<String>, PipelineError> {
        match self {
            Verification::Valid { plan } => Ok(plan),
            Verification::Invalid { error } => Err(PipelineError::LicenseInvalid(error)),
            Verification::Unreachable { error } | Verification::Malformed { error } => {
                Err(PipelineError::LicenseUnreachable(error))
            }
        }
    }

    /// Records the outcome against the key that was checked.
    pub fn into_state(self, key: impl Into<String>) -> LicenseState {
        let key = key.into();
        match self {
            Verification::Valid { plan } => LicenseState {
                key,
                verified: true,
                plan,
                error: None,
            },
            Verification::Invalid { error }
            | Verification::Unreachable { error }
            | Verification::Malformed { error } => LicenseState {
                key,
                verified: false,
                plan: None,
                error: Some(error),
            },
        }
    }
}

/// The result of the latest license check for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseState {
    pub key: String,
    pub verified: bool,
    pub plan: Option<String>,
    pub error: Option<String>,
}

impl LicenseState {
    /// Human readable summary, e.g. `API key is valid (pro plan)`.
    pub fn summary(&self) -> String {
        if !self.verified {
            return self
                .error
                .clone()
                .unwrap_or_else(|| DEFAULT_INVALID_ERROR.to_string());
        }
        match &self.plan {
            Some(plan) if !plan.is_empty() => format!("API key is valid ({plan} plan)"),
            _ => "API key is valid".to_string(),
        }
    }
}

/// Trait for license verification backends.
pub trait LicenseVerifier: Send + Sync {
    /// Checks `key` for the sending `domain`.
    fn verify<'a>(&'a self, key: &'a str, domain: &'a str) -> VerifyFuture<'a>;
}

#[derive(Serialize)]
struct VerifyRequest<'a> {
    domain: &'a str,
}

#[derive(Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Verifies keys with a JSON `POST` to the license endpoint.
#[derive(Debug, Clone)]
pub struct HttpLicenseVerifier {
    client: Client,
    endpoint: String,
}

impl HttpLicenseVerifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn from_settings(settings: &LicenseSettings) -> reqwest::Result<Self> {
        Self::new(&settings.endpoint, Duration::from_secs(settings.timeout_secs))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request(&self, key: &str, domain: &str) -> Verification {
        let response = match self
            .client
            .post(&self.endpoint)
            .bearer_auth(key)
            .json(&VerifyRequest { domain })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Verification::Unreachable {
                    error: format!("{REQUEST_FAILED_ERROR}: {e}"),
                }
            }
        };

        let status = response.status();
        debug!(endpoint = %self.endpoint, status = %status, "License endpoint answered");
        if status != StatusCode::OK {
            return Verification::Unreachable {
                error: format!("{REQUEST_FAILED_ERROR} (HTTP {})", status.as_u16()),
            };
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Verification::Unreachable {
                    error: format!("{REQUEST_FAILED_ERROR}: {e}"),
                }
            }
        };
        parse_response(&body)
    }
}

impl LicenseVerifier for HttpLicenseVerifier {
    fn verify<'a>(&'a self, key: &'a str, domain: &'a str) -> VerifyFuture<'a> {
        Box::pin(self.request(key, domain))
    }
}

/// Interprets the body of a 200 response.
fn parse_response(body: &str) -> Verification {
    match serde_json::from_str::<VerifyResponse>(body) {
        Ok(VerifyResponse {
            valid: true, plan, ..
        }) => Verification::Valid { plan },
        Ok(VerifyResponse { error, .. }) => Verification::Invalid {
            error: error
                .filter(|error| !error.is_empty())
                .unwrap_or_else(|| DEFAULT_INVALID_ERROR.to_string()),
        },
        Err(e) => Verification::Malformed {
            error: format!("Malformed license response: {e}"),
        },
    }
}
