//! Remote fetch of integration source documents.
//!
//! [`Fetcher`] is the transport seam of the pipeline. [`HttpFetcher`] issues
//! one HTTP request per run with the integration's auth materials; it never
//! retries. Tests substitute their own fetcher or point an integration at a
//! local server.
//!
//! | Auth mode | Effect |
//! |-----------|--------|
//! | `none` | no credentials |
//! | `bearer` | `Authorization: Bearer <secret>` |
//! | `basic` | HTTP basic auth, `username` / secret |
//! | `header` | `<name>: <secret>` |
//! | `query` | `?<name>=<secret>` |

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::{AuthConfig, AuthMode, FetchConfig, HttpMethod, IntegrationConfig};

/// Raised when the source document cannot be obtained.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no credential for {mode:?} auth: set {hint}")]
    MissingCredential { mode: AuthMode, hint: String },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("{url} did not return JSON: {reason}")]
    Decode { url: String, reason: String },
}

/// Everything needed to issue one fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: HttpMethod,
    pub auth: AuthConfig,
    pub params: Map<String, Value>,
}

impl FetchRequest {
    pub fn for_integration(integration: &IntegrationConfig, params: Map<String, Value>) -> Self {
        Self {
            url: integration.url.clone(),
            method: integration.method,
            auth: integration.auth.clone(),
            params,
        }
    }

    /// The secret for this request's auth mode, if it needs one.
    pub fn credential(&self) -> Result<Option<String>, TransportError> {
        if self.auth.mode == AuthMode::None {
            return Ok(None);
        }
        let from_env = self
            .auth
            .credential_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        match from_env.or_else(|| self.auth.credential.clone()) {
            Some(secret) => Ok(Some(secret)),
            None => Err(TransportError::MissingCredential {
                mode: self.auth.mode,
                hint: match &self.auth.credential_env {
                    Some(var) => format!("${}", var),
                    None => "auth.credential_env or auth.credential".to_string(),
                },
            }),
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<Value, TransportError>;
}

/// reqwest-backed [`Fetcher`].
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

/// Query-string form of a JSON parameter.
fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Value, TransportError> {
        let secret = request.credential()?;
        let url = request.url.clone();

        let mut builder = match request.method {
            HttpMethod::Get => {
                let pairs: Vec<(&str, String)> = request
                    .params
                    .iter()
                    .map(|(k, v)| (k.as_str(), query_value(v)))
                    .collect();
                self.client.get(&url).query(&pairs)
            }
            HttpMethod::Post => self.client.post(&url).json(&request.params),
        };

        if let Some(secret) = secret {
            builder = match request.auth.mode {
                AuthMode::None => builder,
                AuthMode::Bearer => builder.bearer_auth(secret),
                AuthMode::Basic => {
                    builder.basic_auth(request.auth.username.clone().unwrap_or_default(), Some(secret))
                }
                AuthMode::Header => {
                    builder.header(request.auth.name.clone().unwrap_or_default(), secret)
                }
                AuthMode::Query => builder.query(&[(
                    request.auth.name.clone().unwrap_or_default(),
                    secret,
                )]),
            };
        }

        let response = builder
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| TransportError::Request {
                url: url.clone(),
                source,
            })?;

        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        serde_json::from_str(&body).map_err(|e| TransportError::Decode {
            url,
            reason: e.to_string(),
        })
    }
}
