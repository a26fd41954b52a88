//! HTTP client for a Twilio-style messaging REST API.
//!
//! The client is constructed explicitly at startup and injected into the
//! dispatcher. Credential validation happens in [`HttpSmsProvider::new`]; a
//! misconfigured deployment fails at boot, not on the first send.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::phone::{normalize, E164};

use super::{ProviderError, SmsProvider};

/// Transport provider connection settings, loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the provider API.
    pub base_url: String,
    /// Account identifier, used in the URL path and as the basic-auth user.
    pub account_sid: String,
    /// Auth token, used as the basic-auth password.
    pub auth_token: String,
    /// Sender number, E.164 or any format `normalize` accepts.
    pub from_number: String,
    /// Per-send request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twilio.com".to_string(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            timeout_ms: 15_000,
        }
    }
}

impl ProviderConfig {
    /// Validate credentials and the sender number. Called once at startup;
    /// failure is fatal.
    pub fn validate(&self) -> anyhow::Result<E164> {
        if self.account_sid.is_empty() {
            anyhow::bail!("provider.account_sid is not set");
        }
        if self.auth_token.is_empty() {
            anyhow::bail!("provider.auth_token is not set");
        }
        normalize(&self.from_number)
            .map_err(|_| anyhow::anyhow!("provider.from_number {:?} is not a valid phone number", self.from_number))
    }
}

#[derive(Debug, Deserialize)]
struct SendAccepted {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct SendRejected {
    message: Option<String>,
}

/// Production SMS provider speaking the Twilio messages API shape:
/// form-encoded `To`/`From`/`Body` POST, JSON response carrying `sid`.
pub struct HttpSmsProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    from: E164,
}

impl HttpSmsProvider {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let from = config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            config,
            from,
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl SmsProvider for HttpSmsProvider {
    #[tracing::instrument(skip(self, body), fields(to = %to))]
    async fn send(&self, to: &E164, body: &str) -> Result<String, ProviderError> {
        let params = [
            ("To", to.as_str()),
            ("From", self.from.as_str()),
            ("Body", body),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "provider request failed");
                ProviderError::Transport(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            let accepted: SendAccepted = response
                .json()
                .await
                .map_err(|e| ProviderError::Transport(format!("malformed accept response: {e}")))?;
            tracing::debug!(provider_message_id = %accepted.sid, "provider accepted send");
            Ok(accepted.sid)
        } else {
            let detail = match response.json::<SendRejected>().await {
                Ok(SendRejected { message: Some(m) }) => m,
                _ => format!("HTTP {status}"),
            };
            tracing::warn!(status = %status, detail = %detail, "provider rejected send");
            Err(ProviderError::Rejected(detail))
        }
    }
}
