use crate::{
    compose::EmailEnvelope,
    config::Config,
    error::{ConfigError, MailError},
    mailer::{Delivery, MailSender},
    validation::ContactSubmission,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Sends mail through the Resend HTTP API.
pub struct ResendMailer {
    client: Client,
    api_key: String,
    emails_url: String,
}

impl ResendMailer {
    pub fn new(api_key: impl Into<String>, api_url: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            api_key: api_key.into(),
            emails_url: format!("{}/emails", api_url.trim_end_matches('/')),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let resend = config
            .resend
            .as_ref()
            .ok_or(ConfigError::Missing("RESEND_API_KEY"))?;
        Ok(Self::new(resend.api_key.as_str(), &resend.api_url)?)
    }
}

#[derive(Serialize)]
struct SendEmailPayload<'a> {
    from: String,
    to: Vec<String>,
    reply_to: &'a str,
    subject: &'a str,
    html: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Deserialize)]
struct SendEmailResponse {
    id: String,
}

#[derive(Deserialize, Default)]
struct ApiErrorResponse {
    name: Option<String>,
    message: Option<String>,
}

#[async_trait]
impl MailSender for ResendMailer {
    async fn send(
        &self,
        _submission: &ContactSubmission,
        envelope: &EmailEnvelope,
    ) -> Result<Delivery, MailError> {
        let payload = SendEmailPayload {
            from: envelope.from.to_string(),
            to: vec![envelope.to.to_string()],
            reply_to: &envelope.reply_to,
            subject: &envelope.subject,
            html: &envelope.html,
            text: envelope.text.as_deref(),
        };
        let response = self
            .client
            .post(&self.emails_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body: ApiErrorResponse = response.json().await.unwrap_or_default();
            return Err(MailError::Api {
                status: status.as_u16(),
                name: body.name,
                message: body.message.unwrap_or_else(|| status.to_string()),
            });
        }
        let SendEmailResponse { id } = response.json().await?;
        info!("Message sent via Resend: {id}");
        Ok(Delivery::Sent { id })
    }

    async fn verify(&self) -> Result<&'static str, MailError> {
        Ok("resend")
    }
}
