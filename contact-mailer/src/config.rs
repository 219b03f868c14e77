use crate::{
    error::ConfigError,
    queue::QueueConfig,
    transport::{SecurityPolicy, SmtpConfig, SmtpCredentials, SmtpTimeouts},
};
use lettre::{message::Mailbox, Address};
use std::{str::FromStr, time::Duration};
use tracing::info;

const DEFAULT_APP_PORT: u16 = 3001;
const DEFAULT_SMTP_HOST: &str = "ssl0.ovh.net";
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(30);
const DEFAULT_SITE_NAME: &str = "Devom";
const DEFAULT_SITE_HOST: &str = "devom.fr";
const DEFAULT_RESEND_API_URL: &str = "https://api.resend.com";
const DEFAULT_REDIS_HOST: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 6379;
const DEFAULT_QUEUE_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_QUEUE_BACKOFF: Duration = Duration::from_secs(5);

pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:3002",
    "https://devom.fr",
    "https://www.devom.fr",
    "https://devom-frontend.vercel.app",
];

/// The way outgoing mail leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Smtp,
    SmtpWithFallback,
    Resend,
    Queued,
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "smtp" => Ok(TransportKind::Smtp),
            "smtp-fallback" => Ok(TransportKind::SmtpWithFallback),
            "resend" => Ok(TransportKind::Resend),
            "queued" => Ok(TransportKind::Queued),
            _ => Err(ConfigError::Invalid {
                key: "MAIL_TRANSPORT",
                value: value.into(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub name: String,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct ResendConfig {
    pub api_key: String,
    pub api_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub transport: TransportKind,
    pub worker_transport: TransportKind,
    pub smtp: SmtpConfig,
    pub resend: Option<ResendConfig>,
    pub queue: QueueConfig,
    pub site: SiteConfig,
    pub from: Mailbox,
    pub to: Mailbox,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let listen_port = match var("APP_PORT").or_else(|| var("PORT")) {
            Some(value) => parse_value("APP_PORT", &value)?,
            None => DEFAULT_APP_PORT,
        };

        let resend = var("RESEND_API_KEY").map(|api_key| ResendConfig {
            api_key,
            api_url: var("RESEND_API_URL").unwrap_or_else(|| DEFAULT_RESEND_API_URL.into()),
        });
        let default_delivery = if resend.is_some() {
            TransportKind::Resend
        } else {
            TransportKind::SmtpWithFallback
        };
        let transport = match var("MAIL_TRANSPORT") {
            Some(value) => value.parse()?,
            None => default_delivery,
        };
        let worker_transport = match var("MAIL_WORKER_TRANSPORT") {
            Some(value) => match value.parse()? {
                TransportKind::Queued => {
                    return Err(ConfigError::Invalid {
                        key: "MAIL_WORKER_TRANSPORT",
                        value,
                    })
                }
                kind => kind,
            },
            None => default_delivery,
        };
        let uses_resend =
            transport == TransportKind::Resend || worker_transport == TransportKind::Resend;
        if uses_resend && resend.is_none() {
            return Err(ConfigError::Missing("RESEND_API_KEY"));
        }

        let smtp_user = var("SMTP_USER").or_else(|| var("EMAIL_USER"));
        let smtp_pass = var("SMTP_PASS").or_else(|| var("MAIL_PASS"));
        let credentials = match (smtp_user.clone(), smtp_pass) {
            (Some(username), Some(password)) => Some(SmtpCredentials { username, password }),
            _ => None,
        };
        let smtp = SmtpConfig {
            host: var("SMTP_HOST").unwrap_or_else(|| DEFAULT_SMTP_HOST.into()),
            port: match var("SMTP_PORT") {
                Some(value) => parse_value("SMTP_PORT", &value)?,
                None => DEFAULT_SMTP_PORT,
            },
            credentials,
            security: match var("SMTP_TLS").as_deref() {
                None | Some("required") => SecurityPolicy::Required,
                Some("none") => SecurityPolicy::Plaintext,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "SMTP_TLS",
                        value: other.into(),
                    })
                }
            },
            timeouts: SmtpTimeouts::default(),
            retry_cooldown: match var("SMTP_RETRY_COOLDOWN_SECS").as_deref() {
                None => Some(DEFAULT_RETRY_COOLDOWN),
                Some("never") => None,
                Some(value) => Some(Duration::from_secs(parse_value(
                    "SMTP_RETRY_COOLDOWN_SECS",
                    value,
                )?)),
            },
        };

        let site = SiteConfig {
            name: var("SITE_NAME").unwrap_or_else(|| DEFAULT_SITE_NAME.into()),
            host: var("SITE_HOST").unwrap_or_else(|| DEFAULT_SITE_HOST.into()),
        };

        let from_email = var("FROM_EMAIL");
        if uses_resend && from_email.is_none() {
            return Err(ConfigError::Missing("FROM_EMAIL"));
        }
        let to_email = var("EMAIL_TO")
            .or_else(|| smtp_user.clone())
            .or_else(|| from_email.clone())
            .ok_or(ConfigError::Missing("EMAIL_TO"))?;
        let from_email = from_email
            .or(smtp_user)
            .ok_or(ConfigError::Missing("FROM_EMAIL"))?;
        let from = Mailbox::new(
            Some(site.name.clone()),
            parse_value::<Address>("FROM_EMAIL", &from_email)?,
        );
        let to = Mailbox::new(None, parse_value::<Address>("EMAIL_TO", &to_email)?);

        let queue = QueueConfig {
            host: var("REDIS_HOST").unwrap_or_else(|| DEFAULT_REDIS_HOST.into()),
            port: match var("REDIS_PORT") {
                Some(value) => parse_value("REDIS_PORT", &value)?,
                None => DEFAULT_REDIS_PORT,
            },
            max_attempts: match var("QUEUE_MAX_ATTEMPTS") {
                Some(value) => parse_value("QUEUE_MAX_ATTEMPTS", &value)?,
                None => DEFAULT_QUEUE_MAX_ATTEMPTS,
            },
            backoff: match var("QUEUE_BACKOFF_SECS") {
                Some(value) => Duration::from_secs(parse_value("QUEUE_BACKOFF_SECS", &value)?),
                None => DEFAULT_QUEUE_BACKOFF,
            },
        };

        let allowed_origins = match var("CORS_ALLOWED_ORIGINS") {
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect(),
        };

        Ok(Self {
            listen_port,
            transport,
            worker_transport,
            smtp,
            resend,
            queue,
            site,
            from,
            to,
            allowed_origins,
        })
    }

    /// Logs the configuration without any secrets.
    pub fn log_summary(&self) {
        info!(
            transport = ?self.transport,
            worker_transport = ?self.worker_transport,
            from = %self.from,
            to = %self.to,
            smtp_host = %self.smtp.host,
            smtp_port = self.smtp.port,
            implicit_tls = self.smtp.uses_implicit_tls(),
            credentials_present = self.smtp.credentials.is_some(),
            resend_key_present = self.resend.is_some(),
            "Mail configuration"
        );
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::{Config, TransportKind};
    use crate::{error::ConfigError, transport::SecurityPolicy};
    use googletest::prelude::*;
    use std::{collections::HashMap, time::Duration};

    fn config_from(vars: &[(&str, &str)]) -> std::result::Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_smtp_with_fallback_without_api_key() -> Result<()> {
        let config = config_from(&[("SMTP_USER", "contact@devom.fr"), ("SMTP_PASS", "secret")])
            .unwrap();

        verify_that!(config.transport, eq(TransportKind::SmtpWithFallback))?;
        verify_that!(config.smtp.port, eq(587))?;
        verify_that!(config.listen_port, eq(3001))?;
        verify_that!(config.from.email.to_string(), eq("contact@devom.fr"))?;
        verify_that!(config.to.email.to_string(), eq("contact@devom.fr"))
    }

    #[test]
    fn defaults_to_resend_with_api_key() -> Result<()> {
        let config = config_from(&[
            ("RESEND_API_KEY", "re_123"),
            ("FROM_EMAIL", "noreply@devom.fr"),
            ("EMAIL_TO", "team@devom.fr"),
        ])
        .unwrap();

        verify_that!(config.transport, eq(TransportKind::Resend))?;
        verify_that!(config.to.email.to_string(), eq("team@devom.fr"))
    }

    #[test]
    fn requires_from_email_for_resend() -> Result<()> {
        verify_that!(
            config_from(&[("RESEND_API_KEY", "re_123"), ("SMTP_USER", "a@b.com")]),
            err(matches_pattern!(ConfigError::Missing(eq("FROM_EMAIL"))))
        )
    }

    #[test]
    fn requires_some_address() -> Result<()> {
        verify_that!(
            config_from(&[]),
            err(matches_pattern!(ConfigError::Missing(anything())))
        )
    }

    #[test]
    fn rejects_queued_worker_transport() -> Result<()> {
        verify_that!(
            config_from(&[
                ("SMTP_USER", "a@b.com"),
                ("MAIL_WORKER_TRANSPORT", "queued")
            ]),
            err(matches_pattern!(ConfigError::Invalid {
                key: eq("MAIL_WORKER_TRANSPORT"),
                value: eq("queued"),
            }))
        )
    }

    #[test]
    fn reads_retry_cooldown() -> Result<()> {
        let never = config_from(&[
            ("SMTP_USER", "a@b.com"),
            ("SMTP_RETRY_COOLDOWN_SECS", "never"),
        ])
        .unwrap();
        let short = config_from(&[
            ("SMTP_USER", "a@b.com"),
            ("SMTP_RETRY_COOLDOWN_SECS", "5"),
        ])
        .unwrap();

        verify_that!(never.smtp.retry_cooldown, none())?;
        verify_that!(short.smtp.retry_cooldown, some(eq(Duration::from_secs(5))))
    }

    #[test]
    fn reads_plaintext_security() -> Result<()> {
        let config = config_from(&[("SMTP_USER", "a@b.com"), ("SMTP_TLS", "none")]).unwrap();

        verify_that!(config.smtp.security, eq(SecurityPolicy::Plaintext))
    }

    #[test]
    fn splits_allowed_origins() -> Result<()> {
        let config = config_from(&[
            ("SMTP_USER", "a@b.com"),
            ("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example"),
        ])
        .unwrap();

        verify_that!(
            config.allowed_origins,
            elements_are![eq("https://a.example"), eq("https://b.example")]
        )
    }
}
