//! SMTP transport management.
//!
//! [`SmtpTransportManager`] owns the process-wide SMTP transport. The first caller verifies the
//! configured endpoint and, when the implicit-TLS port fails for connection-level reasons, retries
//! once with STARTTLS on the submission port. The verified transport is then reused for the
//! lifetime of the manager. A failed verification is remembered for a cooldown period, during
//! which callers fail immediately.

use crate::{
    compose::EmailEnvelope,
    error::{MailError, TransportError, TransportFailure},
};
use anyhow::anyhow;
use async_trait::async_trait;
use lettre::{
    transport::smtp::authentication::{Credentials, Mechanism},
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

pub const IMPLICIT_TLS_PORT: u16 = 465;
pub const SUBMISSION_PORT: u16 = 587;

#[derive(Clone, PartialEq, Eq)]
pub struct SmtpCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Whether connections must be encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityPolicy {
    Required,
    /// Unencrypted connections for local development. Credentials are never sent in this mode.
    Plaintext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    ImplicitTls,
    StartTls,
    Plaintext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmtpTimeouts {
    pub connect: Duration,
    pub greeting: Duration,
    pub socket: Duration,
}

impl SmtpTimeouts {
    /// Upper bound for connecting, greeting and authenticating.
    pub fn verification(&self) -> Duration {
        self.connect + self.greeting
    }
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            greeting: Duration::from_secs(7),
            socket: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Option<SmtpCredentials>,
    pub security: SecurityPolicy,
    pub timeouts: SmtpTimeouts,
    /// How long a failed verification is remembered. `None` remembers it forever.
    pub retry_cooldown: Option<Duration>,
}

impl SmtpConfig {
    pub fn uses_implicit_tls(&self) -> bool {
        self.security == SecurityPolicy::Required && self.port == IMPLICIT_TLS_PORT
    }

    fn primary_endpoint(&self) -> SmtpEndpoint {
        let security = match self.security {
            SecurityPolicy::Plaintext => Security::Plaintext,
            SecurityPolicy::Required if self.port == IMPLICIT_TLS_PORT => Security::ImplicitTls,
            SecurityPolicy::Required => Security::StartTls,
        };
        self.endpoint(self.port, security)
    }

    fn fallback_endpoint(&self) -> SmtpEndpoint {
        self.endpoint(SUBMISSION_PORT, Security::StartTls)
    }

    fn endpoint(&self, port: u16, security: Security) -> SmtpEndpoint {
        SmtpEndpoint {
            host: self.host.clone(),
            port,
            security,
            credentials: self.credentials.clone(),
            timeouts: self.timeouts,
        }
    }
}

/// One concrete way of reaching the mail server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpEndpoint {
    pub host: String,
    pub port: u16,
    pub security: Security,
    pub credentials: Option<SmtpCredentials>,
    pub timeouts: SmtpTimeouts,
}

impl std::fmt::Display for SmtpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {:?}", self.host, self.port, self.security)
    }
}

/// The network side of the transport manager.
#[async_trait]
pub trait SmtpConnector: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Connects to `endpoint`, authenticates and returns a transport ready for sending.
    async fn verify(&self, endpoint: &SmtpEndpoint) -> anyhow::Result<Self::Handle>;

    /// Checks that an established transport still reaches its server.
    async fn check(&self, handle: &Self::Handle) -> anyhow::Result<()>;

    /// Sends the message, returning its message id.
    async fn send(&self, handle: &Self::Handle, envelope: &EmailEnvelope)
        -> Result<String, MailError>;
}

/// Maps a raw transport error message to a failure category.
pub fn classify(message: &str) -> TransportFailure {
    const TIMEOUT: &[&str] = &["timeout", "timed out"];
    const TLS: &[&str] = &[
        "before secure tls connection was established",
        "certificate",
        "self signed",
        "self-signed",
        "ssl",
        "tls",
        "handshake",
    ];
    const CONNECTION: &[&str] = &[
        "econnection",
        "econnrefused",
        "econnreset",
        "connection refused",
        "connection reset",
        "connection error",
    ];
    const AUTHENTICATION: &[&str] = &["authentication", "535", "invalid credentials"];

    let message = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));
    if matches(TIMEOUT) {
        TransportFailure::Timeout
    } else if matches(TLS) {
        TransportFailure::TlsFailed
    } else if matches(CONNECTION) {
        TransportFailure::ConnectFailed
    } else if matches(AUTHENTICATION) {
        TransportFailure::AuthFailed
    } else {
        TransportFailure::Other
    }
}

struct Ready<H> {
    handle: Arc<H>,
    endpoint: SmtpEndpoint,
}

struct Failure {
    error: TransportError,
    attempt: u64,
    at: Instant,
}

pub struct SmtpTransportManager<C: SmtpConnector> {
    connector: C,
    config: SmtpConfig,
    fallback: bool,
    ready: OnceLock<Ready<C::Handle>>,
    attempts: AtomicU64,
    last_failure: Mutex<Option<Failure>>,
}

impl<C: SmtpConnector> SmtpTransportManager<C> {
    /// A manager which only ever tries the configured endpoint.
    pub fn direct(connector: C, config: SmtpConfig) -> Self {
        Self::new(connector, config, false)
    }

    /// A manager which falls back from implicit TLS to STARTTLS on the submission port.
    pub fn with_fallback(connector: C, config: SmtpConfig) -> Self {
        Self::new(connector, config, true)
    }

    fn new(connector: C, config: SmtpConfig, fallback: bool) -> Self {
        Self {
            connector,
            config,
            fallback,
            ready: OnceLock::new(),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get().is_some()
    }

    pub async fn get_transport(&self) -> Result<Arc<C::Handle>, TransportError> {
        Ok(self.ready().await?.handle.clone())
    }

    /// Contacts the server through the established transport, establishing it first if needed.
    /// A failed check leaves the established transport in place.
    pub async fn check(&self) -> Result<(), TransportError> {
        let ready = self.ready().await?;
        bounded(&ready.endpoint, self.connector.check(&ready.handle)).await
    }

    async fn ready(&self) -> Result<&Ready<C::Handle>, TransportError> {
        if let Some(ready) = self.ready.get() {
            return Ok(ready);
        }
        let seen = self.attempts.load(Ordering::Acquire);
        let mut last_failure = self.last_failure.lock().await;
        if let Some(ready) = self.ready.get() {
            return Ok(ready);
        }
        if let Some(failure) = last_failure.as_ref() {
            // An attempt newer than `seen` finished while this caller was waiting.
            if failure.attempt > seen || !self.cooldown_elapsed(failure) {
                return Err(failure.error.clone());
            }
        }

        let result = self.establish().await;
        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        match result {
            Ok((handle, endpoint)) => {
                *last_failure = None;
                Ok(self.ready.get_or_init(|| Ready {
                    handle: Arc::new(handle),
                    endpoint,
                }))
            }
            Err(error) => {
                *last_failure = Some(Failure {
                    error: error.clone(),
                    attempt,
                    at: Instant::now(),
                });
                Err(error)
            }
        }
    }

    pub async fn send(&self, envelope: &EmailEnvelope) -> Result<String, MailError> {
        let handle = self
            .get_transport()
            .await
            .map_err(MailError::TransportUnavailable)?;
        self.connector.send(&handle, envelope).await
    }

    fn cooldown_elapsed(&self, failure: &Failure) -> bool {
        match self.config.retry_cooldown {
            Some(cooldown) => failure.at.elapsed() >= cooldown,
            None => false,
        }
    }

    async fn establish(&self) -> Result<(C::Handle, SmtpEndpoint), TransportError> {
        let primary = self.config.primary_endpoint();
        let error = match self.verify(&primary).await {
            Ok(handle) => {
                info!("SMTP transport ready on {primary}");
                return Ok((handle, primary));
            }
            Err(error) => error,
        };

        let eligible = self.fallback
            && primary.security == Security::ImplicitTls
            && error.kind.allows_fallback();
        if !eligible {
            warn!("SMTP verification failed: {error}");
            return Err(error);
        }

        let fallback = self.config.fallback_endpoint();
        warn!("SMTP verification failed: {error}. Falling back to {fallback}");
        match self.verify(&fallback).await {
            Ok(handle) => {
                info!("SMTP transport ready on {fallback} after fallback");
                Ok((handle, fallback))
            }
            Err(error) => {
                warn!("SMTP fallback verification failed: {error}");
                Err(error)
            }
        }
    }

    async fn verify(&self, endpoint: &SmtpEndpoint) -> Result<C::Handle, TransportError> {
        info!("Verifying SMTP transport {endpoint}");
        bounded(endpoint, self.connector.verify(endpoint)).await
    }
}

/// Runs a conversation with the server at `endpoint` within its verification budget.
async fn bounded<T>(
    endpoint: &SmtpEndpoint,
    work: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, TransportError> {
    let limit = endpoint.timeouts.verification();
    let result = match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("Verification timed out after {limit:?}")),
    };
    result.map_err(|error| {
        let message = format!("{error:#}");
        TransportError {
            kind: classify(&message),
            endpoint: endpoint.to_string(),
            message,
        }
    })
}

/// [`SmtpConnector`] backed by lettre's asynchronous SMTP transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct LettreConnector;

impl LettreConnector {
    fn build_mailer(
        endpoint: &SmtpEndpoint,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
        let builder = match endpoint.security {
            Security::ImplicitTls => AsyncSmtpTransport::<Tokio1Executor>::relay(&endpoint.host)?,
            Security::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&endpoint.host)?
            }
            Security::Plaintext => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(endpoint.host.as_str())
            }
        };
        let mut builder = builder
            .port(endpoint.port)
            .timeout(Some(endpoint.timeouts.socket))
            .authentication(vec![Mechanism::Login]);

        // Credentials only travel over encrypted connections.
        if endpoint.security != Security::Plaintext {
            if let Some(credentials) = &endpoint.credentials {
                builder = builder.credentials(Credentials::new(
                    credentials.username.clone(),
                    credentials.password.clone(),
                ));
            }
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl SmtpConnector for LettreConnector {
    type Handle = AsyncSmtpTransport<Tokio1Executor>;

    async fn verify(&self, endpoint: &SmtpEndpoint) -> anyhow::Result<Self::Handle> {
        let mailer = Self::build_mailer(endpoint)?;
        self.check(&mailer).await?;
        Ok(mailer)
    }

    async fn check(&self, mailer: &Self::Handle) -> anyhow::Result<()> {
        if mailer.test_connection().await? {
            Ok(())
        } else {
            Err(anyhow!("SMTP server did not accept the connection test"))
        }
    }

    async fn send(
        &self,
        mailer: &Self::Handle,
        envelope: &EmailEnvelope,
    ) -> Result<String, MailError> {
        let message = envelope.to_message()?;
        let message_id = message
            .headers()
            .get_raw("Message-ID")
            .unwrap_or_default()
            .to_string();
        mailer
            .send(message)
            .await
            .map_err(|error| MailError::Send {
                message: error.to_string(),
                code: error.status().map(|code| code.to_string()),
            })?;
        Ok(message_id)
    }
}
