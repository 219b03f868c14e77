use thiserror::Error;
use tracing::error;

/// Reasons for rejecting a contact form submission. These are caused by the client and are safe
/// to describe precisely in the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing field in request")]
    MissingField,
    #[error("message exceeds the maximum length")]
    MessageTooLong,
    #[error("message looks like spam")]
    LikelySpam,
    #[error("invalid email address")]
    InvalidEmail,
}

impl ValidationError {
    pub fn client_message(&self) -> &'static str {
        match self {
            ValidationError::MissingField => "Tous les champs sont requis.",
            ValidationError::MessageTooLong => "Message trop long.",
            ValidationError::LikelySpam => "Message non valide.",
            ValidationError::InvalidEmail => "Adresse email non valide.",
        }
    }
}

/// Category of a failure to establish a verified SMTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    ConnectFailed,
    AuthFailed,
    TlsFailed,
    Timeout,
    Other,
}

impl TransportFailure {
    /// Whether a failure of this kind on the implicit-TLS port warrants a retry with STARTTLS.
    pub fn allows_fallback(self) -> bool {
        matches!(
            self,
            TransportFailure::ConnectFailed | TransportFailure::TlsFailed | TransportFailure::Timeout
        )
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportFailure::ConnectFailed => "connection failed",
            TransportFailure::AuthFailed => "authentication failed",
            TransportFailure::TlsFailed => "TLS failure",
            TransportFailure::Timeout => "timeout",
            TransportFailure::Other => "transport error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} ({endpoint}): {message}")]
pub struct TransportError {
    pub kind: TransportFailure,
    pub endpoint: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("Mail transport unavailable: {0}")]
    TransportUnavailable(TransportError),
    #[error("Error building message: {0}")]
    Build(String),
    #[error("Error sending message: {message}")]
    Send {
        message: String,
        code: Option<String>,
    },
    #[error("Email API rejected message ({status}): {message}")]
    Api {
        status: u16,
        name: Option<String>,
        message: String,
    },
    #[error("Error calling email API: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Queue error: {0}")]
    Queue(#[from] redis::RedisError),
    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl MailError {
    fn kind(&self) -> &'static str {
        match self {
            MailError::TransportUnavailable(_) => "TransportUnavailable",
            MailError::Build(_) => "BuildError",
            MailError::Send { .. } => "SendError",
            MailError::Api { .. } => "ApiError",
            MailError::Http(_) => "HttpError",
            MailError::Queue(_) => "QueueError",
            MailError::Payload(_) => "PayloadError",
        }
    }

    /// Provider-specific status code, if the failure carries one.
    pub fn code(&self) -> Option<String> {
        match self {
            MailError::Send { code, .. } => code.clone(),
            MailError::Api { status, .. } => Some(status.to_string()),
            MailError::Http(error) => error.status().map(|s| s.as_u16().to_string()),
            MailError::TransportUnavailable(_)
            | MailError::Build(_)
            | MailError::Queue(_)
            | MailError::Payload(_) => None,
        }
    }

    pub fn log(&self) {
        error!(
            kind = self.kind(),
            code = self.code().as_deref().unwrap_or("-"),
            "Error sending contact form email: {self}"
        );
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}
