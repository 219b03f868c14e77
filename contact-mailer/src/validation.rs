use crate::error::ValidationError;
use lettre::Address;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

pub const MAX_MESSAGE_CHARS: usize = 5000;
pub const MAX_LINKS: usize = 3;

/// The request body as sent by the contact form. Every field may be missing.
///
/// Fields are read one by one: a number or boolean is taken as its text, anything else counts
/// as missing without affecting the other fields.
#[derive(Deserialize, Debug, Default)]
pub struct ContactFormMessage {
    #[serde(default, deserialize_with = "text_field")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub message: Option<String>,
}

impl ContactFormMessage {
    /// Parses a request body. A body which is missing or not the expected JSON is treated as a
    /// message with all fields missing.
    pub fn from_body(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<ContactSubmission, ValidationError> {
        let (Some(name), Some(email), Some(message)) = (
            non_empty(&self.name),
            non_empty(&self.email),
            non_empty(&self.message),
        ) else {
            return Err(ValidationError::MissingField);
        };
        if message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ValidationError::MessageTooLong);
        }
        if count_links(message) > MAX_LINKS {
            warn!("Rejected likely spam with too many links");
            return Err(ValidationError::LikelySpam);
        }
        if !is_plain_address(email) {
            return Err(ValidationError::InvalidEmail);
        }
        Ok(ContactSubmission {
            name: name.into(),
            email: email.into(),
            message: message.into(),
        })
    }
}

/// A submission which passed validation. This is also the payload of queued jobs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ContactSubmission {
    pub name: String,
    pub email: String,
    pub message: String,
}

fn text_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    })
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|value| !value.is_empty())
}

fn count_links(message: &str) -> usize {
    let lowercase = message.to_ascii_lowercase();
    lowercase.matches("http://").count() + lowercase.matches("https://").count()
}

// The escaped address is used as Reply-To, so it must not change under HTML escaping.
fn is_plain_address(email: &str) -> bool {
    !email.contains(['&', '<', '>', '"', '\'']) && email.parse::<Address>().is_ok()
}
