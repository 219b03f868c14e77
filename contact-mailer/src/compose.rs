use crate::{
    config::{Config, SiteConfig},
    error::MailError,
    sanitize::{escape_html, line_breaks},
    validation::ContactSubmission,
};
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    Message,
};
use serde::Serialize;
use tinytemplate::TinyTemplate;

const CONTACT_EMAIL_TEMPLATE_NAME: &str = "contact-email";
const CONTACT_EMAIL_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/contact-email.html"
));

/// A fully composed outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailEnvelope {
    pub from: Mailbox,
    pub to: Mailbox,
    pub reply_to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

impl EmailEnvelope {
    pub fn to_message(&self) -> Result<Message, MailError> {
        let reply_to: Mailbox = self
            .reply_to
            .parse()
            .map_err(|error| MailError::Build(format!("Invalid reply-to address: {error}")))?;
        let builder = Message::builder()
            .from(self.from.clone())
            .reply_to(reply_to)
            .to(self.to.clone())
            .subject(self.subject.as_str())
            .message_id(None);
        let html = SinglePart::builder()
            .header(ContentType::TEXT_HTML)
            .body(self.html.clone());
        let message = match &self.text {
            Some(text) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.clone()),
                    )
                    .singlepart(html),
            ),
            None => builder.singlepart(html),
        };
        message.map_err(|error| MailError::Build(error.to_string()))
    }
}

#[derive(Serialize)]
struct Context<'a> {
    site_host: &'a str,
    name: &'a str,
    email: &'a str,
    message: &'a str,
}

/// Builds outgoing messages from validated submissions. Sender and recipient come from the
/// configuration only, never from the submission.
#[derive(Debug, Clone)]
pub struct Composer {
    from: Mailbox,
    to: Mailbox,
    site: SiteConfig,
}

impl Composer {
    pub fn new(from: Mailbox, to: Mailbox, site: SiteConfig) -> Self {
        Self { from, to, site }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.from.clone(), config.to.clone(), config.site.clone())
    }

    pub fn compose(&self, submission: &ContactSubmission) -> Result<EmailEnvelope, MailError> {
        let name = escape_html(&submission.name);
        let email = escape_html(&submission.email);
        let message = line_breaks(&escape_html(&submission.message));

        let mut tt = TinyTemplate::new();
        tt.add_template(CONTACT_EMAIL_TEMPLATE_NAME, CONTACT_EMAIL_TEMPLATE)
            .map_err(|error| MailError::Build(error.to_string()))?;
        let html = tt
            .render(
                CONTACT_EMAIL_TEMPLATE_NAME,
                &Context {
                    site_host: &self.site.host,
                    name: &name,
                    email: &email,
                    message: &message,
                },
            )
            .map_err(|error| MailError::Build(error.to_string()))?;

        Ok(EmailEnvelope {
            from: self.from.clone(),
            to: self.to.clone(),
            subject: format!("[{} Contact] Nouveau message de {name}", self.site.name),
            text: Some(format!(
                "Nom : {}\nEmail : {}\n\n{}\n",
                submission.name, submission.email, submission.message
            )),
            reply_to: email,
            html,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::arbitrary_composer;
    use crate::validation::ContactSubmission;
    use googletest::prelude::*;

    const MALICIOUS_CONTENT: &str = "<script>doEvil();</script>";

    fn submission(name: &str, email: &str, message: &str) -> ContactSubmission {
        ContactSubmission {
            name: name.into(),
            email: email.into(),
            message: message.into(),
        }
    }

    #[test]
    fn takes_addresses_from_configuration() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission("Ana", "a@b.com", "hello"))
            .unwrap();

        verify_that!(envelope.from.email.to_string(), eq("noreply@devom.fr"))?;
        verify_that!(envelope.to.email.to_string(), eq("contact@devom.fr"))?;
        verify_that!(envelope.reply_to, eq("a@b.com"))
    }

    #[test]
    fn includes_escaped_name_in_subject() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission("Ana <B>", "a@b.com", "hello"))
            .unwrap();

        verify_that!(
            envelope.subject,
            eq("[Devom Contact] Nouveau message de Ana &lt;B&gt;")
        )
    }

    #[test]
    fn escapes_user_input_in_body() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission(MALICIOUS_CONTENT, "a@b.com", MALICIOUS_CONTENT))
            .unwrap();

        verify_that!(envelope.html, not(contains_substring(MALICIOUS_CONTENT)))?;
        verify_that!(
            envelope.html,
            contains_substring("&lt;script&gt;doEvil();&lt;/script&gt;")
        )
    }

    #[test]
    fn does_not_escape_twice() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission("Tom & Jerry", "a@b.com", "hello"))
            .unwrap();

        verify_that!(envelope.html, contains_substring(">Tom &amp; Jerry<"))
    }

    #[test]
    fn renders_mailto_link() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission("Ana", "a@b.com", "hello"))
            .unwrap();

        verify_that!(
            envelope.html,
            contains_substring(r#"<a href="mailto:a@b.com">a@b.com</a>"#)
        )
    }

    #[test]
    fn renders_line_breaks_in_message() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission("Ana", "a@b.com", "first line\nsecond line"))
            .unwrap();

        verify_that!(
            envelope.html,
            contains_substring("first line<br>second line")
        )
    }

    #[test]
    fn keeps_raw_text_in_plain_alternative() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission("Ana", "a@b.com", "1 < 2"))
            .unwrap();

        verify_that!(envelope.text, some(contains_substring("1 < 2")))
    }

    #[test]
    fn builds_mime_message() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission("Ana", "a@b.com", "hello"))
            .unwrap();

        let formatted = String::from_utf8(envelope.to_message().unwrap().formatted()).unwrap();

        verify_that!(
            formatted,
            all!(
                contains_substring("Reply-To: a@b.com"),
                contains_substring("To: contact@devom.fr"),
                contains_substring("multipart/alternative")
            )
        )
    }

    #[test]
    fn generates_message_id() -> Result<()> {
        let envelope = arbitrary_composer()
            .compose(&submission("Ana", "a@b.com", "hello"))
            .unwrap();

        let message = envelope.to_message().unwrap();

        verify_that!(
            message.headers().get_raw("Message-ID"),
            some(all!(starts_with("<"), ends_with(">")))
        )
    }
}
