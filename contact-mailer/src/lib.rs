pub mod compose;
pub mod config;
pub mod error;
pub mod handler;
pub mod mailer;
pub mod queue;
pub mod resend;
pub mod sanitize;
pub mod shutdown;
pub mod transport;
pub mod validation;
pub mod worker;
