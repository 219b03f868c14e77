use crate::{
    compose::EmailEnvelope,
    config::{Config, TransportKind},
    error::MailError,
    queue::{JobQueue, RedisJobQueue},
    resend::ResendMailer,
    transport::{LettreConnector, SmtpConnector, SmtpTransportManager},
    validation::ContactSubmission,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Outcome of handing a message to a [`MailSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent { id: String },
    Queued { job_id: String },
}

/// Something which can get a contact message to its recipient.
///
/// Senders which deliver directly use the composed `envelope`. Queueing senders store the
/// `submission` and compose again when the job is processed.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(
        &self,
        submission: &ContactSubmission,
        envelope: &EmailEnvelope,
    ) -> Result<Delivery, MailError>;

    /// Checks that the sender is usable, returning the name of the channel.
    async fn verify(&self) -> Result<&'static str, MailError>;
}

pub struct SmtpSender<C: SmtpConnector> {
    manager: SmtpTransportManager<C>,
}

impl<C: SmtpConnector> SmtpSender<C> {
    pub fn new(manager: SmtpTransportManager<C>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl<C: SmtpConnector> MailSender for SmtpSender<C> {
    async fn send(
        &self,
        _submission: &ContactSubmission,
        envelope: &EmailEnvelope,
    ) -> Result<Delivery, MailError> {
        let id = self.manager.send(envelope).await?;
        info!("Message sent via SMTP: {id}");
        Ok(Delivery::Sent { id })
    }

    async fn verify(&self) -> Result<&'static str, MailError> {
        self.manager
            .check()
            .await
            .map_err(MailError::TransportUnavailable)?;
        Ok("smtp")
    }
}

pub struct QueuedSender<Q: JobQueue> {
    queue: Q,
}

impl<Q: JobQueue> QueuedSender<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl<Q: JobQueue> MailSender for QueuedSender<Q> {
    async fn send(
        &self,
        submission: &ContactSubmission,
        _envelope: &EmailEnvelope,
    ) -> Result<Delivery, MailError> {
        let job_id = self.queue.enqueue(submission).await?;
        info!("Message queued as job {job_id}");
        Ok(Delivery::Queued { job_id })
    }

    async fn verify(&self) -> Result<&'static str, MailError> {
        self.queue.ping().await?;
        Ok("queue")
    }
}

/// Selects the sender used by the HTTP handler.
pub fn from_config(config: &Config) -> anyhow::Result<Arc<dyn MailSender>> {
    build(config, config.transport)
}

/// Selects the sender used by the background worker to deliver queued jobs.
pub fn delivery_from_config(config: &Config) -> anyhow::Result<Arc<dyn MailSender>> {
    build(config, config.worker_transport)
}

fn build(config: &Config, kind: TransportKind) -> anyhow::Result<Arc<dyn MailSender>> {
    Ok(match kind {
        TransportKind::Smtp => Arc::new(SmtpSender::new(SmtpTransportManager::direct(
            LettreConnector,
            config.smtp.clone(),
        ))),
        TransportKind::SmtpWithFallback => Arc::new(SmtpSender::new(
            SmtpTransportManager::with_fallback(LettreConnector, config.smtp.clone()),
        )),
        TransportKind::Resend => Arc::new(ResendMailer::from_config(config)?),
        TransportKind::Queued => Arc::new(QueuedSender::new(RedisJobQueue::new(&config.queue)?)),
    })
}
