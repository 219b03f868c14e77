use crate::{
    compose::Composer,
    error::MailError,
    mailer::{Delivery, MailSender},
    queue::{Job, JobQueue},
};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::info;

const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);
const QUEUE_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Consumes queued contact submissions and delivers them.
pub struct Worker<Q: JobQueue> {
    queue: Q,
    composer: Composer,
    sender: Arc<dyn MailSender>,
}

impl<Q: JobQueue> Worker<Q> {
    pub fn new(queue: Q, composer: Composer, sender: Arc<dyn MailSender>) -> Self {
        Self {
            queue,
            composer,
            sender,
        }
    }

    pub async fn process_job(&self, job: &Job) -> Result<Delivery, MailError> {
        let envelope = self.composer.compose(&job.data)?;
        self.sender.send(&job.data, &envelope).await
    }

    /// Processes jobs until `shutdown` resolves.
    ///
    /// A job interrupted by shutdown stays active in the queue and is picked up again by the
    /// next worker through [`JobQueue::recover`].
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), MailError> {
        self.queue.recover().await?;
        info!("Worker is running and waiting for jobs");
        tokio::pin!(shutdown);
        loop {
            let reserved = tokio::select! {
                _ = &mut shutdown => break,
                reserved = self.queue.reserve(RESERVE_TIMEOUT) => reserved,
            };
            match reserved {
                Ok(Some(job)) => self.handle(job).await,
                Ok(None) => {}
                Err(error) => {
                    error.log();
                    tokio::time::sleep(QUEUE_ERROR_PAUSE).await;
                }
            }
        }
        info!("Worker stopped");
        Ok(())
    }

    async fn handle(&self, job: Job) {
        let acknowledged = match self.process_job(&job).await {
            Ok(delivery) => {
                info!("Email sent successfully for job {} ({delivery:?})", job.id);
                self.queue.complete(&job).await
            }
            Err(error) => {
                error.log();
                self.queue.fail(&job, &error.to_string()).await
            }
        };
        if let Err(error) = acknowledged {
            error.log();
        }
    }
}
