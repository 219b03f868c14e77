use contact_mailer::{
    compose::Composer, config::Config, mailer, queue::RedisJobQueue,
    shutdown::shutdown_signal, worker::Worker,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let config = Config::from_env()?;
    config.log_summary();

    let worker = Worker::new(
        RedisJobQueue::new(&config.queue)?,
        Composer::from_config(&config),
        mailer::delivery_from_config(&config)?,
    );
    worker.run(shutdown_signal()).await?;
    Ok(())
}
