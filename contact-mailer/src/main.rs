use contact_mailer::{
    compose::Composer,
    config::Config,
    handler::{router, AppState},
    mailer,
    shutdown::shutdown_signal,
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let config = Config::from_env()?;
    config.log_summary();

    let sender = mailer::from_config(&config)?;
    let app = router(
        AppState::new(sender, Composer::from_config(&config)),
        &config.allowed_origins,
    );

    let listener = TcpListener::bind(("0.0.0.0", config.listen_port)).await?;
    info!("Server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
