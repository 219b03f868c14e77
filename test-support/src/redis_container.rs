use log::info;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage,
};

pub const REDIS_PORT: u16 = 6379;

/// Location of the Redis server used by a test.
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    _container: Option<ContainerAsync<GenericImage>>,
}

impl RedisConfig {
    /// Starts a fresh Redis container, or uses a server on localhost when `USE_RUNNING_REDIS`
    /// is set.
    pub async fn new() -> Self {
        if std::env::var("USE_RUNNING_REDIS").is_ok() {
            info!("Using already running Redis due to environment variable USE_RUNNING_REDIS");
            return Self {
                host: "127.0.0.1".into(),
                port: REDIS_PORT,
                _container: None,
            };
        }
        info!("Starting own Redis instance");
        let container = GenericImage::new("redis", "7.2-alpine")
            .with_exposed_port(REDIS_PORT.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await
            .unwrap();
        Self {
            host: container.get_host().await.unwrap().to_string(),
            port: container.get_host_port_ipv4(REDIS_PORT).await.unwrap(),
            _container: Some(container),
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}
