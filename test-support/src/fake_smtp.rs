use log::debug;
use mailin_embedded::{Handler, Server, SslConfig};
use std::{net::IpAddr, sync::Arc, time::Duration};
use tokio::{
    sync::watch::{self, error::RecvError, Receiver, Sender},
    time::timeout,
};

const SERVER_NAME: &str = "devom.fr";

#[derive(Clone)]
struct RecordingHandler(Vec<u8>, Arc<Sender<String>>);

impl Handler for RecordingHandler {
    fn data(&mut self, buf: &[u8]) -> std::io::Result<()> {
        debug!("Got data:\n{}", String::from_utf8_lossy(buf));
        self.0.extend(buf);
        Ok(())
    }

    fn data_end(&mut self) -> mailin_embedded::Response {
        let content = String::from_utf8_lossy(&self.0).into_owned();
        self.0.clear();
        let _ = self.1.send(content);
        mailin_embedded::response::OK
    }
}

/// A plaintext SMTP server on a fixed local port which records the last message it accepted.
pub struct FakeSmtpServer {
    port: u16,
    server: std::sync::Mutex<Option<Server<RecordingHandler>>>,
    receiver: tokio::sync::Mutex<Receiver<String>>,
}

impl FakeSmtpServer {
    pub fn new(port: u16) -> Self {
        let (sender, receiver) = watch::channel(String::new());
        let mut server = Server::new(RecordingHandler(Vec::new(), Arc::new(sender)));
        server
            .with_name(SERVER_NAME)
            .with_ssl(SslConfig::None)
            .unwrap()
            .with_addr(format!("127.0.0.1:{port}"))
            .unwrap();
        Self {
            port,
            server: std::sync::Mutex::new(Some(server)),
            receiver: tokio::sync::Mutex::new(receiver),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Starts serving on a background thread. Later calls do nothing.
    pub fn start(&self) {
        if let Some(server) = self.server.lock().unwrap().take() {
            std::thread::spawn(move || {
                let _ = server.serve();
            });
        }
    }

    pub async fn last_mail_content(&self) -> Result<String, RecvError> {
        let mut receiver = self.receiver.lock().await;
        receiver.changed().await?;
        let content = receiver.borrow_and_update().clone();
        Ok(content)
    }

    /// Discards a message left over from an earlier test.
    pub async fn flush(&self) {
        let mut receiver = self.receiver.lock().await;
        let _ = timeout(Duration::from_millis(100), receiver.changed()).await;
        receiver.borrow_and_update();
    }
}

#[derive(Clone)]
struct PoisonedHandler;

impl Handler for PoisonedHandler {
    fn helo(&mut self, _ip: IpAddr, _domain: &str) -> mailin_embedded::Response {
        mailin_embedded::response::INTERNAL_ERROR
    }

    fn mail(&mut self, _ip: IpAddr, _domain: &str, _from: &str) -> mailin_embedded::Response {
        mailin_embedded::response::INTERNAL_ERROR
    }
}

/// Starts a server on `port` which answers every greeting with an error.
pub fn start_poisoned_smtp_server(port: u16) {
    let mut server = Server::new(PoisonedHandler);
    server
        .with_name(SERVER_NAME)
        .with_ssl(SslConfig::None)
        .unwrap()
        .with_addr(format!("127.0.0.1:{port}"))
        .unwrap();
    std::thread::spawn(move || {
        let _ = server.serve();
    });
}
