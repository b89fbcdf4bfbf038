use log::*;
use std::time::Duration;
use wsforge::config::{AutoPingOptions, ServerOptions};
use wsforge::connection::ConnectionHandle;
use wsforge::handler::Handler;
use wsforge::server::Server;

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_connected(&self, conn: &ConnectionHandle) {
        info!("{} connected", conn.remote_addr());
    }

    fn on_upgraded(&self, conn: &ConnectionHandle) {
        info!("{} upgraded", conn.remote_addr());
    }

    fn on_message(&self, conn: &ConnectionHandle, text: String) {
        info!("{}: {text}", conn.remote_addr());
        if let Err(err) = conn.queue_text(text) {
            warn!("{}: failed to echo: {err}", conn.remote_addr());
        }
    }

    fn on_data(&self, conn: &ConnectionHandle, data: Vec<u8>) {
        if let Err(err) = conn.queue_binary(data) {
            warn!("{}: failed to echo binary: {err}", conn.remote_addr());
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let options = ServerOptions {
        bind_address: "127.0.0.1".to_string(),
        bind_port: 8080,
        auto_ping: AutoPingOptions {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        },
        ..ServerOptions::default()
    };

    let server = Server::new(options, EchoHandler);
    if let Err(err) = server.start().await {
        error!("could not start server: {err}");
        return;
    }
    info!("listening on 127.0.0.1:8080");

    tokio::signal::ctrl_c().await.ok();
    let _ = server.stop().await;
}
