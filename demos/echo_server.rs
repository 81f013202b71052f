//! A WebSocket echo server.
//! Every text or binary message a client sends is sent straight back to it.

use std::sync::Arc;

use yawss::{Application, Client, HandlerResult, Options, Payload, Request, Sender, Server};

struct Echo;

impl Application for Echo {
    fn handle_open(&self, client: &Arc<Client>, request: &Request) -> HandlerResult {
        log::info!(
            "client {} connected to {} from {:?}",
            client.id(),
            request.path(),
            request.client_ip()
        );
        Ok(())
    }

    fn handle_message(&self, client: &Arc<Client>, _: &Request, payload: Payload) -> HandlerResult {
        client.send(payload)?;
        Ok(())
    }

    fn handle_close(&self, client: &Arc<Client>, _: &Request) -> HandlerResult {
        log::info!("client {} disconnected", client.id());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> yawss::Result<()> {
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let server = Server::bind(
        Options::default()
            .with_port(3001)
            .with_max_payload_read(100 * 1024 * 1024)
            .with_max_message_size(200 * 1024 * 1024)
            .without_policy_server(),
        Echo,
    )
    .await?;

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("stopping");
            handle.stop();
        }
    });

    server.run().await
}
