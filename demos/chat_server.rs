//! A chat room: every message is relayed to all connected clients.
//!
//! Connect with `ws://localhost:3002/chat?name=alice`. The application and the server share
//! one storage driver, so the application sees the same clients the server registers.

use std::sync::Arc;

use yawss::{
    Application, Client, ClientRegistry, HandlerResult, MemoryDriver, Options, Payload, Request,
    Sender, Server, StorageDriver,
};

struct Chat {
    clients: ClientRegistry,
}

impl Chat {
    fn name(client: &Client) -> String {
        client
            .user()
            .unwrap_or_else(|| format!("guest-{}", client.id()))
    }
}

impl Application for Chat {
    fn handle_open(&self, client: &Arc<Client>, request: &Request) -> HandlerResult {
        let name = request
            .query_pairs()
            .into_iter()
            .find(|(key, _)| key == "name")
            .map(|(_, value)| value);
        client.set_user(name);

        let name = Self::name(client);
        client.send(Payload::from(format!("welcome, {name}")))?;
        self.clients
            .broadcast(&Payload::from(format!("{name} joined")));
        Ok(())
    }

    fn handle_message(&self, client: &Arc<Client>, _: &Request, payload: Payload) -> HandlerResult {
        let Some(text) = payload.as_text() else {
            return Ok(());
        };

        let line = format!("{}: {text}", Self::name(client));
        let sent = self.clients.broadcast(&Payload::from(line));
        log::debug!("relayed message from {} to {sent} clients", client.id());
        Ok(())
    }

    fn handle_close(&self, client: &Arc<Client>, _: &Request) -> HandlerResult {
        self.clients
            .broadcast(&Payload::from(format!("{} left", Self::name(client))));
        Ok(())
    }

    fn sub_protocols(&self) -> Vec<String> {
        vec!["chat".to_owned()]
    }
}

#[tokio::main]
async fn main() -> yawss::Result<()> {
    simple_logger::init_with_level(log::Level::Info).expect("log");

    let storage: Arc<dyn StorageDriver> = Arc::new(MemoryDriver::new());
    let chat = Chat {
        clients: ClientRegistry::new(Arc::clone(&storage)),
    };

    let server = Server::bind(
        Options::default()
            .with_port(3002)
            .with_storage(storage)
            .with_handshake_timeout(std::time::Duration::from_secs(10)),
        chat,
    )
    .await?;

    server.run().await
}
