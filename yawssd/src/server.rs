use std::{net::IpAddr, sync::Arc, time::Duration};

use clap::Args;
use ipnet::IpNet;
use tokio::runtime;
use yawss::{
    Application, Client, HandlerResult, Options, Payload, Request, Sender, Server,
};

/// Command to run an echo server.
///
/// Accepts `ws://` connections, performs the upgrade handshake and echoes every text or
/// binary message back to the client that sent it.
#[derive(Args)]
#[command(alias = "s")]
pub struct Cmd {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Port of the cross-domain policy listener (default 843 when serving on port 80,
    /// 8843 otherwise).
    #[arg(long)]
    policy_port: Option<u16>,

    /// Do not start the cross-domain policy listener.
    #[arg(long)]
    no_policy: bool,

    /// Sub-protocol to offer. Repeat to offer several.
    #[arg(long = "protocol")]
    protocols: Vec<String>,

    /// Time a client has to complete its upgrade request.
    /// Accepts human-readable formats like "5s", "1m", "500ms".
    #[arg(long, value_parser = humantime::parse_duration)]
    handshake_timeout: Option<Duration>,

    /// Network whose peers may set X-Forwarded-For or Forwarded. Repeat for several.
    #[arg(long = "trusted-proxy")]
    trusted_proxies: Vec<IpNet>,

    /// Maximum payload of a single frame, in bytes.
    #[arg(long)]
    max_payload: Option<usize>,

    /// When enabled, pretty-prints received text messages that are valid JSON.
    #[arg(long)]
    print_json: bool,
}

impl Cmd {
    fn options(&self) -> Options {
        let mut options = Options::default()
            .with_address(self.address)
            .with_port(self.port)
            .with_trusted_proxies(self.trusted_proxies.clone());

        if self.no_policy {
            options = options.without_policy_server();
        } else if let Some(port) = self.policy_port {
            options = options.with_policy_port(port);
        }
        if let Some(timeout) = self.handshake_timeout {
            options = options.with_handshake_timeout(timeout);
        }
        if let Some(size) = self.max_payload {
            options = options.with_max_payload_read(size);
        }
        options
    }
}

pub fn run(cmd: Cmd) -> anyhow::Result<()> {
    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;

    let echo = Echo {
        protocols: cmd.protocols.clone(),
        print_json: cmd.print_json,
    };

    runtime.block_on(async {
        let server = Server::bind(cmd.options(), echo).await?;
        println!("> Listening on ws://{}", server.local_addr());
        if let Some(addr) = server.policy_addr() {
            println!("> Policy file on {addr}");
        }

        let handle = server.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("> Stopping");
                handle.stop();
            }
        });

        server.run().await?;
        anyhow::Ok(())
    })
}

struct Echo {
    protocols: Vec<String>,
    print_json: bool,
}

impl Application for Echo {
    fn handle_open(&self, client: &Arc<Client>, request: &Request) -> HandlerResult {
        println!(
            "<{}> connected to {} ({})",
            client.id(),
            request.target(),
            client.sub_protocol().unwrap_or("no sub-protocol")
        );
        Ok(())
    }

    fn handle_message(&self, client: &Arc<Client>, _: &Request, payload: Payload) -> HandlerResult {
        match payload.as_text() {
            Some(text) if self.print_json => match serde_json::from_str::<serde_json::Value>(text) {
                Ok(value) => println!("<{}> {:#}", client.id(), value),
                Err(err) => println!("<{}> parsing json: {}", client.id(), err),
            },
            Some(text) => println!("<{}> {text}", client.id()),
            None => println!("<{}> <{} bytes>", client.id(), payload.len()),
        }

        client.send(payload)?;
        Ok(())
    }

    fn handle_close(&self, client: &Arc<Client>, _: &Request) -> HandlerResult {
        println!("<{}> disconnected", client.id());
        Ok(())
    }

    fn sub_protocols(&self) -> Vec<String> {
        self.protocols.clone()
    }
}
