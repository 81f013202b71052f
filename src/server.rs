use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{
    application::Application,
    client::{Client, ClientId},
    connection::{self, Shared},
    http::RequestParser,
    options::Options,
    policy::{self, PolicyFile},
    protocol::Negotiator,
    registry::ClientRegistry,
    stream::MaybeTlsStream,
    Result,
};

/// Pause after a failed `accept`, so a persistent error (like running out of file
/// descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A bound WebSocket server.
///
/// [`Server::bind`] opens the sockets; [`Server::run`] accepts connections until the server is
/// stopped through a [`ServerHandle`].
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use yawss::{Application, Client, HandlerResult, Options, Payload, Request, Server};
///
/// struct Silent;
///
/// impl Application for Silent {
///     fn handle_message(&self, _: &Arc<Client>, _: &Request, _: Payload) -> HandlerResult {
///         Ok(())
///     }
/// }
///
/// # async fn example() -> yawss::Result<()> {
/// let server = Server::bind(Options::default().with_port(0), Silent).await?;
/// let handle = server.handle();
/// tokio::spawn(server.run());
///
/// // later
/// handle.stop();
/// # Ok(())
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    policy_listener: Option<TcpListener>,
    policy: Arc<PolicyFile>,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Server {
    /// Binds the listening socket (and the policy-file socket unless disabled).
    ///
    /// # Errors
    /// Fails if the main socket cannot be bound. A policy socket that cannot be bound is
    /// logged and skipped.
    pub async fn bind<A: Application>(options: Options, app: A) -> Result<Self> {
        Self::bind_shared(options, Arc::new(app)).await
    }

    /// Like [`Server::bind`], for an application that is shared with other code.
    pub async fn bind_shared(options: Options, app: Arc<dyn Application>) -> Result<Self> {
        let listener = TcpListener::bind(options.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let policy_listener = match options.policy_addr() {
            Some(addr) => match TcpListener::bind(addr).await {
                Ok(listener) => Some(listener),
                Err(err) => {
                    log::warn!("policy listener on {addr} unavailable: {err}");
                    None
                }
            },
            None => None,
        };
        let policy = Arc::new(PolicyFile::for_server(
            options.http_host.as_deref(),
            local_addr.port(),
        ));

        let shared = Arc::new(Shared {
            app,
            negotiator: Negotiator::default(),
            registry: options.registry(),
            parser: RequestParser::new(options.limits().max_request_size)
                .with_trusted_proxies(options.trusted_proxies.clone()),
            limits: options.limits(),
        });

        Ok(Self {
            listener,
            local_addr,
            policy_listener,
            policy,
            tls: options.tls.map(TlsAcceptor::from),
            shared,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the policy-file listener, if it is running.
    pub fn policy_addr(&self) -> Option<SocketAddr> {
        self.policy_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.shared.registry
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            cancel: self.cancel.clone(),
            registry: self.shared.registry.clone(),
            local_addr: self.local_addr,
        }
    }

    /// Accepts connections until [`ServerHandle::stop`] is called.
    ///
    /// Each connection is served on its own task. Stopping does not close connections that
    /// are already open.
    pub async fn run(self) -> Result<()> {
        let Server {
            listener,
            local_addr,
            policy_listener,
            policy,
            tls,
            shared,
            cancel,
        } = self;

        if let Some(policy_listener) = policy_listener {
            if let Ok(addr) = policy_listener.local_addr() {
                log::info!("serving policy file on {addr}");
            }
            tokio::spawn(policy::serve(policy_listener, policy, cancel.clone()));
        }

        log::info!(
            "listening on {}://{local_addr}",
            if tls.is_some() { "wss" } else { "ws" }
        );

        let mut next_id: u64 = 0;
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            next_id += 1;
            let id = ClientId::from(next_id);
            tokio::spawn(accept(stream, peer, id, tls.clone(), Arc::clone(&shared)));
        }

        log::info!("server on {local_addr} stopped");
        Ok(())
    }
}

async fn accept(
    stream: TcpStream,
    peer: SocketAddr,
    id: ClientId,
    tls: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) {
    log::debug!("conn={id} accepted from {peer}");
    if let Err(err) = stream.set_nodelay(true) {
        log::debug!("conn={id} set_nodelay failed: {err}");
    }

    let stream = match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => MaybeTlsStream::from(stream),
            Err(err) => {
                log::debug!("conn={id} TLS handshake failed: {err}");
                return;
            }
        },
        None => MaybeTlsStream::from(stream),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let client = Arc::new(Client::new(id, Some(peer), tx));
    connection::serve(stream, client, rx, shared).await;

    log::debug!("conn={id} finished");
}

/// Controls a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    cancel: CancellationToken,
    registry: ClientRegistry,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Stops accepting connections. Open connections keep running.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
