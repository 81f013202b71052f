//! The boundary between the protocol engine and the code that uses it.
use std::sync::Arc;

use crate::{
    client::{Client, Closer},
    http::Request,
    message::Payload,
    BoxError, WebSocketError,
};

/// What an application callback returns. An error is passed to
/// [`Application::handle_error`].
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Callbacks invoked by every connection of a [`Server`](crate::Server).
///
/// Callbacks run on the connection's own task, one at a time per connection. They should not
/// block: sending through [`Client`] only queues frames.
pub trait Application: Send + Sync + 'static {
    /// The connection completed its handshake. Called once, before any message.
    fn handle_open(&self, client: &Arc<Client>, request: &Request) -> HandlerResult {
        let _ = (client, request);
        Ok(())
    }

    /// A complete message arrived. Text messages were validated as UTF-8; binary messages are
    /// delivered as received.
    fn handle_message(&self, client: &Arc<Client>, request: &Request, payload: Payload)
        -> HandlerResult;

    /// An established connection ended. Called once, while the client is still in the
    /// registry.
    fn handle_close(&self, client: &Arc<Client>, request: &Request) -> HandlerResult {
        let _ = (client, request);
        Ok(())
    }

    /// Something unexpected went wrong: a callback failed or the connection's own state was
    /// inconsistent. Protocol violations by the peer never end up here.
    ///
    /// `request` is `None` if the failure happened before the upgrade request was parsed.
    ///
    /// The default closes an established connection with `1011` and answers any other one
    /// with the error's HTTP status.
    fn handle_error(&self, client: &Arc<Client>, request: Option<&Request>, error: &WebSocketError) {
        let _ = request;
        let result = if client.is_established() {
            client.close_with(error.close_code())
        } else {
            client.reject(error.status_code())
        };

        if let Err(err) = result {
            log::debug!("conn={} could not report error: {err}", client.id());
        }
    }

    /// Sub-protocols this application speaks. The first one the client offers is agreed on.
    /// Queried once per connection.
    fn sub_protocols(&self) -> Vec<String> {
        Vec::new()
    }
}
