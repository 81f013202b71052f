//! Connected clients, addressable by id.
//!
//! The [`ClientRegistry`] is shared by every connection task, so all of its operations take
//! `&self` and are safe to call concurrently. Where the clients are kept is up to a
//! [`StorageDriver`]; the default [`MemoryDriver`] keeps them in a sharded map.
use std::{fmt, sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::{
    client::{Client, ClientId, Sender},
    message::Payload,
    Result, WebSocketError,
};

/// Storage backend of a [`ClientRegistry`].
pub trait StorageDriver: Send + Sync + fmt::Debug {
    /// Stores `client` unless `id` is taken. Returns `false` if it was.
    ///
    /// `ttl` is a hint; drivers without expiry ignore it.
    fn save(&self, id: ClientId, client: Arc<Client>, ttl: Option<Duration>) -> bool;

    fn fetch(&self, id: ClientId) -> Option<Arc<Client>>;

    fn contains(&self, id: ClientId) -> bool;

    /// Returns `true` if an entry was removed.
    fn delete(&self, id: ClientId) -> bool;

    fn fetch_all(&self) -> Vec<Arc<Client>>;

    fn len(&self) -> usize {
        self.fetch_all().len()
    }
}

/// In-process storage. Entries never expire.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    clients: DashMap<ClientId, Arc<Client>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageDriver for MemoryDriver {
    fn save(&self, id: ClientId, client: Arc<Client>, _ttl: Option<Duration>) -> bool {
        match self.clients.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(client);
                true
            }
        }
    }

    fn fetch(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    fn delete(&self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    fn fetch_all(&self) -> Vec<Arc<Client>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn len(&self) -> usize {
        self.clients.len()
    }
}

/// Map from [`ClientId`] to live [`Client`]s.
///
/// Cloning a registry yields a handle to the same storage.
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    driver: Arc<dyn StorageDriver>,
    ttl: Option<Duration>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(Arc::new(MemoryDriver::new()))
    }
}

impl ClientRegistry {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        Self { driver, ttl: None }
    }

    /// TTL handed to the driver for every new entry.
    pub fn with_ttl(self, ttl: Option<Duration>) -> Self {
        Self { ttl, ..self }
    }

    /// # Errors
    /// `DuplicateClient` if `id` is already registered.
    pub fn add(&self, id: ClientId, client: Arc<Client>) -> Result<()> {
        if self.driver.save(id, client, self.ttl) {
            Ok(())
        } else {
            Err(WebSocketError::DuplicateClient(id))
        }
    }

    /// # Errors
    /// `ClientNotFound` if no client is registered under `id`.
    pub fn get(&self, id: ClientId) -> Result<Arc<Client>> {
        self.driver
            .fetch(id)
            .ok_or(WebSocketError::ClientNotFound(id))
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.driver.contains(id)
    }

    pub fn remove(&self, id: ClientId) -> bool {
        self.driver.delete(id)
    }

    /// A snapshot of every registered client.
    pub fn iterate(&self) -> Vec<Arc<Client>> {
        self.driver.fetch_all()
    }

    pub fn len(&self) -> usize {
        self.driver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends `payload` to every established client that is not closing.
    ///
    /// Returns how many clients it was queued for.
    pub fn broadcast(&self, payload: &Payload) -> usize {
        self.iterate()
            .iter()
            .filter(|client| client.send(payload.clone()).is_ok())
            .count()
    }
}
