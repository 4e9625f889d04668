//! Connection Registry
//!
//! One [`Registry`] per listening endpoint maps client identities to live
//! connections. [`Registries`] is the process-wide view used when a relayed
//! direct message has to be matched against every local endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::channel::{ConnectionHandle, ConnectionId};
use crate::protocol::{ClientId, EndpointId};

#[derive(Debug, Clone)]
pub struct Registry {
    endpoint: EndpointId,
    entries: Arc<RwLock<HashMap<ClientId, ConnectionHandle>>>,
}

impl Registry {
    pub fn new(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Insert or replace. The replaced handle is returned untouched; closing
    /// it is the caller's decision.
    pub async fn put(&self, id: ClientId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.entries.write().await.insert(id, handle)
    }

    pub async fn get(&self, id: &ClientId) -> Option<ConnectionHandle> {
        self.entries.read().await.get(id).cloned()
    }

    #[cfg(test)]
    pub async fn remove(&self, id: &ClientId) -> Option<ConnectionHandle> {
        self.entries.write().await.remove(id)
    }

    /// Remove `id` only while it still points at `owner`. A later registration
    /// of the same identity by another connection is left in place.
    pub async fn remove_if_owned(&self, id: &ClientId, owner: ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(id) {
            Some(handle) if handle.id() == owner => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Copy of all entries at call time, in no particular order.
    pub async fn snapshot(&self) -> Vec<(ClientId, ConnectionHandle)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    #[cfg(test)]
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// All endpoint registries owned by this process.
#[derive(Debug, Clone, Default)]
pub struct Registries {
    registries: Arc<[Registry]>,
}

impl Registries {
    pub fn new(registries: Vec<Registry>) -> Self {
        Self {
            registries: registries.into(),
        }
    }

    /// Every open connection registered under `id`, across all endpoints.
    pub async fn find_open(&self, id: &ClientId) -> Vec<ConnectionHandle> {
        let mut found = Vec::new();
        for registry in self.registries.iter() {
            if let Some(handle) = registry.get(id).await {
                if handle.is_open() {
                    found.push(handle);
                }
            }
        }
        found
    }
}
