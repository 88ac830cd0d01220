//! Pool of backend clients keyed by credential, with round-robin selection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::BackendClient;

/// Builds a client for a credential (`None` = anonymous).
pub type ClientFactory = Arc<dyn Fn(Option<&str>) -> Arc<dyn BackendClient> + Send + Sync>;

pub struct CredentialPool {
    clients: Vec<Arc<dyn BackendClient>>,
    by_credential: HashMap<String, usize>,
    cursor: AtomicUsize,
    factory: ClientFactory,
}

impl CredentialPool {
    /// Build from individual credentials; entries are trimmed, blanks and
    /// duplicates dropped.
    pub fn new<I, S>(credentials: I, factory: ClientFactory) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut clients = Vec::new();
        let mut by_credential = HashMap::new();
        for raw in credentials {
            let key = raw.as_ref().trim();
            if key.is_empty() || by_credential.contains_key(key) {
                continue;
            }
            by_credential.insert(key.to_string(), clients.len());
            clients.push(factory(Some(key)));
        }

        if clients.is_empty() {
            tracing::info!("No API keys available");
        } else {
            tracing::info!("Using API keys: {}", clients.len());
        }

        Self {
            clients,
            by_credential,
            cursor: AtomicUsize::new(0),
            factory,
        }
    }

    /// Build from a comma separated list such as the `API_KEYS` variable.
    pub fn from_list(list: &str, factory: ClientFactory) -> Self {
        Self::new(list.split(','), factory)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Client for an explicit credential, or the next pooled one.
    pub fn select(&self, explicit: Option<&str>) -> Arc<dyn BackendClient> {
        match explicit.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => match self.by_credential.get(key) {
                Some(&idx) => self.clients[idx].clone(),
                None => (self.factory)(Some(key)),
            },
            None => self.next_client(),
        }
    }

    /// Round-robin over the pool; falls back to an anonymous client when empty.
    pub fn next_client(&self) -> Arc<dyn BackendClient> {
        if self.clients.is_empty() {
            tracing::error!("No API keys available");
            return (self.factory)(None);
        }
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.clients[n % self.clients.len()].clone()
    }
}

/// Short, log-safe rendering of a credential.
pub fn mask_credential(key: &str) -> String {
    let visible: String = key.chars().take(4).collect();
    if key.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}
