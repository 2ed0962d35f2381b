//! Registry of configured connections.
//!
//! Connection options are registered per `(key, target)` pair; the matching
//! [`Connection`] is opened on first use and shared afterwards. A target with
//! no options of its own falls back to the key's `default` target.

use crate::config::ConnectionOptions;
use crate::db::connection::Connection;
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// Target used when none is given or the requested one is not configured.
pub const DEFAULT_TARGET: &str = "default";

/// A connection shared between callers; one statement flow at a time.
pub type SharedConnection = Arc<Mutex<Connection>>;

type Slot = (String, String);

#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    configs: Arc<RwLock<HashMap<Slot, ConnectionOptions>>>,
    connections: Arc<RwLock<HashMap<Slot, SharedConnection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register options for `key`/`target`. An already open connection for
    /// the pair keeps running on its old options.
    pub async fn add_connection_info(
        &self,
        key: impl Into<String>,
        target: impl Into<String>,
        options: ConnectionOptions,
    ) {
        let slot = (key.into(), target.into());
        info!(key = %slot.0, target = %slot.1, driver = %options.driver, "Registered connection");
        self.configs.write().await.insert(slot, options);
    }

    /// Registered options for `key`/`target`, falling back to the key's
    /// default target.
    pub async fn connection_info(&self, key: &str, target: &str) -> Option<ConnectionOptions> {
        let configs = self.configs.read().await;
        configs
            .get(&(key.to_string(), target.to_string()))
            .or_else(|| configs.get(&(key.to_string(), DEFAULT_TARGET.to_string())))
            .cloned()
    }

    /// The connection for `key`/`target`, opened on first use.
    pub async fn get_connection(&self, key: &str, target: &str) -> DbResult<SharedConnection> {
        let slot = self.resolve(key, target).await?;

        if let Some(conn) = self.connections.read().await.get(&slot) {
            return Ok(Arc::clone(conn));
        }

        let options = self
            .configs
            .read()
            .await
            .get(&slot)
            .cloned()
            .ok_or_else(|| DbError::invalid_input(format!("No connection configured for '{key}'")))?;
        let connection = Connection::open(options).await?;

        // Re-check after the async open: another caller may have won the race
        let (shared, loser) = {
            let mut connections = self.connections.write().await;
            match connections.get(&slot) {
                Some(existing) => (Arc::clone(existing), Some(connection)),
                None => {
                    let shared = Arc::new(Mutex::new(connection));
                    connections.insert(slot.clone(), Arc::clone(&shared));
                    (shared, None)
                }
            }
        };

        if let Some(extra) = loser {
            if let Err(e) = extra.close().await {
                warn!(key = %slot.0, target = %slot.1, error = %e, "Failed to close duplicate connection");
            }
        }
        Ok(shared)
    }

    /// Slot whose options serve `key`/`target`.
    async fn resolve(&self, key: &str, target: &str) -> DbResult<Slot> {
        let configs = self.configs.read().await;
        let requested = (key.to_string(), target.to_string());
        if configs.contains_key(&requested) {
            return Ok(requested);
        }
        let fallback = (key.to_string(), DEFAULT_TARGET.to_string());
        if configs.contains_key(&fallback) {
            return Ok(fallback);
        }
        Err(DbError::invalid_input(format!(
            "No connection configured for key '{key}' and target '{target}'"
        )))
    }

    /// True once the connection serving `key`/`target` has been opened,
    /// including through the fallback to the default target.
    pub async fn is_open(&self, key: &str, target: &str) -> bool {
        match self.resolve(key, target).await {
            Ok(slot) => self.connections.read().await.contains_key(&slot),
            Err(_) => false,
        }
    }

    /// Close every open connection of `key` and forget its options.
    pub async fn remove_connection(&self, key: &str) {
        self.configs.write().await.retain(|(k, _), _| k != key);
        let removed: Vec<(Slot, SharedConnection)> = {
            let mut connections = self.connections.write().await;
            let slots: Vec<Slot> = connections.keys().filter(|(k, _)| k == key).cloned().collect();
            slots
                .into_iter()
                .filter_map(|slot| connections.remove(&slot).map(|c| (slot, c)))
                .collect()
        };
        for (slot, shared) in removed {
            close_shared(slot, shared).await;
        }
    }

    /// Close all open connections.
    pub async fn close_all(&self) {
        let drained: Vec<(Slot, SharedConnection)> =
            self.connections.write().await.drain().collect();
        for (slot, shared) in drained {
            close_shared(slot, shared).await;
        }
        info!("All connections closed");
    }
}

/// Close a connection nobody else holds; otherwise leave it to its holders.
async fn close_shared(slot: Slot, shared: SharedConnection) {
    info!(key = %slot.0, target = %slot.1, "Closing connection");
    match Arc::try_unwrap(shared) {
        Ok(mutex) => {
            if let Err(e) = mutex.into_inner().close().await {
                warn!(key = %slot.0, target = %slot.1, error = %e, "Failed to close connection");
            }
        }
        Err(_) => warn!(
            key = %slot.0,
            target = %slot.1,
            "Connection still in use; it closes when the last holder drops it"
        ),
    }
}
