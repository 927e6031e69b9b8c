//! Registry of named broker connections.
//!
//! The registry is the single owner of connection lifetime: it validates
//! construction parameters, rejects duplicate client identities, hands out
//! cloneable [`Connection`] handles and tears everything down at shutdown.
//! One registry instance is created at process startup and passed by handle
//! to the subsystems that need it; there is no hidden global.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{ConfigError, Error, Result};
use crate::link::{AmqpConnector, LinkConnector};

/// Creates and tracks named [`Connection`]s.
pub struct ConnectionRegistry {
    connections: DashMap<String, Connection>,
    connector: Arc<dyn LinkConnector>,
}

impl ConnectionRegistry {
    /// Create an empty registry backed by the AMQP connector.
    ///
    /// Must be called from within a tokio runtime; each created connection
    /// spawns its own actor task.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            connector: Arc::new(AmqpConnector),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_connector(connector: Arc<dyn LinkConnector>) -> Self {
        Self {
            connections: DashMap::new(),
            connector,
        }
    }

    /// Validate `config`, construct a [`Connection`] and store it under its
    /// client identity.
    ///
    /// The connection is not connected yet; call
    /// [`Connection::connect`] when ready.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a mandatory parameter is missing or
    /// the client identity is already registered.
    pub fn create(&self, config: ConnectionConfig) -> Result<Connection> {
        config.validate().map_err(Error::Config)?;
        match self.connections.entry(config.client_id.clone()) {
            Entry::Occupied(occupied) => Err(Error::Config(ConfigError::DuplicateClientId(
                occupied.key().clone(),
            ))),
            Entry::Vacant(vacant) => {
                let connection = Connection::spawn(config, Arc::clone(&self.connector));
                info!(client_id = %connection.client_id(), "connection registered");
                vacant.insert(connection.clone());
                Ok(connection)
            }
        }
    }

    /// Look up a connection by client identity.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Connection> {
        self.connections.get(client_id).map(|c| c.value().clone())
    }

    /// Snapshot of every registered connection.
    #[must_use]
    pub fn all(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize { self.connections.len() }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.connections.is_empty() }

    /// Disconnect and stop every managed connection, best-effort.
    ///
    /// A failure to disconnect one connection is logged and must not block
    /// disconnecting the rest. Per-connection reconnect timers are cancelled
    /// before this returns.
    pub fn shutdown_all(&self) {
        for entry in &self.connections {
            let connection = entry.value();
            if let Err(error) = connection.disconnect() {
                warn!(
                    client_id = %connection.client_id(),
                    %error,
                    "disconnect failed during shutdown"
                );
            }
            connection.shutdown();
        }
        self.connections.clear();
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_client_identity_is_rejected() {
        let registry = ConnectionRegistry::new();
        registry
            .create(ConnectionConfig::new("broker.test", "gateways", "gw-1"))
            .expect("first registration");
        let error = registry
            .create(ConnectionConfig::new("other.test", "gateways", "gw-1"))
            .expect_err("duplicate identity");
        assert!(matches!(
            error,
            Error::Config(ConfigError::DuplicateClientId(id)) if id == "gw-1"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_registration() {
        let registry = ConnectionRegistry::new();
        let error = registry
            .create(ConnectionConfig::new("", "gateways", "gw-1"))
            .expect_err("missing host");
        assert!(matches!(error, Error::Config(ConfigError::MissingHost)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn create_does_not_auto_connect() {
        let registry = ConnectionRegistry::new();
        let connection = registry
            .create(ConnectionConfig::new("broker.test", "gateways", "gw-1"))
            .expect("registration");
        assert_eq!(
            connection.state(),
            crate::connection::ConnectionState::Idle
        );
    }

    #[tokio::test]
    async fn shutdown_all_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        registry
            .create(ConnectionConfig::new("broker.test", "gateways", "gw-1"))
            .expect("gw-1");
        registry
            .create(ConnectionConfig::new("broker.test", "gateways", "gw-2"))
            .expect("gw-2");
        registry.shutdown_all();
        assert!(registry.is_empty());
    }
}
