//! QUIC front end: endpoint setup, accept loop and the coordinator task

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use quinn::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ChatError, Result};
use crate::server::connection_handler::ConnectionHandler;
use crate::server::hub::{CoordinatorConfig, Hub, HubHandle, HubSnapshot};
use crate::server::rooms::RoomDirectory;
use crate::store::{JsonlStore, MemoryStore, MessageStore};

/// ALPN identifier shared with [`crate::client::ChatClient`]
pub const ALPN: &[u8] = b"huddle";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// Append-only message log; in-memory storage when unset
    pub store_path: Option<PathBuf>,
    pub rooms: RoomDirectory,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 4433)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            store_path: None,
            rooms: RoomDirectory::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Open the configured message store
    pub async fn open_store(&self) -> Result<Arc<dyn MessageStore>> {
        match &self.store_path {
            Some(path) => Ok(Arc::new(JsonlStore::open(path).await?)),
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub open_connections: usize,
    pub live_sessions: usize,
    pub pending_reconnects: usize,
    pub total_rooms: usize,
    pub bind_address: SocketAddr,
}

pub struct ChatServer {
    config: ServerConfig,
    store: Arc<dyn MessageStore>,
    endpoint: Option<Endpoint>,
    hub: Option<(JoinHandle<()>, HubHandle)>,
    open_connections: Arc<AtomicUsize>,
}

impl ChatServer {
    pub fn new(config: ServerConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            config,
            store,
            endpoint: None,
            hub: None,
            open_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build a server with the store named in `config`
    pub async fn from_config(config: ServerConfig) -> Result<Self> {
        let store = config.open_store().await?;
        Ok(Self::new(config, store))
    }

    /// Bind the endpoint and start the coordinator. Returns the bound address.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        let endpoint = Endpoint::server(self.quic_config()?, self.config.bind_addr)
            .map_err(|e| ChatError::network(format!("Failed to create endpoint: {}", e)))?;
        let local_addr = endpoint.local_addr()?;
        info!("Server listening on {}", local_addr);

        self.hub = Some(Hub::spawn(
            self.config.coordinator.clone(),
            self.config.rooms.clone(),
            Arc::clone(&self.store),
        ));
        self.endpoint = Some(endpoint);
        Ok(local_addr)
    }

    /// Bind and accept connections until the endpoint closes
    pub async fn run(&mut self) -> Result<()> {
        if self.endpoint.is_none() {
            self.bind()?;
        }
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| ChatError::internal("Endpoint not bound"))?;
        let hub = self
            .hub_handle()
            .ok_or_else(|| ChatError::internal("Coordinator not started"))?;

        self.accept_connections(endpoint, hub).await
    }

    fn quic_config(&self) -> Result<quinn::ServerConfig> {
        // Self-signed certificate for development
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| ChatError::config(format!("Failed to generate certificate: {}", e)))?;
        let cert_der = CertificateDer::from(
            cert.serialize_der()
                .map_err(|e| ChatError::config(format!("Failed to encode certificate: {}", e)))?,
        );
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| ChatError::config(format!("Failed to configure TLS: {}", e)))?;
        server_config.alpn_protocols = vec![ALPN.to_vec()];
        server_config.max_early_data_size = 0;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(4u32.into());
        transport_config.max_concurrent_uni_streams(0u32.into());
        transport_config.max_idle_timeout(Some(
            self.config
                .idle_timeout
                .try_into()
                .map_err(|e| ChatError::config(format!("Invalid idle timeout: {}", e)))?,
        ));

        let mut quic_server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_config)
                .map_err(|e| ChatError::config(format!("Failed to create QUIC config: {}", e)))?,
        ));
        quic_server_config.transport_config(Arc::new(transport_config));
        Ok(quic_server_config)
    }

    async fn accept_connections(&self, endpoint: Endpoint, hub: HubHandle) -> Result<()> {
        while let Some(incoming) = endpoint.accept().await {
            if self.open_connections.load(Ordering::Acquire) >= self.config.max_connections {
                warn!("Connection limit reached, rejecting connection");
                incoming.refuse();
                continue;
            }

            let counter = Arc::clone(&self.open_connections);
            counter.fetch_add(1, Ordering::AcqRel);
            let hub = hub.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(connection) => {
                        if let Err(e) = ConnectionHandler::new(connection, hub).run().await {
                            warn!("Connection ended with error: {}", e);
                        }
                    }
                    Err(e) => error!("Handshake failed: {}", e),
                }
                counter.fetch_sub(1, Ordering::AcqRel);
            });
        }

        warn!("Endpoint stopped accepting connections");
        Ok(())
    }

    pub fn hub_handle(&self) -> Option<HubHandle> {
        self.hub.as_ref().map(|(_, handle)| handle.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|e| e.local_addr().ok())
    }

    pub async fn snapshot(&self) -> Result<HubSnapshot> {
        self.hub_handle()
            .ok_or_else(|| ChatError::internal("Coordinator not started"))?
            .snapshot()
            .await
    }

    pub async fn get_stats(&self) -> ServerStats {
        let (live_sessions, pending_reconnects) = match self.snapshot().await {
            Ok(snapshot) => (
                snapshot.sessions.iter().filter(|s| s.is_active()).count(),
                snapshot.pending_grace,
            ),
            Err(_) => (0, 0),
        };

        ServerStats {
            open_connections: self.open_connections.load(Ordering::Acquire),
            live_sessions,
            pending_reconnects,
            total_rooms: self.config.rooms.len(),
            bind_address: self.local_addr().unwrap_or(self.config.bind_addr),
        }
    }

    /// Close the endpoint and stop the coordinator
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"Server shutdown");
            info!("Server shutdown complete");
        }
        if let Some((task, _)) = self.hub.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 4433);
        assert!(config.store_path.is_none());
        assert_eq!(config.coordinator.grace_period, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_server_stats_before_bind() {
        let server = ChatServer::new(ServerConfig::default(), Arc::new(MemoryStore::new()));
        let stats = server.get_stats().await;
        assert_eq!(stats.open_connections, 0);
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.total_rooms, 3);
        assert!(server.snapshot().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_starts_coordinator() {
        let config = ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServerConfig::default()
        };
        let mut server = ChatServer::new(config, Arc::new(MemoryStore::new()));
        let addr = server.bind().unwrap();
        assert_ne!(addr.port(), 0);

        let snapshot = server.snapshot().await.unwrap();
        assert!(snapshot.sessions.is_empty());
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_selection() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            store_path: Some(dir.path().join("messages.jsonl")),
            ..ServerConfig::default()
        };
        let store = config.open_store().await.unwrap();
        assert!(store.health().await.is_ok());
        assert!(dir.path().join("messages.jsonl").exists());
    }
}
