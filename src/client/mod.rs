//! QUIC chat client
//!
//! [`ChatClient`] owns the connection and one bidirectional stream. Server
//! frames are forwarded as [`ClientEvent`]s; pings are answered
//! automatically. Feed the frames to a [`ClientState`] to get the merged
//! view.

pub mod reconciler;

pub use reconciler::{ClientState, Entry, LocalIdentity, PresenceChange, SystemEntry};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::generate_message_id;
use crate::model::{Identity, ViewContext};
use crate::protocol::codec::{Encodable, ServerFrame};
use crate::protocol::frame::FrameCodec;
use crate::protocol::messages::{
    Health, HistoryQuery, Join, JoinRoom, Logout, Pong, Reconnect, RecentFiles, SendMessage,
    SetView, ShareFile, TargetFields,
};
use crate::server::chat_server::ALPN;

/// Sender-side cap on shared files
pub const MAX_FILE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ChatClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Client bind address (use 0.0.0.0:0 for auto)
    pub bind_addr: SocketAddr,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// QUIC keep-alive interval in seconds
    pub keep_alive_secs: u64,
    /// Largest file `share_file` accepts
    pub max_file_size: usize,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 4433)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            connect_timeout_secs: 10,
            keep_alive_secs: 5,
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

/// Events that the client can receive
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connected and the join/reconnect frame is sent
    Connected,
    /// Disconnected from server
    Disconnected(String),
    /// Frame from the server
    Frame(ServerFrame),
    /// Error occurred
    Error(ChatError),
}

type SharedSend = Arc<Mutex<SendStream>>;

pub struct ChatClient {
    config: ChatClientConfig,
    identity: Option<Identity>,
    connection: Option<Connection>,
    endpoint: Option<Endpoint>,
    send: Option<SharedSend>,
}

impl ChatClient {
    pub fn new(config: ChatClientConfig) -> Self {
        Self {
            config,
            identity: None,
            connection: None,
            endpoint: None,
            send: None,
        }
    }

    /// Connect and join as a new participant
    pub async fn connect(&mut self, identity: Identity) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        let join = Join {
            name: identity.name.clone(),
            role: identity.role,
        };
        self.open(identity, &join).await
    }

    /// Connect and resume a session that dropped within the grace period
    pub async fn reconnect(&mut self, identity: Identity) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        let reconnect = Reconnect {
            name: identity.name.clone(),
            role: identity.role,
        };
        self.open(identity, &reconnect).await
    }

    async fn open<T: Encodable>(
        &mut self,
        identity: Identity,
        hello: &T,
    ) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        info!("Connecting to chat server at {}", self.config.server_addr);

        let mut endpoint = Endpoint::client(self.config.bind_addr)
            .map_err(|e| ChatError::network(format!("Failed to create endpoint: {}", e)))?;
        endpoint.set_default_client_config(self.configure_client()?);

        let connecting = endpoint
            .connect(self.config.server_addr, "localhost")
            .map_err(|e| ChatError::connection(format!("Failed to initiate connection: {}", e)))?;

        let connection = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            connecting,
        )
        .await
        .map_err(|_| ChatError::timeout("Connection timeout"))?
        .map_err(|e| ChatError::connection(format!("Failed to connect: {}", e)))?;

        let (send, recv) = connection.open_bi().await?;
        let send = Arc::new(Mutex::new(send));
        write_frame(&send, hello).await?;
        info!("Connected as {}", identity);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(ClientEvent::Connected);
        tokio::spawn(receive_frames(recv, Arc::clone(&send), event_tx));

        self.identity = Some(identity);
        self.connection = Some(connection);
        self.endpoint = Some(endpoint);
        self.send = Some(send);
        Ok(event_rx)
    }

    fn configure_client(&self) -> Result<QuinnClientConfig> {
        // Accepts the server's self-signed certificate. Development only.
        let mut crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(Duration::from_secs(self.config.keep_alive_secs)));

        let mut config = QuinnClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ChatError::config(format!("Failed to create QUIC config: {}", e)))?,
        ));
        config.transport_config(Arc::new(transport));
        Ok(config)
    }

    async fn send_frame<T: Encodable>(&self, msg: &T) -> Result<()> {
        let send = self
            .send
            .as_ref()
            .ok_or_else(|| ChatError::connection("Not connected to server"))?;
        write_frame(send, msg).await
    }

    pub async fn join_room(&self, room: impl Into<String>) -> Result<()> {
        self.send_frame(&JoinRoom { room: room.into() }).await
    }

    pub async fn set_view(&self, view: ViewContext) -> Result<()> {
        self.send_frame(&SetView { view }).await
    }

    /// Send a text message. Returns the message id so the caller can record
    /// its local copy before the echo arrives.
    pub async fn send_text(&self, target: TargetFields, text: impl Into<String>) -> Result<String> {
        let message_id = generate_message_id();
        self.send_frame(&SendMessage {
            text: text.into(),
            target,
            message_id: Some(message_id.clone()),
        })
        .await?;
        debug!("Sent message {}", message_id);
        Ok(message_id)
    }

    /// Share a file as a base64 `data:` URL
    pub async fn share_file(
        &self,
        target: TargetFields,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: &[u8],
    ) -> Result<String> {
        let share = self.build_share(target, name.into(), mime_type.into(), bytes)?;
        let message_id = share.message_id.clone().unwrap_or_default();
        self.send_frame(&share).await?;
        debug!("Shared file {} ({} bytes)", share.name, share.size_bytes);
        Ok(message_id)
    }

    fn build_share(
        &self,
        target: TargetFields,
        name: String,
        mime_type: String,
        bytes: &[u8],
    ) -> Result<ShareFile> {
        if bytes.len() > self.config.max_file_size {
            return Err(ChatError::resource_limit(format!(
                "{} is {} bytes, limit is {}",
                name,
                bytes.len(),
                self.config.max_file_size
            )));
        }

        Ok(ShareFile {
            payload: format!("data:{};base64,{}", mime_type, BASE64.encode(bytes)),
            mime_type: Some(mime_type),
            size_bytes: bytes.len() as u64,
            name,
            target,
            message_id: Some(generate_message_id()),
        })
    }

    pub async fn request_history(&self, query: HistoryQuery) -> Result<()> {
        self.send_frame(&query).await
    }

    pub async fn request_recent_files(&self, limit: Option<usize>) -> Result<()> {
        self.send_frame(&RecentFiles { limit }).await
    }

    pub async fn request_health(&self) -> Result<()> {
        self.send_frame(&Health {}).await
    }

    /// Log out and close the connection
    pub async fn logout(&mut self) -> Result<()> {
        self.send_frame(&Logout {}).await?;
        self.disconnect().await
    }

    /// Close the connection without logging out; the server holds the
    /// session for its grace period
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(send) = self.send.take() {
            let _ = send.lock().await.finish();
        }
        if let Some(connection) = self.connection.take() {
            connection.close(0u32.into(), b"Client disconnect");
            info!("Disconnected from chat server");
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"Client shutdown");
        }
        Ok(())
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_stats(&self) -> Option<ConnectionStats> {
        self.connection.as_ref().map(|conn| {
            let stats = conn.stats();
            ConnectionStats {
                bytes_sent: stats.udp_tx.bytes,
                bytes_received: stats.udp_rx.bytes,
                round_trip_time: stats.path.rtt,
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub round_trip_time: Duration,
}

async fn write_frame<T: Encodable>(send: &SharedSend, msg: &T) -> Result<()> {
    let data = msg.encode_frame()?.encode_to_bytes();
    send.lock().await.write_all(&data).await?;
    Ok(())
}

async fn receive_frames(
    mut recv: RecvStream,
    send: SharedSend,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; 8192];

    let reason = loop {
        match recv.read(&mut buf).await {
            Ok(Some(n)) => {
                codec.feed(&buf[..n]);
                loop {
                    match codec.decode_next() {
                        Ok(Some(frame)) => match ServerFrame::decode(&frame) {
                            Ok(ServerFrame::Ping(ping)) => {
                                let pong = Pong {
                                    timestamp: ping.timestamp,
                                };
                                if let Err(e) = write_frame(&send, &pong).await {
                                    warn!("Failed to answer ping: {}", e);
                                }
                            }
                            Ok(server_frame) => {
                                let _ = event_tx.send(ClientEvent::Frame(server_frame));
                            }
                            Err(e) => {
                                error!("Failed to parse {:?}: {}", frame.frame_type, e);
                                let _ = event_tx.send(ClientEvent::Error(ChatError::serialization(
                                    format!("Failed to parse {:?}: {}", frame.frame_type, e),
                                )));
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            let _ = event_tx.send(ClientEvent::Error(ChatError::protocol(
                                format!("Frame decode error: {}", e),
                            )));
                            return;
                        }
                    }
                }
            }
            Ok(None) => break "server closed the stream".to_string(),
            Err(e) => break format!("Connection lost: {}", e),
        }
    };

    let _ = event_tx.send(ClientEvent::Disconnected(reason));
}

/// Certificate verifier that accepts anything. Development only.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
