//! Per-connection task
//!
//! The client opens one bidirectional stream. Inbound frames are decoded and
//! forwarded to the hub; the hub's outbox for this connection is drained onto
//! the send half. When the hub drops the outbox (session superseded or
//! evicted) the connection is closed.

use std::time::Duration;

use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::model::SessionId;
use crate::protocol::codec::{ClientFrame, ServerFrame};
use crate::protocol::frame::FrameCodec;
use crate::server::hub::HubHandle;

const READ_BUFFER_SIZE: usize = 8192;

/// Application close code sent when the hub retires a connection
const CLOSE_SESSION_ENDED: u32 = 1;

pub struct ConnectionHandler {
    connection: Connection,
    conn_id: SessionId,
    hub: HubHandle,
    created_at: Instant,
}

impl ConnectionHandler {
    pub fn new(connection: Connection, hub: HubHandle) -> Self {
        Self {
            connection,
            conn_id: uuid::Uuid::new_v4().to_string(),
            hub,
            created_at: Instant::now(),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Serve the connection until either side closes it
    pub async fn run(self) -> Result<()> {
        let addr = self.remote_address();
        info!("New connection {} from {}", self.conn_id, addr);

        let result = self.serve().await;

        let reason = match &result {
            Ok(()) => "closed".to_string(),
            Err(e) => e.to_string(),
        };
        // The hub may already be gone during shutdown
        let _ = self.hub.disconnect(&self.conn_id, reason);

        info!(
            "Connection {} from {} closed after {:?}",
            self.conn_id,
            addr,
            self.uptime()
        );
        result
    }

    async fn serve(&self) -> Result<()> {
        let (send, recv) = self.connection.accept_bi().await.map_err(|e| {
            ChatError::connection(format!("Failed to accept chat stream: {}", e))
        })?;
        debug!("Chat stream accepted from {}", self.remote_address());

        let outbox = self.hub.connect(&self.conn_id)?;

        let mut reader = tokio::spawn(read_frames(
            recv,
            self.hub.clone(),
            self.conn_id.clone(),
        ));
        let mut writer = tokio::spawn(write_frames(send, outbox));

        tokio::select! {
            res = &mut reader => {
                writer.abort();
                flatten(res)
            }
            res = &mut writer => {
                reader.abort();
                let res = flatten(res);
                if res.is_ok() {
                    debug!("Outbox of {} closed by coordinator", self.conn_id);
                    self.connection
                        .close(CLOSE_SESSION_ENDED.into(), b"session ended");
                }
                res
            }
        }
    }
}

fn flatten(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ChatError::internal(format!("Connection task failed: {}", e))),
    }
}

async fn read_frames(mut recv: RecvStream, hub: HubHandle, conn_id: SessionId) -> Result<()> {
    let mut codec = FrameCodec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match recv.read(&mut buf).await {
            Ok(Some(n)) => {
                codec.feed(&buf[..n]);

                loop {
                    match codec.decode_next() {
                        Ok(Some(frame)) => match ClientFrame::decode(&frame) {
                            Ok(client_frame) => hub.frame(&conn_id, client_frame)?,
                            Err(e) => {
                                warn!("Malformed {:?} frame from {}: {}", frame.frame_type, conn_id, e);
                                hub.reject(
                                    &conn_id,
                                    ChatError::protocol(format!(
                                        "Invalid {:?} frame: {}",
                                        frame.frame_type, e
                                    )),
                                )?;
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            return Err(ChatError::protocol(format!(
                                "Frame decode error: {}",
                                e
                            )));
                        }
                    }
                }
            }
            Ok(None) => {
                debug!("Chat stream of {} finished", conn_id);
                return Ok(());
            }
            Err(e) => {
                return Err(ChatError::network(format!(
                    "Chat stream read error: {}",
                    e
                )));
            }
        }
    }
}

async fn write_frames(
    mut send: SendStream,
    mut outbox: mpsc::UnboundedReceiver<ServerFrame>,
) -> Result<()> {
    while let Some(frame) = outbox.recv().await {
        let data = match frame.encode_frame() {
            Ok(frame) => frame.encode_to_bytes(),
            Err(e) => {
                error!("Failed to encode {:?}: {}", frame.frame_type(), e);
                continue;
            }
        };
        send.write_all(&data).await?;
    }

    let _ = send.finish();
    Ok(())
}
