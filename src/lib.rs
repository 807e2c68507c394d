//! Presence, room membership and message fan-out for a QUIC chat service
//!
//! The server side is a single coordinator task (the hub) that owns the
//! session registry, room directory and grace timers. Connections feed it
//! decoded frames and drain per-connection outboxes. The client side offers a
//! QUIC client and a state reconciler that merges live and replayed traffic.

pub mod client;
pub mod error;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::{ChatClient, ChatClientConfig, ClientState};
pub use error::{ChatError, Result};
pub use server::{ChatServer, CoordinatorConfig, ServerConfig};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Process-wide sequence mixed into generated message ids
static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Width of the random base36 suffix of a message id
const SUFFIX_WIDTH: usize = 5;

/// Generate a unique message ID: `<unix-ms>-<sequence><random suffix>`
///
/// The suffix has a fixed width, so the sequence part can always be told
/// apart from it and two ids from this process never collide.
pub fn generate_message_id() -> String {
    let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    let suffix = rand::thread_rng().gen_range(0..36u64.pow(SUFFIX_WIDTH as u32));
    format!(
        "{}-{}{:0>width$}",
        current_timestamp(),
        to_base36(seq),
        to_base36(suffix),
        width = SUFFIX_WIDTH
    )
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
