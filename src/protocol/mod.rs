//! Wire protocol for the chat coordinator
//!
//! This module provides:
//! - Binary frame encoding/decoding
//! - Message payload definitions
//! - Codec traits and the typed client/server frame enums

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{ClientFrame, Decodable, Encodable, ServerFrame, decode, encode};
pub use frame::{FRAME_HEADER_SIZE, Frame, FrameCodec, FrameType, MAX_FRAME_SIZE};
pub use messages::*;
