//! Binary frame protocol with length-prefixed messages
//!
//! Frame format:
//! ```text
//! +--------+--------+------------------+
//! | type   | length | payload          |
//! | (1 byte)| (4 bytes, BE) | (JSON)   |
//! +--------+--------+------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};

/// Frame header size: 1 byte type + 4 bytes length
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum frame payload size (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Frame types for different message categories
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    // Session control (0x00 - 0x0F)
    Join = 0x01,
    Reconnect = 0x02,
    Logout = 0x03,
    Ping = 0x04,
    Pong = 0x05,

    // Chat commands, client -> server (0x10 - 0x1F)
    JoinRoom = 0x10,
    SetView = 0x11,
    SendMessage = 0x12,
    ShareFile = 0x13,

    // Queries, client -> server (0x20 - 0x2F)
    HistoryQuery = 0x20,
    RecentFiles = 0x21,
    Health = 0x22,

    // Session state, server -> client (0x30 - 0x3F)
    Joined = 0x30,
    Reconnected = 0x31,
    RoomsInfo = 0x32,
    UsersList = 0x33,
    PreviousMessages = 0x34,
    RoomJoined = 0x35,

    // Deliveries, server -> client (0x40 - 0x4F)
    Message = 0x40,
    FileShared = 0x41,
    Notification = 0x42,

    // Presence, server -> client (0x50 - 0x5F)
    UserJoined = 0x50,
    UserLeft = 0x51,
    UserOffline = 0x52,

    // Query results, server -> client (0x60 - 0x6F)
    HistoryResult = 0x60,
    RecentFilesResult = 0x61,
    HealthStatus = 0x62,

    // Error (0xFF)
    Error = 0xFF,
}

impl FrameType {
    /// Convert from u8, returns None for unknown types
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(FrameType::Join),
            0x02 => Some(FrameType::Reconnect),
            0x03 => Some(FrameType::Logout),
            0x04 => Some(FrameType::Ping),
            0x05 => Some(FrameType::Pong),

            0x10 => Some(FrameType::JoinRoom),
            0x11 => Some(FrameType::SetView),
            0x12 => Some(FrameType::SendMessage),
            0x13 => Some(FrameType::ShareFile),

            0x20 => Some(FrameType::HistoryQuery),
            0x21 => Some(FrameType::RecentFiles),
            0x22 => Some(FrameType::Health),

            0x30 => Some(FrameType::Joined),
            0x31 => Some(FrameType::Reconnected),
            0x32 => Some(FrameType::RoomsInfo),
            0x33 => Some(FrameType::UsersList),
            0x34 => Some(FrameType::PreviousMessages),
            0x35 => Some(FrameType::RoomJoined),

            0x40 => Some(FrameType::Message),
            0x41 => Some(FrameType::FileShared),
            0x42 => Some(FrameType::Notification),

            0x50 => Some(FrameType::UserJoined),
            0x51 => Some(FrameType::UserLeft),
            0x52 => Some(FrameType::UserOffline),

            0x60 => Some(FrameType::HistoryResult),
            0x61 => Some(FrameType::RecentFilesResult),
            0x62 => Some(FrameType::HealthStatus),

            0xFF => Some(FrameType::Error),
            _ => None,
        }
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given type and payload
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode this frame into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Encode this frame into a new Bytes
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Try to decode a frame from a buffer
    /// Returns Ok(Some(frame)) if successful, Ok(None) if more data needed
    pub fn decode(buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming
        let mut cursor = Cursor::new(&buf[..]);
        let frame_type_byte = cursor.get_u8();
        let payload_len = cursor.get_u32() as usize;

        let frame_type = parse_frame_type(frame_type_byte)?;
        check_payload_len(payload_len)?;

        let total_size = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < total_size {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }

    /// Decode a single frame from a complete buffer (no streaming)
    pub fn decode_complete(data: &[u8]) -> io::Result<Frame> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Incomplete frame header",
            ));
        }

        let frame_type = parse_frame_type(data[0])?;
        let payload_len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        check_payload_len(payload_len)?;

        let expected_len = FRAME_HEADER_SIZE + payload_len;
        if data.len() < expected_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Incomplete frame: expected {} bytes, got {}",
                    expected_len,
                    data.len()
                ),
            ));
        }

        Ok(Frame {
            frame_type,
            payload: Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..expected_len]),
        })
    }
}

fn parse_frame_type(byte: u8) -> io::Result<FrameType> {
    FrameType::from_u8(byte).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Unknown frame type: 0x{:02X}", byte),
        )
    })
}

fn check_payload_len(payload_len: usize) -> io::Result<()> {
    if payload_len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Frame payload too large: {} bytes (max: {})",
                payload_len, MAX_FRAME_SIZE
            ),
        ));
    }
    Ok(())
}

/// Frame decoder for streaming use
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    /// Create a new frame codec
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Feed data into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame
    pub fn decode_next(&mut self) -> io::Result<Option<Frame>> {
        Frame::decode(&mut self.buffer)
    }

    /// Get the current buffer length
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_roundtrip() {
        let types = [
            FrameType::Join,
            FrameType::Ping,
            FrameType::SendMessage,
            FrameType::HistoryQuery,
            FrameType::RoomsInfo,
            FrameType::Notification,
            FrameType::UserOffline,
            FrameType::HealthStatus,
            FrameType::Error,
        ];

        for frame_type in types {
            let byte = frame_type as u8;
            assert_eq!(FrameType::from_u8(byte), Some(frame_type));
        }
    }

    #[test]
    fn test_frame_codec_streaming() {
        let mut codec = FrameCodec::new();

        let frame1 = Frame::new(FrameType::Ping, &b"{\"timestamp\":1}"[..]);
        let frame2 = Frame::new(FrameType::Pong, &b"{\"timestamp\":2}"[..]);

        let mut data = BytesMut::new();
        frame1.encode(&mut data);
        frame2.encode(&mut data);

        // Header not complete yet
        codec.feed(&data[..3]);
        assert!(codec.decode_next().unwrap().is_none());

        // Header complete, payload partial
        codec.feed(&data[3..10]);
        assert!(codec.decode_next().unwrap().is_none());

        codec.feed(&data[10..]);
        assert_eq!(codec.decode_next().unwrap().unwrap(), frame1);
        assert_eq!(codec.decode_next().unwrap().unwrap(), frame2);
        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut data = BytesMut::new();
        data.put_u8(0xFE);
        data.put_u32(0);

        assert!(Frame::decode_complete(&data).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let mut data = BytesMut::new();
        data.put_u8(FrameType::ShareFile as u8);
        data.put_u32((MAX_FRAME_SIZE + 1) as u32);

        // Rejected from the header alone, before the payload arrives
        assert!(Frame::decode(&mut data).is_err());
        assert!(Frame::decode_complete(&data).is_err());
    }

    #[test]
    fn test_frame_at_limit_waits_for_payload() {
        let mut data = BytesMut::new();
        data.put_u8(FrameType::ShareFile as u8);
        data.put_u32(MAX_FRAME_SIZE as u32);

        assert!(Frame::decode(&mut data).unwrap().is_none());
    }
}
