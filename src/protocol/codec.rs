//! Codec for encoding/decoding protocol messages to/from frames
//!
//! This module provides the bridge between typed messages and binary frames.

use super::frame::{Frame, FrameType};
use super::messages::*;
use crate::model::Notification;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Error as IoError, ErrorKind};

/// Trait for messages that can be encoded to frames
pub trait Encodable {
    /// Get the frame type for this message
    fn frame_type(&self) -> FrameType;

    /// Encode the message payload to bytes
    fn encode_payload(&self) -> io::Result<Bytes>;

    /// Encode the complete frame
    fn encode_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(self.frame_type(), self.encode_payload()?))
    }
}

/// Trait for messages that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected frame type for this message
    fn expected_frame_type() -> FrameType;

    /// Decode the message from a payload
    fn decode_payload(payload: &[u8]) -> io::Result<Self>;

    /// Decode from a complete frame, validating the frame type
    fn decode_frame(frame: &Frame) -> io::Result<Self> {
        if frame.frame_type != Self::expected_frame_type() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "Expected frame type {:?}, got {:?}",
                    Self::expected_frame_type(),
                    frame.frame_type
                ),
            ));
        }
        Self::decode_payload(&frame.payload)
    }
}

fn to_json<T: Serialize>(value: &T) -> io::Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, e))
}

fn from_json<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    serde_json::from_slice(payload).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
}

/// Helper macro to implement Encodable and Decodable for a message type
macro_rules! impl_codec {
    ($type:ty, $frame_type:expr) => {
        impl Encodable for $type {
            fn frame_type(&self) -> FrameType {
                $frame_type
            }

            fn encode_payload(&self) -> io::Result<Bytes> {
                to_json(self)
            }
        }

        impl Decodable for $type {
            fn expected_frame_type() -> FrameType {
                $frame_type
            }

            fn decode_payload(payload: &[u8]) -> io::Result<Self> {
                from_json(payload)
            }
        }
    };
}

// Session control
impl_codec!(Join, FrameType::Join);
impl_codec!(Reconnect, FrameType::Reconnect);
impl_codec!(Logout, FrameType::Logout);
impl_codec!(Ping, FrameType::Ping);
impl_codec!(Pong, FrameType::Pong);

// Chat commands
impl_codec!(JoinRoom, FrameType::JoinRoom);
impl_codec!(SetView, FrameType::SetView);
impl_codec!(SendMessage, FrameType::SendMessage);
impl_codec!(ShareFile, FrameType::ShareFile);

// Queries
impl_codec!(HistoryQuery, FrameType::HistoryQuery);
impl_codec!(RecentFiles, FrameType::RecentFiles);
impl_codec!(Health, FrameType::Health);

// Session state
impl_codec!(Joined, FrameType::Joined);
impl_codec!(Reconnected, FrameType::Reconnected);
impl_codec!(RoomsInfo, FrameType::RoomsInfo);
impl_codec!(UsersList, FrameType::UsersList);
impl_codec!(PreviousMessages, FrameType::PreviousMessages);
impl_codec!(RoomJoined, FrameType::RoomJoined);

// Deliveries
impl_codec!(Notification, FrameType::Notification);
impl_codec!(HealthStatus, FrameType::HealthStatus);

// Error message
impl_codec!(Error, FrameType::Error);

/// Frames a client may send, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Join(Join),
    Reconnect(Reconnect),
    Logout(Logout),
    Pong(Pong),
    JoinRoom(JoinRoom),
    SetView(SetView),
    SendMessage(SendMessage),
    ShareFile(ShareFile),
    HistoryQuery(HistoryQuery),
    RecentFiles(RecentFiles),
    Health(Health),
}

impl ClientFrame {
    /// Decode a frame into a typed client message
    pub fn decode(frame: &Frame) -> io::Result<Self> {
        let payload = &frame.payload;

        match frame.frame_type {
            FrameType::Join => Ok(Self::Join(from_json(payload)?)),
            FrameType::Reconnect => Ok(Self::Reconnect(from_json(payload)?)),
            FrameType::Logout => Ok(Self::Logout(from_json(payload)?)),
            FrameType::Pong => Ok(Self::Pong(from_json(payload)?)),
            FrameType::JoinRoom => Ok(Self::JoinRoom(from_json(payload)?)),
            FrameType::SetView => Ok(Self::SetView(from_json(payload)?)),
            FrameType::SendMessage => Ok(Self::SendMessage(from_json(payload)?)),
            FrameType::ShareFile => Ok(Self::ShareFile(from_json(payload)?)),
            FrameType::HistoryQuery => Ok(Self::HistoryQuery(from_json(payload)?)),
            FrameType::RecentFiles => Ok(Self::RecentFiles(from_json(payload)?)),
            FrameType::Health => Ok(Self::Health(from_json(payload)?)),
            other => Err(IoError::new(
                ErrorKind::InvalidData,
                format!("Frame type {:?} is not sent by clients", other),
            )),
        }
    }

    /// Get the frame type of this message
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Join(_) => FrameType::Join,
            Self::Reconnect(_) => FrameType::Reconnect,
            Self::Logout(_) => FrameType::Logout,
            Self::Pong(_) => FrameType::Pong,
            Self::JoinRoom(_) => FrameType::JoinRoom,
            Self::SetView(_) => FrameType::SetView,
            Self::SendMessage(_) => FrameType::SendMessage,
            Self::ShareFile(_) => FrameType::ShareFile,
            Self::HistoryQuery(_) => FrameType::HistoryQuery,
            Self::RecentFiles(_) => FrameType::RecentFiles,
            Self::Health(_) => FrameType::Health,
        }
    }

    /// Whether this frame needs an established session
    pub fn requires_session(&self) -> bool {
        !matches!(
            self,
            Self::Join(_)
                | Self::Reconnect(_)
                | Self::HistoryQuery(_)
                | Self::RecentFiles(_)
                | Self::Health(_)
        )
    }
}

/// Frames the server sends to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Joined(Joined),
    Reconnected(Reconnected),
    RoomsInfo(RoomsInfo),
    UsersList(UsersList),
    PreviousMessages(PreviousMessages),
    RoomJoined(RoomJoined),
    Ping(Ping),
    Message(Delivered),
    FileShared(Delivered),
    Notification(Notification),
    UserJoined(Presence),
    UserLeft(Presence),
    UserOffline(Presence),
    HistoryResult(HistoryResult),
    RecentFilesResult(HistoryResult),
    HealthStatus(HealthStatus),
    Error(Error),
}

impl ServerFrame {
    /// Wrap a routed message in the frame matching its kind
    pub fn delivery(delivered: Delivered) -> Self {
        if delivered.message.is_file() {
            Self::FileShared(delivered)
        } else {
            Self::Message(delivered)
        }
    }

    /// Get the frame type of this message
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Joined(_) => FrameType::Joined,
            Self::Reconnected(_) => FrameType::Reconnected,
            Self::RoomsInfo(_) => FrameType::RoomsInfo,
            Self::UsersList(_) => FrameType::UsersList,
            Self::PreviousMessages(_) => FrameType::PreviousMessages,
            Self::RoomJoined(_) => FrameType::RoomJoined,
            Self::Ping(_) => FrameType::Ping,
            Self::Message(_) => FrameType::Message,
            Self::FileShared(_) => FrameType::FileShared,
            Self::Notification(_) => FrameType::Notification,
            Self::UserJoined(_) => FrameType::UserJoined,
            Self::UserLeft(_) => FrameType::UserLeft,
            Self::UserOffline(_) => FrameType::UserOffline,
            Self::HistoryResult(_) => FrameType::HistoryResult,
            Self::RecentFilesResult(_) => FrameType::RecentFilesResult,
            Self::HealthStatus(_) => FrameType::HealthStatus,
            Self::Error(_) => FrameType::Error,
        }
    }

    /// Encode into a frame
    pub fn encode_frame(&self) -> io::Result<Frame> {
        let payload = match self {
            Self::Joined(m) => m.encode_payload()?,
            Self::Reconnected(m) => m.encode_payload()?,
            Self::RoomsInfo(m) => m.encode_payload()?,
            Self::UsersList(m) => m.encode_payload()?,
            Self::PreviousMessages(m) => m.encode_payload()?,
            Self::RoomJoined(m) => m.encode_payload()?,
            Self::Ping(m) => m.encode_payload()?,
            Self::Notification(m) => m.encode_payload()?,
            Self::HealthStatus(m) => m.encode_payload()?,
            Self::Error(m) => m.encode_payload()?,
            // Shared payload shapes, told apart by frame type
            Self::Message(m) | Self::FileShared(m) => to_json(m)?,
            Self::UserJoined(p) | Self::UserLeft(p) | Self::UserOffline(p) => to_json(p)?,
            Self::HistoryResult(h) | Self::RecentFilesResult(h) => to_json(h)?,
        };
        Ok(Frame::new(self.frame_type(), payload))
    }

    /// Decode a frame into a typed server message
    pub fn decode(frame: &Frame) -> io::Result<Self> {
        let payload = &frame.payload;

        match frame.frame_type {
            FrameType::Joined => Ok(Self::Joined(from_json(payload)?)),
            FrameType::Reconnected => Ok(Self::Reconnected(from_json(payload)?)),
            FrameType::RoomsInfo => Ok(Self::RoomsInfo(from_json(payload)?)),
            FrameType::UsersList => Ok(Self::UsersList(from_json(payload)?)),
            FrameType::PreviousMessages => Ok(Self::PreviousMessages(from_json(payload)?)),
            FrameType::RoomJoined => Ok(Self::RoomJoined(from_json(payload)?)),
            FrameType::Ping => Ok(Self::Ping(from_json(payload)?)),
            FrameType::Message => Ok(Self::Message(from_json(payload)?)),
            FrameType::FileShared => Ok(Self::FileShared(from_json(payload)?)),
            FrameType::Notification => Ok(Self::Notification(from_json(payload)?)),
            FrameType::UserJoined => Ok(Self::UserJoined(from_json(payload)?)),
            FrameType::UserLeft => Ok(Self::UserLeft(from_json(payload)?)),
            FrameType::UserOffline => Ok(Self::UserOffline(from_json(payload)?)),
            FrameType::HistoryResult => Ok(Self::HistoryResult(from_json(payload)?)),
            FrameType::RecentFilesResult => Ok(Self::RecentFilesResult(from_json(payload)?)),
            FrameType::HealthStatus => Ok(Self::HealthStatus(from_json(payload)?)),
            FrameType::Error => Ok(Self::Error(from_json(payload)?)),
            other => Err(IoError::new(
                ErrorKind::InvalidData,
                format!("Frame type {:?} is not sent by the server", other),
            )),
        }
    }
}

/// Encode a message directly to bytes (convenience function)
pub fn encode<T: Encodable>(msg: &T) -> io::Result<Bytes> {
    msg.encode_frame().map(|f| f.encode_to_bytes())
}

/// Decode a frame to a specific message type (convenience function)
pub fn decode<T: Decodable>(frame: &Frame) -> io::Result<T> {
    T::decode_frame(frame)
}
