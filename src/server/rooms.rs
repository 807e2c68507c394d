//! Room directory and permission checks
//!
//! The directory is built once at startup and shared read-only by the hub.

use std::collections::HashMap;

use crate::error::{ChatError, Result};
use crate::model::{Role, Room};

/// Immutable set of rooms, in configuration order
#[derive(Debug, Clone)]
pub struct RoomDirectory {
    rooms: Vec<Room>,
    index: HashMap<String, usize>,
    default_room: usize,
}

impl RoomDirectory {
    /// Build a directory, rejecting duplicate keys and posting roles that
    /// are not also allowed to view the room.
    pub fn new(rooms: Vec<Room>) -> Result<Self> {
        if rooms.is_empty() {
            return Err(ChatError::config("Room directory is empty"));
        }

        let mut index = HashMap::with_capacity(rooms.len());
        for (i, room) in rooms.iter().enumerate() {
            if index.insert(room.key.clone(), i).is_some() {
                return Err(ChatError::config(format!("Duplicate room key: {}", room.key)));
            }
            if let Some(posting) = &room.posting_roles {
                if let Some(role) = posting.iter().find(|r| !room.allowed_roles.contains(r)) {
                    return Err(ChatError::config(format!(
                        "Room {}: role {} may post but not view",
                        room.key, role
                    )));
                }
            }
        }

        // First room carrying system messages; the first room otherwise
        let default_room = rooms.iter().position(|r| r.system_messages).unwrap_or(0);

        Ok(Self {
            rooms,
            index,
            default_room,
        })
    }

    pub fn get(&self, key: &str) -> Result<&Room> {
        self.index
            .get(key)
            .map(|&i| &self.rooms[i])
            .ok_or_else(|| ChatError::room_not_found(key.to_string()))
    }

    /// Room a participant lands in on join; receives presence-joined
    pub fn default_room(&self) -> &Room {
        &self.rooms[self.default_room]
    }

    /// Look up a room the role may switch into
    pub fn check_join(&self, key: &str, role: Role) -> Result<&Room> {
        let room = self.get(key)?;
        if !room.can_join(role) {
            return Err(ChatError::permission_denied(format!(
                "{} cannot join {}",
                role, room.display_name
            )));
        }
        Ok(room)
    }

    /// Look up a room the role may post in
    pub fn check_post(&self, key: &str, role: Role) -> Result<&Room> {
        let room = self.get(key)?;
        if !room.can_post(role) {
            return Err(ChatError::permission_denied(format!(
                "Only {} can post in {}",
                room.posting_roles_label(),
                room.display_name
            )));
        }
        Ok(room)
    }

    /// Snapshot sent to clients as `roomsInfo`
    pub fn info(&self) -> Vec<Room> {
        self.rooms.clone()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        let rooms = vec![
            Room::open("general", "General").with_system_messages(),
            Room::open("assignments", "Assignments"),
            Room::open("announcements", "Announcements")
                .with_posting_roles(&[Role::Lecturer, Role::Admin]),
        ];
        let index = rooms
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key.clone(), i))
            .collect();

        Self {
            rooms,
            index,
            default_room: 0,
        }
    }
}
