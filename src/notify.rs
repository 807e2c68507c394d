//! Notification rules shared by the server fan-out and the client reconciler

use uuid::Uuid;

use crate::model::{
    ChatMessage, MessageKind, MessageTarget, Notification, NotificationKind, ViewContext,
};

/// Default preview length in characters
pub const PREVIEW_CHARS: usize = 50;

/// First `max_chars` characters of `text`
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Whether a viewer with `view` should be alerted about `message`.
///
/// Broadcasts never notify. Room messages are suppressed for viewers of that
/// room, direct messages for viewers of the conversation with the sender.
pub fn should_notify(view: Option<&ViewContext>, message: &ChatMessage) -> bool {
    match (&message.target, view) {
        (MessageTarget::Broadcast, _) => false,
        (MessageTarget::Room { room }, Some(ViewContext::Room { room: viewing })) => {
            room != viewing
        }
        (MessageTarget::Direct { .. }, Some(ViewContext::Direct { peer_id, .. })) => {
            *peer_id != message.sender_id
        }
        _ => true,
    }
}

/// Client-side counterpart of [`should_notify`] for a received notification
pub fn should_show(view: Option<&ViewContext>, notification: &Notification) -> bool {
    match view {
        Some(ViewContext::Room { room }) => notification.room.as_deref() != Some(room.as_str()),
        Some(ViewContext::Direct { peer_id, .. }) => {
            notification.room.is_some() || notification.from_id != *peer_id
        }
        None => true,
    }
}

/// Build the notification `message` produces for a recipient looking at
/// `recipient_view`, if any.
pub fn derive(
    message: &ChatMessage,
    recipient_view: Option<&ViewContext>,
    preview_chars: usize,
) -> Option<Notification> {
    if !should_notify(recipient_view, message) {
        return None;
    }

    let (kind, room, target_session) = match (&message.target, message.kind) {
        (MessageTarget::Direct { recipient_id, .. }, MessageKind::Text) => {
            (NotificationKind::NewMessage, None, Some(recipient_id.clone()))
        }
        (MessageTarget::Direct { recipient_id, .. }, MessageKind::File) => {
            (NotificationKind::NewFile, None, Some(recipient_id.clone()))
        }
        (MessageTarget::Room { room }, MessageKind::Text) => {
            (NotificationKind::NewRoomMessage, Some(room.clone()), None)
        }
        (MessageTarget::Room { room }, MessageKind::File) => {
            (NotificationKind::NewRoomFile, Some(room.clone()), None)
        }
        (MessageTarget::Broadcast, _) => return None,
    };

    let (preview_text, file_name) = match &message.file {
        Some(file) => (None, Some(file.name.clone())),
        None => (Some(preview(&message.text, preview_chars)), None),
    };

    Some(Notification {
        id: Uuid::new_v4().to_string(),
        kind,
        from: message.sender_name.clone(),
        from_id: message.sender_id.clone(),
        preview: preview_text,
        file_name,
        room,
        target_session,
        message_id: message.message_id.clone(),
        timestamp: message.timestamp,
    })
}
