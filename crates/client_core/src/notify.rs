//! Seam to the platform notification layer. The core decides *whether* to
//! notify and hands off *what*; sound, vibration and OS APIs live behind
//! the trait.

use async_trait::async_trait;
use shared::{
    domain::{ChatId, MessageType, UserId},
    protocol::MessagePayload,
};

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPayload {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_username: Option<String>,
    pub preview: String,
    pub message_type: MessageType,
}

impl NotificationPayload {
    pub fn from_message(message: &MessagePayload) -> Self {
        Self {
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            sender_username: message.sender_username.clone(),
            preview: message.content.clone(),
            message_type: message.message_type,
        }
    }
}

#[async_trait]
pub trait NotificationBridge: Send + Sync {
    async fn notify(&self, notification: NotificationPayload);
}

pub struct NoopNotificationBridge;

#[async_trait]
impl NotificationBridge for NoopNotificationBridge {
    async fn notify(&self, _notification: NotificationPayload) {}
}

/// Notify only for someone else's message in a chat the user is not
/// currently looking at.
pub fn should_notify(
    message: &MessagePayload,
    self_user: UserId,
    focused_chat: Option<ChatId>,
) -> bool {
    message.sender_id != self_user && focused_chat != Some(message.chat_id)
}
