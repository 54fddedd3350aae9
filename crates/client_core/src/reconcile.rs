//! Merges the three message sources (optimistic insert, REST ack,
//! gateway broadcast) into one canonical per-chat ordered list.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, MessageId, MessageType, UserId},
    protocol::{AttachmentPayload, MessagePayload},
};

use crate::delivery::{record_seen, DeliveryStatus, SeenRecord};

/// Client-side canonical view of a message.
///
/// `id` is the server-assigned identity once known; `client_ref` is the
/// locally-assigned correlation key that exists from the optimistic insert
/// onward. Exactly one live entry exists per logical message per chat.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Option<MessageId>,
    pub client_ref: Option<String>,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub sender_username: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub attachment: Option<AttachmentPayload>,
    pub reply_to: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub seen_by: Vec<SeenRecord>,
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    fn from_payload(payload: MessagePayload) -> Self {
        let mut seen_by = Vec::new();
        for receipt in payload.seen_by {
            record_seen(&mut seen_by, receipt.user_id, receipt.username, receipt.seen_at);
        }
        Self {
            id: Some(payload.message_id),
            client_ref: payload.client_ref,
            chat_id: payload.chat_id,
            sender_id: payload.sender_id,
            sender_username: payload.sender_username,
            content: payload.content,
            message_type: payload.message_type,
            attachment: payload.attachment,
            reply_to: payload.reply_to,
            sent_at: payload.sent_at,
            status: DeliveryStatus::Sent,
            seen_by,
            reactions: BTreeMap::new(),
            edited: payload.edited,
            edited_at: payload.edited_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
}

/// In-memory store of per-chat message lists. Holds no durable state; the
/// REST backend owns persistence, this owns reconciliation.
#[derive(Debug, Default)]
pub struct ChatStore {
    chats: HashMap<ChatId, Vec<Message>>,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical ordered list for a chat, timestamp-ascending.
    pub fn messages(&self, chat_id: ChatId) -> &[Message] {
        self.chats.get(&chat_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find_by_client_ref(&self, chat_id: ChatId, client_ref: &str) -> Option<&Message> {
        self.messages(chat_id)
            .iter()
            .find(|message| message.client_ref.as_deref() == Some(client_ref))
    }

    /// Adds a locally-originated message before any server confirmation.
    pub fn insert_optimistic(&mut self, message: Message) {
        let list = self.chats.entry(message.chat_id).or_default();
        list.push(message);
        sort_by_timestamp(list);
    }

    /// Replaces the optimistic entry with the authoritative REST response.
    ///
    /// If the gateway echo already landed and was matched (by id or
    /// `client_ref`), the ack upgrades that entry instead of inserting a
    /// second copy. REST is authoritative even when the socket never
    /// confirms the send.
    pub fn reconcile_ack(&mut self, client_ref: &str, payload: MessagePayload, self_user: UserId) {
        let list = self.chats.entry(payload.chat_id).or_default();
        let position = list
            .iter()
            .position(|m| m.client_ref.as_deref() == Some(client_ref))
            .or_else(|| list.iter().position(|m| m.id == Some(payload.message_id)));
        match position {
            Some(index) => apply_authoritative(&mut list[index], payload, self_user),
            None => {
                let mut message = Message::from_payload(payload);
                if message.client_ref.is_none() {
                    message.client_ref = Some(client_ref.to_string());
                }
                upgrade_own_status(&mut message, self_user);
                list.push(message);
            }
        }
        sort_by_timestamp(list);
    }

    /// Inserts or updates a message arriving from the gateway or a REST
    /// history fetch.
    ///
    /// Duplicate detection, in order: server id, correlation id, then the
    /// sender+timestamp+content heuristic that covers the race where the
    /// broadcast of one's own just-sent message beats the REST response.
    /// On a duplicate the existing entry is kept and upgraded.
    pub fn merge_inbound(&mut self, payload: MessagePayload, self_user: UserId) -> MergeOutcome {
        let list = self.chats.entry(payload.chat_id).or_default();
        let position = list
            .iter()
            .position(|m| m.id == Some(payload.message_id))
            .or_else(|| {
                payload.client_ref.as_deref().and_then(|client_ref| {
                    list.iter()
                        .position(|m| m.client_ref.as_deref() == Some(client_ref))
                })
            })
            .or_else(|| {
                list.iter().position(|m| {
                    m.id.is_none()
                        && m.sender_id == payload.sender_id
                        && m.sent_at == payload.sent_at
                        && m.content == payload.content
                })
            });
        let outcome = match position {
            Some(index) => {
                apply_authoritative(&mut list[index], payload, self_user);
                MergeOutcome::Updated
            }
            None => {
                let mut message = Message::from_payload(payload);
                upgrade_own_status(&mut message, self_user);
                list.push(message);
                MergeOutcome::Inserted
            }
        };
        sort_by_timestamp(list);
        outcome
    }

    /// Marks an optimistic entry as failed. The entry stays in the list so
    /// the caller can offer a resend.
    pub fn mark_send_failed(&mut self, client_ref: &str) -> bool {
        for list in self.chats.values_mut() {
            if let Some(message) = list
                .iter_mut()
                .find(|m| m.client_ref.as_deref() == Some(client_ref))
            {
                return message.status.advance(DeliveryStatus::Error);
            }
        }
        false
    }

    /// Removes a failed entry so it can be resent as a fresh message.
    /// Only `error` entries are removable; a confirmed message stays put.
    pub fn take_failed(&mut self, chat_id: ChatId, client_ref: &str) -> Option<Message> {
        let list = self.chats.get_mut(&chat_id)?;
        let index = list.iter().position(|m| {
            m.client_ref.as_deref() == Some(client_ref) && m.status == DeliveryStatus::Error
        })?;
        Some(list.remove(index))
    }

    /// A `messages_delivered` event: every own `sent` message in the chat
    /// moves to `delivered`. Returns how many entries changed.
    pub fn apply_delivered(&mut self, chat_id: ChatId, self_user: UserId) -> usize {
        let Some(list) = self.chats.get_mut(&chat_id) else {
            return 0;
        };
        let mut changed = 0;
        for message in list
            .iter_mut()
            .filter(|m| m.sender_id == self_user && m.id.is_some())
        {
            if message.status.advance(DeliveryStatus::Delivered) {
                changed += 1;
            }
        }
        changed
    }

    /// A `messages_read` event: own messages move to `read` and the acting
    /// user is appended to each message's seen-by set (idempotently).
    pub fn apply_read(
        &mut self,
        chat_id: ChatId,
        reader: UserId,
        username: Option<String>,
        seen_at: DateTime<Utc>,
        self_user: UserId,
    ) -> usize {
        let Some(list) = self.chats.get_mut(&chat_id) else {
            return 0;
        };
        let mut changed = 0;
        for message in list
            .iter_mut()
            .filter(|m| m.sender_id == self_user && m.id.is_some())
        {
            if message.status == DeliveryStatus::Error {
                continue;
            }
            if message.status.advance(DeliveryStatus::Read) {
                changed += 1;
            }
            record_seen(&mut message.seen_by, reader, username.clone(), seen_at);
        }
        changed
    }

    /// Records a reaction. Re-applying the same (emoji, user) is a no-op.
    pub fn apply_reaction(
        &mut self,
        chat_id: ChatId,
        message_id: MessageId,
        emoji: &str,
        user_id: UserId,
    ) -> bool {
        let Some(list) = self.chats.get_mut(&chat_id) else {
            return false;
        };
        let Some(message) = list.iter_mut().find(|m| m.id == Some(message_id)) else {
            return false;
        };
        message
            .reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(user_id)
    }

    pub fn clear(&mut self) {
        self.chats.clear();
    }
}

fn apply_authoritative(existing: &mut Message, payload: MessagePayload, self_user: UserId) {
    existing.id = Some(payload.message_id);
    if existing.client_ref.is_none() {
        existing.client_ref = payload.client_ref;
    }
    if existing.sender_username.is_none() {
        existing.sender_username = payload.sender_username;
    }
    existing.content = payload.content;
    existing.message_type = payload.message_type;
    existing.attachment = payload.attachment;
    existing.reply_to = payload.reply_to;
    // Server time is the origin of truth once known.
    existing.sent_at = payload.sent_at;
    existing.edited = payload.edited;
    existing.edited_at = payload.edited_at;
    for receipt in payload.seen_by {
        record_seen(
            &mut existing.seen_by,
            receipt.user_id,
            receipt.username,
            receipt.seen_at,
        );
    }
    upgrade_own_status(existing, self_user);
}

// History fetches carry accumulated receipts; an own message with any
// receipt has necessarily been read.
fn upgrade_own_status(message: &mut Message, self_user: UserId) {
    if message.sender_id == self_user && !message.seen_by.is_empty() {
        message.status.advance(DeliveryStatus::Read);
    }
}

// Stable sort: equal timestamps keep arrival order, so a merge never
// visually reorders ties.
fn sort_by_timestamp(list: &mut [Message]) {
    list.sort_by_key(|message| message.sent_at);
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
