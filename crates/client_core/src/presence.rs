//! Typing debounce and remote presence aggregation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChatId, UserId},
    protocol::ClientFrame,
};

/// Quiet period for the local typing broadcast: one `typing:true` per
/// burst, `typing:false` after this much inactivity.
pub const TYPING_QUIET_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct LocalTyping {
    idle_deadline: Instant,
}

/// Time is injected (`Instant` arguments) so the debounce windows are
/// testable without sleeping; the owning client drives `poll_expired`
/// from a periodic tick.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    local_typing: HashMap<ChatId, LocalTyping>,
    remote_typing: HashMap<(ChatId, UserId), bool>,
    presence: HashMap<UserId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a local keystroke. Returns a `typing:true` frame for the
    /// first keystroke of a burst; keystrokes inside the quiet window only
    /// push the inactivity deadline out.
    pub fn note_local_typing(&mut self, chat_id: ChatId, now: Instant) -> Option<ClientFrame> {
        let deadline = now + TYPING_QUIET_PERIOD;
        match self.local_typing.get_mut(&chat_id) {
            Some(state) => {
                state.idle_deadline = deadline;
                None
            }
            None => {
                self.local_typing.insert(
                    chat_id,
                    LocalTyping {
                        idle_deadline: deadline,
                    },
                );
                Some(ClientFrame::Typing {
                    chat_id,
                    is_typing: true,
                })
            }
        }
    }

    /// Sending a message ends the typing burst immediately.
    pub fn note_message_sent(&mut self, chat_id: ChatId) -> Option<ClientFrame> {
        self.local_typing
            .remove(&chat_id)
            .map(|_| ClientFrame::Typing {
                chat_id,
                is_typing: false,
            })
    }

    /// Returns `typing:false` frames for every burst whose inactivity
    /// window has lapsed.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<ClientFrame> {
        let expired: Vec<ChatId> = self
            .local_typing
            .iter()
            .filter(|(_, state)| state.idle_deadline <= now)
            .map(|(chat_id, _)| *chat_id)
            .collect();
        for chat_id in &expired {
            self.local_typing.remove(chat_id);
        }
        expired
            .into_iter()
            .map(|chat_id| ClientFrame::Typing {
                chat_id,
                is_typing: false,
            })
            .collect()
    }

    /// Applies a remote typing event. There is deliberately no receiver-side
    /// expiry: the flag clears only when the sender's `typing:false`
    /// arrives, so a sender that disconnects mid-type leaves it stuck.
    /// Known limitation of the wire contract, not repaired here.
    pub fn apply_remote_typing(&mut self, chat_id: ChatId, user_id: UserId, is_typing: bool) {
        if is_typing {
            self.remote_typing.insert((chat_id, user_id), true);
        } else {
            self.remote_typing.remove(&(chat_id, user_id));
        }
    }

    pub fn is_typing(&self, chat_id: ChatId, user_id: UserId) -> bool {
        self.remote_typing
            .get(&(chat_id, user_id))
            .copied()
            .unwrap_or(false)
    }

    pub fn typing_users(&self, chat_id: ChatId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .remote_typing
            .keys()
            .filter(|(typing_chat, _)| *typing_chat == chat_id)
            .map(|(_, user_id)| *user_id)
            .collect();
        users.sort();
        users
    }

    pub fn apply_user_status(
        &mut self,
        user_id: UserId,
        is_online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) {
        let record = self.presence.entry(user_id).or_insert(PresenceRecord {
            is_online: false,
            last_seen: None,
        });
        record.is_online = is_online;
        if last_seen.is_some() {
            record.last_seen = last_seen;
        }
    }

    pub fn presence(&self, user_id: UserId) -> Option<&PresenceRecord> {
        self.presence.get(&user_id)
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.presence
            .get(&user_id)
            .map(|record| record.is_online)
            .unwrap_or(false)
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
