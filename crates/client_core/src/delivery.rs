//! Per-message delivery lifecycle and read-receipt accumulation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

/// Outbound message lifecycle: sent -> delivered -> read, with `error`
/// reachable only from `sent` (a send that never made it out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Error,
}

impl DeliveryStatus {
    /// Applies a transition only if it moves the lifecycle forward.
    ///
    /// Returns true when the status actually changed. Late or duplicate
    /// events (a `delivered` for an already-`read` message, a repeated
    /// `read`) are no-ops, so callers can apply events unconditionally.
    pub fn advance(&mut self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::{Delivered, Error, Read, Sent};
        let allowed = matches!(
            (*self, next),
            (Sent, Delivered) | (Sent, Read) | (Delivered, Read) | (Sent, Error)
        );
        if allowed {
            *self = next;
        }
        allowed
    }
}

/// One user's read receipt for a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub user_id: UserId,
    pub username: Option<String>,
    pub seen_at: DateTime<Utc>,
}

/// Upserts a receipt into a message's seen-by set.
///
/// Unique by user: re-applying the same reader never duplicates the entry
/// and only moves `seen_at` forward. First-seen order is preserved.
pub fn record_seen(
    records: &mut Vec<SeenRecord>,
    user_id: UserId,
    username: Option<String>,
    seen_at: DateTime<Utc>,
) {
    if let Some(existing) = records.iter_mut().find(|record| record.user_id == user_id) {
        if seen_at > existing.seen_at {
            existing.seen_at = seen_at;
        }
        if existing.username.is_none() {
            existing.username = username;
        }
    } else {
        records.push(SeenRecord {
            user_id,
            username,
            seen_at,
        });
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
