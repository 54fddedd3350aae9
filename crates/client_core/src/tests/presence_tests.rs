use std::time::Instant;

use chrono::Utc;

use super::*;

const CHAT: ChatId = ChatId(4);
const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

#[test]
fn first_keystroke_of_burst_emits_typing_true() {
    let now = Instant::now();
    let mut tracker = PresenceTracker::new();

    assert_eq!(
        tracker.note_local_typing(CHAT, now),
        Some(ClientFrame::Typing {
            chat_id: CHAT,
            is_typing: true,
        })
    );
    // Further keystrokes inside the window only extend the deadline.
    assert_eq!(
        tracker.note_local_typing(CHAT, now + Duration::from_millis(300)),
        None
    );
}

#[test]
fn quiet_period_emits_typing_false() {
    let now = Instant::now();
    let mut tracker = PresenceTracker::new();
    tracker.note_local_typing(CHAT, now);

    assert!(tracker
        .poll_expired(now + TYPING_QUIET_PERIOD - Duration::from_millis(1))
        .is_empty());
    let frames = tracker.poll_expired(now + TYPING_QUIET_PERIOD);
    assert_eq!(
        frames,
        vec![ClientFrame::Typing {
            chat_id: CHAT,
            is_typing: false,
        }]
    );
    // Burst over; nothing more to expire.
    assert!(tracker
        .poll_expired(now + TYPING_QUIET_PERIOD * 2)
        .is_empty());
}

#[test]
fn keystrokes_extend_the_quiet_window() {
    let now = Instant::now();
    let mut tracker = PresenceTracker::new();
    tracker.note_local_typing(CHAT, now);
    tracker.note_local_typing(CHAT, now + Duration::from_millis(800));

    assert!(tracker.poll_expired(now + TYPING_QUIET_PERIOD).is_empty());
    assert!(!tracker
        .poll_expired(now + Duration::from_millis(800) + TYPING_QUIET_PERIOD)
        .is_empty());
}

#[test]
fn sending_a_message_ends_the_burst_immediately() {
    let now = Instant::now();
    let mut tracker = PresenceTracker::new();
    tracker.note_local_typing(CHAT, now);

    assert_eq!(
        tracker.note_message_sent(CHAT),
        Some(ClientFrame::Typing {
            chat_id: CHAT,
            is_typing: false,
        })
    );
    // No burst active: nothing to end.
    assert_eq!(tracker.note_message_sent(CHAT), None);
    // A new keystroke starts a fresh burst.
    assert!(tracker.note_local_typing(CHAT, now).is_some());
}

#[test]
fn remote_typing_tracks_per_chat_and_user() {
    let mut tracker = PresenceTracker::new();
    tracker.apply_remote_typing(CHAT, ALICE, true);
    tracker.apply_remote_typing(CHAT, BOB, true);
    tracker.apply_remote_typing(ChatId(9), ALICE, true);

    assert_eq!(tracker.typing_users(CHAT), vec![ALICE, BOB]);
    tracker.apply_remote_typing(CHAT, ALICE, false);
    assert!(!tracker.is_typing(CHAT, ALICE));
    assert_eq!(tracker.typing_users(CHAT), vec![BOB]);
    assert!(tracker.is_typing(ChatId(9), ALICE));
}

#[test]
fn user_status_keeps_last_seen_when_event_omits_it() {
    let now = Utc::now();
    let mut tracker = PresenceTracker::new();
    tracker.apply_user_status(ALICE, false, Some(now));
    tracker.apply_user_status(ALICE, true, None);

    let record = tracker.presence(ALICE).unwrap();
    assert!(record.is_online);
    assert_eq!(record.last_seen, Some(now));
    assert!(!tracker.is_online(BOB));
}
