//! Lock events and the native notices they are translated from.

use crate::codes::wts_lock_state;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// A session lock transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    /// Whether the session is locked after this transition.
    pub locked: bool,
    /// When the transition was observed (UTC).
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl LockEvent {
    pub fn new(locked: bool, timestamp: OffsetDateTime) -> Self {
        Self { locked, timestamp }
    }

    /// Build an event stamped with the current time.
    pub fn now(locked: bool) -> Self {
        Self::new(locked, OffsetDateTime::now_utc())
    }
}

/// A raw notification delivered by a platform adapter.
///
/// Adapters push these into the relay in the order the OS reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeNotice {
    /// `WM_WTSSESSION_CHANGE` with its `wParam` code.
    WtsSessionChange { code: u32 },
    /// `WM_QUERYENDSESSION`: logoff or shutdown is being queried.
    QueryEndSession,
    /// Screensaver `ActiveChanged` bus signal.
    ScreenSaverActive(bool),
    /// `com.apple.screenIsLocked`.
    ScreenLocked,
    /// `com.apple.screenIsUnlocked`.
    ScreenUnlocked,
    /// `NSWorkspaceSessionDidResignActiveNotification` (fast user switch away).
    SessionResignedActive,
    /// `NSWorkspaceSessionDidBecomeActiveNotification`.
    SessionBecameActive,
    /// A notification whose payload could not be decoded.
    Malformed(String),
}

impl NativeNotice {
    /// Translate to a lock state. `None` means the notice carries no lock
    /// semantics and must not produce an event.
    pub fn lock_state(&self) -> Option<bool> {
        match self {
            NativeNotice::WtsSessionChange { code } => {
                let state = wts_lock_state(*code);
                if state.is_none() {
                    debug!(code = *code, "ignoring session change code");
                }
                state
            }
            NativeNotice::QueryEndSession => {
                info!("Session end queried (logoff or shutdown)");
                None
            }
            NativeNotice::ScreenSaverActive(active) => Some(*active),
            NativeNotice::ScreenLocked | NativeNotice::SessionResignedActive => Some(true),
            NativeNotice::ScreenUnlocked | NativeNotice::SessionBecameActive => Some(false),
            NativeNotice::Malformed(reason) => {
                warn!(%reason, "dropping malformed notification");
                None
            }
        }
    }
}

/// Stamps events so timestamps never go backwards within one subscription.
#[derive(Debug, Default)]
pub struct EventClock {
    last: Option<OffsetDateTime>,
}

impl EventClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp an event with the current time, clamped to the previous stamp.
    pub fn stamp(&mut self, locked: bool) -> LockEvent {
        self.stamp_at(locked, OffsetDateTime::now_utc())
    }

    pub(crate) fn stamp_at(&mut self, locked: bool, now: OffsetDateTime) -> LockEvent {
        let timestamp = match self.last {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last = Some(timestamp);
        LockEvent::new(locked, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::{WTS_SESSION_LOCK, WTS_SESSION_UNLOCK};
    use time::macros::datetime;

    #[test]
    fn test_notice_translation() {
        assert_eq!(
            NativeNotice::WtsSessionChange { code: WTS_SESSION_LOCK }.lock_state(),
            Some(true)
        );
        assert_eq!(
            NativeNotice::WtsSessionChange { code: WTS_SESSION_UNLOCK }.lock_state(),
            Some(false)
        );
        assert_eq!(NativeNotice::QueryEndSession.lock_state(), None);
        assert_eq!(NativeNotice::ScreenSaverActive(true).lock_state(), Some(true));
        assert_eq!(NativeNotice::ScreenSaverActive(false).lock_state(), Some(false));
        assert_eq!(NativeNotice::ScreenLocked.lock_state(), Some(true));
        assert_eq!(NativeNotice::ScreenUnlocked.lock_state(), Some(false));
        assert_eq!(NativeNotice::SessionResignedActive.lock_state(), Some(true));
        assert_eq!(NativeNotice::SessionBecameActive.lock_state(), Some(false));
        assert_eq!(NativeNotice::Malformed("empty body".into()).lock_state(), None);
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let mut clock = EventClock::new();
        let first = clock.stamp_at(true, datetime!(2024-05-01 12:00:10 UTC));
        let second = clock.stamp_at(false, datetime!(2024-05-01 12:00:05 UTC));
        let third = clock.stamp_at(true, datetime!(2024-05-01 12:00:20 UTC));

        assert_eq!(second.timestamp, first.timestamp);
        assert!(third.timestamp > second.timestamp);
        assert!(!second.locked);
    }

    #[test]
    fn test_event_serializes_rfc3339() {
        let event = LockEvent::new(true, datetime!(2024-05-01 12:00:00 UTC));
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"locked":true,"timestamp":"2024-05-01T12:00:00Z"}"#);
    }
}
