//! Windows session-change notification codes.
//!
//! The values are plain integers so the table can be exercised on every
//! platform; the Windows adapter feeds the raw `wParam` of
//! `WM_WTSSESSION_CHANGE` straight into [`wts_lock_state`].

pub const WTS_CONSOLE_CONNECT: u32 = 0x1;
pub const WTS_CONSOLE_DISCONNECT: u32 = 0x2;
pub const WTS_REMOTE_CONNECT: u32 = 0x3;
pub const WTS_REMOTE_DISCONNECT: u32 = 0x4;
pub const WTS_SESSION_LOGON: u32 = 0x5;
pub const WTS_SESSION_LOGOFF: u32 = 0x6;
pub const WTS_SESSION_LOCK: u32 = 0x7;
pub const WTS_SESSION_UNLOCK: u32 = 0x8;
pub const WTS_SESSION_REMOTE_CONTROL: u32 = 0x9;
pub const WTS_SESSION_CREATE: u32 = 0xA;
pub const WTS_SESSION_TERMINATE: u32 = 0xB;

pub const WM_QUERYENDSESSION: u32 = 0x11;
pub const WM_WTSSESSION_CHANGE: u32 = 0x2B1;

/// `SessionFlags` values of `WTSINFOEX_LEVEL1_W`.
pub const WTS_SESSIONSTATE_LOCK: i32 = 0x0;
pub const WTS_SESSIONSTATE_UNLOCK: i32 = 0x1;
pub const WTS_SESSIONSTATE_UNKNOWN: i32 = -1;

/// Map a `WM_WTSSESSION_CHANGE` code to a lock state.
///
/// Returns `None` for codes that carry no lock semantics.
pub fn wts_lock_state(code: u32) -> Option<bool> {
    match code {
        WTS_CONSOLE_DISCONNECT | WTS_REMOTE_DISCONNECT | WTS_SESSION_LOCK | WTS_SESSION_LOGOFF => {
            Some(true)
        }
        WTS_CONSOLE_CONNECT | WTS_REMOTE_CONNECT | WTS_SESSION_UNLOCK | WTS_SESSION_LOGON => {
            Some(false)
        }
        _ => None,
    }
}

/// Map `WTSINFOEX_LEVEL1_W::SessionFlags` to a lock state.
pub fn session_flags_lock_state(flags: i32) -> Option<bool> {
    match flags {
        WTS_SESSIONSTATE_LOCK => Some(true),
        WTS_SESSIONSTATE_UNLOCK => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_codes() {
        for code in [
            WTS_CONSOLE_DISCONNECT,
            WTS_REMOTE_DISCONNECT,
            WTS_SESSION_LOCK,
            WTS_SESSION_LOGOFF,
        ] {
            assert_eq!(wts_lock_state(code), Some(true), "code {code:#x}");
        }
    }

    #[test]
    fn test_unlock_codes() {
        for code in [
            WTS_CONSOLE_CONNECT,
            WTS_REMOTE_CONNECT,
            WTS_SESSION_UNLOCK,
            WTS_SESSION_LOGON,
        ] {
            assert_eq!(wts_lock_state(code), Some(false), "code {code:#x}");
        }
    }

    #[test]
    fn test_irrelevant_codes_dropped() {
        for code in [
            WTS_SESSION_REMOTE_CONTROL,
            WTS_SESSION_CREATE,
            WTS_SESSION_TERMINATE,
            0,
            0xFF,
        ] {
            assert_eq!(wts_lock_state(code), None, "code {code:#x}");
        }
    }

    #[test]
    fn test_session_flags() {
        assert_eq!(session_flags_lock_state(WTS_SESSIONSTATE_LOCK), Some(true));
        assert_eq!(session_flags_lock_state(WTS_SESSIONSTATE_UNLOCK), Some(false));
        assert_eq!(session_flags_lock_state(WTS_SESSIONSTATE_UNKNOWN), None);
    }
}
