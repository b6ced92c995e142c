//! Native session lock notifications.
//!
//! Platform implementations:
//! - Windows: WTS session notifications on a hidden top-level window (`windows.rs`)
//! - macOS: distributed and workspace notification centers (`macos.rs`)
//! - Linux: screensaver `ActiveChanged` signals over D-Bus (`linux.rs`)
//!
//! Each implementation provides a `Platform` (inspector + source factory) and
//! a `NativeSource` that owns its execution context for one subscription.

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
use crossbeam_channel::{select_biased, Receiver, Sender};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
use lockwatch_core::NativeNotice;
use lockwatch_core::{LockwatchError, LockwatchResult, NotifierConfig};

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "windows")]
pub use windows::{WindowsPlatform as NativePlatform, WtsSource as NativeSessionSource};

#[cfg(target_os = "macos")]
pub use macos::{MacPlatform as NativePlatform, WorkspaceSource as NativeSessionSource};

#[cfg(target_os = "linux")]
pub use linux::{LinuxPlatform as NativePlatform, ScreenSaverSource as NativeSessionSource};

/// Whether this build carries an adapter for the host OS.
pub const SUPPORTED: bool = cfg!(any(
    target_os = "windows",
    target_os = "macos",
    target_os = "linux"
));

/// The error returned on hosts without an adapter.
pub fn unsupported() -> LockwatchError {
    LockwatchError::UnsupportedPlatform(std::env::consts::OS.to_string())
}

/// Block until the relay takes `notice` or `stop` fires (a message or a
/// disconnect). Returns false once the caller should stop forwarding.
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub(crate) fn forward_notice(
    notices: &Sender<NativeNotice>,
    stop: &Receiver<()>,
    notice: NativeNotice,
) -> bool {
    select_biased! {
        recv(stop) -> _ => false,
        send(notices, notice) -> sent => sent.is_ok(),
    }
}

/// Build the host's platform from `config`.
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub fn native_platform(config: &NotifierConfig) -> LockwatchResult<NativePlatform> {
    config.validate()?;
    NativePlatform::new(config)
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
pub fn native_platform(config: &NotifierConfig) -> LockwatchResult<std::convert::Infallible> {
    config.validate()?;
    Err(unsupported())
}

#[cfg(all(test, any(target_os = "windows", target_os = "macos", target_os = "linux")))]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_forward_waits_for_room() {
        let (tx, rx) = bounded(1);
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        assert!(forward_notice(&tx, &stop_rx, NativeNotice::ScreenLocked));

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let first = rx.recv().unwrap();
            let second = rx.recv().unwrap();
            (first, second)
        });
        // Blocks until the consumer drains the first notice.
        assert!(forward_notice(&tx, &stop_rx, NativeNotice::ScreenUnlocked));
        assert_eq!(
            consumer.join().unwrap(),
            (NativeNotice::ScreenLocked, NativeNotice::ScreenUnlocked)
        );
    }

    #[test]
    fn test_forward_gives_up_on_stop() {
        let (tx, _rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        assert!(forward_notice(&tx, &stop_rx, NativeNotice::ScreenLocked));

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(stop_tx);
        });
        let start = Instant::now();
        assert!(!forward_notice(&tx, &stop_rx, NativeNotice::ScreenLocked));
        assert!(start.elapsed() < Duration::from_secs(2));
        stopper.join().unwrap();
    }

    #[test]
    fn test_forward_to_dropped_relay() {
        let (tx, rx) = bounded(1);
        let (_stop_tx, stop_rx) = bounded::<()>(0);
        drop(rx);
        assert!(!forward_notice(&tx, &stop_rx, NativeNotice::ScreenLocked));
    }
}
