//! lockwatch-platform: native session lock notifications for lockwatch.
//!
//! This crate provides:
//! - A `Platform` implementation per OS (Windows WTS, Linux screensaver
//!   D-Bus signals, macOS notification centers)
//! - Free functions that run against the host's platform with
//!   `NotifierConfig::from_env()`
//!
//! ## Module Structure
//!
//! - `error` - Native failure types
//! - `session` - Session notification sources and inspectors

mod error;
mod session;

pub use error::{PlatformError, PlatformResult};
pub use session::{native_platform, unsupported, SUPPORTED};

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use session::{NativePlatform, NativeSessionSource};

use crossbeam_channel::Sender;
use lockwatch_core::{CancelToken, LockEvent, LockwatchResult, NotifierConfig, Subscription};

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
use lockwatch_core::{Notifier, SessionInspector};

/// A notifier over the host's platform.
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub fn notifier(config: NotifierConfig) -> LockwatchResult<Notifier<NativePlatform>> {
    let platform = native_platform(&config)?;
    Ok(Notifier::new(platform, config))
}

/// Relay lock events into `output` until `token` is cancelled, using `config`.
pub fn subscribe_with(
    config: NotifierConfig,
    token: CancelToken,
    output: Sender<LockEvent>,
) -> LockwatchResult<Subscription> {
    let platform = native_platform(&config)?;
    #[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
    {
        Notifier::new(platform, config).subscribe(token, output)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        let _ = (token, output);
        match platform {}
    }
}

/// Relay lock events into `output` until `token` is cancelled.
pub fn subscribe(token: CancelToken, output: Sender<LockEvent>) -> LockwatchResult<Subscription> {
    subscribe_with(NotifierConfig::from_env()?, token, output)
}

/// Whether the current session is locked right now.
pub fn check_lock_state() -> LockwatchResult<bool> {
    check_lock_state_with(&NotifierConfig::from_env()?)
}

pub fn check_lock_state_with(config: &NotifierConfig) -> LockwatchResult<bool> {
    let platform = native_platform(config)?;
    #[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
    {
        platform.check_lock_state()
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        match platform {}
    }
}

/// Whether the current session is accessed remotely (`true` = remote).
pub fn is_remote_session() -> LockwatchResult<bool> {
    is_remote_session_with(&NotifierConfig::from_env()?)
}

pub fn is_remote_session_with(config: &NotifierConfig) -> LockwatchResult<bool> {
    let platform = native_platform(config)?;
    #[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
    {
        platform.is_remote_session()
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        match platform {}
    }
}
