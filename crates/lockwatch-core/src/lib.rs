//! lockwatch-core: lock event model + subscription relay.
//!
//! Design goal: keep this crate platform-agnostic.
//! Native notification mechanisms live in `lockwatch-platform`, which
//! implements the [`Platform`] trait for each OS.
//!
//! ## Module Structure
//!
//! - `event` - Lock events and native notices
//! - `codes` - Windows session-change code table
//! - `desktop` - Desktop environment to screensaver bus table
//! - `remote` - Remote access heuristics (environment, socket tables)
//! - `cancel` - Cancellation scope
//! - `config` - Notifier configuration
//! - `notifier` - Subscription façade and relay thread
//! - `scripted` - Caller-driven platform for tests

pub mod codes;
mod cancel;
mod config;
mod desktop;
mod error;
mod event;
mod notifier;
pub mod remote;
mod scripted;

pub use cancel::CancelToken;
pub use config::{
    NotifierConfig, ENV_BUFFER, ENV_DESKTOP, ENV_EMIT_INITIAL, ENV_QUERY_TIMEOUT_MS,
    ENV_STOP_TIMEOUT_MS,
};
pub use desktop::{DesktopEnvironment, ScreenSaverBus, DESKTOP_ENV_VAR};
pub use error::{LockwatchError, LockwatchResult};
pub use event::{EventClock, LockEvent, NativeNotice};
pub use notifier::{
    lock_channel, NativeSource, Notifier, Platform, SessionInspector, Subscription,
    SubscriptionState, NOTICE_QUEUE,
};
pub use scripted::{ScriptedPlatform, ScriptedSource};
