//! Subscription façade: state machine + relay thread.
//!
//! Every call to [`Notifier::subscribe`] builds a fresh [`NativeSource`] from
//! the platform, so overlapping subscriptions never share native handles.
//! The relay thread owns that source for its whole life:
//!
//! 1. start the source (errors are handed back to `subscribe`);
//! 2. emit the current state once;
//! 3. translate notices into [`LockEvent`]s until the token is cancelled,
//!    re-acquiring the source if its notice channel closes on its own;
//! 4. stop the source, drop the output sender, report `Stopped`.

use crate::cancel::CancelToken;
use crate::config::NotifierConfig;
use crate::error::{LockwatchError, LockwatchResult};
use crate::event::{EventClock, LockEvent, NativeNotice};
use crossbeam_channel::{bounded, select_biased, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Capacity of the channel between a native callback context and the relay.
pub const NOTICE_QUEUE: usize = 256;

/// Wait before the first attempt to replace a lost source; doubles per
/// failed attempt up to [`RESTART_BACKOFF_MAX`].
pub const RESTART_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Synchronous session queries.
pub trait SessionInspector: Send + Sync {
    /// Whether the current session is locked right now.
    fn check_lock_state(&self) -> LockwatchResult<bool>;

    /// Whether the current session is accessed remotely (`true` = remote).
    fn is_remote_session(&self) -> LockwatchResult<bool>;
}

/// A native notification mechanism owned by exactly one subscription.
pub trait NativeSource: Send + 'static {
    /// Acquire native resources and begin pushing notices into `notices`.
    ///
    /// Must return only after the resources are in place, so a failure here
    /// is reported to the subscriber.
    fn start(&mut self, notices: Sender<NativeNotice>) -> LockwatchResult<()>;

    /// Unblock the native wait and release every resource.
    ///
    /// Called once, from the relay thread, after `start` succeeded. Also
    /// called when the source closed its notice channel on its own, before
    /// a replacement is built.
    fn stop(&mut self) -> LockwatchResult<()>;
}

/// A host platform: a session inspector plus a factory of native sources.
pub trait Platform: SessionInspector + 'static {
    type Source: NativeSource;

    fn name(&self) -> &'static str;

    /// Build a new, not yet started, source.
    fn new_source(&self, config: &NotifierConfig) -> LockwatchResult<Self::Source>;
}

/// Subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    Idle,
    /// Acquiring native resources and querying the initial state.
    Starting,
    /// Relaying native notices.
    Running,
    /// Releasing native resources.
    Stopping,
    /// Terminal; nothing is written to the output channel any more.
    Stopped,
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Build an output channel with the configured capacity.
pub fn lock_channel(config: &NotifierConfig) -> (Sender<LockEvent>, Receiver<LockEvent>) {
    bounded(config.buffer.max(1))
}

/// Public entry point: one notifier per platform, any number of
/// subscriptions.
pub struct Notifier<P: Platform> {
    platform: Arc<P>,
    config: NotifierConfig,
}

impl<P: Platform> Notifier<P> {
    pub fn new(platform: P, config: NotifierConfig) -> Self {
        Self {
            platform: Arc::new(platform),
            config,
        }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn check_lock_state(&self) -> LockwatchResult<bool> {
        self.platform.check_lock_state()
    }

    pub fn is_remote_session(&self) -> LockwatchResult<bool> {
        self.platform.is_remote_session()
    }

    /// Start relaying lock events into `output` until `token` is cancelled.
    ///
    /// The output channel should be bounded (see [`lock_channel`]); when it
    /// is full the relay waits for the consumer instead of dropping events.
    /// Returns `ResourceAcquisitionFailed` (or the platform's own error) when
    /// the native mechanism cannot be established; in that case no event is
    /// ever written.
    pub fn subscribe(
        &self,
        token: CancelToken,
        output: Sender<LockEvent>,
    ) -> LockwatchResult<Subscription> {
        let state = Arc::new(Mutex::new(SubscriptionState::Idle));
        transition(&state, SubscriptionState::Starting);

        let (ready_tx, ready_rx) = bounded::<LockwatchResult<()>>(1);
        let relay = Relay {
            platform: self.platform.clone(),
            config: self.config.clone(),
            token: token.clone(),
            output,
            state: state.clone(),
            clock: EventClock::new(),
        };

        let spawned = thread::Builder::new()
            .name(format!("lockwatch-{}", self.platform.name()))
            .spawn(move || relay.run(ready_tx));
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                transition(&state, SubscriptionState::Stopped);
                return Err(LockwatchError::ResourceAcquisitionFailed(format!(
                    "failed to spawn relay thread: {e}"
                )));
            }
        };

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(LockwatchError::ResourceAcquisitionFailed(
                "relay thread exited during startup".to_string(),
            ))
        });

        match started {
            Ok(()) => {
                info!(platform = self.platform.name(), "Subscription started");
                Ok(Subscription {
                    token,
                    state,
                    thread: Some(thread),
                })
            }
            Err(e) => {
                let _ = thread.join();
                transition(&state, SubscriptionState::Stopped);
                Err(e)
            }
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does not end the subscription; cancel its token.
#[must_use = "dropping the handle detaches the relay thread; keep it to join on shutdown"]
pub struct Subscription {
    token: CancelToken,
    state: Arc<Mutex<SubscriptionState>>,
    thread: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        current(&self.state)
    }

    /// Check if the relay thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the token this subscription was created with.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait until the subscription reaches `Stopped`.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Relay thread panicked");
                transition(&self.state, SubscriptionState::Stopped);
            }
        }
    }
}

struct Relay<P: Platform> {
    platform: Arc<P>,
    config: NotifierConfig,
    token: CancelToken,
    output: Sender<LockEvent>,
    state: Arc<Mutex<SubscriptionState>>,
    clock: EventClock,
}

/// Why the translate loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    ConsumerGone,
    SourceLost,
}

impl<P: Platform> Relay<P> {
    fn run(mut self, ready_tx: Sender<LockwatchResult<()>>) {
        let platform = self.platform.name();
        info!(platform, "Relay thread started");

        let (notice_tx, mut notice_rx) = bounded(NOTICE_QUEUE);
        let mut source = match self.start_source(notice_tx) {
            Ok(source) => Some(source),
            Err(e) => {
                error!(platform, error = %e, "Failed to start native source");
                transition(&self.state, SubscriptionState::Stopped);
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));

        let mut open = true;
        if self.config.emit_initial_state {
            match self.platform.check_lock_state() {
                Ok(locked) => {
                    let event = self.clock.stamp(locked);
                    debug!(locked, "emitting initial state");
                    open = self.emit(event);
                }
                Err(e) => warn!(platform, error = %e, "Initial state unavailable, skipping"),
            }
        }

        if open {
            transition(&self.state, SubscriptionState::Running);
            while self.relay_loop(&notice_rx) == LoopExit::SourceLost {
                match self.restart(&mut source) {
                    Some(fresh) => notice_rx = fresh,
                    None => break,
                }
            }
        }

        transition(&self.state, SubscriptionState::Stopping);
        if let Some(mut source) = source.take() {
            if let Err(e) = source.stop() {
                error!(platform, error = %e, "Failed to release native source");
            }
        }
        drop(notice_rx);
        drop(self.output);
        transition(&self.state, SubscriptionState::Stopped);
        info!(platform, "Relay thread exiting");
    }

    fn start_source(&self, notices: Sender<NativeNotice>) -> LockwatchResult<P::Source> {
        let mut source = self.platform.new_source(&self.config)?;
        source.start(notices)?;
        Ok(source)
    }

    /// Replace a source whose notice channel closed without cancellation.
    ///
    /// Retries with a doubling backoff; returns `None` once the token is
    /// cancelled, leaving `source` empty.
    fn restart(&self, source: &mut Option<P::Source>) -> Option<Receiver<NativeNotice>> {
        let platform = self.platform.name();
        if let Some(mut lost) = source.take() {
            if let Err(e) = lost.stop() {
                error!(platform, error = %e, "Failed to release lost native source");
            }
        }

        let mut backoff = RESTART_BACKOFF_MIN;
        loop {
            if self.token.wait_timeout(backoff) {
                return None;
            }
            let (notice_tx, notice_rx) = bounded(NOTICE_QUEUE);
            match self.start_source(notice_tx) {
                Ok(fresh) => {
                    info!(platform, "Native source re-acquired");
                    *source = Some(fresh);
                    return Some(notice_rx);
                }
                Err(e) => {
                    backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
                    warn!(platform, error = %e, retry_in = ?backoff, "Failed to re-acquire native source");
                }
            }
        }
    }

    fn relay_loop(&mut self, notices: &Receiver<NativeNotice>) -> LoopExit {
        let cancelled = self.token.cancelled().clone();
        loop {
            select_biased! {
                recv(cancelled) -> _ => {
                    info!("Subscription cancelled");
                    return LoopExit::Cancelled;
                }
                recv(notices) -> notice => match notice {
                    Ok(notice) => {
                        let Some(locked) = notice.lock_state() else {
                            continue;
                        };
                        let event = self.clock.stamp(locked);
                        debug!(?notice, locked, "relaying lock event");
                        if !self.emit(event) {
                            return if self.token.is_cancelled() {
                                LoopExit::Cancelled
                            } else {
                                LoopExit::ConsumerGone
                            };
                        }
                    }
                    Err(_) => {
                        warn!("Native source disconnected, re-acquiring");
                        return LoopExit::SourceLost;
                    }
                },
            }
        }
    }

    /// Block until the consumer accepts `event` or the scope ends.
    /// Returns false if relaying must stop. Cancellation wins over a send
    /// that becomes possible at the same moment.
    fn emit(&self, event: LockEvent) -> bool {
        select_biased! {
            recv(self.token.cancelled()) -> _ => false,
            send(self.output, event) -> sent => {
                if sent.is_err() {
                    warn!("Lock event receiver dropped, stopping subscription");
                }
                sent.is_ok()
            }
        }
    }
}

fn current(state: &Mutex<SubscriptionState>) -> SubscriptionState {
    *state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn transition(state: &Mutex<SubscriptionState>, new: SubscriptionState) {
    let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let old = *guard;
    if old != new {
        *guard = new;
        debug!(?old, ?new, "subscription state transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedPlatform;

    fn relay(output: Sender<LockEvent>, token: CancelToken) -> Relay<ScriptedPlatform> {
        Relay {
            platform: Arc::new(ScriptedPlatform::new()),
            config: NotifierConfig::default(),
            token,
            output,
            state: Arc::new(Mutex::new(SubscriptionState::Running)),
            clock: EventClock::new(),
        }
    }

    #[test]
    fn test_emit_after_cancel_writes_nothing() {
        let (tx, rx) = bounded(64);
        let token = CancelToken::new();
        let relay = relay(tx, token.clone());

        assert!(relay.emit(LockEvent::now(true)));
        token.cancel();
        // Room in the channel and a cancelled token: cancellation must win
        // every time.
        for _ in 0..32 {
            assert!(!relay.emit(LockEvent::now(false)));
        }
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_restart_gives_up_when_cancelled() {
        let (tx, _rx) = bounded(1);
        let token = CancelToken::new();
        let relay = relay(tx, token.clone());
        relay.platform.fail_start("bus gone");
        token.cancel();

        let mut source = None;
        assert!(relay.restart(&mut source).is_none());
        assert!(source.is_none());
        assert_eq!(relay.platform.started_sources(), 0);
    }
}
