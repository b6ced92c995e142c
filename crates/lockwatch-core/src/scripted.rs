//! Scripted platform for tests.
//!
//! Notices are delivered by hand through [`ScriptedPlatform::deliver`]; the
//! reported lock state and failures are set by the caller.

use crate::config::NotifierConfig;
use crate::error::{LockwatchError, LockwatchResult};
use crate::event::NativeNotice;
use crate::notifier::{NativeSource, Platform, SessionInspector};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Default)]
struct Shared {
    locked: Mutex<Option<Result<bool, String>>>,
    remote: AtomicBool,
    start_failure: Mutex<Option<String>>,
    /// The only sender of the running source, tagged with its start number.
    current: Mutex<Option<(usize, Sender<NativeNotice>)>>,
    started: AtomicUsize,
    stopped: AtomicUsize,
}

/// A platform driven entirely by the caller. Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedPlatform {
    shared: Arc<Shared>,
}

impl ScriptedPlatform {
    /// A platform reporting an unlocked, local session.
    pub fn new() -> Self {
        let platform = Self::default();
        platform.set_locked(false);
        platform
    }

    pub fn set_locked(&self, locked: bool) {
        *lock(&self.shared.locked) = Some(Ok(locked));
    }

    /// Make `check_lock_state` fail with `InspectionUnavailable`.
    pub fn fail_inspection(&self, reason: impl Into<String>) {
        *lock(&self.shared.locked) = Some(Err(reason.into()));
    }

    pub fn set_remote(&self, remote: bool) {
        self.shared.remote.store(remote, Ordering::SeqCst);
    }

    /// Make the next sources fail to start with `ResourceAcquisitionFailed`.
    pub fn fail_start(&self, reason: impl Into<String>) {
        *lock(&self.shared.start_failure) = Some(reason.into());
    }

    /// Let sources start again after [`fail_start`](Self::fail_start).
    pub fn allow_start(&self) {
        lock(&self.shared.start_failure).take();
    }

    /// Push a notice into the most recently started source.
    ///
    /// Returns false when no source is running.
    pub fn deliver(&self, notice: NativeNotice) -> bool {
        let sender = lock(&self.shared.current)
            .as_ref()
            .map(|(_, tx)| tx.clone());
        match sender {
            Some(tx) => tx.send(notice).is_ok(),
            None => false,
        }
    }

    /// Drop the running source's sender, as a native source does when its
    /// connection goes away. Returns false when no source is running.
    pub fn disconnect(&self) -> bool {
        let dropped = lock(&self.shared.current).take();
        dropped.is_some()
    }

    /// Sources started and not yet stopped.
    pub fn active_sources(&self) -> usize {
        let started = self.shared.started.load(Ordering::SeqCst);
        let stopped = self.shared.stopped.load(Ordering::SeqCst);
        started.saturating_sub(stopped)
    }

    pub fn started_sources(&self) -> usize {
        self.shared.started.load(Ordering::SeqCst)
    }
}

impl SessionInspector for ScriptedPlatform {
    fn check_lock_state(&self) -> LockwatchResult<bool> {
        match lock(&self.shared.locked).clone() {
            Some(Ok(locked)) => Ok(locked),
            Some(Err(reason)) => Err(LockwatchError::InspectionUnavailable(reason)),
            None => Err(LockwatchError::InspectionUnavailable(
                "no scripted lock state".to_string(),
            )),
        }
    }

    fn is_remote_session(&self) -> LockwatchResult<bool> {
        Ok(self.shared.remote.load(Ordering::SeqCst))
    }
}

impl Platform for ScriptedPlatform {
    type Source = ScriptedSource;

    fn name(&self) -> &'static str {
        "scripted"
    }

    fn new_source(&self, _config: &NotifierConfig) -> LockwatchResult<Self::Source> {
        Ok(ScriptedSource {
            shared: self.shared.clone(),
            id: None,
        })
    }
}

/// Source half of [`ScriptedPlatform`].
pub struct ScriptedSource {
    shared: Arc<Shared>,
    id: Option<usize>,
}

impl NativeSource for ScriptedSource {
    fn start(&mut self, notices: Sender<NativeNotice>) -> LockwatchResult<()> {
        if let Some(reason) = lock(&self.shared.start_failure).clone() {
            return Err(LockwatchError::ResourceAcquisitionFailed(reason));
        }
        let id = self.shared.started.fetch_add(1, Ordering::SeqCst);
        *lock(&self.shared.current) = Some((id, notices));
        self.id = Some(id);
        debug!(id, "scripted source started");
        Ok(())
    }

    fn stop(&mut self) -> LockwatchResult<()> {
        if let Some(id) = self.id.take() {
            let mut current = lock(&self.shared.current);
            if current.as_ref().is_some_and(|(running, _)| *running == id) {
                current.take();
            }
            drop(current);
            self.shared.stopped.fetch_add(1, Ordering::SeqCst);
            debug!(id, "scripted source stopped");
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
