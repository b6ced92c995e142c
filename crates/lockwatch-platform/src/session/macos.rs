//! macOS implementation: notification-center observers.
//!
//! Screen lock arrives as the distributed notifications
//! `com.apple.screenIsLocked` / `com.apple.screenIsUnlocked`; fast user
//! switching arrives as `NSWorkspaceSessionDid{Resign,Become}ActiveNotification`
//! on the shared workspace's own center. Both are observed from a dedicated
//! thread that spins its CFRunLoop in short slices until stopped; observer
//! blocks run on a serial operation queue so notices keep their order.

use super::forward_notice;
use crate::error::{PlatformError, PlatformResult};
use block2::RcBlock;
use core_foundation::base::{CFType, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::{CFDictionary, CFDictionaryRef};
use core_foundation::runloop::{kCFRunLoopDefaultMode, CFRunLoop, CFRunLoopRunResult};
use core_foundation::string::CFString;
use crossbeam_channel::{bounded, Receiver, Sender};
use lockwatch_core::remote::remote_env_marker;
use lockwatch_core::{
    LockwatchResult, NativeNotice, NativeSource, NotifierConfig, Platform, SessionInspector,
};
use objc2::rc::Retained;
use objc2::runtime::{AnyObject, ProtocolObject};
use objc2_app_kit::{
    NSWorkspace, NSWorkspaceSessionDidBecomeActiveNotification,
    NSWorkspaceSessionDidResignActiveNotification,
};
use objc2_foundation::{
    NSDistributedNotificationCenter, NSNotification, NSNotificationCenter, NSObjectProtocol,
    NSOperationQueue, NSString,
};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const SCREEN_LOCKED: &str = "com.apple.screenIsLocked";
const SCREEN_UNLOCKED: &str = "com.apple.screenIsUnlocked";

const SESSION_SCREEN_IS_LOCKED: &str = "CGSSessionScreenIsLocked";
const SESSION_ON_CONSOLE: &str = "kCGSSessionOnConsoleKey";

/// Length of one run loop slice between stop-flag checks.
const RUN_SLICE: Duration = Duration::from_millis(100);

#[link(name = "CoreGraphics", kind = "framework")]
extern "C" {
    fn CGSessionCopyCurrentDictionary() -> CFDictionaryRef;
}

/// The current session dictionary, `None` when no window server session
/// exists (e.g. over plain SSH).
fn session_dictionary() -> Option<CFDictionary<CFString, CFType>> {
    let dict = unsafe { CGSessionCopyCurrentDictionary() };
    if dict.is_null() {
        return None;
    }
    Some(unsafe { CFDictionary::wrap_under_create_rule(dict) })
}

fn session_flag(dict: &CFDictionary<CFString, CFType>, key: &'static str) -> Option<bool> {
    let key = CFString::from_static_string(key);
    dict.find(&key)
        .and_then(|value| value.downcast::<CFBoolean>())
        .map(bool::from)
}

/// Notification-center backed platform.
pub struct MacPlatform {
    stop_timeout: Duration,
}

impl MacPlatform {
    pub fn new(config: &NotifierConfig) -> LockwatchResult<Self> {
        Ok(Self {
            stop_timeout: config.stop_timeout(),
        })
    }
}

impl SessionInspector for MacPlatform {
    fn check_lock_state(&self) -> LockwatchResult<bool> {
        let dict = session_dictionary().ok_or_else(|| {
            PlatformError::Native("CGSessionCopyCurrentDictionary returned null".to_string())
                .inspection()
        })?;
        // Absent while unlocked.
        Ok(session_flag(&dict, SESSION_SCREEN_IS_LOCKED).unwrap_or(false))
    }

    fn is_remote_session(&self) -> LockwatchResult<bool> {
        if let Some(marker) = remote_env_marker(|key| std::env::var(key).ok()) {
            debug!(marker, "remote session marker in environment");
            return Ok(true);
        }
        let dict = session_dictionary().ok_or_else(|| {
            PlatformError::Native("CGSessionCopyCurrentDictionary returned null".to_string())
                .inspection()
        })?;
        Ok(session_flag(&dict, SESSION_ON_CONSOLE) == Some(false))
    }
}

impl Platform for MacPlatform {
    type Source = WorkspaceSource;

    fn name(&self) -> &'static str {
        "macos"
    }

    fn new_source(&self, _config: &NotifierConfig) -> LockwatchResult<Self::Source> {
        Ok(WorkspaceSource::new(self.stop_timeout))
    }
}

/// Observers on both notification centers, owned by one run loop thread.
pub struct WorkspaceSource {
    stop_timeout: Duration,
    stop: Arc<AtomicBool>,
    // Dropped to release an observer block waiting on a full queue.
    halt: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkspaceSource {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            stop_timeout,
            stop: Arc::new(AtomicBool::new(false)),
            halt: None,
            thread: None,
        }
    }
}

impl NativeSource for WorkspaceSource {
    fn start(&mut self, notices: Sender<NativeNotice>) -> LockwatchResult<()> {
        let (ready_tx, ready_rx) = bounded::<PlatformResult<()>>(1);
        let stop = self.stop.clone();
        let (halt, halt_rx) = bounded(0);
        let thread = thread::Builder::new()
            .name("lockwatch-runloop".to_string())
            .spawn(move || run_observers(notices, halt_rx, stop, ready_tx))
            .map_err(|e| {
                PlatformError::Native(format!("failed to spawn run loop thread: {e}"))
                    .acquisition()
            })?;

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(PlatformError::Native(
                "run loop thread exited during startup".to_string(),
            ))
        });
        match started {
            Ok(()) => {
                self.halt = Some(halt);
                self.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                let _ = thread.join();
                Err(e.acquisition())
            }
        }
    }

    fn stop(&mut self) -> LockwatchResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        drop(self.halt.take());
        self.stop.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + self.stop_timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                return Err(
                    PlatformError::Timeout("run loop thread shutdown", self.stop_timeout)
                        .release(),
                );
            }
            thread::sleep(Duration::from_millis(10));
        }
        if thread.join().is_err() {
            error!("Run loop thread panicked");
        }
        Ok(())
    }
}

impl Drop for WorkspaceSource {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "Failed to stop run loop thread on drop");
            }
        }
    }
}

type Observer = Retained<ProtocolObject<dyn NSObjectProtocol>>;

/// Register a block forwarding `notice` for notifications named `name`,
/// run on `queue`. The block waits while the notice queue is full.
///
/// # Safety
/// `name` must be a valid notification name.
unsafe fn observe(
    center: &NSNotificationCenter,
    name: &NSString,
    queue: &NSOperationQueue,
    notices: &Sender<NativeNotice>,
    halt: &Receiver<()>,
    notice: NativeNotice,
) -> Observer {
    let tx = notices.clone();
    let halt = halt.clone();
    let block = RcBlock::new(move |_notification: NonNull<NSNotification>| {
        if !forward_notice(&tx, &halt, notice.clone()) {
            debug!(?notice, "notice not forwarded, source stopping");
        }
    });
    center.addObserverForName_object_queue_usingBlock(Some(name), None, Some(queue), &block)
}

fn run_observers(
    notices: Sender<NativeNotice>,
    halt: Receiver<()>,
    stop: Arc<AtomicBool>,
    ready_tx: Sender<PlatformResult<()>>,
) {
    info!("Run loop thread started");

    let (distributed, workspace, _queue, observers) = unsafe {
        let distributed = NSDistributedNotificationCenter::defaultCenter();
        let workspace = NSWorkspace::sharedWorkspace().notificationCenter();
        let queue = NSOperationQueue::new();
        queue.setMaxConcurrentOperationCount(1);

        let locked = NSString::from_str(SCREEN_LOCKED);
        let unlocked = NSString::from_str(SCREEN_UNLOCKED);
        let distributed_observers = vec![
            observe(
                &distributed,
                &locked,
                &queue,
                &notices,
                &halt,
                NativeNotice::ScreenLocked,
            ),
            observe(
                &distributed,
                &unlocked,
                &queue,
                &notices,
                &halt,
                NativeNotice::ScreenUnlocked,
            ),
        ];
        let workspace_observers = vec![
            observe(
                &workspace,
                NSWorkspaceSessionDidResignActiveNotification,
                &queue,
                &notices,
                &halt,
                NativeNotice::SessionResignedActive,
            ),
            observe(
                &workspace,
                NSWorkspaceSessionDidBecomeActiveNotification,
                &queue,
                &notices,
                &halt,
                NativeNotice::SessionBecameActive,
            ),
        ];
        (
            distributed,
            workspace,
            queue,
            (distributed_observers, workspace_observers),
        )
    };
    drop(notices);
    drop(halt);

    let _ = ready_tx.send(Ok(()));
    debug!("notification observers registered");

    while !stop.load(Ordering::SeqCst) {
        let mode = unsafe { kCFRunLoopDefaultMode };
        if let CFRunLoopRunResult::Finished = CFRunLoop::run_in_mode(mode, RUN_SLICE, false) {
            // No sources attached to this run loop yet.
            thread::sleep(RUN_SLICE);
        }
    }

    let (distributed_observers, workspace_observers) = observers;
    unsafe {
        for observer in &distributed_observers {
            distributed.removeObserver(as_object(observer));
        }
        for observer in &workspace_observers {
            workspace.removeObserver(as_object(observer));
        }
    }
    info!("Run loop thread exiting");
}

fn as_object(observer: &Observer) -> &AnyObject {
    // Every Objective-C object is an AnyObject.
    unsafe { &*Retained::as_ptr(observer).cast::<AnyObject>() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut source = WorkspaceSource::new(Duration::from_millis(100));
        assert!(source.stop().is_ok());
    }

    #[test]
    fn test_workspace_notification_reaches_channel() {
        let mut source = WorkspaceSource::new(Duration::from_secs(2));
        let (tx, rx) = bounded(lockwatch_core::NOTICE_QUEUE);
        source.start(tx).unwrap();

        unsafe {
            let center = NSWorkspace::sharedWorkspace().notificationCenter();
            center.postNotificationName_object(NSWorkspaceSessionDidResignActiveNotification, None);
            center.postNotificationName_object(NSWorkspaceSessionDidBecomeActiveNotification, None);
        }

        let resigned = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(resigned, NativeNotice::SessionResignedActive);
        assert_eq!(resigned.lock_state(), Some(true));
        let became = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(became, NativeNotice::SessionBecameActive);

        source.stop().unwrap();
    }

    #[test]
    fn test_source_starts_and_stops() {
        let mut source = WorkspaceSource::new(Duration::from_secs(2));
        let (tx, rx) = bounded(lockwatch_core::NOTICE_QUEUE);
        source.start(tx).unwrap();
        source.stop().unwrap();
        // Every observer block and the thread's sender are gone.
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }
}
