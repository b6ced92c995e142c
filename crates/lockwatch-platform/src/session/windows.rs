//! Windows implementation: WTS session notifications.
//!
//! A pump thread owns a hidden top-level window registered with
//! `WTSRegisterSessionNotification` and runs `GetMessageW`. The window
//! procedure forwards `WM_WTSSESSION_CHANGE` and `WM_QUERYENDSESSION` into
//! the notice channel. The window is never shown; being top-level lets it
//! receive the end-session broadcast too.

use super::forward_notice;
use crate::error::{PlatformError, PlatformResult};
use crossbeam_channel::{bounded, Receiver, Sender};
use lockwatch_core::codes::{session_flags_lock_state, WM_QUERYENDSESSION, WM_WTSSESSION_CHANGE};
use lockwatch_core::{
    LockwatchResult, NativeNotice, NativeSource, NotifierConfig, Platform, SessionInspector,
};
use std::cell::RefCell;
use std::os::windows::io::AsRawHandle;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use windows_sys::Win32::Foundation::{GetLastError, HANDLE, HWND, LPARAM, LRESULT, TRUE, WPARAM};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::System::RemoteDesktop::{
    ProcessIdToSessionId, WTSFreeMemory, WTSIsRemoteSession, WTSQuerySessionInformationW,
    WTSRegisterSessionNotification, WTSSessionInfoEx, WTSUnRegisterSessionNotification,
    NOTIFY_FOR_THIS_SESSION, WTSINFOEXW, WTS_CURRENT_SERVER_HANDLE, WTS_INFO_CLASS,
};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThreadId, TerminateThread,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
    PostThreadMessageW, RegisterClassW, TranslateMessage, CW_USEDEFAULT, MSG, WM_QUIT, WNDCLASSW,
    WS_OVERLAPPEDWINDOW,
};

/// What the window procedure forwards into: the notice sender plus the
/// halt receiver that frees a send blocked on a full queue.
struct Forwarder {
    notices: Sender<NativeNotice>,
    halt: Receiver<()>,
}

// One per pump thread.
thread_local! {
    static FORWARDER: RefCell<Option<Forwarder>> = const { RefCell::new(None) };
}

const WINDOW_CLASS: &str = "LockwatchSessionWindow\0";

/// Interval at which `stop` checks whether the pump thread has exited.
const JOIN_POLL: Duration = Duration::from_millis(10);

fn last_error(call: &'static str) -> PlatformError {
    PlatformError::Os {
        call,
        code: unsafe { GetLastError() },
    }
}

/// The WTS session of this process.
fn current_session_id() -> PlatformResult<u32> {
    let mut session_id = 0u32;
    if unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id) } == 0 {
        return Err(last_error("ProcessIdToSessionId"));
    }
    Ok(session_id)
}

/// Buffer returned by `WTSQuerySessionInformationW`, released on drop.
struct WtsBuffer {
    ptr: *mut u16,
    len: u32,
}

impl WtsBuffer {
    fn query(session_id: u32, class: WTS_INFO_CLASS) -> PlatformResult<Self> {
        let mut ptr: *mut u16 = std::ptr::null_mut();
        let mut len = 0u32;
        let ok = unsafe {
            WTSQuerySessionInformationW(
                WTS_CURRENT_SERVER_HANDLE,
                session_id,
                class,
                &mut ptr,
                &mut len,
            )
        };
        if ok == 0 {
            return Err(last_error("WTSQuerySessionInformationW"));
        }
        if ptr.is_null() {
            return Err(PlatformError::Native(
                "WTSQuerySessionInformationW returned no buffer".to_string(),
            ));
        }
        Ok(Self { ptr, len })
    }

    /// Copy the buffer out as a `T`, checking the reported size.
    fn read<T: Copy>(&self) -> PlatformResult<T> {
        if (self.len as usize) < std::mem::size_of::<T>() {
            return Err(PlatformError::Native(format!(
                "session info buffer too short: {} bytes",
                self.len
            )));
        }
        Ok(unsafe { std::ptr::read_unaligned(self.ptr as *const T) })
    }
}

impl Drop for WtsBuffer {
    fn drop(&mut self) {
        unsafe { WTSFreeMemory(self.ptr.cast()) };
    }
}

fn query_lock_state() -> PlatformResult<bool> {
    let session_id = current_session_id()?;
    let info: WTSINFOEXW = WtsBuffer::query(session_id, WTSSessionInfoEx)?.read()?;
    if info.Level != 1 {
        return Err(PlatformError::Native(format!(
            "unexpected WTSINFOEX level {}",
            info.Level
        )));
    }
    let flags = unsafe { info.Data.WTSInfoExLevel1.SessionFlags };
    debug!(session_id, flags, "queried session flags");
    session_flags_lock_state(flags)
        .ok_or_else(|| PlatformError::Native(format!("session flags {flags} carry no lock state")))
}

fn query_remote() -> PlatformResult<bool> {
    let session_id = current_session_id()?;
    // BOOLEAN
    let remote: u8 = WtsBuffer::query(session_id, WTSIsRemoteSession)?.read()?;
    Ok(remote != 0)
}

/// WTS-backed platform.
pub struct WindowsPlatform {
    stop_timeout: Duration,
}

impl WindowsPlatform {
    pub fn new(config: &NotifierConfig) -> LockwatchResult<Self> {
        Ok(Self {
            stop_timeout: config.stop_timeout(),
        })
    }
}

impl SessionInspector for WindowsPlatform {
    fn check_lock_state(&self) -> LockwatchResult<bool> {
        query_lock_state().map_err(PlatformError::inspection)
    }

    fn is_remote_session(&self) -> LockwatchResult<bool> {
        query_remote().map_err(PlatformError::inspection)
    }
}

impl Platform for WindowsPlatform {
    type Source = WtsSource;

    fn name(&self) -> &'static str {
        "windows"
    }

    fn new_source(&self, _config: &NotifierConfig) -> LockwatchResult<Self::Source> {
        Ok(WtsSource::new(self.stop_timeout))
    }
}

struct Pump {
    thread_id: u32,
    // Dropped to release a window procedure blocked on a full queue.
    halt: Sender<()>,
    // HWND kept as an integer so the source stays Send.
    hwnd: isize,
    thread: JoinHandle<()>,
}

/// One session window and its pump thread.
pub struct WtsSource {
    stop_timeout: Duration,
    pump: Option<Pump>,
}

impl WtsSource {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            stop_timeout,
            pump: None,
        }
    }

    /// The session window, while the pump is running.
    pub fn window(&self) -> Option<HWND> {
        self.pump.as_ref().map(|pump| pump.hwnd as HWND)
    }
}

impl NativeSource for WtsSource {
    fn start(&mut self, notices: Sender<NativeNotice>) -> LockwatchResult<()> {
        let (ready_tx, ready_rx) = bounded::<PlatformResult<(u32, isize)>>(1);
        let (halt, halt_rx) = bounded(0);
        let forwarder = Forwarder {
            notices,
            halt: halt_rx,
        };
        let thread = thread::Builder::new()
            .name("lockwatch-wts-pump".to_string())
            .spawn(move || run_pump(forwarder, ready_tx))
            .map_err(|e| {
                PlatformError::Native(format!("failed to spawn pump thread: {e}")).acquisition()
            })?;

        match ready_rx.recv() {
            Ok(Ok((thread_id, hwnd))) => {
                debug!(thread_id, hwnd, "WTS pump ready");
                self.pump = Some(Pump {
                    thread_id,
                    halt,
                    hwnd,
                    thread,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e.acquisition())
            }
            Err(_) => {
                let _ = thread.join();
                Err(PlatformError::Native("pump thread exited during startup".to_string())
                    .acquisition())
            }
        }
    }

    fn stop(&mut self) -> LockwatchResult<()> {
        let Some(pump) = self.pump.take() else {
            return Ok(());
        };

        drop(pump.halt);
        if unsafe { PostThreadMessageW(pump.thread_id, WM_QUIT, 0, 0) } == 0 {
            warn!(error = %last_error("PostThreadMessageW"), "Could not post WM_QUIT to pump thread");
        }

        let deadline = Instant::now() + self.stop_timeout;
        while !pump.thread.is_finished() {
            if Instant::now() >= deadline {
                error!(
                    timeout = ?self.stop_timeout,
                    "WTS pump thread did not exit, terminating it"
                );
                let handle = pump.thread.as_raw_handle() as HANDLE;
                let terminated = unsafe { TerminateThread(handle, 1) };
                let result = if terminated == 0 {
                    Err(last_error("TerminateThread").release())
                } else {
                    Ok(())
                };
                // Dropping the JoinHandle closes the thread handle.
                drop(pump.thread);
                return result;
            }
            thread::sleep(JOIN_POLL);
        }

        if pump.thread.join().is_err() {
            error!("WTS pump thread panicked");
        }
        Ok(())
    }
}

impl Drop for WtsSource {
    fn drop(&mut self) {
        if self.pump.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "Failed to stop WTS pump on drop");
            }
        }
    }
}

fn run_pump(forwarder: Forwarder, ready_tx: Sender<PlatformResult<(u32, isize)>>) {
    info!("WTS pump thread started");
    FORWARDER.with(|slot| {
        *slot.borrow_mut() = Some(forwarder);
    });

    let hwnd = match create_session_window() {
        Ok(hwnd) => hwnd,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if unsafe { WTSRegisterSessionNotification(hwnd, NOTIFY_FOR_THIS_SESSION) } == 0 {
        let err = last_error("WTSRegisterSessionNotification");
        unsafe { DestroyWindow(hwnd) };
        let _ = ready_tx.send(Err(err));
        return;
    }

    let thread_id = unsafe { GetCurrentThreadId() };
    let _ = ready_tx.send(Ok((thread_id, hwnd as isize)));

    let mut msg: MSG = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0) };
        if ret == 0 {
            break;
        }
        if ret < 0 {
            error!(error = %last_error("GetMessageW"), "Message loop failed");
            break;
        }
        unsafe {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    unsafe {
        WTSUnRegisterSessionNotification(hwnd);
        DestroyWindow(hwnd);
    }
    FORWARDER.with(|slot| {
        slot.borrow_mut().take();
    });
    info!("WTS pump thread exiting");
}

fn create_session_window() -> PlatformResult<HWND> {
    let class_name: Vec<u16> = WINDOW_CLASS.encode_utf16().collect();
    unsafe {
        let instance = GetModuleHandleW(std::ptr::null());
        let wc = WNDCLASSW {
            style: 0,
            lpfnWndProc: Some(window_proc),
            cbClsExtra: 0,
            cbWndExtra: 0,
            hInstance: instance,
            hIcon: std::ptr::null_mut(),
            hCursor: std::ptr::null_mut(),
            hbrBackground: std::ptr::null_mut(),
            lpszMenuName: std::ptr::null(),
            lpszClassName: class_name.as_ptr(),
        };
        // Fails with ERROR_CLASS_ALREADY_EXISTS for every source after the first.
        RegisterClassW(&wc);

        let hwnd = CreateWindowExW(
            0,
            class_name.as_ptr(),
            class_name.as_ptr(),
            WS_OVERLAPPEDWINDOW,
            CW_USEDEFAULT,
            CW_USEDEFAULT,
            100,
            100,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            instance,
            std::ptr::null(),
        );
        if hwnd.is_null() {
            return Err(last_error("CreateWindowExW"));
        }
        debug!(hwnd = hwnd as isize, "session window created");
        Ok(hwnd)
    }
}

/// Hand `notice` to the relay, waiting while the queue is full. `stop`
/// drops the halt sender before posting `WM_QUIT`, so the wait cannot
/// outlive a stop request.
fn forward(notice: NativeNotice) {
    FORWARDER.with(|slot| {
        if let Some(forwarder) = slot.borrow().as_ref() {
            if !forward_notice(&forwarder.notices, &forwarder.halt, notice) {
                debug!("notice not forwarded, source stopping");
            }
        }
    });
}

unsafe extern "system" fn window_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match msg {
        WM_WTSSESSION_CHANGE => {
            forward(NativeNotice::WtsSessionChange {
                code: wparam as u32,
            });
            0
        }
        WM_QUERYENDSESSION => {
            forward(NativeNotice::QueryEndSession);
            TRUE as LRESULT
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockwatch_core::codes::{WTS_SESSION_LOCK, WTS_SESSION_UNLOCK};
    use lockwatch_core::NOTICE_QUEUE;
    use windows_sys::Win32::UI::WindowsAndMessaging::PostMessageW;

    #[test]
    fn test_posted_session_change_reaches_channel() {
        let mut source = WtsSource::new(Duration::from_secs(2));
        let (tx, rx) = bounded(NOTICE_QUEUE);
        source.start(tx).unwrap();
        let hwnd = source.window().unwrap();

        for code in [WTS_SESSION_LOCK, WTS_SESSION_UNLOCK] {
            let posted = unsafe { PostMessageW(hwnd, WM_WTSSESSION_CHANGE, code as WPARAM, 0) };
            assert_ne!(posted, 0);
        }

        let lock = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(lock, NativeNotice::WtsSessionChange { code: WTS_SESSION_LOCK });
        assert_eq!(lock.lock_state(), Some(true));
        let unlock = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(unlock.lock_state(), Some(false));

        source.stop().unwrap();
        assert!(source.window().is_none());
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    fn post(hwnd: HWND, code: u32) {
        let posted = unsafe { PostMessageW(hwnd, WM_WTSSESSION_CHANGE, code as WPARAM, 0) };
        assert_ne!(posted, 0);
    }

    #[test]
    fn test_full_queue_holds_notices_back() {
        let mut source = WtsSource::new(Duration::from_secs(2));
        let (tx, rx) = bounded(1);
        source.start(tx).unwrap();
        let hwnd = source.window().unwrap();

        let codes = [WTS_SESSION_LOCK, WTS_SESSION_UNLOCK, WTS_SESSION_LOCK];
        for code in codes {
            post(hwnd, code);
        }
        thread::sleep(Duration::from_millis(100));

        let received: Vec<NativeNotice> = (0..codes.len())
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        let expected: Vec<NativeNotice> = codes
            .iter()
            .map(|&code| NativeNotice::WtsSessionChange { code })
            .collect();
        assert_eq!(received, expected);

        source.stop().unwrap();
    }

    #[test]
    fn test_stop_releases_blocked_window_procedure() {
        let mut source = WtsSource::new(Duration::from_secs(2));
        let (tx, _rx) = bounded(1);
        source.start(tx).unwrap();
        let hwnd = source.window().unwrap();

        // The second notice blocks the window procedure on the full queue.
        post(hwnd, WTS_SESSION_LOCK);
        post(hwnd, WTS_SESSION_UNLOCK);
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        source.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut source = WtsSource::new(Duration::from_millis(100));
        assert!(source.stop().is_ok());
    }
}
