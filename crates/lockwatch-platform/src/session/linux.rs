//! Linux implementation: screensaver `ActiveChanged` signals over D-Bus.
//!
//! A dedicated thread runs a current-thread tokio runtime that owns the
//! session-bus connection and a message stream filtered by the desktop's
//! match rule. Each signal body is a single boolean: `true` = locked.

use super::forward_notice;
use crate::error::{PlatformError, PlatformResult};
use crossbeam_channel::{bounded, Receiver, Sender};
use futures_util::StreamExt;
use lockwatch_core::remote::detect_remote;
use lockwatch_core::{
    DesktopEnvironment, LockwatchResult, NativeNotice, NativeSource, NotifierConfig, Platform,
    ScreenSaverBus, SessionInspector,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use zbus::{Connection, MatchRule, MessageStream};

const PROC_TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];

/// Reconnect attempts after the bus drops the stream, before the thread
/// gives up and lets the relay build a new source.
const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

fn runtime() -> PlatformResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| PlatformError::Native(format!("failed to create tokio runtime: {e}")))
}

async fn get_active(bus: ScreenSaverBus, timeout: Duration) -> PlatformResult<bool> {
    let query = async {
        let connection = Connection::session().await?;
        let reply = connection
            .call_method(
                Some(bus.service),
                bus.path,
                Some(bus.query_interface),
                "GetActive",
                &(),
            )
            .await?;
        let active: bool = reply.body().deserialize()?;
        Ok::<_, PlatformError>(active)
    };
    tokio::time::timeout(timeout, query)
        .await
        .map_err(|_| PlatformError::Timeout("GetActive", timeout))?
}

/// Run `GetActive` on a thread of its own; `block_on` panics when the
/// caller is already on a runtime thread.
fn query_active(bus: ScreenSaverBus, timeout: Duration) -> PlatformResult<bool> {
    thread::scope(|scope| {
        scope
            .spawn(|| -> PlatformResult<bool> { runtime()?.block_on(get_active(bus, timeout)) })
            .join()
            .unwrap_or_else(|_| Err(PlatformError::Native("GetActive thread panicked".to_string())))
    })
}

/// Screensaver-backed platform for the configured desktop.
pub struct LinuxPlatform {
    desktop: DesktopEnvironment,
    query_timeout: Duration,
    stop_timeout: Duration,
}

impl LinuxPlatform {
    pub fn new(config: &NotifierConfig) -> LockwatchResult<Self> {
        let desktop = config.desktop_environment();
        debug!(?desktop, "selected desktop environment");
        Ok(Self {
            desktop,
            query_timeout: config.query_timeout(),
            stop_timeout: config.stop_timeout(),
        })
    }

    pub fn desktop(&self) -> DesktopEnvironment {
        self.desktop
    }
}

impl SessionInspector for LinuxPlatform {
    fn check_lock_state(&self) -> LockwatchResult<bool> {
        query_active(self.desktop.bus(), self.query_timeout).map_err(PlatformError::inspection)
    }

    fn is_remote_session(&self) -> LockwatchResult<bool> {
        detect_remote(
            |key| std::env::var(key).ok(),
            &PROC_TCP_TABLES,
            |table| std::fs::read_to_string(table),
        )
    }
}

impl Platform for LinuxPlatform {
    type Source = ScreenSaverSource;

    fn name(&self) -> &'static str {
        "linux"
    }

    fn new_source(&self, _config: &NotifierConfig) -> LockwatchResult<Self::Source> {
        Ok(ScreenSaverSource::new(self.desktop.bus(), self.stop_timeout))
    }
}

/// Held by a running source; dropping it asks the D-Bus thread to stop.
struct StopSignal {
    _wake: oneshot::Sender<()>,
    _halt: Sender<()>,
}

/// The D-Bus thread's side of a [`StopSignal`]: `wake` ends async waits,
/// `halt` ends a send blocked on a full notice queue.
struct StopWatch {
    wake: oneshot::Receiver<()>,
    halt: Receiver<()>,
}

fn stop_pair() -> (StopSignal, StopWatch) {
    let (wake_tx, wake) = oneshot::channel();
    let (halt_tx, halt) = bounded(0);
    (
        StopSignal {
            _wake: wake_tx,
            _halt: halt_tx,
        },
        StopWatch { wake, halt },
    )
}

/// One bus connection and its signal thread.
pub struct ScreenSaverSource {
    bus: ScreenSaverBus,
    stop_timeout: Duration,
    stop: Option<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl ScreenSaverSource {
    pub fn new(bus: ScreenSaverBus, stop_timeout: Duration) -> Self {
        Self {
            bus,
            stop_timeout,
            stop: None,
            thread: None,
        }
    }
}

impl NativeSource for ScreenSaverSource {
    fn start(&mut self, notices: Sender<NativeNotice>) -> LockwatchResult<()> {
        let (ready_tx, ready_rx) = bounded::<PlatformResult<()>>(1);
        let bus = self.bus;
        let (signal, watch) = stop_pair();
        let thread = thread::Builder::new()
            .name("lockwatch-dbus".to_string())
            .spawn(move || signal_thread_main(bus, notices, watch, ready_tx))
            .map_err(|e| {
                PlatformError::Native(format!("failed to spawn D-Bus thread: {e}")).acquisition()
            })?;

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(PlatformError::Native(
                "D-Bus thread exited during startup".to_string(),
            ))
        });
        match started {
            Ok(()) => {
                self.stop = Some(signal);
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
        drop(self.stop.take());

        let deadline = Instant::now() + self.stop_timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                // No safe way to kill a thread here; it is left to wind down.
                return Err(PlatformError::Timeout("D-Bus thread shutdown", self.stop_timeout)
                    .release());
            }
            thread::sleep(Duration::from_millis(10));
        }
        if thread.join().is_err() {
            error!("D-Bus thread panicked");
        }
        Ok(())
    }
}

impl Drop for ScreenSaverSource {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "Failed to stop D-Bus thread on drop");
            }
        }
    }
}

fn signal_thread_main(
    bus: ScreenSaverBus,
    notices: Sender<NativeNotice>,
    watch: StopWatch,
    ready_tx: Sender<PlatformResult<()>>,
) {
    let rt = match runtime() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    rt.block_on(async move {
        match signal_loop(bus, notices, watch, ready_tx).await {
            Ok(()) => info!("D-Bus thread terminated normally"),
            Err(e) => warn!(error = %e, "D-Bus thread error"),
        }
    });
}

async fn subscribe_signals(bus: ScreenSaverBus) -> PlatformResult<(Connection, MessageStream)> {
    let connection = Connection::session().await?;
    let rule = MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .interface(bus.interface)?
        .member(bus.member)?
        .build();
    let stream = MessageStream::for_match_rule(rule, &connection, None).await?;
    Ok((connection, stream))
}

/// Why [`pump_signals`] returned.
#[derive(Debug, PartialEq, Eq)]
enum StreamEnd {
    /// Stop requested, or the relay is gone.
    Done,
    /// The bus closed the stream on its own.
    Closed,
}

async fn signal_loop(
    bus: ScreenSaverBus,
    notices: Sender<NativeNotice>,
    mut watch: StopWatch,
    ready_tx: Sender<PlatformResult<()>>,
) -> PlatformResult<()> {
    // The connection must outlive the stream.
    let (mut _connection, mut stream) = match subscribe_signals(bus).await {
        Ok(subscribed) => subscribed,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return Ok(());
        }
    };

    let _ = ready_tx.send(Ok(()));
    info!(
        interface = bus.interface,
        member = bus.member,
        "D-Bus thread started"
    );

    while pump_signals(bus, &mut stream, &notices, &mut watch).await == StreamEnd::Closed {
        warn!("D-Bus message stream ended, reconnecting");
        match reconnect(bus, &mut watch).await {
            Some((connection, fresh)) => {
                _connection = connection;
                stream = fresh;
            }
            None => break,
        }
    }
    Ok(())
}

async fn pump_signals(
    bus: ScreenSaverBus,
    stream: &mut MessageStream,
    notices: &Sender<NativeNotice>,
    watch: &mut StopWatch,
) -> StreamEnd {
    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = &mut watch.wake => {
                debug!("D-Bus thread stop requested");
                return StreamEnd::Done;
            }
        };
        let Some(message) = message else {
            return StreamEnd::Closed;
        };
        let notice = match message {
            Ok(message) => match message.body().deserialize::<bool>() {
                Ok(active) => NativeNotice::ScreenSaverActive(active),
                Err(e) => NativeNotice::Malformed(format!("{}: {}", bus.member, e)),
            },
            Err(e) => {
                warn!(error = %e, "D-Bus stream error");
                continue;
            }
        };
        debug!(?notice, "screensaver signal");

        // A full queue holds the signal back rather than dropping it.
        let tx = notices.clone();
        let halt = watch.halt.clone();
        match tokio::task::spawn_blocking(move || forward_notice(&tx, &halt, notice)).await {
            Ok(true) => {}
            Ok(false) => return StreamEnd::Done,
            Err(e) => {
                error!(error = %e, "Notice forwarding task failed");
                return StreamEnd::Done;
            }
        }
    }
}

/// Subscribe again with a doubling backoff. `None` when a stop was
/// requested or every attempt failed.
async fn reconnect(
    bus: ScreenSaverBus,
    watch: &mut StopWatch,
) -> Option<(Connection, MessageStream)> {
    let mut backoff = RECONNECT_BACKOFF;
    for attempt in 1..=RECONNECT_ATTEMPTS {
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = &mut watch.wake => return None,
        }
        match subscribe_signals(bus).await {
            Ok(subscribed) => {
                info!(attempt, "D-Bus subscription re-established");
                return Some(subscribed);
            }
            Err(e) => {
                warn!(attempt, error = %e, "D-Bus reconnect failed");
                backoff *= 2;
            }
        }
    }
    error!(attempts = RECONNECT_ATTEMPTS, "Giving up on the D-Bus connection");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_uses_desktop_bus() {
        let config = NotifierConfig {
            desktop: Some("KDE".to_string()),
            ..NotifierConfig::default()
        };
        let platform = LinuxPlatform::new(&config).unwrap();
        assert_eq!(platform.desktop(), DesktopEnvironment::Kde);

        let source = platform.new_source(&config).unwrap();
        assert_eq!(source.bus.interface, "org.kde.screensaver");
        assert_eq!(source.bus.member, "ActiveChanged");
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut source =
            ScreenSaverSource::new(DesktopEnvironment::Gnome.bus(), Duration::from_millis(100));
        assert!(source.stop().is_ok());
    }

    #[test]
    fn test_dropped_signal_ends_both_waits() {
        let (signal, mut watch) = stop_pair();
        let (tx, _rx) = bounded(1);
        tx.send(NativeNotice::ScreenLocked).unwrap();
        drop(signal);

        // A send blocked on the full queue gives up.
        assert!(!forward_notice(&tx, &watch.halt, NativeNotice::ScreenUnlocked));

        let rt = runtime().unwrap();
        rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(1), &mut watch.wake)
                .await
                .expect("wake resolves once the signal is dropped")
                .unwrap_err();
        });
    }

    #[tokio::test]
    async fn test_check_lock_state_inside_runtime() {
        let config = NotifierConfig {
            query_timeout_ms: 500,
            ..NotifierConfig::default()
        };
        let platform = LinuxPlatform::new(&config).unwrap();
        // With or without a session bus, the answer comes back instead of a
        // nested-runtime panic.
        match platform.check_lock_state() {
            Ok(_) | Err(lockwatch_core::LockwatchError::InspectionUnavailable(_)) => {}
            Err(other) => panic!("unexpected {other:?}"),
        }
    }
}
