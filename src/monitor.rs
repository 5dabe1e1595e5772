//! Connection-change relay from the audio server to the host listener.
//!
//! The server delivers port-connect notifications on a thread of its
//! own choosing; the monitor decouples the host listener from it with a
//! channel and a dedicated relay thread. An atomic `accepting` gate is
//! read first by the callback entry so notifications arriving after
//! deactivation are dropped without touching any other state.

use crate::error::{BoxedCause, Error};
use crate::flag::AtomicFlag;
use crate::listener::SystemListener;
use crate::Result;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    /// Just created, or shut down (and re-initializable).
    Uninitialized,
    Initialized,
    Activated,
    Deactivated,
}

impl MonitorState {
    fn describe(self) -> String {
        format!("in {self:?} state").to_lowercase()
    }
}

enum Notification {
    ConnectionChanged,
}

struct MonitorInner {
    state: MonitorState,
    listener: Option<Arc<dyn SystemListener>>,
    tx: Option<Sender<Notification>>,
    relay: Option<JoinHandle<()>>,
}

/// Relay of server connection-change events with its own simple
/// life-cycle: uninitialized → initialized → activated → deactivated.
pub struct SystemMonitor {
    inner: Mutex<MonitorInner>,
    accepting: Arc<AtomicFlag>,
    fault: Arc<Mutex<Option<Error>>>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                state: MonitorState::Uninitialized,
                listener: None,
                tx: None,
                relay: None,
            }),
            accepting: Arc::new(AtomicFlag::new(false)),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    /// Stores the host listener for later delivery.
    pub fn initialize(&self, listener: Arc<dyn SystemListener>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != MonitorState::Uninitialized {
            return Err(Error::wrong_state(
                "initialize system monitor",
                inner.state.describe(),
            ));
        }
        inner.listener = Some(listener);
        inner.state = MonitorState::Initialized;
        Ok(())
    }

    /// Starts the relay thread and begins accepting notifications.
    pub fn activate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != MonitorState::Initialized {
            return Err(Error::wrong_state(
                "activate system monitor",
                inner.state.describe(),
            ));
        }
        let listener = inner.listener.clone().ok_or(Error::wrong_state(
            "activate system monitor",
            "without a listener",
        ))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let relay = spawn_relay(rx, listener, self.accepting.clone(), self.fault.clone())?;

        inner.tx = Some(tx);
        inner.relay = Some(relay);
        inner.state = MonitorState::Activated;
        self.accepting.set(true);
        tracing::debug!("system monitor activated");
        Ok(())
    }

    /// Callback entry for the server glue; callable from any thread.
    /// Returns without effect unless the monitor is accepting.
    pub fn connection_changed(&self) {
        if !self.accepting.get() {
            return;
        }
        let inner = self.inner.lock();
        if let Some(tx) = &inner.tx {
            tx.send(Notification::ConnectionChanged).ok();
        }
    }

    /// Stops accepting notifications and joins the relay thread.
    pub fn deactivate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != MonitorState::Activated {
            return Err(Error::wrong_state(
                "deactivate system monitor",
                inner.state.describe(),
            ));
        }
        self.teardown_relay(&mut inner);
        inner.state = MonitorState::Deactivated;
        Ok(())
    }

    /// Releases the listener.
    pub fn uninitialize(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(
            inner.state,
            MonitorState::Deactivated | MonitorState::Initialized
        ) {
            return Err(Error::wrong_state(
                "uninitialize system monitor",
                inner.state.describe(),
            ));
        }
        inner.listener = None;
        inner.state = MonitorState::Uninitialized;
        Ok(())
    }

    /// Collapses to `Uninitialized` from any state. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.state == MonitorState::Activated {
            self.teardown_relay(&mut inner);
        }
        inner.listener = None;
        inner.state = MonitorState::Uninitialized;
    }

    fn teardown_relay(&self, inner: &mut MonitorInner) {
        self.accepting.set(false);
        // dropping the sender ends the relay loop
        inner.tx = None;
        if let Some(relay) = inner.relay.take() {
            relay.join().ok();
        }
    }

    pub fn is_uninitialized(&self) -> bool {
        self.inner.lock().state == MonitorState::Uninitialized
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().state == MonitorState::Initialized
    }

    pub fn is_activated(&self) -> bool {
        self.inner.lock().state == MonitorState::Activated
    }

    pub fn is_deactivated(&self) -> bool {
        self.inner.lock().state == MonitorState::Deactivated
    }

    /// True if a notification delivery has failed since activation.
    pub fn has_fault(&self) -> bool {
        self.fault.lock().is_some()
    }

    /// Takes the first delivery failure, if any.
    pub fn take_fault(&self) -> Option<Error> {
        self.fault.lock().take()
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_relay(
    rx: Receiver<Notification>,
    listener: Arc<dyn SystemListener>,
    accepting: Arc<AtomicFlag>,
    fault: Arc<Mutex<Option<Error>>>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("midilink-notify".into())
        .spawn(move || {
            for notification in rx {
                if !accepting.get() {
                    continue;
                }
                match notification {
                    Notification::ConnectionChanged => {
                        if let Err(cause) = listener.on_connection_changed() {
                            latch_fault(&fault, cause);
                        }
                    }
                }
            }
        })
        .map_err(|cause| Error::Server {
            during: "spawning the notification thread",
            cause: Box::new(cause),
        })
}

fn latch_fault(fault: &Mutex<Option<Error>>, cause: BoxedCause) {
    let mut fault = fault.lock();
    if fault.is_none() {
        *fault = Some(Error::host_bridge("on_connection_changed", cause));
    } else {
        tracing::debug!("discarding secondary monitor fault");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TimeCode;
    use crate::listener::HostResult;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingListener {
        connection_changes: AtomicUsize,
        fail: AtomicBool,
    }

    impl SystemListener for CountingListener {
        fn on_open(&self) -> HostResult {
            Ok(())
        }
        fn on_cycle_start(&self, _time_code: TimeCode, _last_cycle: bool) -> HostResult {
            Ok(())
        }
        fn on_cycle_end(&self, _time_code: TimeCode, _last_cycle: bool) -> HostResult {
            Ok(())
        }
        fn on_close(&self) -> HostResult {
            Ok(())
        }
        fn on_connection_changed(&self) -> HostResult {
            self.connection_changes.fetch_add(1, Ordering::AcqRel);
            if self.fail.load(Ordering::Acquire) {
                return Err("requested failure".into());
            }
            Ok(())
        }
    }

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        predicate()
    }

    #[test]
    fn test_life_cycle() {
        let monitor = SystemMonitor::new();
        let listener = Arc::new(CountingListener::default());
        assert!(monitor.is_uninitialized());

        monitor.initialize(listener).unwrap();
        assert!(monitor.is_initialized());

        monitor.activate().unwrap();
        assert!(monitor.is_activated());

        monitor.deactivate().unwrap();
        assert!(monitor.is_deactivated());

        monitor.uninitialize().unwrap();
        assert!(monitor.is_uninitialized());
    }

    #[test]
    fn test_wrong_order_is_error() {
        let monitor = SystemMonitor::new();
        assert!(monitor.activate().is_err());
        assert!(monitor.deactivate().is_err());
        assert!(monitor.uninitialize().is_err());
    }

    #[test]
    fn test_delivers_connection_changes() {
        let monitor = SystemMonitor::new();
        let listener = Arc::new(CountingListener::default());
        monitor.initialize(listener.clone()).unwrap();
        monitor.activate().unwrap();

        monitor.connection_changed();
        monitor.connection_changed();
        assert!(wait_until(Duration::from_secs(1), || {
            listener.connection_changes.load(Ordering::Acquire) == 2
        }));

        monitor.deactivate().unwrap();
        // ignored after deactivation
        monitor.connection_changed();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(listener.connection_changes.load(Ordering::Acquire), 2);
        assert!(!monitor.has_fault());

        monitor.shutdown();
        assert!(monitor.is_uninitialized());
    }

    #[test]
    fn test_listener_failure_is_latched() {
        let monitor = SystemMonitor::new();
        let listener = Arc::new(CountingListener::default());
        listener.fail.store(true, Ordering::Release);
        monitor.initialize(listener.clone()).unwrap();
        monitor.activate().unwrap();

        monitor.connection_changed();
        assert!(wait_until(Duration::from_secs(1), || monitor.has_fault()));

        let fault = monitor.take_fault().unwrap();
        assert!(matches!(fault, Error::HostBridge { .. }));
        assert!(monitor.take_fault().is_none());

        monitor.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let monitor = SystemMonitor::new();
        monitor.shutdown();
        assert!(monitor.is_uninitialized());

        let listener = Arc::new(CountingListener::default());
        monitor.initialize(listener).unwrap();
        monitor.activate().unwrap();
        monitor.shutdown();
        assert!(monitor.is_uninitialized());
        monitor.shutdown();
        assert!(monitor.is_uninitialized());
    }
}
