//! Shared helpers for the integration tests: counting port drivers, a
//! no-op server client, and recording listeners.

#![allow(dead_code)]

use midilink::{
    Direction, EventBuffer, HostResult, InputPortListener, LinkConfig, MidiEvent,
    OutputPortListener, Port, PortDriver, PortId, Result, ServerClient, ServerPortHandle,
    SystemListener, TimeCode,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-driver invocation counters, shared with the test body.
#[derive(Default)]
pub struct Counters {
    pub open: AtomicUsize,
    pub register: AtomicUsize,
    pub start: AtomicUsize,
    pub host: AtomicUsize,
    pub native: AtomicUsize,
    pub stop: AtomicUsize,
    pub unregister: AtomicUsize,
    pub close: AtomicUsize,
    pub last_cycle: AtomicUsize,
    pub fail_host: AtomicBool,
    pub fail_native: AtomicBool,
}

impl Counters {
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
    pub fn register_count(&self) -> usize {
        self.register.load(Ordering::Acquire)
    }
    pub fn start_count(&self) -> usize {
        self.start.load(Ordering::Acquire)
    }
    pub fn host_count(&self) -> usize {
        self.host.load(Ordering::Acquire)
    }
    pub fn native_count(&self) -> usize {
        self.native.load(Ordering::Acquire)
    }
    pub fn stop_count(&self) -> usize {
        self.stop.load(Ordering::Acquire)
    }
    pub fn unregister_count(&self) -> usize {
        self.unregister.load(Ordering::Acquire)
    }
    pub fn close_count(&self) -> usize {
        self.close.load(Ordering::Acquire)
    }
    pub fn last_cycle_count(&self) -> usize {
        self.last_cycle.load(Ordering::Acquire)
    }

    /// Asserts the balanced-counter invariant of a port that reached the
    /// deletable state.
    pub fn assert_balanced(&self) {
        assert_eq!(self.open_count(), self.close_count(), "open/close balance");
        assert_eq!(
            self.register_count(),
            self.unregister_count(),
            "register/unregister balance"
        );
        assert_eq!(self.start_count(), self.stop_count(), "start/stop balance");
    }
}

/// Driver that only counts its invocations; faults on request.
pub struct CountingDriver {
    counters: Arc<Counters>,
}

impl PortDriver for CountingDriver {
    fn open(&self) -> Result<()> {
        self.counters.open.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn register(&self, _client: &dyn ServerClient) -> Result<()> {
        self.counters.register.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn start(&self) -> Result<()> {
        self.counters.start.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn process_host(&self, _time_code: TimeCode, last_cycle: bool) -> Result<()> {
        self.counters.host.fetch_add(1, Ordering::AcqRel);
        if last_cycle {
            self.counters.last_cycle.fetch_add(1, Ordering::AcqRel);
        }
        if self.counters.fail_host.load(Ordering::Acquire) {
            return Err(midilink::Error::HostBridge {
                during: "process",
                cause: "requested failure".into(),
            });
        }
        Ok(())
    }
    fn process_native(&self, _time_code: TimeCode, _client: &dyn ServerClient) -> Result<()> {
        self.counters.native.fetch_add(1, Ordering::AcqRel);
        if self.counters.fail_native.load(Ordering::Acquire) {
            return Err(midilink::Error::Server {
                during: "process_native",
                cause: "requested failure".into(),
            });
        }
        Ok(())
    }
    fn stop(&self) -> Result<()> {
        self.counters.stop.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn unregister(&self, _client: &dyn ServerClient) -> Result<()> {
        self.counters.unregister.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn close(&self) -> Result<()> {
        self.counters.close.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Builds a counting port and hands back the shared counters.
pub fn counting_port(id: PortId, direction: Direction, config: &LinkConfig) -> (Port, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let driver = CountingDriver {
        counters: counters.clone(),
    };
    (
        Port::new(id, direction, Box::new(driver), config),
        counters,
    )
}

/// Server client that accepts everything and does nothing.
#[derive(Default)]
pub struct NullClient;

impl ServerClient for NullClient {
    fn register_port(&self, _name: &str, _direction: Direction) -> Result<ServerPortHandle> {
        Ok(ServerPortHandle(0))
    }
    fn unregister_port(&self, _handle: ServerPortHandle) -> Result<()> {
        Ok(())
    }
    fn read_events(
        &self,
        _handle: ServerPortHandle,
        _frames: u64,
        _sink: &mut EventBuffer,
    ) -> Result<()> {
        Ok(())
    }
    fn write_events(
        &self,
        _handle: ServerPortHandle,
        _frames: u64,
        _events: &[MidiEvent],
    ) -> Result<()> {
        Ok(())
    }
}

/// Server client that counts registrations and feeds one synthetic event
/// into every input cycle.
#[derive(Default)]
pub struct MockServer {
    pub registered: AtomicUsize,
    pub unregistered: AtomicUsize,
    pub events_written: AtomicUsize,
    next_handle: AtomicU64,
}

impl ServerClient for MockServer {
    fn register_port(&self, _name: &str, _direction: Direction) -> Result<ServerPortHandle> {
        self.registered.fetch_add(1, Ordering::AcqRel);
        Ok(ServerPortHandle(
            self.next_handle.fetch_add(1, Ordering::AcqRel),
        ))
    }
    fn unregister_port(&self, _handle: ServerPortHandle) -> Result<()> {
        self.unregistered.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn read_events(
        &self,
        _handle: ServerPortHandle,
        _frames: u64,
        sink: &mut EventBuffer,
    ) -> Result<()> {
        sink.push(MidiEvent::new(0, [0x90, 60, 100]))
    }
    fn write_events(
        &self,
        _handle: ServerPortHandle,
        _frames: u64,
        events: &[MidiEvent],
    ) -> Result<()> {
        self.events_written.fetch_add(events.len(), Ordering::AcqRel);
        Ok(())
    }
}

/// System listener recording every callback.
#[derive(Default)]
pub struct RecordingSystemListener {
    pub opened: AtomicUsize,
    pub cycle_starts: AtomicUsize,
    pub cycle_ends: AtomicUsize,
    pub closed: AtomicUsize,
    pub connection_changes: AtomicUsize,
}

impl SystemListener for RecordingSystemListener {
    fn on_open(&self) -> HostResult {
        self.opened.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn on_cycle_start(&self, _time_code: TimeCode, _last_cycle: bool) -> HostResult {
        self.cycle_starts.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn on_cycle_end(&self, _time_code: TimeCode, _last_cycle: bool) -> HostResult {
        self.cycle_ends.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn on_close(&self) -> HostResult {
        self.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn on_connection_changed(&self) -> HostResult {
        self.connection_changes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Input listener recording the events it receives.
#[derive(Default)]
pub struct CollectingInputListener {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub cycles: AtomicUsize,
    pub events_seen: AtomicUsize,
    pub last_cycles: AtomicUsize,
}

impl InputPortListener for CollectingInputListener {
    fn on_open(&self) -> HostResult {
        self.opened.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn process(&self, _time_code: TimeCode, last_cycle: bool, events: &[MidiEvent]) -> HostResult {
        self.cycles.fetch_add(1, Ordering::AcqRel);
        self.events_seen.fetch_add(events.len(), Ordering::AcqRel);
        if last_cycle {
            self.last_cycles.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }
    fn on_close(&self) -> HostResult {
        self.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Output listener emitting one note per cycle.
#[derive(Default)]
pub struct EmittingOutputListener {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub cycles: AtomicUsize,
}

impl OutputPortListener for EmittingOutputListener {
    fn on_open(&self) -> HostResult {
        self.opened.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
    fn process(&self, _time_code: TimeCode, _last_cycle: bool, sink: &mut EventBuffer) -> HostResult {
        self.cycles.fetch_add(1, Ordering::AcqRel);
        sink.push(MidiEvent::new(0, [0x80, 60, 0]))?;
        Ok(())
    }
    fn on_close(&self) -> HostResult {
        self.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
