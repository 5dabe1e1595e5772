//! Host-side callback interfaces.
//!
//! The host registers listeners; the engine invokes them from its worker
//! threads. A listener error is captured into the owning port's fault
//! slot and ends the port's session (emergency stop); it is never
//! propagated to the audio-server callback.

use crate::error::BoxedCause;
use crate::event::{EventBuffer, MidiEvent, TimeCode};

/// Outcome of a host callback.
pub type HostResult = std::result::Result<(), BoxedCause>;

/// Listener of an input port: receives the events read from the server.
///
/// `process` is called once per cycle on the host worker thread, after
/// `on_open` has returned and never after `on_close`.
pub trait InputPortListener: Send + Sync {
    fn on_open(&self) -> HostResult;

    /// `last_cycle` is true on the final invocation before the port
    /// terminates.
    fn process(&self, time_code: TimeCode, last_cycle: bool, events: &[MidiEvent]) -> HostResult;

    fn on_close(&self) -> HostResult;
}

/// Listener of an output port: supplies the events to write to the server.
pub trait OutputPortListener: Send + Sync {
    fn on_open(&self) -> HostResult;

    /// Fills `sink` with this cycle's events, ordered by frame offset.
    fn process(&self, time_code: TimeCode, last_cycle: bool, sink: &mut EventBuffer)
        -> HostResult;

    fn on_close(&self) -> HostResult;
}

/// Listener of session-wide events, driven by the two control ports and
/// the system monitor.
pub trait SystemListener: Send + Sync {
    /// Fired exactly once while the chain initializes.
    fn on_open(&self) -> HostResult;

    /// Fired at the beginning of every cycle's host pass.
    fn on_cycle_start(&self, time_code: TimeCode, last_cycle: bool) -> HostResult;

    /// Fired at the end of every cycle's host pass.
    fn on_cycle_end(&self, time_code: TimeCode, last_cycle: bool) -> HostResult;

    /// Fired exactly once while the chain uninitializes.
    fn on_close(&self) -> HostResult;

    /// Fired from the notification thread when the server reports a port
    /// connection change.
    fn on_connection_changed(&self) -> HostResult;
}
