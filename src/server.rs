//! Interface to the MIDI audio server.
//!
//! The engine never talks to a concrete server library; everything goes
//! through [`ServerClient`]. The real client glue (opening a server
//! connection, enumerating hardware ports) lives outside this crate.

use crate::event::{EventBuffer, MidiEvent};
use crate::Result;

/// Direction of a port, fixed at creation.
///
/// An input port transports data from the server to the host, so its
/// native half runs first each cycle. An output port is the other way
/// round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn is_input(self) -> bool {
        matches!(self, Direction::Input)
    }

    pub fn is_output(self) -> bool {
        matches!(self, Direction::Output)
    }
}

/// Handle to a port registered at the server, opaque to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerPortHandle(pub u64);

/// Connection to the MIDI audio server, shared by all ports of a session.
///
/// Implementations must be callable from the server's real-time thread
/// for the two event transfer methods; registration runs on
/// administrative threads only.
pub trait ServerClient: Send + Sync {
    /// Subscribes a port at the server under a unique name.
    fn register_port(&self, name: &str, direction: Direction) -> Result<ServerPortHandle>;

    /// Withdraws a previously registered port.
    fn unregister_port(&self, handle: ServerPortHandle) -> Result<()>;

    /// Reads the MIDI events the server collected for this cycle into
    /// `sink`. Called on the server thread, input ports only.
    fn read_events(
        &self,
        handle: ServerPortHandle,
        frames: u64,
        sink: &mut EventBuffer,
    ) -> Result<()>;

    /// Writes this cycle's outgoing events, ordered by frame offset.
    /// Called on the server thread, output ports only.
    fn write_events(&self, handle: ServerPortHandle, frames: u64, events: &[MidiEvent])
        -> Result<()>;
}
