//! Bridge between a real-time MIDI server and a host-side worker thread.
//!
//! The audio server calls a short, bounded, non-blocking callback every
//! cycle on a dedicated high-priority thread; the host processes MIDI
//! events at its own pace on a worker thread. midilink lets the two
//! trade execution turns cycle by cycle through a chain of ports, each
//! running a small rendezvous state machine, without the real-time
//! thread ever blocking on an unbounded wait.
//!
//! # Primary API
//!
//! - [`Session`] / [`SessionBuilder`]: process-wide entry point
//! - [`PortChain`] / [`Port`]: the concurrency engine itself
//! - [`ServerClient`]: the interface the server glue implements
//! - [`InputPortListener`] / [`OutputPortListener`] / [`SystemListener`]:
//!   the interfaces the host implements
//!
//! # Example
//!
//! ```ignore
//! use midilink::Session;
//!
//! let session = Session::builder().open(client, system_listener)?;
//! let piano = session.create_input_port("piano", piano_listener)?;
//!
//! // host worker thread:
//! //     session.run()?;
//! // audio server callback:
//! //     session.native_cycle(time_code);
//!
//! session.close_port(piano)?;
//! session.close()?;
//! ```

// Error types
pub mod error;
pub use error::{BoxedCause, Error, Result};

// Configuration
mod config;
pub use config::LinkConfig;

// Event model
mod event;
pub use event::{EventBuffer, MidiEvent, TimeCode};

// Host-side callback interfaces
mod listener;
pub use listener::{HostResult, InputPortListener, OutputPortListener, SystemListener};

// Server-side interface
mod server;
pub use server::{Direction, ServerClient, ServerPortHandle};

// Exception carrier
mod fault;
pub use fault::ProcessFault;

// Lock-free primitives
mod flag;
pub use flag::AtomicFlag;

// Guarded slots
mod slot;
pub use slot::{GuardedSlot, SlotAccessor};

// The port state machine and the concrete drivers
pub mod port;
pub use port::{
    end_control_port, input_port, output_port, start_control_port, MainState, Port, PortDriver,
    PortId, RunState, END_CONTROL_ID, INVALID_PORT_ID, START_CONTROL_ID,
};

// The chain
mod chain;
pub use chain::{ChainState, PortChain};

// Connection-change relay
mod monitor;
pub use monitor::SystemMonitor;

// Session entry point
mod session;
pub use session::{Session, SessionBuilder};
