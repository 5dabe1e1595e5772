//! Error types for midilink.

use crate::port::PortId;
use thiserror::Error;

/// Source error raised by host listeners or server clients.
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync>;

/// Error type for all midilink operations.
///
/// Worker halves never surface these to the audio-server callback; errors
/// raised there are latched into the owning port's fault slot and
/// retrieved later on an administrative thread (see
/// [`ProcessFault`](crate::ProcessFault)).
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was invoked on a port or chain in an incompatible state.
    #[error("cannot {action} {state}")]
    WrongState {
        action: &'static str,
        state: String,
    },

    /// A bounded wait expired before the awaited condition arrived.
    #[error("timeout in {0}")]
    Timeout(&'static str),

    /// A fault captured from a worker half, rethrown on an administrative thread.
    #[error("worker fault on port {port}")]
    Worker {
        port: PortId,
        #[source]
        cause: Box<Error>,
    },

    /// The native thread began a new cycle before the previous one completed.
    #[error("xrun: previous cycle not complete at cycle start")]
    XRun,

    /// No free chain slot, or a per-cycle event buffer is full.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    /// An outgoing MIDI event's frame offset went backwards within a cycle.
    #[error("midi event out of order at frame {frame}")]
    OutOfOrderEvent { frame: u32 },

    /// No port with the given id is hooked into the chain.
    #[error("port {0} not found")]
    PortNotFound(PortId),

    /// A host listener callback reported a failure.
    #[error("host listener failed during {during}")]
    HostBridge {
        during: &'static str,
        #[source]
        cause: BoxedCause,
    },

    /// A server client call reported a failure.
    #[error("server call failed during {during}")]
    Server {
        during: &'static str,
        #[source]
        cause: BoxedCause,
    },

    /// The configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn wrong_state(action: &'static str, state: impl Into<String>) -> Self {
        Error::WrongState {
            action,
            state: state.into(),
        }
    }

    pub(crate) fn host_bridge(during: &'static str, cause: BoxedCause) -> Self {
        Error::HostBridge { during, cause }
    }

    /// True for faults that indicate an expired bounded wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
