//! Exception carrier for worker-thread faults.

use crate::error::Error;
use crate::port::PortId;
use std::fmt;

/// A fault captured in a worker half, pinned so it can be rethrown on an
/// administrative thread.
#[derive(Debug)]
pub struct ProcessFault {
    port: PortId,
    cause: Error,
}

impl ProcessFault {
    pub(crate) fn new(port: PortId, cause: Error) -> Self {
        Self { port, cause }
    }

    /// Id of the port whose worker half raised the fault.
    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn cause(&self) -> &Error {
        &self.cause
    }

    /// Converts the fault back into an error suitable for returning from
    /// an administrative call.
    pub fn into_error(self) -> Error {
        Error::Worker {
            port: self.port,
            cause: Box::new(self.cause),
        }
    }
}

impl fmt::Display for ProcessFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}: {}", self.port, self.cause)
    }
}

/// At-most-once fault container. The first latched fault wins; later
/// ones are discarded.
#[derive(Debug, Default)]
pub(crate) struct FaultSlot {
    fault: Option<ProcessFault>,
}

impl FaultSlot {
    pub(crate) fn latch(&mut self, fault: ProcessFault) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        } else {
            tracing::debug!(port = fault.port(), "discarding secondary fault: {}", fault);
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.fault.is_some()
    }

    pub(crate) fn take(&mut self) -> Option<ProcessFault> {
        self.fault.take()
    }
}
