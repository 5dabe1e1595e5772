//! The two pseudo-ports at the chain extremities.
//!
//! Control ports do no MIDI I/O. They fire the session-wide listener
//! callbacks and keep the rendezvous machine alive when the chain holds
//! no user ports, so the host loop can sleep-wait instead of spinning.

use crate::config::LinkConfig;
use crate::event::TimeCode;
use crate::listener::SystemListener;
use crate::port::{Port, PortDriver, END_CONTROL_ID, START_CONTROL_ID};
use crate::server::{Direction, ServerClient};
use crate::{Error, Result};
use std::sync::Arc;

/// Driver of a start or end control-port.
///
/// The start control (an input port, so it runs first each cycle) fires
/// `on_cycle_start` and owns the single `on_open`; the end control (an
/// output port, so it runs last) fires `on_cycle_end` and owns the
/// single `on_close`.
pub struct ControlPortDriver {
    listener: Arc<dyn SystemListener>,
    direction: Direction,
}

impl ControlPortDriver {
    fn new(listener: Arc<dyn SystemListener>, direction: Direction) -> Self {
        Self {
            listener,
            direction,
        }
    }
}

impl PortDriver for ControlPortDriver {
    fn open(&self) -> Result<()> {
        if self.direction.is_input() {
            self.listener
                .on_open()
                .map_err(|cause| Error::host_bridge("on_open", cause))?;
        }
        Ok(())
    }

    fn register(&self, _client: &dyn ServerClient) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn process_host(&self, time_code: TimeCode, last_cycle: bool) -> Result<()> {
        if self.direction.is_input() {
            self.listener
                .on_cycle_start(time_code, last_cycle)
                .map_err(|cause| Error::host_bridge("on_cycle_start", cause))
        } else {
            self.listener
                .on_cycle_end(time_code, last_cycle)
                .map_err(|cause| Error::host_bridge("on_cycle_end", cause))
        }
    }

    fn process_native(&self, _time_code: TimeCode, _client: &dyn ServerClient) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, _client: &dyn ServerClient) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.direction.is_output() {
            self.listener
                .on_close()
                .map_err(|cause| Error::host_bridge("on_close", cause))?;
        }
        Ok(())
    }
}

/// Creates the start control-port (input direction, id −2).
pub fn start_control_port(listener: Arc<dyn SystemListener>, config: &LinkConfig) -> Port {
    Port::new(
        START_CONTROL_ID,
        Direction::Input,
        Box::new(ControlPortDriver::new(listener, Direction::Input)),
        config,
    )
}

/// Creates the end control-port (output direction, id −1).
pub fn end_control_port(listener: Arc<dyn SystemListener>, config: &LinkConfig) -> Port {
    Port::new(
        END_CONTROL_ID,
        Direction::Output,
        Box::new(ControlPortDriver::new(listener, Direction::Output)),
        config,
    )
}
