//! Concrete input port: server → host.

use crate::config::LinkConfig;
use crate::event::{EventBuffer, TimeCode};
use crate::listener::InputPortListener;
use crate::port::{Port, PortDriver, PortId};
use crate::server::{Direction, ServerClient, ServerPortHandle};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Driver of an input port. The native half copies this cycle's events
/// out of the server into a local buffer; the host half hands the buffer
/// to the listener. The rendezvous automaton guarantees the two halves
/// never touch the buffer concurrently.
pub struct InputPortDriver {
    name: String,
    listener: Arc<dyn InputPortListener>,
    handle: Mutex<Option<ServerPortHandle>>,
    buffer: Mutex<EventBuffer>,
}

impl InputPortDriver {
    pub fn new(
        name: impl Into<String>,
        listener: Arc<dyn InputPortListener>,
        max_midi_events: usize,
    ) -> Self {
        Self {
            name: name.into(),
            listener,
            handle: Mutex::new(None),
            buffer: Mutex::new(EventBuffer::new(max_midi_events)),
        }
    }
}

impl PortDriver for InputPortDriver {
    fn open(&self) -> Result<()> {
        self.listener
            .on_open()
            .map_err(|cause| Error::host_bridge("on_open", cause))
    }

    fn register(&self, client: &dyn ServerClient) -> Result<()> {
        let handle = client.register_port(&self.name, Direction::Input)?;
        tracing::debug!(port = %self.name, "registered input port at server");
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn process_host(&self, time_code: TimeCode, last_cycle: bool) -> Result<()> {
        let buffer = self.buffer.lock();
        self.listener
            .process(time_code, last_cycle, buffer.events())
            .map_err(|cause| Error::host_bridge("process", cause))
    }

    fn process_native(&self, time_code: TimeCode, client: &dyn ServerClient) -> Result<()> {
        let handle = (*self.handle.lock())
            .ok_or(Error::wrong_state("read events", "on an unregistered port"))?;
        let mut buffer = self.buffer.lock();
        buffer.clear();
        client.read_events(handle, time_code.duration, &mut buffer)
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, client: &dyn ServerClient) -> Result<()> {
        let handle = self.handle.lock().take().ok_or(Error::wrong_state(
            "unregister",
            "an input port with no server handle",
        ))?;
        client.unregister_port(handle)?;
        tracing::debug!(port = %self.name, "unregistered input port from server");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.listener
            .on_close()
            .map_err(|cause| Error::host_bridge("on_close", cause))
    }
}

/// Creates an input port around the given listener.
pub fn input_port(
    id: PortId,
    name: impl Into<String>,
    listener: Arc<dyn InputPortListener>,
    config: &LinkConfig,
) -> Port {
    Port::new(
        id,
        Direction::Input,
        Box::new(InputPortDriver::new(name, listener, config.max_midi_events)),
        config,
    )
}
