//! Concrete output port: host → server.

use crate::config::LinkConfig;
use crate::event::{EventBuffer, TimeCode};
use crate::listener::OutputPortListener;
use crate::port::{Port, PortDriver, PortId};
use crate::server::{Direction, ServerClient, ServerPortHandle};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Driver of an output port. The host half lets the listener fill the
/// local buffer; the native half writes the buffered events to the
/// server, enforcing frame ordering.
pub struct OutputPortDriver {
    name: String,
    listener: Arc<dyn OutputPortListener>,
    handle: Mutex<Option<ServerPortHandle>>,
    buffer: Mutex<EventBuffer>,
}

impl OutputPortDriver {
    pub fn new(
        name: impl Into<String>,
        listener: Arc<dyn OutputPortListener>,
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

impl PortDriver for OutputPortDriver {
    fn open(&self) -> Result<()> {
        self.listener
            .on_open()
            .map_err(|cause| Error::host_bridge("on_open", cause))
    }

    fn register(&self, client: &dyn ServerClient) -> Result<()> {
        let handle = client.register_port(&self.name, Direction::Output)?;
        tracing::debug!(port = %self.name, "registered output port at server");
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn process_host(&self, time_code: TimeCode, last_cycle: bool) -> Result<()> {
        let mut buffer = self.buffer.lock();
        buffer.clear();
        self.listener
            .process(time_code, last_cycle, &mut buffer)
            .map_err(|cause| Error::host_bridge("process", cause))
    }

    fn process_native(&self, time_code: TimeCode, client: &dyn ServerClient) -> Result<()> {
        let handle = (*self.handle.lock())
            .ok_or(Error::wrong_state("write events", "on an unregistered port"))?;
        let buffer = self.buffer.lock();
        buffer.check_ordered()?;
        client.write_events(handle, time_code.duration, buffer.events())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn unregister(&self, client: &dyn ServerClient) -> Result<()> {
        let handle = self.handle.lock().take().ok_or(Error::wrong_state(
            "unregister",
            "an output port with no server handle",
        ))?;
        client.unregister_port(handle)?;
        tracing::debug!(port = %self.name, "unregistered output port from server");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.listener
            .on_close()
            .map_err(|cause| Error::host_bridge("on_close", cause))
    }
}

/// Creates an output port around the given listener.
pub fn output_port(
    id: PortId,
    name: impl Into<String>,
    listener: Arc<dyn OutputPortListener>,
    config: &LinkConfig,
) -> Port {
    Port::new(
        id,
        Direction::Output,
        Box::new(OutputPortDriver::new(name, listener, config.max_midi_events)),
        config,
    )
}
