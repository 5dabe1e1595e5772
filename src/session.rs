//! Process-wide session object.
//!
//! One session owns one server connection, one port chain and one system
//! monitor. The audio-server glue holds an `Arc<Session>` and calls
//! [`Session::native_cycle`] from its process callback; the host worker
//! thread calls [`Session::run`]; administrative threads open and close
//! ports. There are no module-level globals.

use crate::chain::PortChain;
use crate::config::LinkConfig;
use crate::event::TimeCode;
use crate::flag::AtomicFlag;
use crate::listener::{InputPortListener, OutputPortListener, SystemListener};
use crate::monitor::SystemMonitor;
use crate::port::{end_control_port, input_port, output_port, start_control_port, PortId};
use crate::server::ServerClient;
use crate::{Error, Result};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Builder for a [`Session`], following the engine's configuration knobs.
#[derive(Debug, Default)]
pub struct SessionBuilder {
    config: LinkConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_ports(mut self, max_ports: usize) -> Self {
        self.config.max_ports = max_ports;
        self
    }

    pub fn max_waiting_time(mut self, bound: std::time::Duration) -> Self {
        self.config.max_waiting_time = bound;
        self
    }

    pub fn slot_timeout(mut self, bound: std::time::Duration) -> Self {
        self.config.slot_timeout = bound;
        self
    }

    pub fn state_lock_timeout(mut self, bound: std::time::Duration) -> Self {
        self.config.state_lock_timeout = bound;
        self
    }

    pub fn max_midi_events(mut self, capacity: usize) -> Self {
        self.config.max_midi_events = capacity;
        self
    }

    /// Opens the session: embeds the chain (with its two control ports)
    /// into the host environment, registers it at the server, and
    /// activates the connection monitor.
    pub fn open(
        self,
        client: Arc<dyn ServerClient>,
        listener: Arc<dyn SystemListener>,
    ) -> Result<Session> {
        Session::open(self.config, client, listener)
    }
}

/// A midilink session.
pub struct Session {
    config: LinkConfig,
    client: Arc<dyn ServerClient>,
    chain: PortChain,
    monitor: SystemMonitor,
    /// Gates the native callback until `run` has started the chain.
    active: AtomicFlag,
    next_port_id: AtomicI64,
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// See [`SessionBuilder::open`].
    pub fn open(
        config: LinkConfig,
        client: Arc<dyn ServerClient>,
        listener: Arc<dyn SystemListener>,
    ) -> Result<Session> {
        config.validate()?;

        let chain = PortChain::new(&config);
        let start_control = start_control_port(listener.clone(), &config);
        let end_control = end_control_port(listener.clone(), &config);
        chain.initialize(start_control, end_control)?;
        chain.register_at_server(client.as_ref())?;

        let monitor = SystemMonitor::new();
        monitor.initialize(listener)?;
        monitor.activate()?;

        tracing::debug!("session opened");
        Ok(Session {
            config,
            client,
            chain,
            monitor,
            active: AtomicFlag::new(false),
            next_port_id: AtomicI64::new(1),
        })
    }

    /// Runs the host side of the session on the calling thread. Starts
    /// the chain, enables the native callback and does not return until
    /// the session ends.
    pub fn run(&self) -> Result<()> {
        if !self.chain.is_registered() {
            return Err(Error::wrong_state(
                "run session",
                "with the chain not registered",
            ));
        }
        if self.active.get() {
            return Err(Error::wrong_state("run session", "while already active"));
        }
        self.chain.start()?;
        self.active.set(true);
        self.chain.run_host_loop()
    }

    /// Body of the audio server's process callback. Never fails towards
    /// the server: overruns are logged and the cycle skipped.
    pub fn native_cycle(&self, time_code: TimeCode) {
        if !self.active.get() {
            tracing::warn!("native cycle before session activation");
            return;
        }
        match self.chain.exec_native_cycle(time_code, self.client.as_ref()) {
            Ok(()) => {}
            Err(Error::XRun) => {
                tracing::warn!(start = time_code.start, "xrun, skipping cycle");
            }
            Err(error) => {
                tracing::error!("native cycle failed: {error}");
            }
        }
    }

    /// Opens an input port and hooks it into the running chain.
    pub fn create_input_port(
        &self,
        name: impl Into<String>,
        listener: Arc<dyn InputPortListener>,
    ) -> Result<PortId> {
        let id = self.next_port_id.fetch_add(1, Ordering::AcqRel);
        let port = input_port(id, name, listener, &self.config);
        port.initialize()?;
        self.chain.add_port(port, Some(self.client.as_ref()))?;
        Ok(id)
    }

    /// Opens an output port and hooks it into the running chain.
    pub fn create_output_port(
        &self,
        name: impl Into<String>,
        listener: Arc<dyn OutputPortListener>,
    ) -> Result<PortId> {
        let id = self.next_port_id.fetch_add(1, Ordering::AcqRel);
        let port = output_port(id, name, listener, &self.config);
        port.initialize()?;
        self.chain.add_port(port, Some(self.client.as_ref()))?;
        Ok(id)
    }

    /// Shuts a port down, removes it from the chain, and surfaces the
    /// fault its worker halves may have latched.
    pub fn close_port(&self, id: PortId) -> Result<()> {
        let removed = self.chain.remove_port(self.client.as_ref(), id)?;
        if let Some(fault) = removed.take_fault() {
            return Err(fault.into_error());
        }
        Ok(())
    }

    pub fn port_exists(&self, id: PortId) -> Result<bool> {
        self.chain.port_exists(id)
    }

    /// Number of ports in the chain, control ports included.
    pub fn port_count(&self) -> usize {
        self.chain.port_count()
    }

    /// Synchronous barrier on the end control-port's cycle completion.
    pub fn wait_for_cycle_done(&self) -> Result<()> {
        self.chain.wait_for_cycle_done()
    }

    /// First fault latched by any port's worker half, taken exactly once.
    pub fn retrieve_process_fault(&self) -> Option<crate::ProcessFault> {
        self.chain.retrieve_process_fault()
    }

    /// Ends the session: stops the chain, shuts down the monitor and the
    /// chain, and rethrows the first latched worker fault. Callers must
    /// drain the fault before discarding the session.
    pub fn close(&self) -> Result<()> {
        if self.chain.is_running() {
            self.chain.stop()?;
        }
        self.active.set(false);

        self.monitor.shutdown();
        self.chain.shutdown(self.client.as_ref())?;

        if let Some(fault) = self.chain.retrieve_process_fault() {
            return Err(fault.into_error());
        }
        if let Some(fault) = self.monitor.take_fault() {
            return Err(fault);
        }
        tracing::debug!("session closed");
        Ok(())
    }

    /// Callback entry for server connection-change notifications.
    pub fn connection_changed(&self) {
        self.monitor.connection_changed();
    }

    pub fn chain(&self) -> &PortChain {
        &self.chain
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("chain", &self.chain)
            .field("active", &self.active.get())
            .finish()
    }
}
