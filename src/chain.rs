//! The port chain: an ordered collection of guarded slots driven
//! together each audio cycle.
//!
//! Input ports occupy contiguous slots from the front (after the start
//! control-port in slot 0), output ports from the back (before the end
//! control-port in the last slot), so each native cycle initializes and
//! processes inputs before outputs. The chain's own life-cycle mirrors
//! the port life-cycle; every administrative operation walks the held
//! ports so their state stays compatible with the chain's.

use crate::config::LinkConfig;
use crate::event::TimeCode;
use crate::fault::ProcessFault;
use crate::flag::{AtomicCell8, AtomicFlag};
use crate::port::{Port, PortId};
use crate::server::{Direction, ServerClient};
use crate::slot::GuardedSlot;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Life-cycle states of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Created,
    Initialized,
    Registered,
    Running,
    Stopped,
    Unregistered,
    Deletable,
}

impl ChainState {
    fn as_u8(self) -> u8 {
        match self {
            ChainState::Created => 0,
            ChainState::Initialized => 1,
            ChainState::Registered => 2,
            ChainState::Running => 3,
            ChainState::Stopped => 4,
            ChainState::Unregistered => 5,
            ChainState::Deletable => 6,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChainState::Created,
            1 => ChainState::Initialized,
            2 => ChainState::Registered,
            3 => ChainState::Running,
            4 => ChainState::Stopped,
            5 => ChainState::Unregistered,
            _ => ChainState::Deletable,
        }
    }

    fn describe(self) -> String {
        format!("in {self:?} state").to_lowercase()
    }
}

/// Ordered collection of ports executed together each audio cycle.
pub struct PortChain {
    /// Every entry is either empty or holds a port in a state compatible
    /// with the chain's. Slot 0 and the last slot are reserved for the
    /// control ports after initialization.
    slots: Box<[GuardedSlot]>,
    state: Mutex<ChainState>,
    /// Mirror of `state` for the worker loops, which must not contend on
    /// the state mutex.
    state_mirror: AtomicCell8,
    state_changed: Condvar,
    /// Latched when the next cycle is the last one of the session.
    last_cycle: AtomicFlag,
    /// Held by `run_host_loop` for its whole lifetime; at most one host
    /// loop runs.
    host_mutex: Mutex<()>,
    port_count: AtomicUsize,
    state_lock_timeout: Duration,
}

impl PortChain {
    pub fn new(config: &LinkConfig) -> Self {
        let slots: Vec<GuardedSlot> = (0..config.max_ports)
            .map(|_| GuardedSlot::new(config.slot_timeout))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            state: Mutex::new(ChainState::Created),
            state_mirror: AtomicCell8::new(ChainState::Created.as_u8()),
            state_changed: Condvar::new(),
            last_cycle: AtomicFlag::new(false),
            host_mutex: Mutex::new(()),
            port_count: AtomicUsize::new(0),
            state_lock_timeout: config.state_lock_timeout,
        }
    }

    fn last_slot(&self) -> usize {
        self.slots.len() - 1
    }

    fn lock_state(&self, action: &'static str) -> Result<MutexGuard<'_, ChainState>> {
        self.state
            .try_lock_for(self.state_lock_timeout)
            .ok_or(Error::Timeout(action))
    }

    fn set_state(&self, st: &mut ChainState, new: ChainState) {
        *st = new;
        self.state_mirror.set(new.as_u8());
    }

    /// Lock-free state read for the worker loops.
    fn snapshot_state(&self) -> ChainState {
        ChainState::from_u8(self.state_mirror.get())
    }

    pub fn state(&self) -> ChainState {
        self.snapshot_state()
    }

    pub fn is_created(&self) -> bool {
        self.snapshot_state() == ChainState::Created
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot_state() == ChainState::Initialized
    }

    pub fn is_registered(&self) -> bool {
        self.snapshot_state() == ChainState::Registered
    }

    pub fn is_running(&self) -> bool {
        self.snapshot_state() == ChainState::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.snapshot_state() == ChainState::Stopped
    }

    pub fn is_unregistered(&self) -> bool {
        self.snapshot_state() == ChainState::Unregistered
    }

    pub fn is_deletable(&self) -> bool {
        self.snapshot_state() == ChainState::Deletable
    }

    /// Number of ports currently held, control ports included.
    pub fn port_count(&self) -> usize {
        self.port_count.load(Ordering::Acquire)
    }

    // ==================== life-cycle ====================

    /// Embeds the chain into the host environment: initializes the two
    /// control ports and installs them at the chain's extremities.
    pub fn initialize(&self, start_control: Port, end_control: Port) -> Result<()> {
        let mut st = self.lock_state("initialize")?;
        if *st != ChainState::Created {
            return Err(Error::wrong_state("initialize chain", st.describe()));
        }
        if !start_control.is_input() {
            return Err(Error::wrong_state(
                "initialize chain",
                "with a non-input start control port",
            ));
        }
        if !start_control.is_created() {
            return Err(Error::wrong_state(
                "initialize chain",
                "with a start control port not in created state",
            ));
        }
        if !end_control.is_output() {
            return Err(Error::wrong_state(
                "initialize chain",
                "with a non-output end control port",
            ));
        }
        if !end_control.is_created() {
            return Err(Error::wrong_state(
                "initialize chain",
                "with an end control port not in created state",
            ));
        }

        start_control.initialize()?;
        end_control.initialize()?;

        self.install_port(start_control, 0, *st, None)?;
        self.install_port(end_control, self.last_slot(), *st, None)?;

        self.set_state(&mut st, ChainState::Initialized);
        self.state_changed.notify_all();
        Ok(())
    }

    /// Subscribes all ports at the MIDI server.
    pub fn register_at_server(&self, client: &dyn ServerClient) -> Result<()> {
        let mut st = self.lock_state("register_at_server")?;
        if *st != ChainState::Initialized {
            return Err(Error::wrong_state("register chain", st.describe()));
        }
        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                port.register(client)?;
            }
        }
        self.set_state(&mut st, ChainState::Registered);
        self.state_changed.notify_all();
        Ok(())
    }

    /// Transits all ports into the running state.
    pub fn start(&self) -> Result<()> {
        let mut st = self.lock_state("start")?;
        if *st != ChainState::Registered {
            return Err(Error::wrong_state("start chain", st.describe()));
        }
        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                port.start()?;
            }
        }
        self.set_state(&mut st, ChainState::Running);
        self.state_changed.notify_all();
        Ok(())
    }

    /// Transits all ports into the stopped state. Blocks until the host
    /// loop has returned.
    pub fn stop(&self) -> Result<()> {
        let mut st = self.lock_state("stop")?;
        self.stop_locked(&mut st)?;
        self.state_changed.notify_all();
        Ok(())
    }

    fn stop_locked(&self, st: &mut ChainState) -> Result<()> {
        if *st != ChainState::Running {
            return Err(Error::wrong_state("stop chain", st.describe()));
        }

        // last orders: with cooperating worker threads every port will
        // now run its final cycle and terminate
        self.last_cycle.set(true);

        let forced = {
            let accessor = self.slots[self.last_slot()].accessor();
            let end = accessor.port().ok_or(Error::wrong_state(
                "stop chain",
                "without an end control port",
            ))?;
            match end.wait_for_terminated() {
                Ok(()) => false,
                Err(Error::Timeout(_)) => true,
                Err(other) => return Err(other),
            }
        };
        if forced {
            tracing::warn!("chain did not terminate in time, forcing port stop");
        }

        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                port.stop(forced)?;
            }
        }
        self.set_state(st, ChainState::Stopped);

        // wait for the host loop to end
        let _host = self
            .host_mutex
            .try_lock_for(self.state_lock_timeout)
            .ok_or(Error::Timeout("stop: waiting for the host loop"))?;
        Ok(())
    }

    /// Withdraws all ports' server subscriptions.
    pub fn unregister_at_server(&self, client: &dyn ServerClient) -> Result<()> {
        let mut st = self.lock_state("unregister_at_server")?;
        if !matches!(*st, ChainState::Stopped | ChainState::Registered) {
            return Err(Error::wrong_state("unregister chain", st.describe()));
        }
        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                port.unregister(client)?;
            }
        }
        self.set_state(&mut st, ChainState::Unregistered);
        self.state_changed.notify_all();
        Ok(())
    }

    /// Detaches all ports from the host environment.
    pub fn uninitialize(&self) -> Result<()> {
        let mut st = self.lock_state("uninitialize")?;
        self.uninitialize_locked(&mut st)?;
        self.state_changed.notify_all();
        Ok(())
    }

    fn uninitialize_locked(&self, st: &mut ChainState) -> Result<()> {
        if !matches!(
            *st,
            ChainState::Unregistered | ChainState::Initialized | ChainState::Created
        ) {
            return Err(Error::wrong_state("uninitialize chain", st.describe()));
        }
        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                port.uninitialize()?;
            }
        }
        self.set_state(st, ChainState::Deletable);
        Ok(())
    }

    /// Collapses the chain and all its ports to the deletable state,
    /// regardless of the current state. Idempotent.
    pub fn shutdown(&self, client: &dyn ServerClient) -> Result<()> {
        // release the host loop whatever happens
        self.state_changed.notify_all();
        let mut st = self.lock_state("shutdown")?;
        match *st {
            ChainState::Created
            | ChainState::Initialized
            | ChainState::Unregistered => {
                self.uninitialize_locked(&mut st)?;
            }
            ChainState::Registered | ChainState::Stopped => {
                self.unregister_walk(client)?;
                self.set_state(&mut st, ChainState::Unregistered);
                self.uninitialize_locked(&mut st)?;
            }
            ChainState::Running => {
                self.stop_locked(&mut st)?;
                self.unregister_walk(client)?;
                self.set_state(&mut st, ChainState::Unregistered);
                self.uninitialize_locked(&mut st)?;
            }
            ChainState::Deletable => {}
        }
        self.set_state(&mut st, ChainState::Deletable);
        self.state_changed.notify_all();
        Ok(())
    }

    fn unregister_walk(&self, client: &dyn ServerClient) -> Result<()> {
        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                port.unregister(client)?;
            }
        }
        Ok(())
    }

    // ==================== per-cycle driving ====================

    /// Runs one native cycle over all ports, in slot order. Called from
    /// the audio server's thread; takes no chain-wide lock and relies on
    /// the slot accessors and the per-port automata.
    ///
    /// Returns without work when the chain has been stopped between
    /// callbacks; reports [`Error::XRun`] when the previous cycle had
    /// not completed.
    pub fn exec_native_cycle(&self, time_code: TimeCode, client: &dyn ServerClient) -> Result<()> {
        {
            let accessor = self.slots[self.last_slot()].accessor();
            let end = accessor.port().ok_or(Error::wrong_state(
                "run a native cycle",
                "without an end control port",
            ))?;
            if !end.is_running() {
                return Ok(());
            }
            if end.is_terminated() {
                return Ok(());
            }
            if !end.is_cycle_done() && !end.is_started() {
                if end.is_running() {
                    return Err(Error::XRun);
                }
                // stopped meanwhile
                return Ok(());
            }
        }

        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                port.exec_native_cycle_init(time_code);
            }
        }
        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                // output ports wait here for the host half of the cycle
                port.exec_native_process(client);
            }
        }
        Ok(())
    }

    /// Runs the host half of one cycle over all ports, in slot order.
    fn exec_host_cycle(&self, last_cycle: bool) {
        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                port.exec_host_process(last_cycle);
            }
        }
    }

    /// Runs the host side of the session on the calling thread. Returns
    /// once the chain has stopped or the start control-port terminated.
    /// At most one host loop runs at a time.
    pub fn run_host_loop(&self) -> Result<()> {
        let _host = self
            .host_mutex
            .try_lock_for(self.state_lock_timeout)
            .ok_or(Error::Timeout("run_host_loop"))?;

        self.wait_for_first_cycle()?;

        loop {
            if self.snapshot_state() != ChainState::Running {
                break;
            }
            {
                let accessor = self.slots[0].accessor();
                let start = accessor.port().ok_or(Error::wrong_state(
                    "run host cycles",
                    "without a start control port",
                ))?;
                if start.is_terminated() {
                    break;
                }
                if !start.is_running() {
                    // the start control stopped on error; there will be no
                    // further rendezvous to sleep on
                    tracing::warn!("host loop exiting: start control port left running state");
                    break;
                }
            }
            self.exec_host_cycle(self.last_cycle.get());
        }
        Ok(())
    }

    /// Sleeps until the chain starts and the start control-port has seen
    /// its first cycle-init, so the host loop neither spins on an idle
    /// chain nor misses the session start.
    fn wait_for_first_cycle(&self) -> Result<()> {
        {
            let mut st = self.lock_state("run_host_loop")?;
            while matches!(
                *st,
                ChainState::Created | ChainState::Initialized | ChainState::Registered
            ) {
                if self
                    .state_changed
                    .wait_for(&mut st, self.state_lock_timeout)
                    .timed_out()
                {
                    return Err(Error::Timeout("run_host_loop: waiting for chain start"));
                }
            }
        }

        while self.snapshot_state() == ChainState::Running {
            {
                let accessor = self.slots[0].accessor();
                let start = accessor.port().ok_or(Error::wrong_state(
                    "wait for the first cycle",
                    "without a start control port",
                ))?;
                if start.is_host_to_exec() {
                    break;
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    // ==================== port management ====================

    /// Adds a port to the chain. The port must be initialized; it is
    /// driven forward to the chain's state before it becomes visible in
    /// its slot. `client` may be omitted only while the chain has not
    /// registered with the server.
    pub fn add_port(&self, port: Port, client: Option<&dyn ServerClient>) -> Result<()> {
        let st = self.lock_state("add_port")?;

        if !port.is_initialized() {
            return Err(Error::wrong_state(
                "add a port",
                format!("that is {}", port.main_state().describe()),
            ));
        }
        if port.id() < crate::port::START_CONTROL_ID {
            return Err(Error::wrong_state("add a port", "with an invalid id"));
        }
        if !matches!(
            *st,
            ChainState::Created
                | ChainState::Initialized
                | ChainState::Registered
                | ChainState::Running
        ) {
            return Err(Error::wrong_state(
                "add a port",
                "to a chain that is about to shut down",
            ));
        }
        if matches!(*st, ChainState::Registered | ChainState::Running) && client.is_none() {
            return Err(Error::wrong_state(
                "register a new port",
                "without a server client",
            ));
        }

        let index = self.find_slot_for(port.direction())?;
        self.install_port(port, index, *st, client)?;
        self.state_changed.notify_all();
        Ok(())
    }

    /// Brings `port` to a state compatible with `chain_state`, then
    /// installs it. No period exists in which a visible port could be
    /// executed in a wrong state.
    fn install_port(
        &self,
        port: Port,
        index: usize,
        chain_state: ChainState,
        client: Option<&dyn ServerClient>,
    ) -> Result<()> {
        match chain_state {
            ChainState::Registered => {
                let client = client.ok_or(Error::wrong_state(
                    "register a new port",
                    "without a server client",
                ))?;
                port.register(client)?;
            }
            ChainState::Running => {
                let client = client.ok_or(Error::wrong_state(
                    "register a new port",
                    "without a server client",
                ))?;
                port.register(client)?;
                port.start()?;
            }
            _ => {}
        }

        self.slots[index].set_item_wait(Arc::new(port))?;
        self.port_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Shuts the port down through a short-lived accessor (so concurrent
    /// host-cycle waiters observe the transition), then takes ownership
    /// out of the slot and hands the port to the caller. The caller may
    /// inspect its fault slot.
    pub fn remove_port(&self, client: &dyn ServerClient, id: PortId) -> Result<Arc<Port>> {
        let _st = self.lock_state("remove_port")?;

        let index = self.find_slot_of(id).ok_or(Error::PortNotFound(id))?;
        {
            let accessor = self.slots[index].accessor();
            let port = accessor.port().ok_or(Error::PortNotFound(id))?;
            port.shutdown(client, false)?;
        }
        let port = self.slots[index].remove_item_wait()?;
        self.port_count.fetch_sub(1, Ordering::AcqRel);
        self.state_changed.notify_all();
        Ok(port)
    }

    /// True if a port with the given id is currently hooked in.
    pub fn port_exists(&self, id: PortId) -> Result<bool> {
        let _st = self.lock_state("port_exists")?;
        Ok(self.find_slot_of(id).is_some())
    }

    /// Slot index of the port with the given id, for diagnostics.
    pub fn slot_index_of(&self, id: PortId) -> Result<Option<usize>> {
        let _st = self.lock_state("slot_index_of")?;
        Ok(self.find_slot_of(id))
    }

    /// Synchronous barrier on the end control-port's cycle completion.
    pub fn wait_for_cycle_done(&self) -> Result<()> {
        let accessor = self.slots[self.last_slot()].accessor();
        let end = accessor.port().ok_or(Error::wrong_state(
            "wait for cycle done",
            "without an end control port",
        ))?;
        end.wait_for_cycle_done()
    }

    /// First latched worker fault across all ports, taken exactly once.
    pub fn retrieve_process_fault(&self) -> Option<ProcessFault> {
        for slot in self.slots.iter() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                if let Some(fault) = port.take_fault() {
                    return Some(fault);
                }
            }
        }
        None
    }

    // ==================== slot policy ====================

    fn find_slot_for(&self, direction: Direction) -> Result<usize> {
        match direction {
            Direction::Input => self.find_slot_for_input(),
            Direction::Output => self.find_slot_for_output(),
        }
    }

    /// Input ports fill from the front; holes left by removals are
    /// reused by the next input insertion.
    fn find_slot_for_input(&self) -> Result<usize> {
        // slot 0 is reserved for the start control
        if self.slots[1].accessor().is_empty() {
            return Ok(1);
        }
        for index in 1..self.slots.len() {
            if self.slots[index].accessor().has_item() {
                continue;
            }
            let predecessor = self.slots[index - 1].accessor();
            if let Some(port) = predecessor.port() {
                if port.is_input() {
                    return Ok(index);
                }
            }
        }
        Err(Error::CapacityExceeded("input port slots"))
    }

    /// Output ports fill from the back, symmetrically.
    fn find_slot_for_output(&self) -> Result<usize> {
        // the last slot is reserved for the end control
        let last = self.last_slot() - 1;
        if self.slots[last].accessor().is_empty() {
            return Ok(last);
        }
        for index in (0..last).rev() {
            if self.slots[index].accessor().has_item() {
                continue;
            }
            let successor = self.slots[index + 1].accessor();
            if let Some(port) = successor.port() {
                if port.is_output() {
                    return Ok(index);
                }
            }
        }
        Err(Error::CapacityExceeded("output port slots"))
    }

    fn find_slot_of(&self, id: PortId) -> Option<usize> {
        for (index, slot) in self.slots.iter().enumerate() {
            let accessor = slot.accessor();
            if let Some(port) = accessor.port() {
                if port.id() == id {
                    return Some(index);
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for PortChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortChain")
            .field("state", &self.snapshot_state())
            .field("ports", &self.port_count())
            .field("capacity", &self.slots.len())
            .finish()
    }
}
