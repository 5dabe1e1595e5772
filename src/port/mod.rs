//! Per-port life-cycle and per-cycle rendezvous state machine.
//!
//! A port mediates one logical MIDI stream in one direction between the
//! audio server and the host. Each cycle, the server's real-time thread
//! and the host worker thread trade execution turns on the port: the two
//! halves of a cycle strictly alternate, and the per-port condition
//! variable is the rendezvous point. An input port runs its native half
//! first (it reads hardware events); an output port runs its host half
//! first (it supplies them).
//!
//! Everything that touches the server or the host listeners is deferred
//! to a [`PortDriver`]; this module owns only the synchronization.

mod control;
mod input;
mod output;

pub use control::{end_control_port, start_control_port, ControlPortDriver};
pub use input::{input_port, InputPortDriver};
pub use output::{output_port, OutputPortDriver};

use crate::config::LinkConfig;
use crate::event::TimeCode;
use crate::fault::{FaultSlot, ProcessFault};
use crate::server::{Direction, ServerClient};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::mem;
use std::time::Duration;

/// Application-unique port identifier.
pub type PortId = i64;

/// Marks the remains of a drained port (see [`Port::take`]).
pub const INVALID_PORT_ID: PortId = i64::MIN;

/// Reserved id of the start control-port.
pub const START_CONTROL_ID: PortId = -2;

/// Reserved id of the end control-port.
pub const END_CONTROL_ID: PortId = -1;

/// Sub-states of [`MainState::Running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Running was just entered; no cycle has been initialized yet.
    Started,
    /// The host thread must execute, the native thread waits.
    HostToExec,
    /// The native thread must execute, the host thread waits.
    NativeToExec,
    /// A complete cycle has been executed.
    CycleDone,
    /// The native thread must terminate the last cycle (output ports only).
    NativeToTerminate,
    /// The running state is terminated.
    Terminated,
}

/// Main life-cycle states of a port.
///
/// The running sub-state lives inside [`MainState::Running`], so a port
/// outside `Running` structurally has no sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    /// The port is created.
    Created,
    /// The port is embedded in the host environment.
    Initialized,
    /// The port has registered with the MIDI server.
    Registered,
    /// The port is processing callbacks from both sides.
    Running(RunState),
    /// The port stopped processing because of an error.
    StoppedOnError,
    /// The port stopped processing.
    Stopped,
    /// The port has unregistered from the MIDI server.
    Unregistered,
    /// The port has detached from the host environment and can be dropped.
    Deletable,
}

impl MainState {
    /// States past `Running` in the life-cycle order.
    fn is_past_running(self) -> bool {
        matches!(
            self,
            MainState::StoppedOnError
                | MainState::Stopped
                | MainState::Unregistered
                | MainState::Deletable
        )
    }

    pub(crate) fn describe(self) -> String {
        match self {
            MainState::Running(sub) => format!("in running state (sub-state: {sub})"),
            other => format!("in {other} state"),
        }
    }
}

impl fmt::Display for MainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MainState::Created => "created",
            MainState::Initialized => "initialized",
            MainState::Registered => "registered",
            MainState::Running(_) => "running",
            MainState::StoppedOnError => "stopped-on-error",
            MainState::Stopped => "stopped",
            MainState::Unregistered => "unregistered",
            MainState::Deletable => "deletable",
        };
        f.write_str(name)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Started => "started",
            RunState::HostToExec => "host-to-exec",
            RunState::NativeToExec => "native-to-exec",
            RunState::CycleDone => "cycle-done",
            RunState::NativeToTerminate => "native-to-terminate",
            RunState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// The half-operations a concrete port contributes.
///
/// The engine calls these under the port's state mutex; implementations
/// must not call back into the owning port. `process_host` runs on the
/// host worker thread, `process_native` on the audio-server thread;
/// everything else runs on administrative threads.
pub trait PortDriver: Send + Sync {
    /// Embeds the port in the host environment; fires the listener's
    /// `on_open`. Not called from the audio thread, and the host process
    /// callback is never invoked before `open` has returned.
    fn open(&self) -> Result<()>;

    /// Subscribes the port at the MIDI server.
    fn register(&self, client: &dyn ServerClient) -> Result<()>;

    fn start(&self) -> Result<()>;

    /// The host half of one cycle.
    fn process_host(&self, time_code: TimeCode, last_cycle: bool) -> Result<()>;

    /// The native half of one cycle.
    fn process_native(&self, time_code: TimeCode, client: &dyn ServerClient) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Withdraws the port's server subscription.
    fn unregister(&self, client: &dyn ServerClient) -> Result<()>;

    /// Undoes `open`; fires the listener's `on_close`. Never invoked
    /// while a host process callback is in flight.
    fn close(&self) -> Result<()>;
}

/// Placeholder driver left behind in a drained port.
struct DrainedDriver;

impl PortDriver for DrainedDriver {
    fn open(&self) -> Result<()> {
        Ok(())
    }
    fn register(&self, _client: &dyn ServerClient) -> Result<()> {
        Ok(())
    }
    fn start(&self) -> Result<()> {
        Ok(())
    }
    fn process_host(&self, _time_code: TimeCode, _last_cycle: bool) -> Result<()> {
        Ok(())
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
        Ok(())
    }
}

struct PortState {
    id: PortId,
    main: MainState,
    time_code: TimeCode,
    last_cycle: bool,
    fault: FaultSlot,
}

/// A port of the chain: direction, identity, life-cycle automaton and
/// per-cycle rendezvous machinery around a [`PortDriver`].
pub struct Port {
    direction: Direction,
    driver: Box<dyn PortDriver>,
    state: Mutex<PortState>,
    state_changed: Condvar,
    state_lock_timeout: Duration,
    max_waiting_time: Duration,
}

impl Port {
    pub fn new(
        id: PortId,
        direction: Direction,
        driver: Box<dyn PortDriver>,
        config: &LinkConfig,
    ) -> Self {
        Self {
            direction,
            driver,
            state: Mutex::new(PortState {
                id,
                main: MainState::Created,
                time_code: TimeCode::default(),
                last_cycle: false,
                fault: FaultSlot::default(),
            }),
            state_changed: Condvar::new(),
            state_lock_timeout: config.state_lock_timeout,
            max_waiting_time: config.max_waiting_time,
        }
    }

    fn lock_state(&self, action: &'static str) -> Result<MutexGuard<'_, PortState>> {
        self.state
            .try_lock_for(self.state_lock_timeout)
            .ok_or(Error::Timeout(action))
    }

    /// Latches `cause` and stops the port involuntarily.
    fn emergency_stop(&self, st: &mut PortState, cause: Error) {
        tracing::warn!(port = st.id, "emergency stop: {cause}");
        self.driver.stop().ok();
        st.main = MainState::StoppedOnError;
        let fault = ProcessFault::new(st.id, cause);
        st.fault.latch(fault);
        self.state_changed.notify_all();
    }

    // ==================== administrative operations ====================

    /// Embeds the port in the host environment.
    pub fn initialize(&self) -> Result<()> {
        let mut st = self.lock_state("initialize")?;
        if st.main != MainState::Created {
            return Err(Error::wrong_state("initialize", st.main.describe()));
        }
        self.driver.open()?;
        st.main = MainState::Initialized;
        self.state_changed.notify_all();
        Ok(())
    }

    /// Subscribes the port at the MIDI server. May fail if the port name
    /// is not unique.
    pub fn register(&self, client: &dyn ServerClient) -> Result<()> {
        let mut st = self.lock_state("register")?;
        if st.main != MainState::Initialized {
            return Err(Error::wrong_state("register", st.main.describe()));
        }
        self.driver.register(client)?;
        st.main = MainState::Registered;
        self.state_changed.notify_all();
        Ok(())
    }

    /// After this call the port participates in the next cycle.
    pub fn start(&self) -> Result<()> {
        let mut st = self.lock_state("start")?;
        if st.main != MainState::Registered {
            return Err(Error::wrong_state("start", st.main.describe()));
        }
        self.driver.start()?;
        st.main = MainState::Running(RunState::Started);
        self.state_changed.notify_all();
        Ok(())
    }

    /// Stops the worker processes. Latches the last-cycle flag and waits
    /// up to the rendezvous bound for the port to terminate; on expiry
    /// (or with `force` set) the port is stopped without waiting and a
    /// fault is latched. Afterwards the exec operations become no-ops.
    pub fn stop(&self, force: bool) -> Result<()> {
        let mut st = self.lock_state("stop")?;

        if st.main == MainState::StoppedOnError {
            st.main = MainState::Stopped;
            self.state_changed.notify_all();
            return Ok(());
        }
        if !matches!(st.main, MainState::Running(_) | MainState::Registered) {
            return Err(Error::wrong_state("stop", st.main.describe()));
        }

        st.last_cycle = true;

        let mut force = force;
        while !force && matches!(st.main, MainState::Running(sub) if sub != RunState::Terminated) {
            if self
                .state_changed
                .wait_for(&mut st, self.max_waiting_time)
                .timed_out()
            {
                force = true;
            }
        }

        if matches!(st.main, MainState::Running(sub) if sub != RunState::Terminated) {
            self.emergency_stop(&mut st, Error::Timeout("stop: port did not terminate"));
        } else {
            self.driver.stop()?;
        }
        st.main = MainState::Stopped;
        self.state_changed.notify_all();
        Ok(())
    }

    /// Withdraws the port's server subscription.
    pub fn unregister(&self, client: &dyn ServerClient) -> Result<()> {
        let mut st = self.lock_state("unregister")?;
        if !matches!(st.main, MainState::Stopped | MainState::Registered) {
            return Err(Error::wrong_state("unregister", st.main.describe()));
        }
        self.driver.unregister(client)?;
        st.main = MainState::Unregistered;
        self.state_changed.notify_all();
        Ok(())
    }

    /// Detaches the port from the host environment; fires `on_close`.
    pub fn uninitialize(&self) -> Result<()> {
        let mut st = self.lock_state("uninitialize")?;
        if !matches!(st.main, MainState::Unregistered | MainState::Initialized) {
            return Err(Error::wrong_state("uninitialize", st.main.describe()));
        }
        self.driver.close()?;
        st.main = MainState::Deletable;
        self.state_changed.notify_all();
        Ok(())
    }

    /// Drives the port to `Deletable` from any state. Errors raised by
    /// the tear-down sequence are latched into the fault slot instead of
    /// propagating; the port always ends up deletable.
    pub fn shutdown(&self, client: &dyn ServerClient, force: bool) -> Result<()> {
        let mut st = self.lock_state("shutdown")?;
        st.last_cycle = true;

        let mut force = force;
        while !force && matches!(st.main, MainState::Running(sub) if sub != RunState::Terminated) {
            if self
                .state_changed
                .wait_for(&mut st, self.max_waiting_time)
                .timed_out()
            {
                force = true;
            }
        }

        if let Err(cause) = self.shutdown_sequence(st.main, client) {
            let fault = ProcessFault::new(st.id, cause);
            st.fault.latch(fault);
        }

        st.main = MainState::Deletable;
        self.state_changed.notify_all();
        Ok(())
    }

    /// The tear-down suffix applicable from `from`.
    fn shutdown_sequence(&self, from: MainState, client: &dyn ServerClient) -> Result<()> {
        match from {
            MainState::Created | MainState::Deletable => Ok(()),
            MainState::Initialized => self.driver.close(),
            MainState::Registered
            | MainState::StoppedOnError
            | MainState::Stopped => {
                self.driver.unregister(client)?;
                self.driver.close()
            }
            MainState::Running(_) => {
                self.driver.stop()?;
                self.driver.unregister(client)?;
                self.driver.close()
            }
            MainState::Unregistered => self.driver.close(),
        }
    }

    // ==================== per-cycle operations ====================

    /// The native thread initiates a new cycle: stores the time-code and
    /// hands the first half to the direction-appropriate side. Outside
    /// `Running`, or once terminated, this is a no-op; in any other
    /// sub-state than `Started`/`CycleDone` it is a latched fault.
    pub fn exec_native_cycle_init(&self, time_code: TimeCode) {
        let mut st = self.state.lock();
        if let Err(cause) = self.cycle_init_locked(&mut st, time_code) {
            self.emergency_stop(&mut st, cause);
        }
    }

    fn cycle_init_locked(&self, st: &mut PortState, time_code: TimeCode) -> Result<()> {
        let sub = match st.main {
            MainState::Running(sub) => sub,
            _ => return Ok(()),
        };
        if sub == RunState::Terminated {
            return Ok(());
        }
        if !matches!(sub, RunState::CycleDone | RunState::Started) {
            return Err(Error::wrong_state(
                "exec_native_cycle_init",
                st.main.describe(),
            ));
        }

        st.time_code = time_code;
        st.main = MainState::Running(if self.direction.is_input() {
            RunState::NativeToExec
        } else {
            RunState::HostToExec
        });
        self.state_changed.notify_all();
        Ok(())
    }

    /// Runs the host half of the current cycle on the calling thread.
    ///
    /// Blocks (bounded) until the port's turn order hands execution to
    /// the host side, runs the driver's host half, advances the
    /// sub-state and broadcasts. Returns silently when the port is not
    /// running or the session is winding down; faults are latched, never
    /// propagated.
    pub fn exec_host_process(&self, last_cycle: bool) {
        let mut st = self.state.lock();
        if let Err(cause) = self.host_process_locked(&mut st, last_cycle) {
            self.emergency_stop(&mut st, cause);
        }
    }

    fn host_process_locked(&self, st: &mut MutexGuard<'_, PortState>, last_cycle: bool) -> Result<()> {
        match st.main {
            MainState::Running(RunState::Started)
            | MainState::Running(RunState::Terminated)
            | MainState::Running(RunState::NativeToTerminate) => return Ok(()),
            MainState::Running(_) => {}
            _ => return Ok(()),
        }

        loop {
            match st.main {
                MainState::Running(RunState::HostToExec) => break,
                MainState::Running(RunState::Terminated)
                | MainState::Running(RunState::NativeToTerminate) => return Ok(()),
                MainState::Running(_) => {
                    if self
                        .state_changed
                        .wait_for(st, self.max_waiting_time)
                        .timed_out()
                    {
                        return Err(Error::Timeout("exec_host_process"));
                    }
                }
                _ => return Ok(()),
            }
        }

        st.last_cycle |= last_cycle;
        let time_code = st.time_code;
        let last = st.last_cycle;
        self.driver.process_host(time_code, last)?;

        let next = if last {
            if self.direction.is_output() {
                // the native thread must do the last actions of the session
                RunState::NativeToTerminate
            } else {
                // on an input port the session ends with the host process
                RunState::Terminated
            }
        } else if self.direction.is_output() {
            RunState::NativeToExec
        } else {
            RunState::CycleDone
        };
        st.main = MainState::Running(next);
        self.state_changed.notify_all();
        Ok(())
    }

    /// Runs the native half of the current cycle. Called from the audio
    /// server's worker thread; faults are latched, never propagated.
    pub fn exec_native_process(&self, client: &dyn ServerClient) {
        let mut st = self.state.lock();
        if let Err(cause) = self.native_process_locked(&mut st, client) {
            self.emergency_stop(&mut st, cause);
        }
    }

    fn native_process_locked(
        &self,
        st: &mut MutexGuard<'_, PortState>,
        client: &dyn ServerClient,
    ) -> Result<()> {
        match st.main {
            MainState::Running(RunState::Started)
            | MainState::Running(RunState::Terminated) => return Ok(()),
            MainState::Running(_) => {}
            _ => return Ok(()),
        }

        loop {
            match st.main {
                MainState::Running(RunState::NativeToExec)
                | MainState::Running(RunState::NativeToTerminate) => break,
                MainState::Running(_) => {
                    if self
                        .state_changed
                        .wait_for(st, self.max_waiting_time)
                        .timed_out()
                    {
                        return Err(Error::Timeout("exec_native_process"));
                    }
                    if matches!(
                        st.main,
                        MainState::Running(RunState::Terminated)
                            | MainState::Running(RunState::CycleDone)
                            | MainState::Running(RunState::Started)
                    ) {
                        return Err(Error::wrong_state(
                            "exec_native_process",
                            st.main.describe(),
                        ));
                    }
                }
                // the port was closed while waiting
                _ => return Ok(()),
            }
        }

        let sub = match st.main {
            MainState::Running(sub) => sub,
            _ => return Ok(()),
        };
        if self.direction.is_input() && sub == RunState::NativeToTerminate {
            // an input port never processes the native-to-terminate state
            return Err(Error::wrong_state(
                "exec_native_process on an input port",
                st.main.describe(),
            ));
        }

        let time_code = st.time_code;
        self.driver.process_native(time_code, client)?;

        let next = if self.direction.is_input() {
            RunState::HostToExec
        } else if sub == RunState::NativeToTerminate {
            RunState::Terminated
        } else {
            RunState::CycleDone
        };
        st.main = MainState::Running(next);
        self.state_changed.notify_all();
        Ok(())
    }

    // ==================== observers ====================

    pub fn id(&self) -> PortId {
        self.state.lock().id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_input(&self) -> bool {
        self.direction.is_input()
    }

    pub fn is_output(&self) -> bool {
        self.direction.is_output()
    }

    pub fn main_state(&self) -> MainState {
        self.state.lock().main
    }

    pub fn is_created(&self) -> bool {
        self.main_state() == MainState::Created
    }

    pub fn is_initialized(&self) -> bool {
        self.main_state() == MainState::Initialized
    }

    pub fn is_registered(&self) -> bool {
        self.main_state() == MainState::Registered
    }

    pub fn is_running(&self) -> bool {
        matches!(self.main_state(), MainState::Running(_))
    }

    pub fn is_stopped(&self) -> bool {
        self.main_state() == MainState::Stopped
    }

    pub fn is_stopped_on_error(&self) -> bool {
        self.main_state() == MainState::StoppedOnError
    }

    pub fn is_unregistered(&self) -> bool {
        self.main_state() == MainState::Unregistered
    }

    /// True once the port has detached from the host environment. The
    /// dropping thread must still make sure no other thread can
    /// re-acquire the port while it is being dropped.
    pub fn is_deletable(&self) -> bool {
        self.main_state() == MainState::Deletable
    }

    fn run_state(&self) -> Option<RunState> {
        match self.main_state() {
            MainState::Running(sub) => Some(sub),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.run_state() == Some(RunState::Started)
    }

    pub fn is_host_to_exec(&self) -> bool {
        self.run_state() == Some(RunState::HostToExec)
    }

    pub fn is_native_to_exec(&self) -> bool {
        self.run_state() == Some(RunState::NativeToExec)
    }

    pub fn is_cycle_done(&self) -> bool {
        self.run_state() == Some(RunState::CycleDone)
    }

    pub fn is_native_to_terminate(&self) -> bool {
        self.run_state() == Some(RunState::NativeToTerminate)
    }

    pub fn is_terminated(&self) -> bool {
        self.run_state() == Some(RunState::Terminated)
    }

    /// Blocks until the port reaches the terminated sub-state, with a
    /// bounded wait per state change. Returns early once the port has
    /// left `Running`.
    pub fn wait_for_terminated(&self) -> Result<()> {
        let mut st = self.state.lock();
        loop {
            match st.main {
                MainState::Running(RunState::Terminated) => return Ok(()),
                MainState::Running(_) => {
                    if self
                        .state_changed
                        .wait_for(&mut st, self.max_waiting_time)
                        .timed_out()
                    {
                        return Err(Error::Timeout("wait_for_terminated"));
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Blocks until the current cycle has fully completed (or the port
    /// has terminated or left `Running`), with a bounded wait.
    pub fn wait_for_cycle_done(&self) -> Result<()> {
        let mut st = self.state.lock();
        loop {
            match st.main {
                MainState::Running(RunState::CycleDone)
                | MainState::Running(RunState::Terminated) => return Ok(()),
                main if main.is_past_running() => return Ok(()),
                _ => {
                    if self
                        .state_changed
                        .wait_for(&mut st, self.max_waiting_time)
                        .timed_out()
                    {
                        return Err(Error::Timeout("wait_for_cycle_done"));
                    }
                }
            }
        }
    }

    /// True if a worker half has latched a fault.
    pub fn has_fault(&self) -> bool {
        self.state.lock().fault.is_set()
    }

    /// Takes the latched fault, if any. A fault can be retrieved exactly
    /// once.
    pub fn take_fault(&self) -> Option<ProcessFault> {
        self.state.lock().fault.take()
    }

    /// Drains this port into a fresh one; the remains satisfy
    /// `id == INVALID_PORT_ID` and `Deletable`, so they are safe to drop.
    ///
    /// The exclusive borrow guarantees no worker thread holds the port;
    /// the state transfer still happens under its lock.
    pub fn take(&mut self) -> Port {
        let driver = mem::replace(&mut self.driver, Box::new(DrainedDriver));
        let mut st = self.state.lock();
        let moved = PortState {
            id: st.id,
            main: st.main,
            time_code: st.time_code,
            last_cycle: st.last_cycle,
            fault: mem::take(&mut st.fault),
        };
        st.id = INVALID_PORT_ID;
        st.main = MainState::Deletable;
        drop(st);

        Port {
            direction: self.direction,
            driver,
            state: Mutex::new(moved),
            state_changed: Condvar::new(),
            state_lock_timeout: self.state_lock_timeout,
            max_waiting_time: self.max_waiting_time,
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Port")
            .field("id", &st.id)
            .field("direction", &self.direction)
            .field("state", &st.main)
            .finish()
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        let st = self.state.lock();
        if !matches!(st.main, MainState::Created | MainState::Deletable) {
            tracing::error!(port = st.id, state = %st.main, "port dropped in wrong state");
        }
    }
}
