//! Remote debug session.
//!
//! A [`RemoteSession`] drives one debuggee through a GDB remote stub. All
//! mutable state (the connection, breakpoint store, run state) sits behind a
//! single mutex, which is the only point of serialisation: every public
//! operation and every poller iteration takes it, so at most one request is
//! on the wire at a time.
//!
//! ## Lifecycle
//!
//! `Closed -> Opening -> Open -> Closing -> Closed`. While open, a poller
//! thread waits for the stop reply of a running target and publishes a
//! [`SessionEvent::Stopped`] when it arrives.
//!
//! ## Software breakpoints
//!
//! Installing a breakpoint saves the byte at the address and writes `int3`.
//! When a continued target stops with the trap signal one byte past an
//! armed breakpoint, the PC is rewound onto it. Leaving a breakpoint (step or
//! continue) restores the original byte, single-steps with stop notification
//! suppressed and then re-arms it, so the instruction under the breakpoint
//! runs exactly once.

use std::fmt;
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nacldbg_protocol::ProtocolError;
use tracing::{debug, error, info, trace, warn};

use super::host::{GdbHost, StopEvent};
use crate::breakpoints::{BreakpointId, BreakpointInfo, BreakpointKind, BreakpointState, TRAP_INSTRUCTION};
use crate::config::SessionConfig;
use crate::error::{DebuggerError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::types::{Address, Architecture, Registers, SourcePosition, StopReason, ThreadId};
use crate::unwind::MemoryAccess;

/// Connection state of a [`RemoteSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState
{
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for SessionState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
        };
        write!(f, "{name}")
    }
}

/// What the stub told us while opening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake
{
    pub architecture: Architecture,
    /// Module path reported by `qExecPath`
    pub exec_path: Option<std::path::PathBuf>,
    /// Registers of the current thread at open time
    pub registers: Registers,
}

struct Inner
{
    state: SessionState,
    host: Option<GdbHost>,
    breakpoints: crate::breakpoints::BreakpointStore,
    running: bool,
    architecture: Option<Architecture>,
    last_stop: Option<StopEvent>,
}

impl Inner
{
    fn host(&mut self) -> Result<&mut GdbHost>
    {
        self.host.as_mut().ok_or(DebuggerError::NotConnected)
    }

    fn ensure_open(&self) -> Result<()>
    {
        match self.state {
            SessionState::Open if self.host.is_some() => Ok(()),
            SessionState::Open => Err(DebuggerError::NotConnected),
            other => Err(DebuggerError::invalid_state(SessionState::Open, other)),
        }
    }

    fn ensure_stopped(&self) -> Result<()>
    {
        self.ensure_open()?;
        if self.running {
            return Err(DebuggerError::invalid_state("stopped", "running"));
        }
        Ok(())
    }
}

struct Shared
{
    inner: Mutex<Inner>,
    events: EventBus,
    config: SessionConfig,
}

impl Shared
{
    fn lock(&self) -> Result<MutexGuard<'_, Inner>>
    {
        self.inner
            .lock()
            .map_err(|_| DebuggerError::invalid_state("usable session lock", "poisoned lock"))
    }

    fn is_trap(&self, stop: &StopEvent) -> bool
    {
        stop.reason == StopReason::Signal(self.config.trap_signal)
    }

    /// Process a stop reply: rewind over a breakpoint trap, count the hit,
    /// drop temporary breakpoints and publish exactly one `Stopped`.
    ///
    /// `resumed` is set only for the reply to a `c`. Single steps never run
    /// an armed trap, so their stops are taken at face value.
    fn handle_stop(&self, inner: &mut Inner, stop: StopEvent, resumed: bool)
    {
        inner.running = false;
        inner.last_stop = Some(stop);

        let mut pc = None;
        let mut breakpoint = None;
        if stop.reason.is_alive() {
            match self.rewind_trap(inner, stop, resumed) {
                Ok((stop_pc, hit)) => {
                    pc = Some(stop_pc);
                    breakpoint = hit;
                }
                Err(err) => warn!(error = %err, "could not inspect registers after stop"),
            }
            self.remove_temporaries(inner);
        } else {
            info!(reason = %stop.reason, "target is gone");
            for address in inner.breakpoints.temporaries() {
                inner.breakpoints.remove_at(address);
            }
        }

        for text in inner.host.as_mut().map(GdbHost::take_output).unwrap_or_default() {
            self.events.publish(&SessionEvent::Output(text));
        }
        debug!(reason = %stop.reason, pc = ?pc, breakpoint = ?breakpoint, "target stopped");
        self.events.publish(&SessionEvent::Stopped {
            reason: stop.reason,
            thread: stop.thread,
            pc,
            breakpoint,
        });
    }

    fn rewind_trap(&self, inner: &mut Inner, stop: StopEvent, resumed: bool) -> Result<(Address, Option<BreakpointId>)>
    {
        let mut registers = inner.host()?.read_registers(None)?;
        if !resumed || !self.is_trap(&stop) {
            return Ok((registers.pc(), None));
        }

        let trap_address = registers.pc() - 1;
        if !inner.breakpoints.is_armed_at(trap_address) {
            return Ok((registers.pc(), None));
        }
        registers.set_pc(trap_address);
        inner.host()?.write_registers(&registers)?;
        let hit = inner
            .breakpoints
            .record_hit(trap_address)
            .filter(|info| !info.is_temporary())
            .map(|info| info.id);
        trace!(address = %trap_address, "rewound past breakpoint trap");
        Ok((trap_address, hit))
    }

    fn remove_temporaries(&self, inner: &mut Inner)
    {
        for address in inner.breakpoints.temporaries() {
            if let Err(err) = disarm(inner, address) {
                warn!(%address, error = %err, "failed to remove temporary breakpoint");
            }
            inner.breakpoints.remove_at(address);
        }
    }

    /// Run the instruction under the armed breakpoint at `pc` once.
    fn step_over_breakpoint(&self, inner: &mut Inner, pc: Address) -> Result<StopEvent>
    {
        trace!(%pc, "stepping over breakpoint");
        disarm(inner, pc)?;
        let stepped = inner.host()?.single_step();
        let alive = stepped.as_ref().map_or(true, |stop| stop.reason.is_alive());
        if alive {
            arm(inner, pc)?;
        }
        stepped
    }

    /// One underlying instruction step, stepping over a breakpoint at the PC.
    fn step_instruction(&self, inner: &mut Inner, pc: Address) -> Result<StopEvent>
    {
        if inner.breakpoints.is_armed_at(pc) {
            self.step_over_breakpoint(inner, pc)
        } else {
            inner.host()?.single_step()
        }
    }
}

/// Restore the original byte of the breakpoint at `address`.
fn disarm(inner: &mut Inner, address: Address) -> Result<()>
{
    let Some(info) = inner.breakpoints.at(address) else {
        return Err(DebuggerError::NoBreakpoint(address.value()));
    };
    if info.state == BreakpointState::Armed {
        let original = info.original_byte;
        inner.host()?.write_memory(address, &[original])?;
        inner.breakpoints.set_state(address, BreakpointState::Suspended);
    }
    Ok(())
}

/// Write the trap back over a suspended breakpoint at `address`.
fn arm(inner: &mut Inner, address: Address) -> Result<()>
{
    if inner
        .breakpoints
        .at(address)
        .is_some_and(|info| info.state == BreakpointState::Suspended)
    {
        inner.host()?.write_memory(address, &[TRAP_INSTRUCTION])?;
        inner.breakpoints.set_state(address, BreakpointState::Armed);
    }
    Ok(())
}

/// Pause between polls while the target runs; the socket wait inside each
/// poll is `reply_timeout`.
const RUNNING_POLL_PAUSE: Duration = Duration::from_millis(1);

enum PollerSignal
{
    /// The target was resumed
    Wake,
    Terminate,
}

struct Poller
{
    handle: JoinHandle<()>,
    signals: mpsc::Sender<PollerSignal>,
}

/// Client for one debuggee behind a GDB remote stub.
pub struct RemoteSession
{
    shared: Arc<Shared>,
    poller: Mutex<Option<Poller>>,
}

impl RemoteSession
{
    /// Closed session publishing to `events`.
    #[must_use]
    pub fn new(config: SessionConfig, events: EventBus) -> Self
    {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Closed,
                    host: None,
                    breakpoints: crate::breakpoints::BreakpointStore::new(),
                    running: false,
                    architecture: None,
                    last_stop: None,
                }),
                events,
                config,
            }),
            poller: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig
    {
        &self.shared.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState
    {
        self.shared.lock().map_or(SessionState::Closed, |inner| inner.state)
    }

    /// Whether the target is executing (continued and not yet stopped).
    #[must_use]
    pub fn is_running(&self) -> bool
    {
        self.shared.lock().is_ok_and(|inner| inner.running)
    }

    #[must_use]
    pub fn architecture(&self) -> Option<Architecture>
    {
        self.shared.lock().ok().and_then(|inner| inner.architecture.clone())
    }

    /// Connect to `address` and run the handshake (architecture, module
    /// path, registers).
    ///
    /// The session is `Open` afterwards but not yet polling; see
    /// [`RemoteSession::start_polling`].
    ///
    /// # Errors
    ///
    /// [`DebuggerError::Timeout`] when the stub does not answer within the
    /// handshake timeout; the session is closed again.
    pub fn open(&self, address: &str) -> Result<Handshake>
    {
        {
            let mut inner = self.shared.lock()?;
            if inner.state != SessionState::Closed {
                return Err(DebuggerError::invalid_state(SessionState::Closed, inner.state));
            }
            inner.state = SessionState::Opening;
        }

        info!(address, "opening remote session");
        let timeout = self.shared.config.handshake_timeout;
        let handshake = GdbHost::connect(address, timeout).and_then(|mut host| {
            let architecture = host.architecture()?;
            let exec_path = host.exec_path()?;
            let registers = host.read_registers(None)?;
            Ok((
                host,
                Handshake {
                    architecture,
                    exec_path,
                    registers,
                },
            ))
        });

        let mut inner = self.shared.lock()?;
        match handshake {
            Ok((host, handshake)) => {
                info!(architecture = %handshake.architecture, exec_path = ?handshake.exec_path, "handshake complete");
                inner.host = Some(host);
                inner.architecture = Some(handshake.architecture.clone());
                inner.state = SessionState::Open;
                inner.running = false;
                Ok(handshake)
            }
            Err(err) => {
                inner.state = SessionState::Closed;
                error!(address, error = %err, "failed to open remote session");
                Err(match err {
                    DebuggerError::Protocol(ProtocolError::Timeout(what)) => {
                        DebuggerError::Timeout(format!("{what} during open handshake with {address}"))
                    }
                    DebuggerError::Protocol(ProtocolError::Io(io)) if io.kind() == std::io::ErrorKind::TimedOut => {
                        DebuggerError::Timeout(format!("connecting to {address}"))
                    }
                    other => other,
                })
            }
        }
    }

    /// Start the background thread that collects stop replies.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::InvalidState`] unless the session is open, and
    /// [`DebuggerError::Io`] if the thread cannot be spawned.
    pub fn start_polling(&self) -> Result<()>
    {
        self.shared.lock()?.ensure_open()?;
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return Ok(());
        }

        let (signals, received) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("nacldbg-poller".to_string())
            .spawn(move || poll_loop(&shared, &received))?;
        *poller = Some(Poller { handle, signals });
        debug!("poller started");
        Ok(())
    }

    /// Ask the stub why the target is stopped and publish it as a stop.
    ///
    /// # Errors
    ///
    /// Protocol failures.
    pub fn report_current_stop(&self) -> Result<StopEvent>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;
        let stop = inner.host()?.last_signal()?;
        self.shared.handle_stop(&mut inner, stop, false);
        Ok(stop)
    }

    /// Last stop reply seen.
    #[must_use]
    pub fn last_stop(&self) -> Option<StopEvent>
    {
        self.shared.lock().ok().and_then(|inner| inner.last_stop)
    }

    /// Install a breakpoint at `address`.
    ///
    /// Adding one where a breakpoint already exists returns the existing id
    /// (promoting a temporary breakpoint when `kind` is
    /// [`BreakpointKind::User`]).
    ///
    /// # Errors
    ///
    /// [`DebuggerError::InvalidState`] while running and
    /// [`DebuggerError::MemoryAccess`] if the address is not writable.
    pub fn add_breakpoint(&self, address: Address, kind: BreakpointKind) -> Result<BreakpointId>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;
        if inner.breakpoints.at(address).is_some() {
            return Ok(inner.breakpoints.insert(address, kind, TRAP_INSTRUCTION));
        }

        let host = inner.host()?;
        let original = host.read_memory(address, 1)?;
        let original = original.first().copied().ok_or(DebuggerError::MemoryAccess {
            address,
            length: 1,
            reason: "empty read".to_string(),
        })?;
        host.write_memory(address, &[TRAP_INSTRUCTION])?;
        let id = inner.breakpoints.insert(address, kind, original);
        debug!(%address, id = id.raw(), ?kind, "breakpoint installed");
        Ok(id)
    }

    /// Remove the breakpoint at `address`, restoring the original byte.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::NoBreakpoint`] if none is installed there.
    pub fn remove_breakpoint(&self, address: Address) -> Result<()>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;
        disarm(&mut inner, address)?;
        inner.breakpoints.remove_at(address);
        debug!(%address, "breakpoint removed");
        Ok(())
    }

    /// Every tracked breakpoint in id order.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<BreakpointInfo>
    {
        self.shared
            .lock()
            .map(|inner| inner.breakpoints.list())
            .unwrap_or_default()
    }

    /// Step one source line.
    ///
    /// Single-steps until `position` reports a different line than at the
    /// start, or the target stops for anything but the trap signal. Without
    /// a starting position a single instruction is executed. The loop has no
    /// time bound; `max_step_instructions` in the configuration caps it.
    ///
    /// Publishes one `Stopped` and one `StepFinished` at the end.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::InvalidState`] while running, and protocol failures.
    pub fn step<F>(&self, thread: Option<ThreadId>, position: F) -> Result<StopEvent>
    where
        F: Fn(Address) -> Option<SourcePosition>,
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;

        let mut pc = inner.host()?.read_registers(thread)?.pc();
        let start = position(pc);
        debug!(%pc, start = ?start, "stepping");

        let mut executed: u64 = 0;
        let stop = loop {
            let stop = self.shared.step_instruction(&mut inner, pc)?;
            executed += 1;
            if !self.shared.is_trap(&stop) {
                break stop;
            }
            pc = inner.host()?.read_registers(None)?.pc();

            let Some(start) = &start else {
                break stop;
            };
            if !position(pc).is_some_and(|now| now.same_line(start)) {
                break stop;
            }
            if self
                .shared
                .config
                .max_step_instructions
                .is_some_and(|limit| executed >= limit)
            {
                warn!(executed, "step instruction limit reached");
                break stop;
            }
        };

        trace!(executed, %pc, "step finished");
        let stop = StopEvent {
            thread: stop.thread.or(thread),
            ..stop
        };
        self.shared.handle_stop(&mut inner, stop, false);
        self.shared
            .events
            .publish(&SessionEvent::StepFinished { thread: stop.thread });
        Ok(stop)
    }

    /// Resume the target. Returns once the continue is on the wire; the stop
    /// arrives later as a `Stopped` event.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::InvalidState`] while running, and protocol failures.
    pub fn continue_execution(&self) -> Result<()>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;

        let pc = inner.host()?.read_registers(None)?.pc();
        if inner.breakpoints.is_armed_at(pc) {
            let stop = self.shared.step_over_breakpoint(&mut inner, pc)?;
            if !self.shared.is_trap(&stop) {
                self.shared.handle_stop(&mut inner, stop, false);
                return Ok(());
            }
        }

        inner.host()?.resume()?;
        inner.running = true;
        debug!(%pc, "continuing");
        self.shared.events.publish(&SessionEvent::Continuing);
        drop(inner);
        self.wake_poller();
        Ok(())
    }

    fn wake_poller(&self)
    {
        let poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(poller) = poller.as_ref() {
            if poller.signals.send(PollerSignal::Wake).is_err() {
                debug!("poller is gone; nothing to wake");
            }
        }
    }

    /// Interrupt a running target. The stop is reported by the poller.
    ///
    /// # Errors
    ///
    /// Protocol failures.
    pub fn request_break(&self) -> Result<()>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_open()?;
        if inner.running {
            debug!("interrupting target");
            inner.host()?.interrupt()?;
        }
        Ok(())
    }

    /// Registers of `thread` (the current thread when `None`).
    ///
    /// # Errors
    ///
    /// [`DebuggerError::InvalidState`] while running and
    /// [`DebuggerError::RegisterAccess`] for bad replies.
    pub fn registers(&self, thread: Option<ThreadId>) -> Result<Registers>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;
        inner.host()?.read_registers(thread)
    }

    /// Read target memory. Bytes under breakpoints read as the original
    /// instruction bytes.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::MemoryAccess`] if the stub refuses the read.
    pub fn read_memory(&self, address: Address, length: usize) -> Result<Vec<u8>>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;
        let mut data = inner.host()?.read_memory(address, length)?;
        for info in inner.breakpoints.list() {
            if let Some(offset) = info.address.relative_to(address) {
                if info.is_armed() && offset < data.len() as u64 {
                    data[offset as usize] = info.original_byte;
                }
            }
        }
        Ok(data)
    }

    /// Write target memory. Breakpoints inside the range stay armed and
    /// remember the newly written byte as their original.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::MemoryAccess`] if the stub refuses the write.
    pub fn write_memory(&self, address: Address, data: &[u8]) -> Result<()>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;
        let mut patched = data.to_vec();
        for info in inner.breakpoints.list() {
            if let Some(offset) = info.address.relative_to(address) {
                if offset < data.len() as u64 && info.is_armed() {
                    let offset = offset as usize;
                    inner.breakpoints.set_original_byte(info.address, data[offset]);
                    patched[offset] = TRAP_INSTRUCTION;
                }
            }
        }
        inner.host()?.write_memory(address, &patched)
    }

    /// Thread list.
    ///
    /// # Errors
    ///
    /// Protocol failures.
    pub fn threads(&self) -> Result<Vec<ThreadId>>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;
        inner.host()?.threads()
    }

    /// Why the target last stopped, straight from the stub.
    ///
    /// # Errors
    ///
    /// Protocol failures.
    pub fn last_signal(&self) -> Result<StopEvent>
    {
        let mut inner = self.shared.lock()?;
        inner.ensure_stopped()?;
        inner.host()?.last_signal()
    }

    /// Close the session.
    ///
    /// Safe while the poller is mid-iteration: the poller is told to exit and
    /// joined for at most `join_timeout`, after which it is detached.
    /// Breakpoint bytes are restored on a best-effort basis.
    ///
    /// # Errors
    ///
    /// Only a poisoned session lock; transport failures while tearing down
    /// are logged.
    pub fn close(&self) -> Result<()>
    {
        {
            let mut inner = self.shared.lock()?;
            if matches!(inner.state, SessionState::Closed | SessionState::Closing) {
                return Ok(());
            }
            inner.state = SessionState::Closing;
        }
        info!("closing remote session");

        let poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(poller) = poller {
            let _ = poller.signals.send(PollerSignal::Terminate);
            let deadline = Instant::now() + self.shared.config.join_timeout;
            while !poller.handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if poller.handle.is_finished() {
                if poller.handle.join().is_err() {
                    warn!("poller thread panicked");
                }
            } else {
                warn!("poller did not exit in time; detaching it");
            }
        }

        let mut inner = self.shared.lock()?;
        if !inner.running {
            for info in inner.breakpoints.list() {
                if let Err(err) = disarm(&mut inner, info.address) {
                    debug!(address = %info.address, error = %err, "could not restore breakpoint byte");
                }
            }
        }
        inner.breakpoints.drain();
        if let Some(mut host) = inner.host.take() {
            if let Err(err) = host.shutdown() {
                debug!(error = %err, "transport shutdown failed");
            }
        }
        inner.running = false;
        inner.state = SessionState::Closed;
        drop(inner);

        self.shared.events.publish(&SessionEvent::Closed);
        Ok(())
    }
}

impl MemoryAccess for RemoteSession
{
    fn read_bytes(&self, address: Address, length: usize) -> Result<Vec<u8>>
    {
        self.read_memory(address, length)
    }
}

impl Drop for RemoteSession
{
    fn drop(&mut self)
    {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close remote session on drop");
        }
    }
}

fn poll_loop(shared: &Shared, signals: &mpsc::Receiver<PollerSignal>)
{
    loop {
        let pause = match shared.lock() {
            Ok(mut inner) => {
                if inner.state != SessionState::Open {
                    break;
                }
                if inner.running {
                    poll_once(shared, &mut inner);
                }
                if inner.running {
                    RUNNING_POLL_PAUSE
                } else {
                    shared.config.poll_interval
                }
            }
            Err(err) => {
                error!(error = %err, "poller stopping");
                break;
            }
        };

        match signals.recv_timeout(pause) {
            Ok(PollerSignal::Wake) | Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(PollerSignal::Terminate) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("poller exited");
}

fn poll_once(shared: &Shared, inner: &mut Inner)
{
    let timeout = shared.config.reply_timeout;
    let Some(host) = inner.host.as_mut() else {
        return;
    };
    let polled = host.poll_stop(timeout);
    let output = host.take_output();
    for text in output {
        shared.events.publish(&SessionEvent::Output(text));
    }

    match polled {
        Ok(Some(stop)) => shared.handle_stop(inner, stop, true),
        Ok(None) => {}
        Err(DebuggerError::Protocol(ProtocolError::Disconnected)) => {
            warn!("remote stub disconnected while the target was running");
            inner.running = false;
            inner.host = None;
        }
        Err(err) => warn!(error = %err, "error while waiting for a stop reply"),
    }
}
