//! # Debug Session
//!
//! [`DebugSession`] is the object an IDE (or the CLI) holds: one
//! [`Resolver`] with the module's symbols and one [`RemoteSession`] for the
//! live target. It translates between source lines and addresses, so callers
//! never see module-relative addresses, and it uses 0-based lines on every
//! method that takes or returns a line.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use nacldbg_core::{DebugSession, SessionConfig};
//!
//! let mut session = DebugSession::new(SessionConfig::from_env());
//! let events = session.subscribe();
//! session.open("localhost:4014")?;
//! session.set_breakpoint(Path::new("/src/hello.c"), 9)?;
//! session.continue_execution()?;
//! let stopped = events.recv().expect("session event");
//! println!("{}", stopped.describe());
//! # Ok::<(), nacldbg_core::DebuggerError>(())
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::breakpoints::{BreakpointId, BreakpointInfo, BreakpointKind, BreakpointLocator, BreakpointResolution};
use crate::config::SessionConfig;
use crate::error::{DebuggerError, Result};
use crate::events::{EventBus, SessionEvent, SessionEventReceiver};
use crate::ide::IdePosition;
use crate::remote::{RemoteSession, SessionState, StopEvent};
use crate::symbols::{LoadStatus, Resolver, SymbolDatabase};
use crate::types::registers::DWARF_R15;
use crate::types::{Address, Architecture, Registers, StackFrame, Symbol, ThreadId};
use crate::unwind::Unwinder;

/// Breakpoint request after placement and installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointBinding
{
    pub resolution: BreakpointResolution,
    /// One id per installed address
    pub ids: Vec<BreakpointId>,
}

/// A debugging session over one module and one remote target.
pub struct DebugSession
{
    config: SessionConfig,
    events: EventBus,
    resolver: Resolver,
    remote: RemoteSession,
}

impl DebugSession
{
    /// Closed session without symbols.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self
    {
        let events = EventBus::new();
        let remote = RemoteSession::new(config.clone(), events.clone());
        Self {
            config,
            events,
            resolver: Resolver::empty(),
            remote,
        }
    }

    /// Closed session with symbols already loaded.
    ///
    /// The symbols are kept on open unless a module path is configured or
    /// reported by the stub; only their base changes.
    #[must_use]
    pub fn with_symbols(config: SessionConfig, database: SymbolDatabase) -> Self
    {
        let mut session = Self::new(config);
        session.resolver = Resolver::from_database(database, Address::ZERO);
        session
    }

    /// Register an event listener.
    #[must_use]
    pub fn subscribe(&self) -> SessionEventReceiver
    {
        self.events.subscribe()
    }

    #[must_use]
    pub fn resolver(&self) -> &Resolver
    {
        &self.resolver
    }

    #[must_use]
    pub fn remote(&self) -> &RemoteSession
    {
        &self.remote
    }

    #[must_use]
    pub fn state(&self) -> SessionState
    {
        self.remote.state()
    }

    /// Connect to the stub at `address` (`host:port`).
    ///
    /// Runs the handshake, computes the module base (`r15` on x86-64),
    /// loads symbols from the configured module path or the path the stub
    /// reports, publishes `ModuleLoaded` and `Opened`, starts polling and
    /// finally reports the target's current stop.
    ///
    /// A module whose symbols fail to load does not fail the open; the
    /// `ModuleLoaded` event carries the failure.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::Timeout`] if the handshake does not finish in time,
    /// [`DebuggerError::InvalidState`] if the session is not closed.
    pub fn open(&mut self, address: &str) -> Result<()>
    {
        let handshake = self.remote.open(address)?;
        let base = match handshake.architecture {
            Architecture::X86_64 => Address::new(handshake.registers.get(DWARF_R15).unwrap_or_default()),
            _ => Address::ZERO,
        };
        debug!(%base, "module base");

        let module = self.config.module_path.clone().or(handshake.exec_path);
        match &module {
            Some(path) => {
                let status = self.resolver.load_module(path, base);
                self.events.publish(&SessionEvent::ModuleLoaded {
                    path: path.clone(),
                    status,
                });
            }
            None if self.resolver.is_loaded() => {
                debug!("no module path; keeping the symbols already loaded");
                self.resolver.set_base(base);
            }
            None => {
                warn!("stub did not report a module path; continuing without symbols");
                self.resolver = Resolver::from_database(SymbolDatabase::empty(), base);
            }
        }
        self.events.publish(&SessionEvent::Opened {
            architecture: handshake.architecture,
            module,
        });

        let started = self
            .remote
            .start_polling()
            .and_then(|()| self.remote.report_current_stop());
        if let Err(err) = started {
            warn!(error = %err, "session failed right after opening");
            self.remote.close()?;
            return Err(err);
        }
        info!(address, "session open");
        Ok(())
    }

    /// Close the session. Closing a closed session does nothing.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::close`].
    pub fn close(&self) -> Result<()>
    {
        self.remote.close()
    }

    /// Replace the symbols with those of `path`, keeping the current base.
    pub fn load_module(&mut self, path: &Path) -> LoadStatus
    {
        let status = self.resolver.load_module(path, self.resolver.base());
        self.events.publish(&SessionEvent::ModuleLoaded {
            path: path.to_path_buf(),
            status: status.clone(),
        });
        status
    }

    /// Place a breakpoint for 0-based `line` without touching the target.
    #[must_use]
    pub fn resolve_breakpoint(&self, path: &Path, line: u32) -> BreakpointResolution
    {
        BreakpointLocator::new(&self.resolver).resolve_ide_line(path, line)
    }

    /// Place and install a breakpoint for 0-based `line`.
    ///
    /// A request that places nowhere is not an error; the returned binding
    /// carries the diagnostics and no ids.
    ///
    /// # Errors
    ///
    /// Installation failures from [`RemoteSession::add_breakpoint`].
    pub fn set_breakpoint(&self, path: &Path, line: u32) -> Result<BreakpointBinding>
    {
        let resolution = self.resolve_breakpoint(path, line);
        let ids = resolution
            .addresses
            .iter()
            .map(|&address| self.remote.add_breakpoint(address, BreakpointKind::User))
            .collect::<Result<Vec<_>>>()?;
        Ok(BreakpointBinding { resolution, ids })
    }

    /// Remove the breakpoints a request for 0-based `line` installed.
    /// Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Failures restoring the original bytes.
    pub fn clear_breakpoint(&self, path: &Path, line: u32) -> Result<usize>
    {
        let installed: BTreeSet<Address> = self.remote.breakpoints().iter().map(|info| info.address).collect();
        let mut removed = 0;
        for address in self.resolve_breakpoint(path, line).addresses {
            if installed.contains(&address) {
                self.remote.remove_breakpoint(address)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    #[must_use]
    pub fn breakpoints(&self) -> Vec<BreakpointInfo>
    {
        self.remote.breakpoints()
    }

    /// Step one source line.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::step`].
    pub fn step(&self, thread: Option<ThreadId>) -> Result<StopEvent>
    {
        self.remote
            .step(thread, |pc| self.resolver.position_from_address(pc))
    }

    /// Run to the next line of the current function, or to the caller.
    ///
    /// Temporary breakpoints go on every line start of the function except
    /// those of the current line, and on the return address. Without any
    /// target address this falls back to [`DebugSession::step`].
    ///
    /// # Errors
    ///
    /// Register access and breakpoint installation failures.
    pub fn step_over(&self, thread: Option<ThreadId>) -> Result<()>
    {
        let registers = self.remote.registers(thread)?;
        let pc = registers.pc();
        let current = self.resolver.position_from_address(pc);

        let mut targets: BTreeSet<Address> = self
            .resolver
            .addresses_in_scope(pc)
            .into_iter()
            .filter(|&address| address != pc)
            .filter(|&address| {
                let position = self.resolver.position_from_address(address);
                match (&current, &position) {
                    (Some(current), Some(position)) => !current.same_line(position),
                    _ => true,
                }
            })
            .collect();
        if let Some(return_address) = self.return_address(&registers) {
            targets.insert(return_address);
        }

        if targets.is_empty() {
            debug!(%pc, "nothing to run to; stepping instead");
            self.step(thread)?;
            return Ok(());
        }
        self.run_to(&targets)
    }

    /// Run until the current function returns.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::Unsupported`] when no call frame information covers
    /// the PC.
    pub fn step_out(&self, thread: Option<ThreadId>) -> Result<()>
    {
        let registers = self.remote.registers(thread)?;
        let Some(return_address) = self.return_address(&registers) else {
            return Err(DebuggerError::Unsupported(format!(
                "cannot find the return address of the frame at {}",
                registers.pc()
            )));
        };
        self.run_to(&BTreeSet::from([return_address]))
    }

    fn return_address(&self, registers: &Registers) -> Option<Address>
    {
        let unwinder = Unwinder::new(self.resolver.database(), self.resolver.base(), &self.remote);
        match unwinder.previous_frame(registers) {
            Ok(caller) => caller.map(|caller| caller.pc()).filter(|&pc| pc != Address::ZERO),
            Err(err) => {
                warn!(pc = %registers.pc(), error = %err, "could not unwind to the caller");
                None
            }
        }
    }

    fn run_to(&self, targets: &BTreeSet<Address>) -> Result<()>
    {
        for &address in targets {
            if let Err(err) = self.remote.add_breakpoint(address, BreakpointKind::Temporary) {
                warn!(%address, error = %err, "skipping temporary breakpoint");
            }
        }
        self.remote.continue_execution()
    }

    /// Resume the target.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::continue_execution`].
    pub fn continue_execution(&self) -> Result<()>
    {
        self.remote.continue_execution()
    }

    /// Interrupt a running target.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::request_break`].
    pub fn request_break(&self) -> Result<()>
    {
        self.remote.request_break()
    }

    /// Call stack of `thread`, innermost frame first.
    ///
    /// # Errors
    ///
    /// Register access failures for the innermost frame. Problems further
    /// up the stack end the walk instead.
    pub fn call_stack(&self, thread: Option<ThreadId>) -> Result<Vec<StackFrame>>
    {
        let registers = self.remote.registers(thread)?;
        let unwinder = Unwinder::new(self.resolver.database(), self.resolver.base(), &self.remote);
        let frames = unwinder
            .unwind(&registers, self.config.max_frames)
            .into_iter()
            .enumerate()
            .map(|(index, registers)| {
                let pc = registers.pc();
                // Return addresses point after the call; look up the call itself.
                let lookup = if index == 0 { pc } else { pc - 1 };
                StackFrame {
                    index,
                    pc,
                    sp: registers.sp(),
                    cfa: unwinder.canonical_frame_address(&registers).ok().flatten(),
                    function: self.resolver.function_from_address(lookup),
                    position: self.resolver.position_from_address(lookup),
                    registers,
                }
            })
            .collect::<Vec<_>>();
        debug!(frames = frames.len(), "call stack");
        Ok(frames)
    }

    /// Variables visible in `frame`.
    #[must_use]
    pub fn symbols_for_frame(&self, frame: &StackFrame) -> Vec<Symbol>
    {
        self.resolver.symbols_in_scope(&frame.registers, &self.remote)
    }

    /// Current value of `symbol` rendered for display, when it is in memory
    /// and its type is known.
    #[must_use]
    pub fn format_symbol(&self, symbol: &Symbol) -> Option<String>
    {
        let address = symbol.location.address()?;
        let size = usize::try_from(symbol.symbol_type.size).ok().filter(|&size| size > 0)?;
        let bytes = self.remote.read_memory(address, size).ok()?;
        symbol.symbol_type.format_value(&bytes)
    }

    /// Source position of `address` with a 0-based line.
    #[must_use]
    pub fn position_from_address(&self, address: Address) -> Option<IdePosition>
    {
        self.resolver.position_from_address(address).map(IdePosition::from)
    }

    /// Registers of `thread`.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::registers`].
    pub fn registers(&self, thread: Option<ThreadId>) -> Result<Registers>
    {
        self.remote.registers(thread)
    }

    /// Read target memory.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::read_memory`].
    pub fn read_memory(&self, address: Address, length: usize) -> Result<Vec<u8>>
    {
        self.remote.read_memory(address, length)
    }

    /// Write target memory.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::write_memory`].
    pub fn write_memory(&self, address: Address, data: &[u8]) -> Result<()>
    {
        self.remote.write_memory(address, data)
    }

    /// Threads of the target.
    ///
    /// # Errors
    ///
    /// See [`RemoteSession::threads`].
    pub fn threads(&self) -> Result<Vec<ThreadId>>
    {
        self.remote.threads()
    }
}
