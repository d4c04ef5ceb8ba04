use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nacldbg_core::breakpoints::BreakpointLocator;
use nacldbg_core::events::SessionEvent;
use nacldbg_core::symbols::{self, Resolver};
use nacldbg_core::types::Address;
use nacldbg_core::{DebugSession, SessionConfig};
use nacldbg_utils::{info, init_logging, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Symbolic debugger for Native Client modules behind a GDB remote stub.
#[derive(Parser, Debug)]
#[command(name = "nacldbg")]
#[command(version)]
#[command(about = "Symbolic debugger for Native Client modules behind a GDB remote stub", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Load a module's debug information and print what it contains
    Symbols
    {
        /// Module (ELF) with DWARF debug information
        module: PathBuf,
        /// Load base added to module-relative addresses
        #[arg(long, value_parser = parse_address, default_value = "0")]
        base: u64,
    },
    /// Show the source position and function of an address
    Lookup
    {
        module: PathBuf,
        /// Process address (hex with 0x, or decimal)
        #[arg(value_parser = parse_address)]
        address: u64,
        #[arg(long, value_parser = parse_address, default_value = "0")]
        base: u64,
    },
    /// Show where a breakpoint on a source line would be placed
    Breakpoint
    {
        module: PathBuf,
        /// Source file as the editor knows it
        file: PathBuf,
        /// 1-based line number
        line: u32,
    },
    /// Connect to a stub, set breakpoints, run and print session events
    Attach
    {
        /// Stub address (host:port)
        address: String,
        /// Load symbols from this module instead of the one the stub reports
        #[arg(long)]
        module: Option<PathBuf>,
        /// Breakpoint as file:line (1-based); may be repeated
        #[arg(long = "break", value_name = "FILE:LINE", value_parser = parse_location)]
        breakpoints: Vec<(PathBuf, u32)>,
        /// Stop printing events and close the session after this many seconds
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

fn main()
{
    // Reads RUST_LOG, NACLDBG_LOG_FORMAT and NACLDBG_LOG_FILE
    let _logging = match init_logging() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Symbols { module, base } => print_symbols(&module, base),
        Commands::Lookup { module, address, base } => lookup(&module, address, base),
        Commands::Breakpoint { module, file, line } => place_breakpoint(&module, &file, line),
        Commands::Attach {
            address,
            module,
            breakpoints,
            seconds,
        } => run_attach(address, module, breakpoints, seconds),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn parse_address(raw: &str) -> Result<u64, String>
{
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid address {raw}: {e}"))
}

fn parse_location(raw: &str) -> Result<(PathBuf, u32), String>
{
    let (file, line) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("expected FILE:LINE, got {raw}"))?;
    let line = line.parse::<u32>().map_err(|e| format!("invalid line in {raw}: {e}"))?;
    if line == 0 {
        return Err("line numbers start at 1".to_string());
    }
    Ok((PathBuf::from(file), line))
}

fn load_resolver(module: &Path, base: u64) -> CliResult<Resolver>
{
    let mut resolver = Resolver::empty();
    let status = resolver.load_module(module, Address::new(base));
    if !status.loaded {
        return Err(status.message.into());
    }
    Ok(resolver)
}

fn print_symbols(module: &Path, base: u64) -> CliResult<()>
{
    let database = symbols::load_module(module)?;
    let stats = database.stats();
    println!("{}", module.display());
    println!("  Entries:           {}", stats.entries);
    println!("  Source files:      {}", stats.files);
    println!("  Line rows:         {}", stats.locations);
    println!("  Scope transitions: {}", stats.scope_transitions);
    println!("  Call frames:       {}", stats.call_frames);
    println!("  Location lists:    {}", stats.loc_lists);
    println!("  Range entries:     {}", stats.range_entries);

    let resolver = Resolver::from_database(database, Address::new(base));
    let mut files: Vec<PathBuf> = resolver.database().files().map(|file| file.declared_path()).collect();
    files.sort();
    files.dedup();
    println!("\nSource files:");
    for file in files {
        println!("  {}", file.display());
    }
    Ok(())
}

fn lookup(module: &Path, address: u64, base: u64) -> CliResult<()>
{
    let resolver = load_resolver(module, base)?;
    let address = Address::new(address);
    let function = resolver.function_from_address(address);

    println!("Address:  {address}");
    match resolver.position_from_address(address) {
        Some(position) => println!("Position: {position}"),
        None => println!("Position: <no line information>"),
    }
    match function.range {
        Some((low, high)) => println!("Function: {function} [{low}, {high})"),
        None => println!("Function: {function}"),
    }
    Ok(())
}

fn place_breakpoint(module: &Path, file: &Path, line: u32) -> CliResult<()>
{
    let resolver = load_resolver(module, 0)?;
    let resolution = BreakpointLocator::new(&resolver).resolve_line(file, line);
    for address in &resolution.addresses {
        println!("{address}");
    }
    for diagnostic in &resolution.diagnostics {
        println!("[{}] {}", diagnostic.severity, diagnostic.message);
    }
    if resolution.has_errors() {
        return Err(format!("no code for {}:{line}", file.display()).into());
    }
    Ok(())
}

fn run_attach(address: String, module: Option<PathBuf>, breakpoints: Vec<(PathBuf, u32)>, seconds: u64) -> CliResult<()>
{
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(attach(address, module, breakpoints, seconds));
    // The event forwarder may still be parked on the session channel.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn attach(address: String, module: Option<PathBuf>, breakpoints: Vec<(PathBuf, u32)>, seconds: u64) -> CliResult<()>
{
    let mut config = SessionConfig::from_env();
    if let Some(module) = module {
        config = config.with_module_path(module);
    }

    let mut session = DebugSession::new(config);
    let events = forward_events(session.subscribe());
    info!(address = %address, "attaching");
    session.open(&address)?;

    for (file, line) in &breakpoints {
        // The session speaks 0-based lines.
        let binding = session.set_breakpoint(file, line.saturating_sub(1))?;
        for diagnostic in &binding.resolution.diagnostics {
            println!("[{}] {}:{line}: {}", diagnostic.severity, file.display(), diagnostic.message);
        }
        for id in &binding.ids {
            println!("Breakpoint {} set at {}:{line}", id.raw(), file.display());
        }
    }

    session.continue_execution()?;
    let result = event_loop(&session, events, Duration::from_secs(seconds)).await;
    session.close()?;
    result
}

/// Move session events from the blocking channel onto the runtime.
fn forward_events(events: std::sync::mpsc::Receiver<SessionEvent>) -> mpsc::UnboundedReceiver<SessionEvent>
{
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = events.recv() {
            if sender.send(event).is_err() {
                break;
            }
        }
    });
    receiver
}

async fn event_loop(session: &DebugSession, mut events: mpsc::UnboundedReceiver<SessionEvent>, duration: Duration) -> CliResult<()>
{
    let deadline = Instant::now() + duration;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            () = sleep_until(deadline) => {
                info!("deadline reached");
                return Ok(());
            }
        };
        let Some(event) = event else {
            return Ok(());
        };

        match &event {
            SessionEvent::Output(text) => print!("{text}"),
            other => println!("{}", other.describe()),
        }

        match event {
            SessionEvent::Stopped { reason, .. } if reason.is_alive() => {
                print_stop(session);
                session.continue_execution()?;
            }
            SessionEvent::Stopped { .. } | SessionEvent::Closed => return Ok(()),
            _ => {}
        }
    }
}

fn print_stop(session: &DebugSession)
{
    let frames = match session.call_stack(None) {
        Ok(frames) => frames,
        Err(e) => {
            warn!(error = %e, "no call stack");
            return;
        }
    };
    for frame in &frames {
        match frame.ide_position() {
            // Back to 1-based for people.
            Some(position) => println!(
                "  #{} {} {} at {}:{}",
                frame.index,
                frame.pc,
                frame.function,
                position.path.display(),
                position.line + 1
            ),
            None => println!("  #{} {} {}", frame.index, frame.pc, frame.function),
        }
    }
    if let Some(frame) = frames.first() {
        for symbol in session.symbols_for_frame(frame) {
            let value = session.format_symbol(&symbol).unwrap_or_else(|| "<unavailable>".to_string());
            println!("    {} {} = {value}", symbol.symbol_type, symbol.name);
        }
    }
}
