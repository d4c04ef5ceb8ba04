//! Tests for DebugSession against an emulated GDB stub

mod support;

use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use nacldbg_core::breakpoints::BreakpointKind;
use nacldbg_core::events::SessionEvent;
use nacldbg_core::remote::SessionState;
use nacldbg_core::types::registers::{DWARF_RBP, DWARF_RSP};
use nacldbg_core::types::{Address, Architecture, StopReason, ThreadId};
use nacldbg_core::{DebugSession, DebuggerError};
use support::{at, hello_database, test_config, wait_for, FakeStub, Target, SOURCE_PATH};

/// Open a session with the fixture symbols and swallow the initial stop.
fn open(stub: &FakeStub) -> (DebugSession, mpsc::Receiver<SessionEvent>)
{
    let mut session = DebugSession::with_symbols(test_config(), hello_database());
    let events = session.subscribe();
    session.open(stub.address()).unwrap();
    wait_for(&events, |event| matches!(event, SessionEvent::Stopped { .. }));
    (session, events)
}

fn is_stopped(event: &SessionEvent) -> bool
{
    matches!(event, SessionEvent::Stopped { .. })
}

fn stop_reason(event: &SessionEvent) -> Option<StopReason>
{
    match event {
        SessionEvent::Stopped { reason, .. } => Some(*reason),
        _ => None,
    }
}

fn write_i32(target: &mut Target, address: u64, value: i32)
{
    for (offset, byte) in value.to_le_bytes().into_iter().enumerate() {
        target.memory.insert(address + offset as u64, byte);
    }
}

#[test]
fn test_open_publishes_module_open_and_stop_in_order()
{
    let stub = FakeStub::start(Target {
        exec_path: Some("/nonexistent/hello.nexe".to_string()),
        ..Target::default()
    });
    let mut session = DebugSession::new(test_config());
    let events = session.subscribe();
    session.open(stub.address()).unwrap();

    match events.recv_timeout(Duration::from_secs(2)).unwrap() {
        SessionEvent::ModuleLoaded { path, status } => {
            assert_eq!(path, Path::new("/nonexistent/hello.nexe"));
            assert!(!status.loaded);
        }
        other => panic!("expected ModuleLoaded, got {other:?}"),
    }
    match events.recv_timeout(Duration::from_secs(2)).unwrap() {
        SessionEvent::Opened { architecture, module } => {
            assert_eq!(architecture, Architecture::X86_64);
            assert_eq!(module.as_deref(), Some(Path::new("/nonexistent/hello.nexe")));
        }
        other => panic!("expected Opened, got {other:?}"),
    }
    match events.recv_timeout(Duration::from_secs(2)).unwrap() {
        SessionEvent::Stopped { reason, pc, breakpoint, .. } => {
            assert_eq!(reason, StopReason::Signal(5));
            assert_eq!(pc, Some(at(0x1000)));
            assert_eq!(breakpoint, None);
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_preloaded_symbols_are_rebased_on_open()
{
    let stub = FakeStub::start(Target::default());
    let (session, _events) = open(&stub);
    assert_eq!(session.resolver().base(), at(0));
    let position = session.position_from_address(at(0x1006)).unwrap();
    assert_eq!(position.line, 3);
}

#[test]
fn test_silent_stub_times_out_and_closes()
{
    let stub = FakeStub::start(Target {
        silent: true,
        ..Target::default()
    });
    let mut config = test_config();
    config.handshake_timeout = Duration::from_millis(200);
    let mut session = DebugSession::new(config);

    let err = session.open(stub.address()).unwrap_err();
    assert!(matches!(err, DebuggerError::Timeout(_)), "unexpected error: {err}");
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_open_twice_is_rejected()
{
    let stub = FakeStub::start(Target::default());
    let (mut session, _events) = open(&stub);
    let err = session.open(stub.address()).unwrap_err();
    assert!(matches!(err, DebuggerError::InvalidState { .. }));
    assert_eq!(session.state(), SessionState::Open);
}

#[test]
fn test_breakpoint_hit_rewinds_pc()
{
    let stub = FakeStub::start(Target::default());
    let (session, events) = open(&stub);

    // 0-based line 7 is DWARF line 8, the nested block at 0x1020
    let binding = session.set_breakpoint(Path::new(SOURCE_PATH), 7).unwrap();
    assert_eq!(binding.resolution.addresses, vec![at(0x1020)]);
    assert_eq!(binding.ids.len(), 1);
    assert_eq!(stub.target().byte(at(0x1020)), Some(0xCC));

    session.continue_execution().unwrap();
    wait_for(&events, |event| *event == SessionEvent::Continuing);
    match wait_for(&events, is_stopped) {
        SessionEvent::Stopped { reason, pc, breakpoint, .. } => {
            assert_eq!(reason, StopReason::Signal(5));
            assert_eq!(pc, Some(at(0x1020)));
            assert_eq!(breakpoint, Some(binding.ids[0]));
        }
        other => panic!("expected Stopped, got {other:?}"),
    }

    assert_eq!(session.registers(None).unwrap().pc(), at(0x1020));
    assert_eq!(stub.target().registers.pc(), at(0x1020));
    assert_eq!(session.breakpoints()[0].hit_count, 1);
}

#[test]
fn test_stop_is_reported_without_waiting_for_idle_interval()
{
    let stub = FakeStub::start(Target::default());
    let config = test_config().with_poll_interval(Duration::from_secs(30));
    let mut session = DebugSession::with_symbols(config, hello_database());
    let events = session.subscribe();
    session.open(stub.address()).unwrap();
    wait_for(&events, is_stopped);
    session.set_breakpoint(Path::new(SOURCE_PATH), 7).unwrap();

    let started = Instant::now();
    session.continue_execution().unwrap();
    match wait_for(&events, is_stopped) {
        SessionEvent::Stopped { pc, .. } => assert_eq!(pc, Some(at(0x1020))),
        other => panic!("expected Stopped, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
    session.close().unwrap();
}

#[test]
fn test_continue_from_breakpoint_runs_instruction_once()
{
    let stub = FakeStub::start(Target::default());
    let (session, events) = open(&stub);
    session.set_breakpoint(Path::new(SOURCE_PATH), 7).unwrap();

    session.continue_execution().unwrap();
    wait_for(&events, is_stopped);
    session.continue_execution().unwrap();
    let stopped = wait_for(&events, is_stopped);
    assert_eq!(stop_reason(&stopped), Some(StopReason::Exited(0)));

    let executed = stub.target().executed.clone();
    assert_eq!(executed, (0x1000..0x1060).collect::<Vec<u64>>());
    // The trap was put back before the target ran on.
    assert_eq!(stub.target().byte(at(0x1020)), Some(0xCC));
}

#[test]
fn test_step_from_breakpoint_finishes_line()
{
    let mut target = Target::default();
    target.registers.set_pc(at(0x1004));
    let stub = FakeStub::start(target);
    let (session, events) = open(&stub);
    session.set_breakpoint(Path::new(SOURCE_PATH), 3).unwrap();
    assert_eq!(stub.target().byte(at(0x1004)), Some(0xCC));

    let stop = session.step(None).unwrap();
    assert_eq!(stop.reason, StopReason::Signal(5));

    assert_eq!(stub.target().executed, (0x1004..0x100c).collect::<Vec<u64>>());
    assert_eq!(stub.target().registers.pc(), at(0x100c));
    assert_eq!(stub.target().byte(at(0x1004)), Some(0xCC));

    match wait_for(&events, |_| true) {
        SessionEvent::Stopped { pc, breakpoint, .. } => {
            assert_eq!(pc, Some(at(0x100c)));
            assert_eq!(breakpoint, None);
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
    assert!(matches!(wait_for(&events, |_| true), SessionEvent::StepFinished { .. }));
}

#[test]
fn test_step_from_breakpoint_without_symbols_advances()
{
    let stub = FakeStub::start(Target::default());
    let mut session = DebugSession::new(test_config());
    let events = session.subscribe();
    session.open(stub.address()).unwrap();
    wait_for(&events, is_stopped);
    session.remote().add_breakpoint(at(0x1000), BreakpointKind::User).unwrap();

    session.step(None).unwrap();
    match wait_for(&events, is_stopped) {
        SessionEvent::Stopped { pc, breakpoint, .. } => {
            assert_eq!(pc, Some(at(0x1001)));
            assert_eq!(breakpoint, None);
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
    session.step(None).unwrap();

    assert_eq!(stub.target().executed, vec![0x1000, 0x1001]);
    assert_eq!(stub.target().registers.pc(), at(0x1002));
    assert_eq!(stub.target().byte(at(0x1000)), Some(0xCC));
    assert_eq!(session.breakpoints()[0].hit_count, 0);
}

#[test]
fn test_step_from_breakpoint_on_last_instruction_of_line()
{
    let mut target = Target::default();
    target.registers.set_pc(at(0x1003));
    let stub = FakeStub::start(target);
    let (session, events) = open(&stub);
    session.remote().add_breakpoint(at(0x1003), BreakpointKind::User).unwrap();

    // 0x1003 ends line 3; one instruction reaches line 4.
    session.step(None).unwrap();
    assert_eq!(stub.target().executed, vec![0x1003]);
    assert_eq!(stub.target().registers.pc(), at(0x1004));
    match wait_for(&events, is_stopped) {
        SessionEvent::Stopped { pc, breakpoint, .. } => {
            assert_eq!(pc, Some(at(0x1004)));
            assert_eq!(breakpoint, None);
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
    assert_eq!(session.position_from_address(at(0x1004)).unwrap().line, 3);

    // The next step runs the whole of line 4.
    session.step(None).unwrap();
    assert_eq!(stub.target().executed, (0x1003..0x100c).collect::<Vec<u64>>());
    assert_eq!(stub.target().byte(at(0x1003)), Some(0xCC));
    assert_eq!(session.breakpoints()[0].hit_count, 0);
}

#[test]
fn test_step_without_symbols_is_one_instruction()
{
    let stub = FakeStub::start(Target::default());
    let mut session = DebugSession::new(test_config());
    let events = session.subscribe();
    session.open(stub.address()).unwrap();
    wait_for(&events, is_stopped);
    assert!(!session.resolver().is_loaded());

    session.step(None).unwrap();
    assert_eq!(stub.target().executed, vec![0x1000]);
}

#[test]
fn test_step_honours_instruction_limit()
{
    let stub = FakeStub::start(Target::default());
    let mut config = test_config();
    config.max_step_instructions = Some(3);
    let mut session = DebugSession::with_symbols(config, hello_database());
    let events = session.subscribe();
    session.open(stub.address()).unwrap();
    wait_for(&events, is_stopped);

    // Line 3 spans four instructions.
    session.step(None).unwrap();
    assert_eq!(stub.target().executed, vec![0x1000, 0x1001, 0x1002]);
}

#[test]
fn test_step_over_removes_temporaries_before_stop()
{
    let stub = FakeStub::start(Target::default());
    let (session, events) = open(&stub);

    // The caller's return address slot is zero, so only line starts are targets.
    session.step_over(None).unwrap();

    match wait_for(&events, is_stopped) {
        SessionEvent::Stopped { pc, breakpoint, .. } => {
            assert_eq!(pc, Some(at(0x1004)));
            assert_eq!(breakpoint, None);
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
    assert!(session.breakpoints().is_empty());
    for address in [0x1004, 0x100c, 0x1020, 0x1030] {
        assert_eq!(stub.target().byte(at(address)), Some(0x90));
    }
}

#[test]
fn test_step_out_targets_return_address()
{
    let mut target = Target::default();
    target.registers.set_pc(at(0x1048));
    target.write_u64(0x7000, at(0x1010).value());
    target.run_forever = true;
    let stub = FakeStub::start(target);
    let (session, events) = open(&stub);

    session.step_out(None).unwrap();
    let breakpoints = session.breakpoints();
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(breakpoints[0].address, at(0x1010));
    assert_eq!(breakpoints[0].kind, BreakpointKind::Temporary);

    session.request_break().unwrap();
    wait_for(&events, is_stopped);
    assert!(session.breakpoints().is_empty());
    assert_eq!(stub.target().byte(at(0x1010)), Some(0x90));
}

#[test]
fn test_step_out_without_caller_is_unsupported()
{
    let stub = FakeStub::start(Target::default());
    let (session, _events) = open(&stub);
    // Return address slot at the bottom of the stack is zero.
    let err = session.step_out(None).unwrap_err();
    assert!(matches!(err, DebuggerError::Unsupported(_)));
    assert!(session.breakpoints().is_empty());
}

#[test]
fn test_request_break_interrupts_running_target()
{
    let stub = FakeStub::start(Target {
        run_forever: true,
        ..Target::default()
    });
    let (session, events) = open(&stub);

    session.continue_execution().unwrap();
    assert!(session.remote().is_running());
    session.request_break().unwrap();
    let stopped = wait_for(&events, is_stopped);
    assert_eq!(stop_reason(&stopped), Some(StopReason::Signal(2)));
    assert!(!session.remote().is_running());
}

#[test]
fn test_request_break_while_stopped_does_nothing()
{
    let stub = FakeStub::start(Target::default());
    let (session, _events) = open(&stub);
    session.request_break().unwrap();
    assert!(!stub.target().commands.iter().any(|command| command == "\\x03"));
}

#[test]
fn test_output_arrives_before_stop()
{
    let stub = FakeStub::start(Target {
        output: Some("hello, world\n".to_string()),
        ..Target::default()
    });
    let (session, events) = open(&stub);

    session.continue_execution().unwrap();
    let event = wait_for(&events, |event| matches!(event, SessionEvent::Output(_) | SessionEvent::Stopped { .. }));
    assert_eq!(event, SessionEvent::Output("hello, world\n".to_string()));
    let stopped = wait_for(&events, is_stopped);
    assert_eq!(stop_reason(&stopped), Some(StopReason::Exited(0)));
}

#[test]
fn test_close_while_running()
{
    let stub = FakeStub::start(Target {
        run_forever: true,
        ..Target::default()
    });
    let (session, events) = open(&stub);
    session.continue_execution().unwrap();

    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    wait_for(&events, |event| *event == SessionEvent::Closed);
    // Closing again is a no-op.
    session.close().unwrap();
}

#[test]
fn test_close_restores_breakpoint_bytes()
{
    let stub = FakeStub::start(Target::default());
    let (session, _events) = open(&stub);
    session.set_breakpoint(Path::new(SOURCE_PATH), 9).unwrap();
    assert_eq!(stub.target().byte(at(0x1030)), Some(0xCC));

    session.close().unwrap();
    assert_eq!(stub.target().byte(at(0x1030)), Some(0x90));
    assert!(session.breakpoints().is_empty());
}

#[test]
fn test_target_access_requires_stopped_target()
{
    let stub = FakeStub::start(Target {
        run_forever: true,
        ..Target::default()
    });
    let (session, _events) = open(&stub);
    session.continue_execution().unwrap();

    assert!(matches!(
        session.read_memory(at(0x1000), 4),
        Err(DebuggerError::InvalidState { .. })
    ));
    assert!(matches!(session.registers(None), Err(DebuggerError::InvalidState { .. })));
    assert!(matches!(
        session.set_breakpoint(Path::new(SOURCE_PATH), 3),
        Err(DebuggerError::InvalidState { .. })
    ));
}

#[test]
fn test_memory_reads_hide_breakpoints()
{
    let stub = FakeStub::start(Target::default());
    let (session, _events) = open(&stub);
    session.set_breakpoint(Path::new(SOURCE_PATH), 3).unwrap();

    assert_eq!(session.read_memory(at(0x1000), 8).unwrap(), vec![0x90; 8]);
    assert_eq!(stub.target().byte(at(0x1004)), Some(0xCC));
}

#[test]
fn test_memory_writes_keep_breakpoints_armed()
{
    let stub = FakeStub::start(Target::default());
    let (session, _events) = open(&stub);
    session.set_breakpoint(Path::new(SOURCE_PATH), 3).unwrap();

    session.write_memory(at(0x1003), &[0x55, 0x56]).unwrap();
    assert_eq!(stub.target().byte(at(0x1003)), Some(0x55));
    assert_eq!(stub.target().byte(at(0x1004)), Some(0xCC));
    assert_eq!(session.read_memory(at(0x1003), 2).unwrap(), vec![0x55, 0x56]);
    assert_eq!(session.breakpoints()[0].original_byte, 0x56);
}

#[test]
fn test_unmapped_memory_is_reported()
{
    let stub = FakeStub::start(Target::default());
    let (session, _events) = open(&stub);
    let err = session.read_memory(Address::new(0x10), 4).unwrap_err();
    assert!(matches!(err, DebuggerError::MemoryAccess { .. }));
}

#[test]
fn test_threads()
{
    let stub = FakeStub::start(Target {
        threads: vec![1, 0x2a],
        ..Target::default()
    });
    let (session, _events) = open(&stub);
    assert_eq!(session.threads().unwrap(), vec![ThreadId(1), ThreadId(0x2a)]);
}

#[test]
fn test_clear_breakpoint_restores_byte()
{
    let stub = FakeStub::start(Target::default());
    let (session, _events) = open(&stub);
    session.set_breakpoint(Path::new(SOURCE_PATH), 5).unwrap();
    assert_eq!(stub.target().byte(at(0x100c)), Some(0xCC));

    assert_eq!(session.clear_breakpoint(Path::new(SOURCE_PATH), 5).unwrap(), 1);
    assert_eq!(stub.target().byte(at(0x100c)), Some(0x90));
    assert!(session.breakpoints().is_empty());
    assert_eq!(session.clear_breakpoint(Path::new(SOURCE_PATH), 5).unwrap(), 0);
}

#[test]
fn test_call_stack_and_variables()
{
    let mut target = Target::default();
    target.registers.set_pc(at(0x1024));
    target.registers.set(DWARF_RSP, 0x7080);
    target.registers.set(DWARF_RBP, 0x7100);
    write_i32(&mut target, 0x7110 - 20, 42);
    write_i32(&mut target, 0x7110 - 24, -7);
    let stub = FakeStub::start(target);
    let (session, _events) = open(&stub);

    let frames = session.call_stack(None).unwrap();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.function.name, "main");
    assert_eq!(frame.cfa, Some(Address::new(0x7110)));
    assert_eq!(frame.ide_position().map(|position| position.line), Some(7));

    let symbols = session.symbols_for_frame(frame);
    let rendered: Vec<(String, Option<String>)> = symbols
        .iter()
        .map(|symbol| (symbol.name.clone(), session.format_symbol(symbol)))
        .collect();
    assert_eq!(
        rendered,
        vec![
            ("inner".to_string(), Some("-7".to_string())),
            ("count".to_string(), Some("42".to_string())),
        ]
    );
}
