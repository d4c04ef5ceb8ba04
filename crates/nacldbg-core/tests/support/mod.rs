//! Shared fixtures: a hand-built symbol database for a small C module and an
//! in-process GDB stub that emulates a target with one-byte instructions.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nacldbg_core::events::SessionEvent;
use nacldbg_core::symbols::{
    dwarf, AttributeValue, DebugInfoEntry, EntryKey, FileKey, Rule, RuleKind, RuleRegister, SourceLocation,
    SymbolDatabase,
};
use nacldbg_core::types::registers::{DWARF_R15, DWARF_RBP, DWARF_RIP, DWARF_RSP};
use nacldbg_core::types::{Address, Registers};
use nacldbg_core::unwind::MemoryAccess;
use nacldbg_core::{DebuggerError, SessionConfig};
use nacldbg_protocol::{hex, packet, Frame, PacketDecoder};

// hello.c
//
//   3  int main(void) {
//   4      int count = 0;
//   6      count = helper();
//   8      { int inner = count; }
//  10      return count;
//     }
//  14  int helper(void) {
//  15      return 1;
//     }

pub const SOURCE_PATH: &str = "/build/src/hello.c";
pub const CU: EntryKey = EntryKey::from_parts(0, 0x0b);
pub const MAIN: EntryKey = EntryKey::from_parts(0, 0x20);
pub const COUNT: EntryKey = EntryKey::from_parts(0, 0x30);
pub const BLOCK: EntryKey = EntryKey::from_parts(0, 0x38);
pub const INNER: EntryKey = EntryKey::from_parts(0, 0x40);
pub const HELPER: EntryKey = EntryKey::from_parts(0, 0x50);
pub const INT: EntryKey = EntryKey::from_parts(0, 0x60);
pub const FILE: FileKey = FileKey::from_parts(0, 1);

/// Module base used by the stub (`r15`).
pub const BASE: u64 = 0x4000_0000;
/// Bottom of the emulated stack.
pub const STACK: u64 = 0x7000;

/// Line rows as `(start, length, line)`.
pub const ROWS: [(u64, u64, u32); 7] = [
    (0x1000, 0x4, 3),
    (0x1004, 0x8, 4),
    (0x100c, 0x14, 6),
    (0x1020, 0x10, 8),
    (0x1030, 0x10, 10),
    (0x1040, 0x10, 14),
    (0x1050, 0x10, 15),
];

fn fbreg(offset: u8) -> AttributeValue
{
    AttributeValue::Bytes(vec![dwarf::DW_OP_fbreg.0, offset])
}

fn cfa_rule(address: u64, register: u16, offset: i64) -> Rule
{
    Rule {
        address,
        register: RuleRegister::Cfa,
        kind: RuleKind::ValOffset {
            base: RuleRegister::Dwarf(register),
            offset,
        },
    }
}

fn saved_rule(address: u64, register: u16, offset: i64) -> Rule
{
    Rule {
        address,
        register: RuleRegister::Dwarf(register),
        kind: RuleKind::Offset {
            base: RuleRegister::Cfa,
            offset,
        },
    }
}

/// Everything the fixture database contains, still unindexed.
pub fn hello_builder() -> nacldbg_core::symbols::DatabaseBuilder
{
    let mut builder = SymbolDatabase::builder();
    builder.add_entry(
        DebugInfoEntry::new(CU, None, dwarf::DW_TAG_compile_unit)
            .with_attribute(dwarf::DW_AT_name, AttributeValue::String("hello.c".into()))
            .with_attribute(dwarf::DW_AT_low_pc, AttributeValue::Unsigned(0x1000))
            .with_attribute(dwarf::DW_AT_high_pc, AttributeValue::Unsigned(0x1060)),
    );
    builder.add_entry(
        DebugInfoEntry::new(MAIN, Some(CU), dwarf::DW_TAG_subprogram)
            .with_outer_scope(Some(CU))
            .with_attribute(dwarf::DW_AT_name, AttributeValue::String("main".into()))
            .with_attribute(dwarf::DW_AT_low_pc, AttributeValue::Unsigned(0x1000))
            .with_attribute(dwarf::DW_AT_high_pc, AttributeValue::Unsigned(0x1040))
            .with_attribute(
                dwarf::DW_AT_frame_base,
                AttributeValue::Bytes(vec![dwarf::DW_OP_call_frame_cfa.0]),
            ),
    );
    builder.add_entry(
        DebugInfoEntry::new(COUNT, Some(MAIN), dwarf::DW_TAG_variable)
            .with_outer_scope(Some(MAIN))
            .with_attribute(dwarf::DW_AT_name, AttributeValue::String("count".into()))
            .with_attribute(dwarf::DW_AT_location, fbreg(0x6c))
            .with_attribute(dwarf::DW_AT_type, AttributeValue::Reference(INT)),
    );
    builder.add_entry(
        DebugInfoEntry::new(BLOCK, Some(MAIN), dwarf::DW_TAG_lexical_block)
            .with_outer_scope(Some(MAIN))
            .with_attribute(dwarf::DW_AT_low_pc, AttributeValue::Unsigned(0x1020))
            .with_attribute(dwarf::DW_AT_high_pc, AttributeValue::Unsigned(0x1030)),
    );
    builder.add_entry(
        DebugInfoEntry::new(INNER, Some(BLOCK), dwarf::DW_TAG_variable)
            .with_outer_scope(Some(BLOCK))
            .with_attribute(dwarf::DW_AT_name, AttributeValue::String("inner".into()))
            .with_attribute(dwarf::DW_AT_location, fbreg(0x68))
            .with_attribute(dwarf::DW_AT_type, AttributeValue::Reference(INT)),
    );
    builder.add_entry(
        DebugInfoEntry::new(HELPER, Some(CU), dwarf::DW_TAG_subprogram)
            .with_outer_scope(Some(CU))
            .with_attribute(dwarf::DW_AT_name, AttributeValue::String("helper".into()))
            .with_attribute(dwarf::DW_AT_low_pc, AttributeValue::Unsigned(0x1040))
            .with_attribute(dwarf::DW_AT_high_pc, AttributeValue::Unsigned(0x1060)),
    );
    builder.add_entry(
        DebugInfoEntry::new(INT, Some(CU), dwarf::DW_TAG_base_type)
            .with_attribute(dwarf::DW_AT_name, AttributeValue::String("int".into()))
            .with_attribute(dwarf::DW_AT_byte_size, AttributeValue::Unsigned(4))
            .with_attribute(
                dwarf::DW_AT_encoding,
                AttributeValue::Unsigned(u64::from(dwarf::DW_ATE_signed.0)),
            ),
    );

    builder.add_scope_transition(0x1000, Some(MAIN));
    builder.add_scope_transition(0x1020, Some(BLOCK));
    builder.add_scope_transition(0x1030, Some(MAIN));
    builder.add_scope_transition(0x1040, Some(HELPER));
    builder.add_scope_transition(0x1060, None);

    builder.add_file(FILE, "hello.c", "/build/src");
    for (start, length, line) in ROWS {
        builder.add_location(SourceLocation {
            start,
            length,
            file: FILE,
            line,
            column: 0,
        });
    }

    // main: push rbp; mov rbp, rsp
    builder.add_call_frame(0x1000);
    builder.add_rule(0x1000, cfa_rule(0x1000, DWARF_RSP, 8));
    builder.add_rule(0x1000, saved_rule(0x1000, DWARF_RIP, -8));
    builder.add_rule(0x1000, cfa_rule(0x1001, DWARF_RSP, 16));
    builder.add_rule(0x1000, saved_rule(0x1001, DWARF_RBP, -16));
    builder.add_rule(0x1000, cfa_rule(0x1004, DWARF_RBP, 16));
    // helper: leaf without a frame
    builder.add_call_frame(0x1040);
    builder.add_rule(0x1040, cfa_rule(0x1040, DWARF_RSP, 8));
    builder.add_rule(0x1040, saved_rule(0x1040, DWARF_RIP, -8));
    builder
}

/// The indexed fixture database.
pub fn hello_database() -> SymbolDatabase
{
    hello_builder().build_indices().unwrap()
}

/// Configuration tuned for fast tests.
pub fn test_config() -> SessionConfig
{
    let mut config = SessionConfig::default().with_poll_interval(Duration::from_millis(10));
    config.handshake_timeout = Duration::from_secs(2);
    config
}

/// Absolute address of a module-relative one.
pub fn at(relative: u64) -> Address
{
    Address::new(BASE + relative)
}

/// Wait for the next event matching `predicate`, failing after two seconds.
pub fn wait_for(
    events: &mpsc::Receiver<SessionEvent>,
    mut predicate: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent
{
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(2))
            .expect("timed out waiting for a session event");
        if predicate(&event) {
            return event;
        }
    }
}

/// Sparse memory for resolver and unwinder tests.
#[derive(Debug, Default)]
pub struct TestMemory(pub BTreeMap<u64, u8>);

impl TestMemory
{
    pub fn write_u64(&mut self, address: u64, value: u64)
    {
        for (offset, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.0.insert(address + offset as u64, byte);
        }
    }
}

impl MemoryAccess for TestMemory
{
    fn read_bytes(&self, address: Address, length: usize) -> nacldbg_core::Result<Vec<u8>>
    {
        (0..length as u64)
            .map(|offset| self.0.get(&(address.value() + offset)).copied())
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| DebuggerError::MemoryAccess {
                address,
                length,
                reason: "unmapped".to_string(),
            })
    }
}

/// Emulated target state.
#[derive(Debug, Clone)]
pub struct Target
{
    pub registers: Registers,
    pub memory: BTreeMap<u64, u8>,
    /// `qExecPath` answer; `None` replies with an empty packet
    pub exec_path: Option<String>,
    pub architecture: String,
    pub threads: Vec<u64>,
    /// Addresses of instructions executed, in order
    pub executed: Vec<u64>,
    /// Every packet received, as text
    pub commands: Vec<String>,
    /// Sent as `O` packets when the target is continued
    pub output: Option<String>,
    /// `c` never stops by itself; only an interrupt ends the run
    pub run_forever: bool,
    /// Never acknowledge anything
    pub silent: bool,
    pub running: bool,
}

impl Default for Target
{
    fn default() -> Self
    {
        let mut registers = Registers::new();
        registers.set_pc(at(0x1000));
        registers.set(DWARF_RSP, STACK);
        registers.set(DWARF_RBP, STACK + 0x100);
        registers.set(DWARF_R15, BASE);

        let mut memory = BTreeMap::new();
        for address in 0x1000..0x1060 {
            memory.insert(BASE + address, 0x90);
        }
        for address in STACK..STACK + 0x200 {
            memory.insert(address, 0);
        }

        Self {
            registers,
            memory,
            exec_path: None,
            architecture: "i386:x86-64".to_string(),
            threads: vec![1],
            executed: Vec::new(),
            commands: Vec::new(),
            output: None,
            run_forever: false,
            silent: false,
            running: false,
        }
    }
}

impl Target
{
    pub fn write_u64(&mut self, address: u64, value: u64)
    {
        for (offset, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.memory.insert(address + offset as u64, byte);
        }
    }

    pub fn byte(&self, address: Address) -> Option<u8>
    {
        self.memory.get(&address.value()).copied()
    }

    fn stop_reply(signal: u8) -> String
    {
        format!("T{signal:02x}thread:01;")
    }

    /// Execute one instruction. `None` means the program ran off mapped
    /// memory and exited.
    fn execute(&mut self) -> Option<bool>
    {
        let pc = self.registers.pc();
        let byte = self.byte(pc)?;
        self.registers.set_pc(pc + 1);
        if byte == 0xCC {
            return Some(true);
        }
        self.executed.push(pc.value() - BASE);
        Some(false)
    }

    fn single_step(&mut self) -> String
    {
        match self.execute() {
            Some(_) => Self::stop_reply(5),
            None => "W00".to_string(),
        }
    }

    fn resume(&mut self) -> Option<String>
    {
        if self.run_forever {
            self.running = true;
            return None;
        }
        loop {
            match self.execute() {
                Some(true) => return Some(Self::stop_reply(5)),
                Some(false) => {}
                None => return Some("W00".to_string()),
            }
        }
    }

    fn read(&self, request: &str) -> String
    {
        let Some((address, length)) = request.split_once(',') else {
            return "E01".to_string();
        };
        let (Ok(address), Ok(length)) = (u64::from_str_radix(address, 16), u64::from_str_radix(length, 16)) else {
            return "E01".to_string();
        };
        let bytes: Option<Vec<u8>> = (address..address + length)
            .map(|address| self.memory.get(&address).copied())
            .collect();
        bytes.map_or_else(|| "E14".to_string(), |bytes| hex::encode(&bytes))
    }

    fn write(&mut self, request: &str) -> String
    {
        let Some((header, data)) = request.split_once(':') else {
            return "E01".to_string();
        };
        let Some((address, _)) = header.split_once(',') else {
            return "E01".to_string();
        };
        let (Ok(address), Ok(bytes)) = (u64::from_str_radix(address, 16), hex::decode(data.as_bytes())) else {
            return "E01".to_string();
        };
        if (address..address + bytes.len() as u64).any(|address| !self.memory.contains_key(&address)) {
            return "E14".to_string();
        }
        for (offset, byte) in bytes.into_iter().enumerate() {
            self.memory.insert(address + offset as u64, byte);
        }
        "OK".to_string()
    }

    /// Replies to one packet; `None` for packets answered later (`c`).
    fn handle(&mut self, payload: &str) -> Vec<String>
    {
        self.commands.push(payload.to_string());
        if let Some(rest) = payload.strip_prefix("qXfer:features:read:target.xml:") {
            return vec![if rest.starts_with("0,") {
                format!("l<target><architecture>{}</architecture></target>", self.architecture)
            } else {
                "l".to_string()
            }];
        }
        let reply = match payload {
            "qExecPath" => self.exec_path.as_deref().map(|path| hex::encode(path.as_bytes())).unwrap_or_default(),
            "?" => Self::stop_reply(5),
            "g" => hex::encode(&self.registers.to_gdb_bytes()),
            "s" => self.single_step(),
            "c" => {
                let mut replies: Vec<String> = self
                    .output
                    .iter()
                    .map(|text| format!("O{}", hex::encode(text.as_bytes())))
                    .collect();
                replies.extend(self.resume());
                return replies;
            }
            "qfThreadInfo" => {
                let ids: Vec<String> = self.threads.iter().map(|id| format!("{id:x}")).collect();
                format!("m{}", ids.join(","))
            }
            "qsThreadInfo" => "l".to_string(),
            other if other.starts_with("Hg") => "OK".to_string(),
            other if other.starts_with('G') => match hex::decode(other[1..].as_bytes())
                .ok()
                .and_then(|bytes| Registers::from_gdb_bytes(&bytes).ok())
            {
                Some(registers) => {
                    self.registers = registers;
                    "OK".to_string()
                }
                None => "E01".to_string(),
            },
            other if other.starts_with('m') => self.read(&other[1..]),
            other if other.starts_with('M') => self.write(&other[1..]),
            _ => String::new(),
        };
        vec![reply]
    }

    fn interrupt(&mut self) -> Option<String>
    {
        self.commands.push("\\x03".to_string());
        if self.running {
            self.running = false;
            return Some(Self::stop_reply(2));
        }
        None
    }
}

/// In-process GDB stub listening on `127.0.0.1`.
pub struct FakeStub
{
    address: String,
    target: Arc<Mutex<Target>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FakeStub
{
    pub fn start(target: Target) -> Self
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let target = Arc::new(Mutex::new(target));
        let stop = Arc::new(AtomicBool::new(false));

        let shared = Arc::clone(&target);
        let stopping = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            listener.set_nonblocking(true).unwrap();
            while !stopping.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => serve(stream, &shared, &stopping),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(5)),
                    Err(_) => break,
                }
            }
        });

        Self {
            address,
            target,
            stop,
            handle: Some(handle),
        }
    }

    pub fn address(&self) -> &str
    {
        &self.address
    }

    /// Inspect or modify the emulated target.
    pub fn target(&self) -> std::sync::MutexGuard<'_, Target>
    {
        self.target.lock().unwrap()
    }
}

impl Drop for FakeStub
{
    fn drop(&mut self)
    {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn send(stream: &mut TcpStream, payload: &str) -> bool
{
    stream.write_all(&packet::encode(payload.as_bytes())).is_ok()
}

fn serve(mut stream: TcpStream, target: &Mutex<Target>, stop: &AtomicBool)
{
    stream.set_nonblocking(false).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(10))).unwrap();
    let mut decoder = PacketDecoder::new();
    let mut buffer = [0u8; 4096];
    while !stop.load(Ordering::SeqCst) {
        let read = match stream.read(&mut buffer) {
            Ok(0) => return,
            Ok(read) => read,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(_) => return,
        };
        for frame in decoder.feed(&buffer[..read]) {
            let mut target = target.lock().unwrap();
            if target.silent {
                continue;
            }
            match frame {
                Frame::Packet(payload) => {
                    if stream.write_all(b"+").is_err() {
                        return;
                    }
                    for reply in target.handle(&String::from_utf8_lossy(&payload)) {
                        if !send(&mut stream, &reply) {
                            return;
                        }
                    }
                }
                Frame::Interrupt => {
                    if let Some(reply) = target.interrupt() {
                        if !send(&mut stream, &reply) {
                            return;
                        }
                    }
                }
                Frame::Corrupt { .. } => {
                    let _ = stream.write_all(b"-");
                }
                Frame::Ack | Frame::Nack => {}
            }
        }
    }
}
