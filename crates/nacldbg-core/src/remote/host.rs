//! Semantic GDB remote operations.
//!
//! [`GdbHost`] turns the operations the session needs (read registers, write
//! memory, single-step, ...) into packets and decodes the replies. It owns
//! the packet [`Connection`] and nothing else; session state lives in
//! [`super::RemoteSession`].

use std::net::TcpStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nacldbg_protocol::{hex, Connection, ProtocolError, Transport};
use tracing::{debug, trace};

use crate::error::{DebuggerError, Result};
use crate::types::{Address, Architecture, Registers, StopReason, ThreadId};

/// Largest memory transfer issued as a single `m`/`M` packet.
pub const MAX_MEMORY_CHUNK: usize = 0x800;

/// A decoded stop reply (`S`, `T`, `W` or `X`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopEvent
{
    pub reason: StopReason,
    pub thread: Option<ThreadId>,
}

/// Client side of a GDB remote stub connection.
#[derive(Debug)]
pub struct GdbHost<T: Transport = TcpStream>
{
    connection: Connection<T>,
    timeout: Duration,
    output: Vec<String>,
}

impl GdbHost<TcpStream>
{
    /// Connect to `address` (`host:port`).
    ///
    /// # Errors
    ///
    /// [`DebuggerError::Protocol`] when the connection cannot be made.
    pub fn connect(address: &str, timeout: Duration) -> Result<Self>
    {
        let connection = Connection::connect(address, timeout)?;
        Ok(Self::new(connection, timeout))
    }
}

impl<T: Transport> GdbHost<T>
{
    /// Wrap an established connection; `timeout` bounds every request.
    pub fn new(connection: Connection<T>, timeout: Duration) -> Self
    {
        Self {
            connection,
            timeout,
            output: Vec::new(),
        }
    }

    /// Send a request and return the reply payload.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Remote`] (wrapped) when the stub answers `Exx`, and
    /// any transport failure.
    pub fn transact(&mut self, payload: &[u8]) -> Result<Vec<u8>>
    {
        let reply = self.connection.transact(payload, self.timeout)?;
        if let Some(code) = error_reply(&reply) {
            debug!(request = %String::from_utf8_lossy(payload), code, "stub reported an error");
            return Err(ProtocolError::Remote(code).into());
        }
        Ok(reply)
    }

    fn expect_ok(&mut self, payload: &[u8]) -> Result<()>
    {
        let reply = self.transact(payload)?;
        if reply == b"OK" {
            Ok(())
        } else {
            Err(unexpected(payload, &reply))
        }
    }

    /// Fetch `target.xml` with `qXfer:features:read`.
    ///
    /// Returns an empty string when the stub does not support the request.
    ///
    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub fn target_description(&mut self) -> Result<String>
    {
        let mut document = Vec::new();
        loop {
            let request = format!("qXfer:features:read:target.xml:{:x},fff", document.len());
            let reply = self.transact(request.as_bytes())?;
            match reply.split_first() {
                None => return Ok(String::new()),
                Some((&b'm', chunk)) if !chunk.is_empty() => document.extend_from_slice(chunk),
                Some((&(b'l' | b'm'), chunk)) => {
                    document.extend_from_slice(chunk);
                    break;
                }
                Some(_) => return Err(unexpected(request.as_bytes(), &reply)),
            }
        }
        Ok(String::from_utf8_lossy(&document).into_owned())
    }

    /// Target architecture from the target description.
    ///
    /// # Errors
    ///
    /// See [`GdbHost::target_description`].
    pub fn architecture(&mut self) -> Result<Architecture>
    {
        let description = self.target_description()?;
        Ok(Architecture::from_target_description(&description))
    }

    /// Path of the module the stub is running (`qExecPath`, hex encoded).
    ///
    /// # Errors
    ///
    /// Transport failures and undecodable replies.
    pub fn exec_path(&mut self) -> Result<Option<PathBuf>>
    {
        let reply = match self.transact(b"qExecPath") {
            Ok(reply) => reply,
            Err(DebuggerError::Protocol(ProtocolError::Remote(_))) => return Ok(None),
            Err(err) => return Err(err),
        };
        if reply.is_empty() {
            return Ok(None);
        }
        let path = hex::decode(&reply)?;
        Ok(Some(PathBuf::from(String::from_utf8_lossy(&path).into_owned())))
    }

    /// Read the register file of `thread` (the current thread when `None`).
    ///
    /// # Errors
    ///
    /// [`DebuggerError::RegisterAccess`] for a short or undecodable reply.
    pub fn read_registers(&mut self, thread: Option<ThreadId>) -> Result<Registers>
    {
        if let Some(thread) = thread {
            self.expect_ok(format!("Hg{thread}").as_bytes())?;
        }
        let reply = self.transact(b"g")?;
        let bytes = hex::decode(&reply)
            .map_err(|err| DebuggerError::RegisterAccess(format!("undecodable register reply: {err}")))?;
        let registers = Registers::from_gdb_bytes(&bytes)?;
        debug!(pc = %registers.pc(), sp = %registers.sp(), "read registers");
        Ok(registers)
    }

    /// Write the whole register file of the current thread.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::RegisterAccess`] when the stub rejects the write.
    pub fn write_registers(&mut self, registers: &Registers) -> Result<()>
    {
        let mut request = b"G".to_vec();
        request.extend_from_slice(hex::encode(&registers.to_gdb_bytes()).as_bytes());
        self.expect_ok(&request)
            .map_err(|err| DebuggerError::RegisterAccess(format!("register write rejected: {err}")))
    }

    /// Read `length` bytes at `address`.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::MemoryAccess`] when the stub refuses the read or
    /// returns fewer bytes than requested.
    pub fn read_memory(&mut self, address: Address, length: usize) -> Result<Vec<u8>>
    {
        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            let chunk_address = address + data.len() as u64;
            let chunk_length = (length - data.len()).min(MAX_MEMORY_CHUNK);
            let request = format!("m{:x},{chunk_length:x}", chunk_address.value());
            let reply = self
                .transact(request.as_bytes())
                .map_err(|err| memory_error(err, address, length))?;
            let bytes = hex::decode(&reply).map_err(|err| DebuggerError::MemoryAccess {
                address,
                length,
                reason: err.to_string(),
            })?;
            if bytes.is_empty() {
                return Err(DebuggerError::MemoryAccess {
                    address,
                    length,
                    reason: format!("short read at {chunk_address}"),
                });
            }
            data.extend_from_slice(&bytes);
        }
        data.truncate(length);
        Ok(data)
    }

    /// Write `data` at `address`.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::MemoryAccess`] when the stub refuses the write.
    pub fn write_memory(&mut self, address: Address, data: &[u8]) -> Result<()>
    {
        for (index, chunk) in data.chunks(MAX_MEMORY_CHUNK).enumerate() {
            let chunk_address = address + (index * MAX_MEMORY_CHUNK) as u64;
            let request = format!("M{:x},{:x}:{}", chunk_address.value(), chunk.len(), hex::encode(chunk));
            self.expect_ok(request.as_bytes())
                .map_err(|err| memory_error(err, address, data.len()))?;
        }
        Ok(())
    }

    /// Execute one instruction and wait for the resulting stop.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::Timeout`] when no stop reply arrives in time.
    pub fn single_step(&mut self) -> Result<StopEvent>
    {
        self.connection.send_packet(b"s", self.timeout)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DebuggerError::Timeout("single-step stop reply".to_string()));
            }
            if let Some(stop) = self.poll_stop(remaining)? {
                return Ok(stop);
            }
        }
    }

    /// Resume the target; the stop reply arrives later through
    /// [`GdbHost::poll_stop`].
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn resume(&mut self) -> Result<()>
    {
        self.connection.send_packet(b"c", self.timeout)?;
        Ok(())
    }

    /// Ask a running target to stop.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn interrupt(&mut self) -> Result<()>
    {
        self.connection.send_interrupt()?;
        Ok(())
    }

    /// Wait up to `timeout` for a stop reply.
    ///
    /// Program output (`O` packets) that arrives meanwhile is buffered for
    /// [`GdbHost::take_output`].
    ///
    /// # Errors
    ///
    /// Transport failures and malformed stop replies.
    pub fn poll_stop(&mut self, timeout: Duration) -> Result<Option<StopEvent>>
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(packet) = self.connection.recv_packet(remaining)? else {
                return Ok(None);
            };
            if let Some(text) = console_output(&packet) {
                trace!(bytes = text.len(), "program output");
                self.output.push(text);
                continue;
            }
            return parse_stop_reply(&packet).map(Some);
        }
    }

    /// Query why the target last stopped (`?`).
    ///
    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub fn last_signal(&mut self) -> Result<StopEvent>
    {
        let reply = self.transact(b"?")?;
        parse_stop_reply(&reply)
    }

    /// Thread list from `qfThreadInfo` / `qsThreadInfo`.
    ///
    /// # Errors
    ///
    /// Transport failures and malformed replies.
    pub fn threads(&mut self) -> Result<Vec<ThreadId>>
    {
        let mut threads = Vec::new();
        let mut request: &[u8] = b"qfThreadInfo";
        loop {
            let reply = self.transact(request)?;
            match reply.split_first() {
                Some((&b'm', list)) => {
                    for id in list.split(|&byte| byte == b',').filter(|id| !id.is_empty()) {
                        threads.push(ThreadId(hex::parse_u64(id)?));
                    }
                }
                Some((&b'l', _)) | None => break,
                Some(_) => return Err(unexpected(request, &reply)),
            }
            request = b"qsThreadInfo";
        }
        Ok(threads)
    }

    /// Program output received since the last call.
    pub fn take_output(&mut self) -> Vec<String>
    {
        std::mem::take(&mut self.output)
    }

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn shutdown(&mut self) -> Result<()>
    {
        self.connection.shutdown()?;
        Ok(())
    }
}

/// Decode a stop reply.
///
/// # Errors
///
/// [`ProtocolError::Malformed`] (wrapped) for anything that is not a stop
/// reply.
pub fn parse_stop_reply(payload: &[u8]) -> Result<StopEvent>
{
    let malformed = || -> DebuggerError {
        ProtocolError::Malformed(format!("not a stop reply: {}", String::from_utf8_lossy(payload))).into()
    };
    let (&kind, rest) = payload.split_first().ok_or_else(malformed)?;
    let code = rest.get(..2).ok_or_else(malformed)?;
    let value = u8::try_from(hex::parse_u64(code)?).map_err(|_| malformed())?;

    let reason = match kind {
        b'S' | b'T' => StopReason::Signal(value),
        b'W' => StopReason::Exited(value),
        b'X' => StopReason::Terminated(value),
        _ => return Err(malformed()),
    };

    let mut thread = None;
    if kind == b'T' {
        for pair in rest[2..].split(|&byte| byte == b';') {
            let mut fields = pair.splitn(2, |&byte| byte == b':');
            if let (Some(b"thread"), Some(id)) = (fields.next(), fields.next()) {
                thread = Some(ThreadId(hex::parse_u64(id)?));
            }
        }
    }
    Ok(StopEvent { reason, thread })
}

/// `Exx` error code of a reply.
fn error_reply(reply: &[u8]) -> Option<u8>
{
    match reply {
        [b'E', high, low] => Some((hex::nibble(*high)? << 4) | hex::nibble(*low)?),
        _ => None,
    }
}

/// Text of an `O` console output packet.
fn console_output(packet: &[u8]) -> Option<String>
{
    match packet.split_first() {
        Some((&b'O', text)) if packet != b"OK" => {
            hex::decode(text).ok().map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => None,
    }
}

fn unexpected(request: &[u8], reply: &[u8]) -> DebuggerError
{
    ProtocolError::Malformed(format!(
        "unexpected reply {:?} to {:?}",
        String::from_utf8_lossy(reply),
        String::from_utf8_lossy(request)
    ))
    .into()
}

fn memory_error(err: DebuggerError, address: Address, length: usize) -> DebuggerError
{
    match err {
        DebuggerError::Protocol(ProtocolError::Remote(code)) => DebuggerError::MemoryAccess {
            address,
            length,
            reason: format!("stub error E{code:02x}"),
        },
        DebuggerError::Protocol(ProtocolError::Malformed(reason)) => DebuggerError::MemoryAccess {
            address,
            length,
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_signal_stop()
    {
        let stop = parse_stop_reply(b"S05").unwrap();
        assert_eq!(stop.reason, StopReason::Signal(5));
        assert_eq!(stop.thread, None);
    }

    #[test]
    fn test_parse_t_stop_with_thread()
    {
        let stop = parse_stop_reply(b"T0506:0000000000000000;thread:1a;").unwrap();
        assert_eq!(stop.reason, StopReason::Signal(5));
        assert_eq!(stop.thread, Some(ThreadId(0x1a)));
    }

    #[test]
    fn test_parse_exit_and_termination()
    {
        assert_eq!(parse_stop_reply(b"W00").unwrap().reason, StopReason::Exited(0));
        assert_eq!(parse_stop_reply(b"X09").unwrap().reason, StopReason::Terminated(9));
        assert!(parse_stop_reply(b"OK").is_err());
        assert!(parse_stop_reply(b"").is_err());
    }

    #[test]
    fn test_error_and_output_packets()
    {
        assert_eq!(error_reply(b"E0e"), Some(0x0e));
        assert_eq!(error_reply(b"OK"), None);
        assert_eq!(console_output(b"O68690a").as_deref(), Some("hi\n"));
        assert_eq!(console_output(b"OK"), None);
    }
}
