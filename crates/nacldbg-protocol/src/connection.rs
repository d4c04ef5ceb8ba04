//! Acknowledged packet exchange over a byte stream.
//!
//! Every packet sent is retransmitted until the peer answers `+` (or the
//! retry budget runs out). Every packet received is acknowledged with `+`,
//! or `-` when its checksum is wrong. Packets that arrive while we are still
//! waiting for an acknowledgement are queued and returned by the next
//! [`Connection::recv_packet`].

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::{self, Frame, PacketDecoder};

const DEFAULT_MAX_RETRIES: u32 = 3;
const READ_CHUNK: usize = 4096;

/// A byte stream that can carry packets.
pub trait Transport: Read + Write + Send
{
    /// Bound the next blocking read; `None` blocks indefinitely.
    ///
    /// # Errors
    ///
    /// Propagates the platform error.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close both directions so a blocked reader wakes up.
    ///
    /// # Errors
    ///
    /// Propagates the platform error.
    fn shutdown(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream
{
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>
    {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&mut self) -> io::Result<()>
    {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// A packet connection to a remote stub.
#[derive(Debug)]
pub struct Connection<T: Transport = TcpStream>
{
    transport: T,
    decoder: PacketDecoder,
    frames: VecDeque<Frame>,
    pending: VecDeque<Vec<u8>>,
    max_retries: u32,
}

impl Connection<TcpStream>
{
    /// Connect to `address` (`host:port`).
    ///
    /// Every resolved socket address is tried in turn.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] when no address accepts the connection.
    pub fn connect(address: &str, timeout: Duration) -> ProtocolResult<Self>
    {
        let mut last_error = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address} did not resolve to any socket address"),
        );
        for socket_address in address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&socket_address, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%socket_address, "connected to remote stub");
                    return Ok(Self::new(stream));
                }
                Err(err) => {
                    debug!(%socket_address, error = %err, "connection attempt failed");
                    last_error = err;
                }
            }
        }
        Err(ProtocolError::Io(last_error))
    }
}

impl<T: Transport> Connection<T>
{
    /// Wrap an established transport.
    pub fn new(transport: T) -> Self
    {
        Self {
            transport,
            decoder: PacketDecoder::new(),
            frames: VecDeque::new(),
            pending: VecDeque::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Change how many times a rejected packet is retransmitted.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self
    {
        self.max_retries = max_retries;
        self
    }

    /// Access the underlying transport.
    pub const fn transport(&self) -> &T
    {
        &self.transport
    }

    /// Send `payload` and wait until the stub acknowledges it.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Timeout`] if no acknowledgement arrives in `timeout`
    /// - [`ProtocolError::Nack`] if the retry budget is exhausted
    /// - [`ProtocolError::Disconnected`] / [`ProtocolError::Io`] on transport failure
    pub fn send_packet(&mut self, payload: &[u8], timeout: Duration) -> ProtocolResult<()>
    {
        let packet = packet::encode(payload);
        trace!(packet = %String::from_utf8_lossy(&packet), "sending packet");
        for attempt in 0..=self.max_retries {
            self.write_all(&packet)?;
            if self.wait_for_ack(timeout)? {
                return Ok(());
            }
            warn!(attempt, "packet rejected by remote stub, retransmitting");
        }
        Err(ProtocolError::Nack(self.max_retries + 1))
    }

    /// Wait up to `timeout` for the next packet.
    ///
    /// Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// Transport failures and disconnects.
    pub fn recv_packet(&mut self, timeout: Duration) -> ProtocolResult<Option<Vec<u8>>>
    {
        if let Some(payload) = self.pending.pop_front() {
            return Ok(Some(payload));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.next_frame(deadline)? {
                None => return Ok(None),
                Some(Frame::Packet(payload)) => {
                    self.acknowledge(true)?;
                    trace!(payload = %String::from_utf8_lossy(&payload), "received packet");
                    return Ok(Some(payload));
                }
                Some(Frame::Corrupt { expected, actual }) => {
                    debug!(expected, actual, "requesting retransmission of corrupt packet");
                    self.acknowledge(false)?;
                }
                Some(frame) => trace!(?frame, "ignoring stray frame"),
            }
        }
    }

    /// Send `payload` and wait for the reply packet.
    ///
    /// # Errors
    ///
    /// See [`Connection::send_packet`]; additionally [`ProtocolError::Timeout`]
    /// when no reply arrives.
    pub fn transact(&mut self, payload: &[u8], timeout: Duration) -> ProtocolResult<Vec<u8>>
    {
        self.send_packet(payload, timeout)?;
        self.recv_packet(timeout)?.ok_or(ProtocolError::Timeout("reply"))
    }

    /// Send the out-of-band interrupt byte.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn send_interrupt(&mut self) -> ProtocolResult<()>
    {
        self.write_all(&[packet::INTERRUPT])
    }

    /// Shut down the transport.
    ///
    /// # Errors
    ///
    /// Transport failures other than "not connected".
    pub fn shutdown(&mut self) -> ProtocolResult<()>
    {
        match self.transport.shutdown() {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> ProtocolResult<()>
    {
        self.transport.write_all(bytes)?;
        self.transport.flush()?;
        Ok(())
    }

    fn acknowledge(&mut self, accepted: bool) -> ProtocolResult<()>
    {
        self.write_all(if accepted { &[packet::ACK] } else { &[packet::NACK] })
    }

    fn wait_for_ack(&mut self, timeout: Duration) -> ProtocolResult<bool>
    {
        let deadline = Instant::now() + timeout;
        loop {
            match self.next_frame(deadline)? {
                None => return Err(ProtocolError::Timeout("acknowledgement")),
                Some(Frame::Ack) => return Ok(true),
                Some(Frame::Nack) => return Ok(false),
                Some(Frame::Packet(payload)) => {
                    self.acknowledge(true)?;
                    self.pending.push_back(payload);
                }
                Some(Frame::Corrupt { .. }) => self.acknowledge(false)?,
                Some(Frame::Interrupt) => {}
            }
        }
    }

    fn next_frame(&mut self, deadline: Instant) -> ProtocolResult<Option<Frame>>
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(Some(frame));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.transport.set_read_timeout(Some(deadline - now))?;

            match self.transport.read(&mut chunk) {
                Ok(0) => return Err(ProtocolError::Disconnected),
                Ok(read) => {
                    let frames = self.decoder.feed(&chunk[..read]);
                    self.frames.extend(frames);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}
