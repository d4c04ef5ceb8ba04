//! Packet framing.
//!
//! A packet on the wire is `$<body>#<c1><c2>` where `<c1><c2>` is the modulo
//! 256 sum of the body bytes as transmitted. Inside the body, `$`, `#`, `}`
//! and `*` are escaped as `}` followed by the byte xor `0x20`. Replies may
//! also use run-length encoding: `X*<n>` repeats `X` a further `n - 29` times.
//!
//! Outside of packets the stream carries single-byte acknowledgements (`+`,
//! `-`) and the interrupt byte `0x03`.

use tracing::trace;

use crate::hex;

/// Start of a packet.
pub const PACKET_START: u8 = b'$';
/// End of a packet body, followed by two checksum digits.
pub const PACKET_END: u8 = b'#';
/// Escape prefix inside a packet body.
pub const ESCAPE: u8 = b'}';
/// Run-length marker inside a packet body.
pub const RUN_LENGTH: u8 = b'*';
/// Positive acknowledgement.
pub const ACK: u8 = b'+';
/// Negative acknowledgement, asks the peer to retransmit.
pub const NACK: u8 = b'-';
/// Out-of-band break request.
pub const INTERRUPT: u8 = 0x03;

const ESCAPE_XOR: u8 = 0x20;
const RUN_LENGTH_BIAS: u8 = 29;

/// Modulo 256 sum of `body`.
#[must_use]
pub fn checksum(body: &[u8]) -> u8
{
    body.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

/// Frame `payload` as a complete packet, escaping reserved bytes.
#[must_use]
pub fn encode(payload: &[u8]) -> Vec<u8>
{
    let mut body = Vec::with_capacity(payload.len() + 4);
    for &byte in payload {
        if matches!(byte, PACKET_START | PACKET_END | ESCAPE | RUN_LENGTH) {
            body.push(ESCAPE);
            body.push(byte ^ ESCAPE_XOR);
        } else {
            body.push(byte);
        }
    }

    let mut packet = Vec::with_capacity(body.len() + 4);
    packet.push(PACKET_START);
    packet.extend_from_slice(&body);
    packet.push(PACKET_END);
    packet.extend_from_slice(&hex::encode_byte(checksum(&body)));
    packet
}

/// One unit of traffic recognised by [`PacketDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame
{
    /// `+`
    Ack,
    /// `-`
    Nack,
    /// `0x03` outside of a packet
    Interrupt,
    /// A complete packet with a valid checksum; the payload is unescaped
    Packet(Vec<u8>),
    /// A complete packet whose checksum did not match
    ///
    /// Unparsable checksum digits count as zero.
    Corrupt
    {
        /// Checksum sent by the peer
        expected: u8,
        /// Checksum computed over the received body
        actual: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState
{
    Idle,
    Body,
    Escape,
    RunLength,
    ChecksumHigh,
    ChecksumLow(u8),
}

/// Incremental decoder that turns a byte stream into [`Frame`]s.
///
/// Bytes outside of a packet that are not acknowledgements or interrupts are
/// dropped.
#[derive(Debug)]
pub struct PacketDecoder
{
    state: DecodeState,
    raw: Vec<u8>,
    payload: Vec<u8>,
}

impl Default for PacketDecoder
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl PacketDecoder
{
    /// Create a decoder waiting for the start of a frame.
    #[must_use]
    pub const fn new() -> Self
    {
        Self {
            state: DecodeState::Idle,
            raw: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Whether the decoder is in the middle of a packet.
    #[must_use]
    pub fn in_packet(&self) -> bool
    {
        self.state != DecodeState::Idle
    }

    /// Feed one byte; returns a frame when one completes.
    pub fn push(&mut self, byte: u8) -> Option<Frame>
    {
        match self.state {
            DecodeState::Idle => match byte {
                ACK => Some(Frame::Ack),
                NACK => Some(Frame::Nack),
                INTERRUPT => Some(Frame::Interrupt),
                PACKET_START => {
                    self.raw.clear();
                    self.payload.clear();
                    self.state = DecodeState::Body;
                    None
                }
                other => {
                    trace!(byte = other, "dropping byte outside of packet");
                    None
                }
            },
            DecodeState::Body => {
                match byte {
                    PACKET_END => self.state = DecodeState::ChecksumHigh,
                    ESCAPE => {
                        self.raw.push(byte);
                        self.state = DecodeState::Escape;
                    }
                    RUN_LENGTH => {
                        self.raw.push(byte);
                        self.state = DecodeState::RunLength;
                    }
                    PACKET_START => {
                        // A new packet started before the old one finished.
                        self.raw.clear();
                        self.payload.clear();
                    }
                    _ => {
                        self.raw.push(byte);
                        self.payload.push(byte);
                    }
                }
                None
            }
            DecodeState::Escape => {
                self.raw.push(byte);
                self.payload.push(byte ^ ESCAPE_XOR);
                self.state = DecodeState::Body;
                None
            }
            DecodeState::RunLength => {
                self.raw.push(byte);
                if let Some(&last) = self.payload.last() {
                    let count = usize::from(byte.saturating_sub(RUN_LENGTH_BIAS));
                    self.payload.extend(std::iter::repeat(last).take(count));
                }
                self.state = DecodeState::Body;
                None
            }
            DecodeState::ChecksumHigh => {
                self.state = DecodeState::ChecksumLow(hex::nibble(byte).unwrap_or(0));
                None
            }
            DecodeState::ChecksumLow(high) => {
                self.state = DecodeState::Idle;
                let expected = (high << 4) | hex::nibble(byte).unwrap_or(0);
                let actual = checksum(&self.raw);
                if expected == actual {
                    Some(Frame::Packet(std::mem::take(&mut self.payload)))
                } else {
                    self.payload.clear();
                    Some(Frame::Corrupt { expected, actual })
                }
            }
        }
    }

    /// Feed a chunk of bytes, collecting every frame it completes.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame>
    {
        bytes.iter().filter_map(|&byte| self.push(byte)).collect()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_encode_simple_packet()
    {
        assert_eq!(encode(b"g"), b"$g#67".to_vec());
        assert_eq!(encode(b""), b"$#00".to_vec());
    }

    #[test]
    fn test_encode_escapes_reserved_bytes()
    {
        let packet = encode(b"a#b");
        assert_eq!(&packet[..6], b"$a}\x03b#");
        let frames = PacketDecoder::new().feed(&packet);
        assert_eq!(frames, vec![Frame::Packet(b"a#b".to_vec())]);
    }

    #[test]
    fn test_decoder_recognises_acks_and_interrupts()
    {
        let frames = PacketDecoder::new().feed(b"+-\x03");
        assert_eq!(frames, vec![Frame::Ack, Frame::Nack, Frame::Interrupt]);
    }

    #[test]
    fn test_decoder_reports_checksum_mismatch()
    {
        let frames = PacketDecoder::new().feed(b"$OK#00");
        assert_eq!(
            frames,
            vec![Frame::Corrupt {
                expected: 0,
                actual: checksum(b"OK"),
            }]
        );
    }

    #[test]
    fn test_decoder_expands_run_length()
    {
        // '0' followed by "*" and ' ' (32) repeats it 3 more times.
        let body = b"0* ";
        let mut wire = vec![PACKET_START];
        wire.extend_from_slice(body);
        wire.push(PACKET_END);
        wire.extend_from_slice(&hex::encode_byte(checksum(body)));

        let frames = PacketDecoder::new().feed(&wire);
        assert_eq!(frames, vec![Frame::Packet(b"0000".to_vec())]);
    }

    #[test]
    fn test_decoder_handles_split_input()
    {
        let mut decoder = PacketDecoder::new();
        assert_eq!(decoder.feed(b"+$S0"), vec![Frame::Ack]);
        assert!(decoder.in_packet());
        let frames = decoder.feed(b"5#b8");
        assert_eq!(frames, vec![Frame::Packet(b"S05".to_vec())]);
        assert!(!decoder.in_packet());
    }

    #[test]
    fn test_decoder_ignores_noise_between_packets()
    {
        let frames = PacketDecoder::new().feed(b"xx$OK#9a");
        assert_eq!(frames, vec![Frame::Packet(b"OK".to_vec())]);
    }
}
