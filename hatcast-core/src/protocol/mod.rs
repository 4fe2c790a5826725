//! protocol — control commands and frame fragmentation over UDP
//!
//! Inbound datagrams are ASCII commands:
//!
//! | datagram             | effect                                  |
//! |----------------------|-----------------------------------------|
//! | `REGISTER`           | add sender to the fanout set, ack       |
//! | `UNREGISTER`         | remove sender                           |
//! | `HAT_OFF`            | disable the overlay                     |
//! | `HAT_CATEGORY:<name>`| select accessory `<name>` and enable it |
//!
//! Outbound, every encoded frame is cut into fragments that each carry a
//! 12-byte big-endian header `(sequence, total, index)` followed by at most
//! `max_packet_size - 12` payload bytes. There is no retransmission: a
//! receiver missing any fragment of a sequence drops the whole frame.

use thiserror::Error;

/// Size of [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = 12;
/// Largest datagram the server emits by default.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 60_000;
/// Reply to a `REGISTER`.
pub const REGISTERED_ACK: &[u8] = b"REGISTERED";

const HAT_CATEGORY_PREFIX: &str = "HAT_CATEGORY:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("command is not valid UTF-8")]
    NotUtf8,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("packet of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated(usize),
    #[error("fragment index {index} out of range for {total} fragments")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("max packet size {0} leaves no room for payload after the header")]
    PacketTooSmall(usize),
}

// ── Commands ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Register,
    Unregister,
    HatOff,
    /// Display name of the accessory to select, matched exactly.
    HatCategory(String),
}

impl ControlCommand {
    /// Parse one datagram. A trailing line terminator is ignored; everything
    /// else, accessory names included, must match exactly.
    pub fn parse(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(datagram).map_err(|_| ProtocolError::NotUtf8)?;
        let text = text
            .strip_suffix('\n')
            .map(|t| t.strip_suffix('\r').unwrap_or(t))
            .unwrap_or(text);
        match text {
            "REGISTER" => Ok(Self::Register),
            "UNREGISTER" => Ok(Self::Unregister),
            "HAT_OFF" => Ok(Self::HatOff),
            _ => match text.strip_prefix(HAT_CATEGORY_PREFIX) {
                Some(name) => Ok(Self::HatCategory(name.to_string())),
                None => Err(ProtocolError::UnknownCommand(text.to_string())),
            },
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Register => b"REGISTER".to_vec(),
            Self::Unregister => b"UNREGISTER".to_vec(),
            Self::HatOff => b"HAT_OFF".to_vec(),
            Self::HatCategory(name) => format!("{HAT_CATEGORY_PREFIX}{name}").into_bytes(),
        }
    }
}

// ── Frame header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u32,
    pub total: u32,
    pub index: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.total.to_be_bytes());
        out[8..12].copy_from_slice(&self.index.to_be_bytes());
        out
    }

    /// Split a received fragment into its header and payload.
    pub fn decode(packet: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if packet.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated(packet.len()));
        }
        let word = |i: usize| u32::from_be_bytes([packet[i], packet[i + 1], packet[i + 2], packet[i + 3]]);
        let header = Self {
            sequence: word(0),
            total: word(4),
            index: word(8),
        };
        if header.index >= header.total {
            return Err(ProtocolError::IndexOutOfRange {
                index: header.index,
                total: header.total,
            });
        }
        Ok((header, &packet[HEADER_LEN..]))
    }
}

/// 16-bit frame counter; the first frame is sequence 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance and return the sequence for the next frame (65535 → 0).
    pub fn next(&mut self) -> u16 {
        self.0 = self.0.wrapping_add(1);
        self.0
    }

    pub fn current(&self) -> u16 {
        self.0
    }
}

// ── Fragmentation ────────────────────────────────────────────────────────────

/// Payload bytes carried by one fragment.
pub fn fragment_capacity(max_packet_size: usize) -> Result<usize, ProtocolError> {
    match max_packet_size.checked_sub(HEADER_LEN) {
        Some(capacity) if capacity > 0 => Ok(capacity),
        _ => Err(ProtocolError::PacketTooSmall(max_packet_size)),
    }
}

/// `ceil(payload_len / capacity)`.
pub fn fragment_count(payload_len: usize, capacity: usize) -> usize {
    payload_len.div_ceil(capacity)
}

/// Cut `payload` into header-prefixed datagrams no larger than
/// `max_packet_size`.
pub fn fragment(
    payload: &[u8],
    sequence: u16,
    max_packet_size: usize,
) -> Result<Fragments<'_>, ProtocolError> {
    let capacity = fragment_capacity(max_packet_size)?;
    let total = fragment_count(payload.len(), capacity) as u32;
    Ok(Fragments {
        chunks: payload.chunks(capacity),
        sequence: sequence as u32,
        total,
        index: 0,
    })
}

/// Iterator over the datagrams of one frame.
pub struct Fragments<'a> {
    chunks: std::slice::Chunks<'a, u8>,
    sequence: u32,
    total: u32,
    index: u32,
}

impl Fragments<'_> {
    pub fn total(&self) -> u32 {
        self.total
    }
}

impl Iterator for Fragments<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.next()?;
        let header = FrameHeader {
            sequence: self.sequence,
            total: self.total,
            index: self.index,
        };
        self.index += 1;
        let mut packet = Vec::with_capacity(HEADER_LEN + chunk.len());
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(chunk);
        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Fragments<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(ControlCommand::parse(b"REGISTER"), Ok(ControlCommand::Register));
        assert_eq!(ControlCommand::parse(b"UNREGISTER\n"), Ok(ControlCommand::Unregister));
        assert_eq!(ControlCommand::parse(b"HAT_OFF"), Ok(ControlCommand::HatOff));
        assert_eq!(
            ControlCommand::parse(b"HAT_CATEGORY:TOP HAT"),
            Ok(ControlCommand::HatCategory("TOP HAT".into()))
        );
        assert_eq!(
            ControlCommand::parse(b"HAT_CATEGORY:"),
            Ok(ControlCommand::HatCategory(String::new()))
        );
    }

    #[test]
    fn accessory_names_are_not_trimmed() {
        assert_eq!(
            ControlCommand::parse(b"HAT_CATEGORY:FOO "),
            Ok(ControlCommand::HatCategory("FOO ".into()))
        );
        assert_eq!(
            ControlCommand::parse(b"HAT_CATEGORY: CROWN\r\n"),
            Ok(ControlCommand::HatCategory(" CROWN".into()))
        );
        assert!(matches!(
            ControlCommand::parse(b" REGISTER"),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn rejects_unknown_commands() {
        assert!(matches!(
            ControlCommand::parse(b"register"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert_eq!(ControlCommand::parse(&[0xff, 0xfe]), Err(ProtocolError::NotUtf8));
    }

    #[test]
    fn command_bytes_parse_back() {
        for cmd in [
            ControlCommand::Register,
            ControlCommand::Unregister,
            ControlCommand::HatOff,
            ControlCommand::HatCategory("CROWN".into()),
        ] {
            assert_eq!(ControlCommand::parse(&cmd.to_bytes()), Ok(cmd));
        }
    }

    #[test]
    fn header_is_big_endian() {
        let header = FrameHeader {
            sequence: 1,
            total: 2,
            index: 1,
        };
        assert_eq!(header.encode(), [0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 1]);
    }

    #[test]
    fn decode_rejects_bad_packets() {
        assert_eq!(FrameHeader::decode(&[0; 5]), Err(ProtocolError::Truncated(5)));
        let bad = FrameHeader {
            sequence: 3,
            total: 2,
            index: 2,
        };
        assert_eq!(
            FrameHeader::decode(&bad.encode()),
            Err(ProtocolError::IndexOutOfRange { index: 2, total: 2 })
        );
    }

    #[test]
    fn fragment_count_is_ceiling() {
        let capacity = fragment_capacity(112).unwrap();
        assert_eq!(capacity, 100);
        for (len, expected) in [(1, 1), (99, 1), (100, 1), (101, 2), (1_000, 10), (1_001, 11)] {
            let payload = vec![7u8; len];
            let frags = fragment(&payload, 9, 112).unwrap();
            assert_eq!(frags.len(), expected, "payload {len}");
            assert_eq!(frags.total() as usize, expected);
        }
    }

    #[test]
    fn fragments_cover_payload_without_gaps() {
        let payload: Vec<u8> = (0..2_345u32).map(|i| (i % 251) as u8).collect();
        let mut rebuilt = Vec::new();
        let mut indices = Vec::new();
        for packet in fragment(&payload, 42, 512).unwrap() {
            assert!(packet.len() <= 512);
            let (header, body) = FrameHeader::decode(&packet).unwrap();
            assert_eq!(header.sequence, 42);
            assert_eq!(header.total, 5);
            indices.push(header.index);
            rebuilt.extend_from_slice(body);
        }
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn empty_payload_has_no_fragments() {
        assert_eq!(fragment(&[], 1, 512).unwrap().count(), 0);
    }

    #[test]
    fn tiny_packet_size_is_rejected() {
        assert_eq!(
            fragment(&[1, 2, 3], 1, HEADER_LEN).err(),
            Some(ProtocolError::PacketTooSmall(HEADER_LEN))
        );
    }

    #[test]
    fn sequence_wraps_after_65535() {
        let mut counter = SequenceCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        let mut counter = SequenceCounter(65_534);
        assert_eq!(counter.next(), 65_535);
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
    }
}
