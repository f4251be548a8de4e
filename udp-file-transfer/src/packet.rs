//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Segment`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Segment`], returning
//!   [`PacketError::MalformedSegment`] for truncated or oversized input.
//! - Signed-distance sequence-number comparisons shared by both engines.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Flags     |       Advertised Window       |  Payload Len  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  (cont.)      |               Payload ...                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 13 bytes.
//! seq(4) + ack(4) + flags(1) + window(2) + payload_len(2)

use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
pub mod flags {
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish: sender has no more data to send.
    pub const FIN: u8 = 0b0000_0100;
    /// Negative acknowledgement: resend starting at the acknowledgement number.
    pub const NAK: u8 = 0b0000_1000;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 13;

/// Largest payload a single segment may carry.
pub const MAX_SEGMENT_SIZE: usize = 1460;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_WINDOW: usize = 9;
const OFF_PAYLOAD_LEN: usize = 11;

// ---------------------------------------------------------------------------
// Sequence arithmetic
// ---------------------------------------------------------------------------

/// Signed distance from `from` to `to` in 32-bit sequence space.
///
/// Positive when `to` lies ahead of `from`.  Correct as long as the two
/// values are less than `2^31` apart, which always holds for a live window.
#[inline]
pub fn seq_distance(from: u32, to: u32) -> i32 {
    to.wrapping_sub(from) as i32
}

/// `true` when `a` precedes `b`.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    seq_distance(a, b) > 0
}

/// `true` when `a` precedes or equals `b`.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    seq_distance(a, b) >= 0
}

// ---------------------------------------------------------------------------
// Header / Segment
// ---------------------------------------------------------------------------

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Segment::encode`] converts to big-endian
/// on the wire and [`Segment::decode`] converts back.  The payload length is
/// not stored here: it is always derived from the payload itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Sequence number of this segment (one unit per segment).
    pub seq: u32,
    /// Cumulative acknowledgement: next sequence number expected from the peer.
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
    /// Advertised free capacity of the receiver's reassembly queue, in segments.
    pub window: u16,
}

impl Header {
    /// `true` when every bit of `flag` is set.
    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Build a payload-free control segment (SYN, ACK, FIN, NAK, …).
    pub fn control(seq: u32, ack: u32, flags: u8, window: u16) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                flags,
                window,
            },
            payload: Vec::new(),
        }
    }

    /// Build a data segment.  Data segments always carry a valid ACK field.
    pub fn data(seq: u32, ack: u32, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                flags: flags::ACK,
                window: 0,
            },
            payload,
        }
    }

    /// `true` when the segment carries application bytes.
    pub fn is_data(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Serialise this segment into a newly allocated byte vector.
    ///
    /// Fails when the payload does not fit in one segment.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_SEGMENT_SIZE {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.header.ack.to_be_bytes());
        buf[OFF_FLAGS] = self.header.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.header.window.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        Ok(buf)
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`PacketError::MalformedSegment`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the `payload_len` field exceeds the bytes that follow the header, or
    /// - the `payload_len` field exceeds [`MAX_SEGMENT_SIZE`].
    ///
    /// Bytes beyond the declared payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::MalformedSegment("shorter than header"));
        }

        let seq = read_u32(buf, OFF_SEQ);
        let ack = read_u32(buf, OFF_ACK);
        let flags = buf[OFF_FLAGS];
        let window = read_u16(buf, OFF_WINDOW);
        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN) as usize;

        if payload_len > MAX_SEGMENT_SIZE {
            return Err(PacketError::MalformedSegment(
                "payload length exceeds maximum segment size",
            ));
        }
        if payload_len > buf.len() - HEADER_LEN {
            return Err(PacketError::MalformedSegment(
                "payload length exceeds remaining bytes",
            ));
        }

        Ok(Segment {
            header: Header {
                seq,
                ack,
                flags,
                window,
            },
            payload: buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
        })
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = &self.header;
        let names = [
            (flags::SYN, "SYN"),
            (flags::FIN, "FIN"),
            (flags::NAK, "NAK"),
            (flags::ACK, "ACK"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if h.has(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        write!(
            f,
            " seq={} ack={} wnd={} len={}",
            h.seq,
            h.ack,
            h.window,
            self.payload.len()
        )
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The datagram does not hold a well-formed segment.
    #[error("malformed segment: {0}")]
    MalformedSegment(&'static str),
    /// Encode was asked to frame more than [`MAX_SEGMENT_SIZE`] bytes.
    #[error("payload of {0} bytes exceeds the maximum segment size")]
    PayloadTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let seg = Segment::data(42, 7, b"hello".to_vec());
        let decoded = Segment::decode(&seg.encode().unwrap()).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn encode_sets_correct_payload_len() {
        let seg = Segment::data(1, 2, b"world".to_vec());
        let bytes = seg.encode().unwrap();
        let len_field = u16::from_be_bytes([bytes[OFF_PAYLOAD_LEN], bytes[OFF_PAYLOAD_LEN + 1]]);
        assert_eq!(len_field, 5);
    }

    #[test]
    fn decode_empty_buffer_is_malformed() {
        assert!(matches!(
            Segment::decode(&[]),
            Err(PacketError::MalformedSegment(_))
        ));
    }

    #[test]
    fn decode_short_header_is_malformed() {
        assert!(matches!(
            Segment::decode(&[0u8; HEADER_LEN - 1]),
            Err(PacketError::MalformedSegment(_))
        ));
    }

    #[test]
    fn decode_truncated_payload_is_malformed() {
        let mut bytes = Segment::data(0, 0, b"data".to_vec()).encode().unwrap();
        bytes.pop(); // payload_len still claims 4 bytes, but buf is one short
        assert_eq!(
            Segment::decode(&bytes),
            Err(PacketError::MalformedSegment(
                "payload length exceeds remaining bytes"
            ))
        );
    }

    #[test]
    fn decode_rejects_payload_len_above_mss() {
        let mut bytes = vec![0u8; HEADER_LEN + MAX_SEGMENT_SIZE + 1];
        let len = (MAX_SEGMENT_SIZE + 1) as u16;
        bytes[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2].copy_from_slice(&len.to_be_bytes());
        assert_eq!(
            Segment::decode(&bytes),
            Err(PacketError::MalformedSegment(
                "payload length exceeds maximum segment size"
            ))
        );
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut bytes = Segment::data(3, 4, b"abc".to_vec()).encode().unwrap();
        bytes.extend_from_slice(b"junk");
        let decoded = Segment::decode(&bytes).unwrap();
        assert_eq!(decoded.payload, b"abc");
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let seg = Segment::data(0, 0, vec![0u8; MAX_SEGMENT_SIZE + 1]);
        assert_eq!(
            seg.encode(),
            Err(PacketError::PayloadTooLarge(MAX_SEGMENT_SIZE + 1))
        );
    }

    #[test]
    fn full_size_payload_fits() {
        let seg = Segment::data(9, 0, vec![0xab; MAX_SEGMENT_SIZE]);
        let bytes = seg.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + MAX_SEGMENT_SIZE);
        assert_eq!(Segment::decode(&bytes).unwrap().payload.len(), MAX_SEGMENT_SIZE);
    }

    #[test]
    fn multiple_flag_bits() {
        let f = flags::SYN | flags::ACK;
        let bytes = Segment::control(1, 2, f, 512).encode().unwrap();
        assert_eq!(bytes[OFF_FLAGS], f);
        let decoded = Segment::decode(&bytes).unwrap();
        assert!(decoded.header.has(flags::SYN));
        assert!(decoded.header.has(flags::ACK));
        assert!(!decoded.header.has(flags::NAK));
        assert!(!decoded.header.has(flags::SYN | flags::FIN));
    }

    #[test]
    fn header_fields_big_endian_on_wire() {
        let bytes = Segment::control(0x0102_0304, 0x0506_0708, flags::NAK, 0x090a)
            .encode()
            .unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[OFF_ACK..OFF_ACK + 4], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(bytes[OFF_FLAGS], flags::NAK);
        assert_eq!(&bytes[OFF_WINDOW..OFF_WINDOW + 2], &[0x09, 0x0a]);
        assert_eq!(&bytes[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2], &[0, 0]);
    }

    #[test]
    fn display_lists_flags() {
        let seg = Segment::control(5, 6, flags::FIN | flags::ACK, 3);
        assert_eq!(seg.to_string(), "FIN|ACK seq=5 ack=6 wnd=3 len=0");
    }

    #[test]
    fn seq_comparisons_survive_wraparound() {
        let near_max = u32::MAX - 1;
        assert!(seq_lt(near_max, 2));
        assert!(!seq_lt(2, near_max));
        assert!(seq_le(7, 7));
        assert_eq!(seq_distance(near_max, 2), 4);
        assert_eq!(seq_distance(2, near_max), -4);
    }
}
