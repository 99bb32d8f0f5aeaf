//! Segment header codec.
//!
//! ```text
//!  0        1        2        3
//! +--------+--------+--------+--------+----------------
//! | flags  | source |  seq   |  len   | payload (len bytes)
//! +--------+--------+--------+--------+----------------
//! ```
//!
//! `flags` bit 0 is ACK, bit 1 SYN, bit 2 RST. A segment with no flag set
//! carries data.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    constants::{FLAG_ACK, FLAG_RST, FLAG_SYN, HEADER_SIZE},
    error::{OstError, Result},
    Address,
};

/// The flags octet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    /// No bits set: a data segment.
    pub const DATA: Flags = Flags(0);
    /// Acknowledges the segment with the same sequence number.
    pub const ACK: Flags = Flags(FLAG_ACK);
    /// Opens a connection.
    pub const SYN: Flags = Flags(FLAG_SYN);
    /// Resets a connection.
    pub const RST: Flags = Flags(FLAG_RST);
    /// Second leg of the handshake.
    pub const SYN_ACK: Flags = Flags(FLAG_SYN | FLAG_ACK);

    /// Wraps a raw octet. Undefined bits are kept.
    pub const fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    /// The raw octet.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("DATA");
        }
        let names = [(FLAG_SYN, "SYN"), (FLAG_ACK, "ACK"), (FLAG_RST, "RST")];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Control bits.
    pub flags: Flags,
    /// Address of the sending station.
    pub source: Address,
    /// Sequence number, modulo 256.
    pub seq: u8,
    /// Payload bytes that follow the header.
    pub payload_len: u8,
}

impl Header {
    /// Builds a header. `payload_len` is taken as given.
    pub fn new(flags: Flags, seq: u8, source: Address, payload_len: u8) -> Self {
        Self {
            flags,
            source,
            seq,
            payload_len,
        }
    }

    /// Header bytes in wire order.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        [self.flags.bits(), self.source, self.seq, self.payload_len]
    }

    /// Reads the first four bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(OstError::MalformedHeader(buf.len()));
        }
        Ok(Self {
            flags: Flags::from_bits(buf[0]),
            source: buf[1],
            seq: buf[2],
            payload_len: buf[3],
        })
    }

    /// ACK bit set.
    pub fn is_ack(&self) -> bool {
        self.flags.contains(Flags::ACK)
    }

    /// SYN bit set.
    pub fn is_syn(&self) -> bool {
        self.flags.contains(Flags::SYN)
    }

    /// RST bit set.
    pub fn is_rst(&self) -> bool {
        self.flags.contains(Flags::RST)
    }

    /// No flag bit set at all. Segments with undefined bits are not data.
    pub fn is_data(&self) -> bool {
        self.flags == Flags::DATA
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(seq={}, src={}, len={})",
            self.flags, self.seq, self.source, self.payload_len
        )
    }
}

/// A header together with the payload it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Parsed header.
    pub header: Header,
    /// Exactly `payload_len` bytes.
    pub payload: Bytes,
}

impl Segment {
    /// Builds a segment whose `payload_len` matches `payload`.
    ///
    /// Callers bound payloads to [`crate::constants::MAX_SEGMENT_SIZE`] before
    /// they reach the codec.
    pub fn new(flags: Flags, seq: u8, source: Address, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= u8::MAX as usize);
        Self {
            header: Header::new(flags, seq, source, payload.len() as u8),
            payload,
        }
    }

    /// A payload-free control segment (ACK, SYN, RST or a combination).
    pub fn control(flags: Flags, seq: u8, source: Address) -> Self {
        Self::new(flags, seq, source, Bytes::new())
    }

    /// Header followed by the payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses one frame. Bytes beyond `payload_len` are link padding and are
    /// dropped.
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        let header = Header::decode(&frame)?;
        frame.advance(HEADER_SIZE);

        let expected = header.payload_len as usize;
        if frame.len() < expected {
            return Err(OstError::Truncated {
                expected,
                actual: frame.len(),
            });
        }
        frame.truncate(expected);

        Ok(Self {
            header,
            payload: frame,
        })
    }
}
