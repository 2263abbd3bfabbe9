//! # Wire Format
//!
//! Plaintext layout inside the authenticated envelope. Every packet starts
//! with a one-byte tag that discriminates data symbols, pongs, and
//! application OOB traffic.
//!
//! ## Data / recovery symbol
//!
//! ```text
//! [tag:1][code_group:1][symbol_id:varint][original_count:varint][recovery_count:varint][payload...]
//! ```
//!
//! ## Pong
//!
//! ```text
//! [tag:1][group:1][seen:varint][count:varint][rtt_ms:varint]
//! ```
//!
//! Original symbols carry the running original count (`symbol_id + 1`) and
//! a zero recovery count; recovery symbols carry the final group parameters
//! and are the authoritative source for them.

use bytes::{Buf, BufMut};
use std::fmt;

// ─── Tags ────────────────────────────────────────────────────────────────────

/// Original data symbol.
pub const TAG_ORIGINAL: u8 = 0x00;

/// Recovery symbol produced by the systematic encoder.
pub const TAG_RECOVERY: u8 = 0x01;

/// Telemetry pong.
pub const TAG_PONG: u8 = 0x02;

/// Highest tag owned by the engine; unknown values up to here are dropped.
pub const RESERVED_TAG_MAX: u8 = 0x0F;

/// First type code available to application OOB traffic.
pub const APP_OOB_MIN: u8 = 0x10;

/// Worst-case encoded symbol header: tag + group + three 2-byte varints.
pub const SYMBOL_HEADER_MAX: usize = 8;

// ─── VarInt ──────────────────────────────────────────────────────────────────

/// A 30-bit variable-length integer encoded in 1, 2, or 4 bytes.
///
/// Encoding (2-bit length prefix in the first byte):
/// - `0x00..0x3F` → 1 byte (6 bits), prefix `00`
/// - `0x40..0x3FFF` → 2 bytes (14 bits), prefix `01`
/// - `0x4000..0x3FFF_FFFF` → 4 bytes (30 bits), prefix `10`
///
/// Prefix `11` is unused and rejected on decode.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u32);

impl VarInt {
    /// Maximum representable value: 2^30 - 1.
    pub const MAX: u32 = (1 << 30) - 1;

    /// Create a VarInt, returning `None` if the value exceeds 30 bits.
    #[inline]
    pub fn new(val: u32) -> Option<Self> {
        if val <= Self::MAX {
            Some(VarInt(val))
        } else {
            None
        }
    }

    /// Create a VarInt from a u32, panicking if out of range.
    #[inline]
    pub fn from_u32(val: u32) -> Self {
        Self::new(val).expect("VarInt value exceeds 30-bit limit")
    }

    /// Get the underlying value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Number of bytes this value encodes to.
    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 < 0x40 {
            1
        } else if self.0 < 0x4000 {
            2
        } else {
            4
        }
    }

    /// Encode into a mutable buffer.
    pub fn encode(&self, buf: &mut impl BufMut) {
        match self.encoded_len() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(0x4000 | self.0 as u16),
            4 => buf.put_u32(0x8000_0000 | self.0),
            _ => unreachable!(),
        }
    }

    /// Decode from a buffer. Returns `None` on truncation or a `11` prefix.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let first = buf.chunk()[0];
        match first >> 6 {
            0b00 => {
                buf.advance(1);
                Some(VarInt((first & 0x3F) as u32))
            }
            0b01 => {
                if buf.remaining() < 2 {
                    return None;
                }
                Some(VarInt((buf.get_u16() & 0x3FFF) as u32))
            }
            0b10 => {
                if buf.remaining() < 4 {
                    return None;
                }
                Some(VarInt(buf.get_u32() & 0x3FFF_FFFF))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u16> for VarInt {
    fn from(v: u16) -> Self {
        VarInt(v as u32)
    }
}

impl From<u8> for VarInt {
    fn from(v: u8) -> Self {
        VarInt(v as u32)
    }
}

// ─── Symbol Header ──────────────────────────────────────────────────────────

/// Whether a symbol carries application data or computed redundancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Original,
    Recovery,
}

impl SymbolKind {
    pub fn tag(self) -> u8 {
        match self {
            SymbolKind::Original => TAG_ORIGINAL,
            SymbolKind::Recovery => TAG_RECOVERY,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_ORIGINAL => Some(SymbolKind::Original),
            TAG_RECOVERY => Some(SymbolKind::Recovery),
            _ => None,
        }
    }
}

/// Decoded header of a data or recovery symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolHeader {
    pub kind: SymbolKind,
    /// Wrapping 8-bit code group id.
    pub group: u8,
    /// Dense id within the group; recovery ids start at `original_count`.
    pub symbol_id: u16,
    /// Running count on originals, final count on recovery symbols.
    pub original_count: u16,
    /// Zero on originals, final count on recovery symbols.
    pub recovery_count: u16,
}

impl SymbolHeader {
    /// Encode the header, tag byte included.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.tag());
        buf.put_u8(self.group);
        VarInt::from(self.symbol_id).encode(buf);
        VarInt::from(self.original_count).encode(buf);
        VarInt::from(self.recovery_count).encode(buf);
    }

    /// Decode a header, tag byte included. The buffer is left positioned at
    /// the symbol payload.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        let kind = SymbolKind::from_tag(buf.get_u8())?;
        let group = buf.get_u8();
        let symbol_id = Self::field(buf)?;
        let original_count = Self::field(buf)?;
        let recovery_count = Self::field(buf)?;
        Some(SymbolHeader {
            kind,
            group,
            symbol_id,
            original_count,
            recovery_count,
        })
    }

    /// Total encoded size of this header.
    pub fn encoded_len(&self) -> usize {
        2 + VarInt::from(self.symbol_id).encoded_len()
            + VarInt::from(self.original_count).encoded_len()
            + VarInt::from(self.recovery_count).encoded_len()
    }

    // Symbol-space fields fit u16; anything larger is malformed.
    fn field(buf: &mut impl Buf) -> Option<u16> {
        let v = VarInt::decode(buf)?.value();
        u16::try_from(v).ok()
    }
}

// ─── Pong ───────────────────────────────────────────────────────────────────

/// Telemetry pong: loss statistics for closed groups plus the reporter's
/// own smoothed delay estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongReport {
    /// Most recently closed group, used by the peer for RTT matching.
    pub group: u8,
    /// Originals received across the contributing groups.
    pub seen: u32,
    /// Originals expected across the contributing groups.
    pub count: u32,
    /// Reporter's local smoothed one-way delay in milliseconds.
    pub rtt_ms: u32,
}

impl PongReport {
    /// Encode the pong, tag byte included.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(TAG_PONG);
        buf.put_u8(self.group);
        VarInt::from_u32(self.seen.min(VarInt::MAX)).encode(buf);
        VarInt::from_u32(self.count.min(VarInt::MAX)).encode(buf);
        VarInt::from_u32(self.rtt_ms.min(VarInt::MAX)).encode(buf);
    }

    /// Decode a pong, tag byte included.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        if buf.get_u8() != TAG_PONG {
            return None;
        }
        let group = buf.get_u8();
        let seen = VarInt::decode(buf)?.value();
        let count = VarInt::decode(buf)?.value();
        let rtt_ms = VarInt::decode(buf)?.value();
        Some(PongReport {
            group,
            seen,
            count,
            rtt_ms,
        })
    }
}
