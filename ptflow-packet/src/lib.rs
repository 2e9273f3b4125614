#![no_std]

//! Wire-level tokenizer for Intel Processor Trace packet streams.
//!
//! This crate turns raw PT bytes into typed [`Packet`] records, one packet at
//! a time. It performs framing only: compressed IPs are *not* expanded here
//! (that requires the last-IP context a stateful consumer keeps), TNT payloads
//! are left-aligned but not walked, and timing payloads are returned raw.
//!
//! Buffers may be chunked arbitrarily. When a packet straddles the end of the
//! given slice, [`Packet::parse`] reports
//! [`NeedMoreBytes`][error::PacketError::NeedMoreBytes] so the caller can
//! splice the chunk boundary and retry; [`PKT_MAX_SZ`] bounds the splice
//! buffer a caller needs.

pub mod error;
mod parse;

use derive_more::Display;

use crate::error::PacketResult;

/// Number of bytes in a PSB packet
pub const PSB_LEN: usize = 16;

/// The PSB packet on the wire: eight repetitions of `02 82`
pub const PSB_BYTES: [u8; PSB_LEN] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];

/// Upper bound on the encoded size of any packet
pub const PKT_MAX_SZ: usize = 16;

/// Kind of a decoded packet
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PacketKind {
    /// Padding
    #[display("PAD")]
    Pad,
    /// Taken/Not-taken conditional branch outcomes (short or long form)
    #[display("TNT")]
    Tnt,
    /// Target IP
    #[display("TIP")]
    Tip,
    /// Target IP, packet generation enabled
    #[display("TIP.PGE")]
    TipPge,
    /// Target IP, packet generation disabled
    #[display("TIP.PGD")]
    TipPgd,
    /// Flow update (asynchronous source IP)
    #[display("FUP")]
    Fup,
    /// Paging information (CR3)
    #[display("PIP")]
    Pip,
    /// Execution mode (bitness)
    #[display("MODE.Exec")]
    ModeExec,
    /// Transaction state
    #[display("MODE.TSX")]
    ModeTsx,
    /// Full 7-byte timestamp counter
    #[display("TSC")]
    Tsc,
    /// Mini time counter (8-bit CTC slice)
    #[display("MTC")]
    Mtc,
    /// TSC/MTC alignment
    #[display("TMA")]
    Tma,
    /// Cycle count
    #[display("CYC")]
    Cyc,
    /// Core-to-bus ratio
    #[display("CBR")]
    Cbr,
    /// Packet stream boundary
    #[display("PSB")]
    Psb,
    /// End of the PSB+ header sequence
    #[display("PSBEND")]
    Psbend,
    /// Internal buffer overflow
    #[display("OVF")]
    Ovf,
    /// Trace stop
    #[display("TraceStop")]
    TraceStop,
    /// VMCS pointer
    #[display("VMCS")]
    Vmcs,
    /// Maintenance
    #[display("MNT")]
    Mnt,
}

/// One decoded packet
///
/// The meaning of `payload` and `count` depends on `kind`:
///
/// - `Tnt`: `payload` holds the Taken/Not-taken bits left-aligned so the first
///   outcome to apply is bit 63; `count` is the number of valid bits.
/// - `Tip`/`TipPge`/`TipPgd`/`Fup`: `payload` is the raw IP payload bytes
///   (little-endian, not expanded); `count` is the IP-bytes field of the
///   header (0, 1, 2, 3, 4 or 6).
/// - `Tma`: `payload` is CTC[15:0]; `count` is the 9-bit fast-counter.
/// - `ModeTsx`: `payload` bit 0 is InTX, bit 1 is TXAbort.
/// - `ModeExec`: `payload` is the bitness (16, 32 or 64).
/// - Remaining kinds use `payload` for their natural value and leave `count`
///   zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind
    pub kind: PacketKind,
    /// Payload value, see type-level docs
    pub payload: u64,
    /// Auxiliary count, see type-level docs
    pub count: u16,
    /// Encoded size in bytes
    pub size: u8,
}

impl Packet {
    pub(crate) fn new(kind: PacketKind, payload: u64, count: u16, size: u8) -> Self {
        Self {
            kind,
            payload,
            count,
            size,
        }
    }

    /// Tokenize one packet from the head of `buf`.
    ///
    /// `buf` need not contain a whole packet;
    /// [`NeedMoreBytes`][error::PacketError::NeedMoreBytes] is returned when
    /// it does not. An empty buffer is also `NeedMoreBytes`.
    pub fn parse(buf: &[u8]) -> PacketResult<Self> {
        parse::parse(buf)
    }
}
