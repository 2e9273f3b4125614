//! Published decode-step records

use core::ops::{BitOr, BitOrAssign};

use derive_more::Display;

use crate::error::TraceError;

/// What a [`TraceState`] record samples, as a bit set: a record can be both a
/// branch and an instruction sample, or carry a transaction marker alongside
/// a branch.
///
/// The empty set marks a synchronization record ("decoder regained an IP"),
/// not a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SampleType(u32);

impl SampleType {
    /// Synchronization marker, not a sample
    pub const NONE: Self = Self(0);
    /// A resolved branch with from/to IPs
    pub const BRANCH: Self = Self(1 << 0);
    /// An instruction sample (period expiry or MTC sampling)
    pub const INSTRUCTION: Self = Self(1 << 1);
    /// A transaction state change
    pub const TRANSACTION: Self = Self(1 << 2);

    /// Whether every bit of `other` is set in `self`
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bit is set (a sync marker)
    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SampleType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SampleType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Per-record flags, as a bit set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SampleFlag(u32);

impl SampleFlag {
    /// Executed inside a transaction
    pub const IN_TX: Self = Self(1 << 0);
    /// A transaction abort
    pub const ABORT_TX: Self = Self(1 << 1);
    /// Asynchronous branch (interrupt, fault, ...)
    pub const ASYNC: Self = Self(1 << 2);

    pub(crate) const EMPTY: Self = Self(0);

    /// Mask the transaction bits out of a MODE.TSX payload
    pub(crate) fn tx_from_payload(payload: u64) -> Self {
        Self(payload as u32 & (Self::IN_TX.0 | Self::ABORT_TX.0))
    }

    /// Whether every bit of `other` is set in `self`
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for SampleFlag {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SampleFlag {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Instruction-sampling period configuration
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeriodType {
    /// No instruction sampling
    #[default]
    #[display("none")]
    None,
    /// Sample every `period` instructions
    #[display("instructions")]
    Instructions,
    /// Sample every `period` TSC ticks (rounded down to a power of two)
    #[display("ticks")]
    Ticks,
    /// Sample on MTC packets
    #[display("mtc")]
    Mtc,
}

/// The record published by one [`decode()`][crate::Decoder::decode] call.
///
/// Successive calls overwrite the same record; callers that need history copy
/// it out.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TraceState {
    /// What this record samples; the empty set is a sync marker
    pub kind: SampleType,
    /// Source IP, or the IP at failure when `err` is set
    pub from_ip: u64,
    /// Destination IP; 0 when tracing left the filter region or stopped
    pub to_ip: u64,
    /// Transaction / async flags
    pub flags: SampleFlag,
    /// Page-table root of the current address space
    pub cr3: u64,
    /// Reconstructed timestamp at the sample point
    pub timestamp: u64,
    /// Timestamp estimate extrapolated over instructions executed since the
    /// last timing packet
    pub est_timestamp: u64,
    /// Total instructions walked since decoder construction
    pub tot_insn_cnt: u64,
    /// Sequence number of the trace buffer this record came from
    pub trace_nr: u64,
    /// Failure for this step, if any
    pub err: Option<TraceError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_type_bits_combine() {
        let mut kind = SampleType::BRANCH;
        kind |= SampleType::INSTRUCTION;
        assert!(kind.contains(SampleType::BRANCH));
        assert!(kind.contains(SampleType::INSTRUCTION));
        assert!(!kind.contains(SampleType::TRANSACTION));
        assert!(SampleType::NONE.is_none());
        assert!(!kind.is_none());
    }

    #[test]
    fn sample_flag_tx_payload_masks_high_bits() {
        let flags = SampleFlag::tx_from_payload(0b111);
        assert!(flags.contains(SampleFlag::IN_TX));
        assert!(flags.contains(SampleFlag::ABORT_TX));
        assert!(!flags.contains(SampleFlag::ASYNC));
    }

    #[test]
    fn sample_flag_remove() {
        let mut flags = SampleFlag::IN_TX | SampleFlag::ASYNC;
        flags.remove(SampleFlag::IN_TX);
        assert!(!flags.contains(SampleFlag::IN_TX));
        assert!(flags.contains(SampleFlag::ASYNC));
    }
}
