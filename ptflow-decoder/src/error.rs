//! This module contains definition of errors made when decoding

use thiserror::Error;

/// Error published in a [`TraceState`][crate::TraceState] record when a
/// decode step fails.
///
/// The decoder keeps going after most of these: the next
/// [`decode()`][crate::Decoder::decode] call begins re-synchronization, so a
/// caller that wants best-effort output simply skips errored records. Only
/// [`NoData`][TraceError::NoData] is terminal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[non_exhaustive]
pub enum TraceError {
    /// Allocation failure. Kept for interface parity; not produced by this
    /// implementation.
    #[error("Memory allocation failed")]
    NoMem,
    /// A state was reached that the automaton has no transition for
    #[error("Internal error")]
    Internal,
    /// The tokenizer rejected the bytes at the cursor
    #[error("Bad packet")]
    BadPacket,
    /// The trace provider is exhausted
    #[error("No more data")]
    NoData,
    /// The instruction walker has no instruction text at the current IP
    #[error("Failed to get instruction")]
    NoInsn,
    /// The walked instruction contradicts what the packet stream implies
    #[error("Trace doesn't match instruction")]
    Mismatch,
    /// An OVF packet: the trace hardware overflowed its buffer
    #[error("Overflow packet")]
    Overflow,
    /// Trace data lost. Kept for interface parity; not produced by this
    /// implementation.
    #[error("Lost trace data")]
    Lost,
    /// Unmapped internal code
    #[error("Unknown error!")]
    Unknown,
    /// The loop guard concluded the decoder is stuck in an infinite loop
    #[error("Never-ending loop")]
    NeverEndingLoop,
}

/// Crate-internal step outcome, the moral equivalent of the errno-style codes
/// the automaton handlers pass around. `Again` and `Relink` are control-flow
/// signals, not failures; everything else maps onto [`TraceError`] when it
/// reaches the `decode()` boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// The current packet is exhausted, fetch another one and continue
    Again,
    /// The trace provider signalled a discontinuity; restart from the new
    /// automaton state
    Relink,
    NoData,
    BadPacket,
    Overflow,
    Mismatch,
    NoInsn,
    NeverEndingLoop,
    Internal,
}

impl From<Fault> for TraceError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::NoData => TraceError::NoData,
            Fault::BadPacket => TraceError::BadPacket,
            Fault::Overflow => TraceError::Overflow,
            Fault::Mismatch => TraceError::Mismatch,
            Fault::NoInsn => TraceError::NoInsn,
            Fault::NeverEndingLoop => TraceError::NeverEndingLoop,
            Fault::Internal => TraceError::Internal,
            // Control-flow signals never escape; if one does, surface it as
            // the catch-all like the original code table did.
            Fault::Again | Fault::Relink => TraceError::Unknown,
        }
    }
}

pub(crate) type StepResult = Result<(), Fault>;
