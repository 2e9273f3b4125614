//! Reconstruct executed control flow and timing from Intel Processor Trace
//! packet streams.
//!
//! Intel PT hardware emits a highly compressed record of execution: taken /
//! not-taken bits for conditional branches, target IPs only for indirect
//! transfers, and a family of timing packets. Turning that back into "the
//! program went from here to there at this time" requires re-walking the
//! traced program's instructions. This crate supplies the stateful decoder
//! that does so; the caller supplies the two seams it cannot provide itself:
//!
//! - [`ProvideTrace`] hands the decoder chunks of raw packet bytes;
//! - [`WalkInsn`] decodes target-program instructions at a given IP.
//!
//! One [`Decoder::decode`] call resolves one branch, instruction sample or
//! synchronization point and publishes it as a [`TraceState`] record:
//!
//! ```rust,ignore
//! let mut decoder = Decoder::new(source, walker, DecoderConfig::default());
//! loop {
//!     let state = decoder.decode();
//!     match state.err {
//!         Some(TraceError::NoData) => break,
//!         Some(err) => eprintln!("step failed: {err}"),
//!         None => println!("{:#x} -> {:#x}", state.from_ip, state.to_ip),
//!     }
//! }
//! ```
//!
//! Decoding is strictly single-threaded and pull-based: no internal threads,
//! no shared state between decoder instances, cancellation by simply not
//! calling `decode()` again.

mod automaton;
pub mod error;
mod insn;
mod overlap;
mod source;
mod stack;
mod state;
mod timing;
mod tokenizer;

#[cfg(feature = "iced_walker")]
mod iced_walker;

use ptflow_packet::{PKT_MAX_SZ, Packet, PacketKind};

pub use crate::{
    error::TraceError,
    insn::{InsnBranch, InsnOp, PtInsn, WalkError, WalkInsn},
    overlap::{Overlap, find_overlap},
    source::{ProvideTrace, SliceTrace, TraceChunk},
    state::{PeriodType, SampleFlag, SampleType, TraceState},
};

#[cfg(feature = "iced_walker")]
pub use crate::iced_walker::ImageWalker;

use crate::{
    error::Fault, stack::RetStack, state::SampleFlag as Flag, timing::Timing, tokenizer::Window,
};

/// Automaton state between `decode()` calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PktState {
    /// Not synchronized; scan for a PSB
    NoPsb,
    /// Synchronized but no IP yet; scan for a packet carrying a full IP
    NoIp,
    /// Recovering from an error; same scan as `NoIp` but IP context is kept
    ErrResync,
    /// Steady state, dispatch on the next packet
    InSync,
    /// TNT bits pending, continuing from a previous step
    TntCont,
    /// TNT bits pending
    Tnt,
    /// Walking toward the target of a TIP
    Tip,
    /// Walking toward the target of a TIP.PGD
    TipPgd,
    /// FUP resolved, follow-up pending
    Fup,
    /// FUP resolved, no follow-up TIP expected
    FupNoTip,
}

impl PktState {
    /// Whether the timestamp at the end of a step in this state is safe to
    /// publish (mid-packet states hold back until the packet completes)
    fn sample_time(self) -> bool {
        match self {
            PktState::NoPsb
            | PktState::NoIp
            | PktState::ErrResync
            | PktState::InSync
            | PktState::TntCont => true,
            PktState::Tnt
            | PktState::Tip
            | PktState::TipPgd
            | PktState::Fup
            | PktState::FupNoTip => false,
        }
    }
}

/// Construction-time configuration for [`Decoder`].
///
/// You can create default options via [`DecoderConfig::default`] and adjust
/// them with the builder-style setters.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    return_compression: bool,
    period: u64,
    period_type: PeriodType,
    max_non_turbo_ratio: u32,
    mtc_period: u32,
    tsc_ctc_ratio_n: u32,
    tsc_ctc_ratio_d: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            return_compression: true,
            period: 0,
            period_type: PeriodType::None,
            max_non_turbo_ratio: 0,
            mtc_period: 0,
            tsc_ctc_ratio_n: 0,
            tsc_ctc_ratio_d: 0,
        }
    }
}

impl DecoderConfig {
    /// Whether the trace was recorded with return compression (RET encoded
    /// as one TNT bit against the shadow stack). Default `true`.
    pub fn return_compression(&mut self, return_compression: bool) -> &mut Self {
        self.return_compression = return_compression;
        self
    }

    /// Instruction-sampling period and its unit. Default: no sampling.
    pub fn period(&mut self, period: u64, period_type: PeriodType) -> &mut Self {
        self.period = period;
        self.period_type = period_type;
        self
    }

    /// The CPU's max non-turbo ratio, used for cycle-to-TSC conversion.
    /// Default 0 (unknown).
    pub fn max_non_turbo_ratio(&mut self, ratio: u32) -> &mut Self {
        self.max_non_turbo_ratio = ratio;
        self
    }

    /// The MTC period exponent the trace was recorded with (CTC bits skipped
    /// per MTC step). Default 0.
    pub fn mtc_period(&mut self, mtc_period: u32) -> &mut Self {
        self.mtc_period = mtc_period;
        self
    }

    /// The TSC:CTC frequency ratio from CPUID. A zero denominator (or zero
    /// numerator) disables MTC/TMA timing entirely. Default 0/0.
    pub fn tsc_ctc_ratio(&mut self, n: u32, d: u32) -> &mut Self {
        self.tsc_ctc_ratio_n = n;
        self.tsc_ctc_ratio_d = d;
        self
    }
}

/// The Intel PT decoder.
///
/// `'a` is the lifetime of the trace bytes handed out by the provider `P`;
/// `W` walks target-program instructions. Both collaborators are mandatory at
/// construction, which is what makes a `Decoder` well-formed by definition.
pub struct Decoder<'a, P, W> {
    pub(crate) source: P,
    pub(crate) walker: W,

    // Published record
    pub(crate) state: TraceState,

    // Byte cursor
    pub(crate) buf: Window<'a>,
    pub(crate) next_buf: Option<&'a [u8]>,
    pub(crate) temp_buf: [u8; PKT_MAX_SZ],
    pub(crate) pos: u64,
    pub(crate) pkt_step: usize,
    pub(crate) pkt_len: usize,
    pub(crate) packet: Packet,
    pub(crate) tnt: Packet,
    pub(crate) last_packet_type: Option<PacketKind>,

    // Automaton
    pub(crate) pkt_state: PktState,
    pub(crate) ip: u64,
    pub(crate) last_ip: u64,
    pub(crate) have_last_ip: bool,
    pub(crate) cr3: u64,
    pub(crate) exec_mode: u64,
    pub(crate) pge: bool,
    pub(crate) overflow: bool,
    pub(crate) tx_flags: Flag,
    pub(crate) fup_tx_flags: Flag,
    pub(crate) set_fup_tx_flags: bool,
    pub(crate) stack: RetStack,
    pub(crate) ret_addr: u64,
    pub(crate) return_compression: bool,
    pub(crate) mtc_insn: bool,

    // Timing reconstruction
    pub(crate) timing: Timing,
    pub(crate) sample_timestamp: u64,
    pub(crate) sample_insn_cnt: u64,

    // Instruction counting and sampling period
    pub(crate) tot_insn_cnt: u64,
    pub(crate) period: u64,
    pub(crate) period_type: PeriodType,
    pub(crate) period_insn_cnt: u64,
    pub(crate) period_mask: u64,
    pub(crate) period_ticks: u64,
    pub(crate) last_masked_timestamp: u64,
    pub(crate) continuous_period: bool,

    // Loop guard
    pub(crate) stuck_ip: u64,
    pub(crate) no_progress: u32,
    pub(crate) stuck_ip_prd: u32,
    pub(crate) stuck_ip_cnt: u32,
}

impl<'a, P, W> Decoder<'a, P, W>
where
    P: ProvideTrace<'a>,
    W: WalkInsn,
{
    /// Create a decoder over `source`, walking instructions with `walker`
    #[must_use]
    pub fn new(source: P, walker: W, config: DecoderConfig) -> Self {
        let timing = Timing::new(&config);
        log::debug!("timestamp: mtc_shift {}", timing.mtc_shift);
        log::debug!("timestamp: tsc_ctc_ratio_n {}", timing.tsc_ctc_ratio_n);
        log::debug!("timestamp: tsc_ctc_ratio_d {}", timing.tsc_ctc_ratio_d);
        log::debug!("timestamp: tsc_ctc_mult {}", timing.tsc_ctc_mult);
        log::debug!("timestamp: tsc_slip {:#x}", timing.tsc_slip);

        let mut decoder = Self {
            source,
            walker,
            state: TraceState::default(),
            buf: Window::empty(),
            next_buf: None,
            temp_buf: [0; PKT_MAX_SZ],
            pos: 0,
            pkt_step: 0,
            pkt_len: 0,
            packet: Packet {
                kind: PacketKind::Pad,
                payload: 0,
                count: 0,
                size: 0,
            },
            tnt: Packet {
                kind: PacketKind::Tnt,
                payload: 0,
                count: 0,
                size: 0,
            },
            last_packet_type: None,
            pkt_state: PktState::NoPsb,
            ip: 0,
            last_ip: 0,
            have_last_ip: false,
            cr3: 0,
            exec_mode: 0,
            pge: false,
            overflow: false,
            tx_flags: Flag::EMPTY,
            fup_tx_flags: Flag::EMPTY,
            set_fup_tx_flags: false,
            stack: RetStack::new(),
            ret_addr: 0,
            return_compression: config.return_compression,
            mtc_insn: false,
            timing,
            sample_timestamp: 0,
            sample_insn_cnt: 0,
            tot_insn_cnt: 0,
            period: config.period,
            period_type: config.period_type,
            period_insn_cnt: 0,
            period_mask: 0,
            period_ticks: 0,
            last_masked_timestamp: 0,
            continuous_period: false,
            stuck_ip: 0,
            no_progress: 0,
            stuck_ip_prd: 0,
            stuck_ip_cnt: 0,
        };
        decoder.setup_period();
        decoder
    }

    /// Resolve the next branch, instruction sample or synchronization point.
    ///
    /// The returned record is valid until the next call. On error, `err` is
    /// set and `from_ip` holds the IP at failure; the decoder is left in a
    /// recovery state so the next call re-synchronizes.
    pub fn decode(&mut self) -> &TraceState {
        let mut result;

        loop {
            self.state.kind = SampleType::BRANCH;
            self.state.flags = Flag::EMPTY;

            result = match self.pkt_state {
                PktState::NoPsb => self.sync(),
                PktState::NoIp => {
                    self.have_last_ip = false;
                    self.last_ip = 0;
                    self.ip = 0;
                    self.sync_ip()
                }
                PktState::ErrResync => self.sync_ip(),
                PktState::InSync => self.walk_trace(),
                PktState::Tnt | PktState::TntCont => match self.walk_tnt() {
                    Err(Fault::Again) => self.walk_trace(),
                    other => other,
                },
                PktState::Tip | PktState::TipPgd => self.walk_tip(),
                PktState::Fup => {
                    self.pkt_state = PktState::InSync;
                    match self.walk_fup() {
                        Err(Fault::Again) => self.walk_fup_tip(),
                        Ok(()) => {
                            self.pkt_state = PktState::Fup;
                            Ok(())
                        }
                        other => other,
                    }
                }
                PktState::FupNoTip => {
                    self.pkt_state = PktState::InSync;
                    match self.walk_fup() {
                        Err(Fault::Again) => self.walk_trace(),
                        other => other,
                    }
                }
            };

            if result != Err(Fault::Relink) {
                break;
            }
        }

        if let Err(fault) = result {
            self.state.err = Some(TraceError::from(fault));
            self.state.from_ip = self.ip;
            self.sample_timestamp = self.timing.timestamp;
            self.sample_insn_cnt = self.timing.timestamp_insn_cnt;
        } else {
            self.state.err = None;
            if self.pkt_state.sample_time() {
                self.sample_timestamp = self.timing.timestamp;
                self.sample_insn_cnt = self.timing.timestamp_insn_cnt;
            }
        }

        self.state.timestamp = self.sample_timestamp;
        self.state.est_timestamp = self.est_timestamp();
        self.state.cr3 = self.cr3;
        self.state.tot_insn_cnt = self.tot_insn_cnt;

        &self.state
    }

    /// Execution mode (bitness) last reported by a MODE.EXEC packet; 0 until
    /// one has been seen
    #[must_use]
    pub fn exec_mode(&self) -> u64 {
        self.exec_mode
    }

    /// Whether the trace has carried any CYC packets (cycle-accurate timing)
    #[must_use]
    pub fn have_cyc(&self) -> bool {
        self.timing.have_cyc
    }

    /// Timestamp estimate: extrapolate from the last published timestamp over
    /// the instructions executed since, at roughly two instructions per
    /// cycle, scaled by the current core frequency when it is known
    fn est_timestamp(&self) -> u64 {
        if self.timing.cbr == 0 || self.timing.max_non_turbo_ratio == 0 {
            return self.sample_timestamp;
        }
        let mut est = self.sample_insn_cnt << 1;
        est *= u64::from(self.timing.max_non_turbo_ratio);
        est /= u64::from(self.timing.cbr);
        self.sample_timestamp + est
    }

    fn setup_period(&mut self) {
        if self.period_type == PeriodType::Ticks {
            let period = lower_power_of_2(self.period);
            self.period_mask = !(period.wrapping_sub(1));
            self.period_ticks = period;
        }
    }
}

fn lower_power_of_2(x: u64) -> u64 {
    if x == 0 {
        return 0;
    }
    1 << (63 - x.leading_zeros())
}
