//! Decoder state machine
//!
//! The handlers here consume packets and drive the instruction walker until
//! one branch, sample or synchronization point resolves, then return to
//! `decode()` with the published record filled in. Mid-packet progress (TNT
//! bits left over, a TIP still being walked toward) is carried between calls
//! in `pkt_state`, which is also what `decode()` dispatches on.

use ptflow_packet::{Packet, PacketKind};

use crate::{
    Decoder, PeriodType, PktState, ProvideTrace, SampleFlag, SampleType, WalkInsn,
    error::{Fault, StepResult},
    insn::{InsnBranch, InsnOp, PtInsn, WalkError},
};

const BIT63: u64 = 1 << 63;

/// Maximum number of unconditional branches with no packets consumed before
/// the decoder concludes it is stuck in a loop
const MAX_LOOPS: u32 = 10_000;

/// Outcome of one instruction-walker invocation, after the adapter has
/// accounted for counters, the shadow stack and resolved branches
pub(crate) enum Walked {
    /// A record was published (a fall-through sample or a taken
    /// unconditional branch)
    Emitted,
    /// The walker stopped at a branch the packet stream must resolve
    Pending(PtInsn),
    /// The walker reached the requested target IP
    AtTarget,
}

/// Expand a (possibly compressed) IP payload against the last IP
fn calc_ip(packet: &Packet, last_ip: u64) -> u64 {
    match packet.count {
        1 => (last_ip & 0xffff_ffff_ffff_0000) | packet.payload,
        2 => (last_ip & 0xffff_ffff_0000_0000) | packet.payload,
        3 => {
            // Sign-extend 6-byte ip
            let ip = packet.payload;
            if ip & 0x8000_0000_0000 != 0 {
                ip | 0xffff_0000_0000_0000
            } else {
                ip
            }
        }
        4 => (last_ip & 0xffff_0000_0000_0000) | packet.payload,
        6 => packet.payload,
        _ => 0,
    }
}

impl<'a, P, W> Decoder<'a, P, W>
where
    P: ProvideTrace<'a>,
    W: WalkInsn,
{
    fn set_last_ip(&mut self) {
        self.last_ip = calc_ip(&self.packet, self.last_ip);
        self.have_last_ip = true;
    }

    fn set_ip(&mut self) {
        self.set_last_ip();
        self.ip = self.last_ip;
    }

    /// Whether the current packet yields a full IP: it must carry payload
    /// bytes, and either be self-contained (6-byte forms) or have a last IP
    /// to expand against
    fn have_ip(&self) -> bool {
        self.packet.count != 0
            && (self.have_last_ip || self.packet.count == 3 || self.packet.count == 6)
    }

    pub(crate) fn clear_tx_flags(&mut self) {
        self.tx_flags = SampleFlag::EMPTY;
    }

    fn update_in_tx(&mut self) {
        self.tx_flags = if self.packet.payload & 1 != 0 {
            SampleFlag::IN_TX
        } else {
            SampleFlag::EMPTY
        };
    }

    fn bug(&mut self) -> Fault {
        log::error!("Internal error");
        self.pkt_state = PktState::NoPsb;
        Fault::Internal
    }

    fn on_overflow(&mut self) -> Fault {
        log::error!("Buffer overflow");
        self.clear_tx_flags();
        self.timing.have_tma = false;
        self.timing.timestamp_insn_cnt = 0;
        self.pkt_state = PktState::ErrResync;
        self.overflow = true;
        Fault::Overflow
    }

    /// Ticks until the next tick-period sample boundary
    fn next_period(&mut self) -> u64 {
        let mut timestamp = self.timing.timestamp + self.timing.timestamp_insn_cnt;
        let mut masked_timestamp = timestamp & self.period_mask;
        if self.continuous_period {
            if masked_timestamp != self.last_masked_timestamp {
                return 1;
            }
        } else {
            timestamp += 1;
            masked_timestamp = timestamp & self.period_mask;
            if masked_timestamp != self.last_masked_timestamp {
                self.last_masked_timestamp = masked_timestamp;
                self.continuous_period = true;
            }
        }
        self.period_ticks - (timestamp - masked_timestamp)
    }

    /// Instruction budget for the next walk; 0 means unbounded
    fn next_sample(&mut self) -> u64 {
        match self.period_type {
            PeriodType::Instructions => self.period.wrapping_sub(self.period_insn_cnt),
            PeriodType::Ticks => self.next_period(),
            PeriodType::None | PeriodType::Mtc => 0,
        }
    }

    /// The walk hit the sampling budget: mark the record as an instruction
    /// sample and restart the period
    fn sample_insn(&mut self) {
        match self.period_type {
            PeriodType::Instructions => self.period_insn_cnt = 0,
            PeriodType::Ticks => {
                let timestamp = self.timing.timestamp + self.timing.timestamp_insn_cnt;
                self.last_masked_timestamp = timestamp & self.period_mask;
            }
            PeriodType::None | PeriodType::Mtc => {}
        }
        self.state.kind |= SampleType::INSTRUCTION;
    }

    /// Run the external walker from the current IP toward `to_ip` (0 for
    /// "until the next branch") and fold the result into decoder state:
    /// counters, shadow-stack pushes/pops, resolved unconditional branches,
    /// budget samples and the loop guard.
    fn walk_insn(&mut self, to_ip: u64) -> Result<Walked, Fault> {
        if !self.mtc_insn {
            self.mtc_insn = true;
        }

        let max_insn_cnt = self.next_sample();

        let mut insn = PtInsn::default();
        let mut insn_cnt = 0u64;
        let result = self
            .walker
            .walk_insn(&mut insn, &mut insn_cnt, &mut self.ip, to_ip, max_insn_cnt);

        self.tot_insn_cnt += insn_cnt;
        self.timing.timestamp_insn_cnt += insn_cnt;
        self.sample_insn_cnt += insn_cnt;
        self.period_insn_cnt += insn_cnt;

        if let Err(err) = result {
            self.no_progress = 0;
            log::error!("{:#x}: Failed to get instruction", self.ip);
            return Err(match err {
                WalkError::MissingText => {
                    self.pkt_state = PktState::NoIp;
                    Fault::NoInsn
                }
                WalkError::Failed => {
                    self.pkt_state = PktState::ErrResync;
                    Fault::Mismatch
                }
            });
        }

        if to_ip != 0 && self.ip == to_ip {
            self.no_progress = 0;
            self.apply_in_tx_flag();
            return Ok(Walked::AtTarget);
        }

        if max_insn_cnt != 0 && insn_cnt >= max_insn_cnt {
            self.sample_insn();
        }

        if insn.branch == InsnBranch::NoBranch {
            self.state.kind = SampleType::INSTRUCTION;
            self.state.from_ip = self.ip;
            self.state.to_ip = 0;
            self.ip = self.ip.wrapping_add(u64::from(insn.length));
            self.no_progress = 0;
            self.apply_in_tx_flag();
            return Ok(Walked::Emitted);
        }

        if insn.op == InsnOp::Call {
            // Zero-length calls are excluded
            if insn.branch != InsnBranch::Unconditional || insn.rel != 0 {
                self.stack
                    .push(self.ip.wrapping_add(u64::from(insn.length)));
            }
        } else if insn.op == InsnOp::Ret {
            self.ret_addr = self.stack.pop();
        }

        if insn.branch == InsnBranch::Unconditional {
            let cnt = self.no_progress;
            self.no_progress += 1;

            self.state.from_ip = self.ip;
            self.ip = self
                .ip
                .wrapping_add(u64::from(insn.length))
                .wrapping_add(insn.rel as i64 as u64);
            self.state.to_ip = self.ip;

            // A decoder error can leave the IP inside an infinite loop that
            // consumes no packets; such a loop must contain an unconditional
            // branch, so this is the place to watch for it.
            if cnt != 0 {
                if cnt == 1 {
                    self.stuck_ip = self.state.to_ip;
                    self.stuck_ip_prd = 1;
                    self.stuck_ip_cnt = 1;
                } else if cnt > MAX_LOOPS || self.state.to_ip == self.stuck_ip {
                    log::error!("{:#x}: Never-ending loop", self.state.to_ip);
                    self.pkt_state = PktState::ErrResync;
                    self.no_progress = 0;
                    self.apply_in_tx_flag();
                    return Err(Fault::NeverEndingLoop);
                } else {
                    self.stuck_ip_cnt -= 1;
                    if self.stuck_ip_cnt == 0 {
                        self.stuck_ip_prd += 1;
                        self.stuck_ip_cnt = self.stuck_ip_prd;
                        self.stuck_ip = self.state.to_ip;
                    }
                }
            }

            self.apply_in_tx_flag();
            return Ok(Walked::Emitted);
        }

        self.no_progress = 0;
        self.apply_in_tx_flag();
        Ok(Walked::Pending(insn))
    }

    fn apply_in_tx_flag(&mut self) {
        if self.tx_flags.contains(SampleFlag::IN_TX) {
            self.state.flags |= SampleFlag::IN_TX;
        }
    }

    /// Walk from the FUP source IP to the point the FUP reports. A pending
    /// MODE.TSX transaction change is published once the walk arrives.
    pub(crate) fn walk_fup(&mut self) -> StepResult {
        let ip = self.last_ip;
        loop {
            match self.walk_insn(ip) {
                Ok(Walked::Emitted) => return Ok(()),
                Ok(Walked::AtTarget) => {
                    if self.set_fup_tx_flags {
                        self.set_fup_tx_flags = false;
                        self.tx_flags = self.fup_tx_flags;
                        self.state.kind = SampleType::TRANSACTION;
                        self.state.from_ip = self.ip;
                        self.state.to_ip = 0;
                        self.state.flags = self.fup_tx_flags;
                        return Ok(());
                    }
                    return Err(Fault::Again);
                }
                Ok(Walked::Pending(insn)) => {
                    self.set_fup_tx_flags = false;
                    match insn.branch {
                        InsnBranch::Indirect => {
                            log::error!("{:#x}: Unexpected indirect branch", self.ip);
                            self.pkt_state = PktState::ErrResync;
                            return Err(Fault::Mismatch);
                        }
                        InsnBranch::Conditional => {
                            log::error!("{:#x}: Unexpected conditional branch", self.ip);
                            self.pkt_state = PktState::ErrResync;
                            return Err(Fault::Mismatch);
                        }
                        InsnBranch::NoBranch | InsnBranch::Unconditional => {
                            return Err(self.bug());
                        }
                    }
                }
                Err(fault) => {
                    self.set_fup_tx_flags = false;
                    return Err(fault);
                }
            }
        }
    }

    /// Walk to the indirect or filter-exiting branch a TIP / TIP.PGD
    /// announces, then apply its target
    pub(crate) fn walk_tip(&mut self) -> StepResult {
        match self.walk_insn(0)? {
            Walked::Emitted => {
                if self.pkt_state == PktState::TipPgd
                    && self.state.kind.contains(SampleType::BRANCH)
                    && self.walker.is_outside_filter(self.state.to_ip)
                {
                    // Unconditional branch leaving filter region
                    self.no_progress = 0;
                    self.pge = false;
                    self.continuous_period = false;
                    self.pkt_state = PktState::InSync;
                    self.state.to_ip = 0;
                }
                Ok(())
            }
            Walked::AtTarget => Err(Fault::Again),
            Walked::Pending(insn) => match insn.branch {
                InsnBranch::Indirect => {
                    if self.pkt_state == PktState::TipPgd {
                        self.pge = false;
                        self.continuous_period = false;
                        self.pkt_state = PktState::InSync;
                        self.state.from_ip = self.ip;
                        self.state.to_ip = 0;
                        if self.packet.count != 0 {
                            self.ip = self.last_ip;
                        }
                    } else {
                        self.pkt_state = PktState::InSync;
                        self.state.from_ip = self.ip;
                        if self.packet.count == 0 {
                            self.state.to_ip = 0;
                        } else {
                            self.state.to_ip = self.last_ip;
                            self.ip = self.last_ip;
                        }
                    }
                    Ok(())
                }
                InsnBranch::Conditional => {
                    let to_ip = self
                        .ip
                        .wrapping_add(u64::from(insn.length))
                        .wrapping_add(insn.rel as i64 as u64);

                    if self.pkt_state == PktState::TipPgd && self.walker.is_outside_filter(to_ip) {
                        // Conditional branch leaving filter region
                        self.pge = false;
                        self.continuous_period = false;
                        self.pkt_state = PktState::InSync;
                        self.ip = to_ip;
                        self.state.from_ip = self.ip;
                        self.state.to_ip = 0;
                        Ok(())
                    } else {
                        log::error!(
                            "{:#x}: Conditional branch when expecting indirect branch",
                            self.ip
                        );
                        self.pkt_state = PktState::ErrResync;
                        Err(Fault::Mismatch)
                    }
                }
                InsnBranch::NoBranch | InsnBranch::Unconditional => Err(self.bug()),
            },
        }
    }

    /// Resolve branches against the pending TNT bits, most significant
    /// first: conditional branches take a bit each, compressed returns take
    /// a taken-bit plus a shadow-stack pop, and indirect branches force a
    /// deferred TIP fetch
    pub(crate) fn walk_tnt(&mut self) -> StepResult {
        loop {
            let insn = match self.walk_insn(0)? {
                Walked::Emitted => return Ok(()),
                Walked::AtTarget => return Err(Fault::Again),
                Walked::Pending(insn) => insn,
            };

            if insn.op == InsnOp::Ret {
                if !self.return_compression {
                    log::error!("{:#x}: RET when expecting conditional branch", self.ip);
                    self.pkt_state = PktState::ErrResync;
                    return Err(Fault::Mismatch);
                }
                if self.ret_addr == 0 {
                    log::error!("{:#x}: Bad RET compression (stack empty)", self.ip);
                    self.pkt_state = PktState::ErrResync;
                    return Err(Fault::Mismatch);
                }
                if self.tnt.payload & BIT63 == 0 {
                    log::error!("{:#x}: Bad RET compression (TNT=N)", self.ip);
                    self.pkt_state = PktState::ErrResync;
                    return Err(Fault::Mismatch);
                }
                self.tnt.count -= 1;
                self.pkt_state = if self.tnt.count != 0 {
                    PktState::TntCont
                } else {
                    PktState::InSync
                };
                self.tnt.payload <<= 1;
                self.state.from_ip = self.ip;
                self.ip = self.ret_addr;
                self.state.to_ip = self.ip;
                return Ok(());
            }

            if insn.branch == InsnBranch::Indirect {
                // Handle deferred TIPs
                self.next_packet()?;
                if self.packet.kind != PacketKind::Tip || self.packet.count == 0 {
                    log::error!("{:#x}: Missing deferred TIP for indirect branch", self.ip);
                    self.pkt_state = PktState::ErrResync;
                    self.pkt_step = 0;
                    return Err(Fault::Mismatch);
                }
                self.set_last_ip();
                self.state.from_ip = self.ip;
                self.state.to_ip = self.last_ip;
                self.ip = self.last_ip;
                return Ok(());
            }

            if insn.branch == InsnBranch::Conditional {
                self.tnt.count -= 1;
                self.pkt_state = if self.tnt.count != 0 {
                    PktState::TntCont
                } else {
                    PktState::InSync
                };
                if self.tnt.payload & BIT63 != 0 {
                    self.tnt.payload <<= 1;
                    self.state.from_ip = self.ip;
                    self.ip = self
                        .ip
                        .wrapping_add(u64::from(insn.length))
                        .wrapping_add(insn.rel as i64 as u64);
                    self.state.to_ip = self.ip;
                    return Ok(());
                }
                // Instruction sample for a non-taken branch
                if self.state.kind.contains(SampleType::INSTRUCTION) {
                    self.tnt.payload <<= 1;
                    self.state.kind = SampleType::INSTRUCTION;
                    self.state.from_ip = self.ip;
                    self.state.to_ip = 0;
                    self.ip = self.ip.wrapping_add(u64::from(insn.length));
                    return Ok(());
                }
                // Not taken: publish the fall-through edge
                self.tnt.payload <<= 1;
                self.state.from_ip = self.ip;
                self.ip = self.ip.wrapping_add(u64::from(insn.length));
                self.state.to_ip = self.ip;
                return Ok(());
            }

            return Err(self.bug());
        }
    }

    /// MODE.TSX while tracing is enabled: the transaction change applies at
    /// the IP the following FUP reports, so stash the flags until that walk
    /// completes
    fn mode_tsx(&mut self, no_tip: &mut bool) -> StepResult {
        let fup_tx_flags = SampleFlag::tx_from_payload(self.packet.payload);

        self.next_packet()?;
        if self.packet.kind == PacketKind::Fup {
            self.fup_tx_flags = fup_tx_flags;
            self.set_fup_tx_flags = true;
            if !self.fup_tx_flags.contains(SampleFlag::ABORT_TX) {
                *no_tip = true;
            }
        } else {
            log::error!("{:#x}: Missing FUP after MODE.TSX", self.pos);
            self.update_in_tx();
        }
        Ok(())
    }

    /// Walk PSB+ packets when already in sync
    fn walk_psbend(&mut self) -> StepResult {
        loop {
            self.next_packet()?;

            match self.packet.kind {
                PacketKind::Psbend => return Ok(()),

                PacketKind::TipPgd
                | PacketKind::TipPge
                | PacketKind::Tip
                | PacketKind::Tnt
                | PacketKind::TraceStop
                | PacketKind::Psb => {
                    self.timing.have_tma = false;
                    log::error!("Unexpected packet");
                    return Err(Fault::Again);
                }

                PacketKind::Ovf => return Err(self.on_overflow()),

                PacketKind::Tsc => self.calc_tsc_timestamp(),
                PacketKind::Tma => self.calc_tma(),
                PacketKind::Cbr => self.calc_cbr(),
                PacketKind::ModeExec => self.exec_mode = self.packet.payload,
                PacketKind::Pip => self.cr3 = self.packet.payload & (BIT63 - 1),

                PacketKind::Fup => {
                    self.pge = true;
                    if self.packet.count != 0 {
                        self.set_last_ip();
                    }
                }

                PacketKind::ModeTsx => self.update_in_tx(),

                PacketKind::Mtc => {
                    self.calc_mtc_timestamp();
                    if self.period_type == PeriodType::Mtc {
                        self.state.kind |= SampleType::INSTRUCTION;
                    }
                }

                _ => {}
            }
        }
    }

    /// A FUP resolved but its source event still needs the follow-up TIP
    /// variant; consume timing packets until it arrives
    pub(crate) fn walk_fup_tip(&mut self) -> StepResult {
        if self.tx_flags.contains(SampleFlag::ABORT_TX) {
            self.tx_flags = SampleFlag::EMPTY;
            self.state.flags.remove(SampleFlag::IN_TX);
            self.state.flags |= SampleFlag::ABORT_TX;
        } else {
            self.state.flags |= SampleFlag::ASYNC;
        }

        loop {
            self.next_packet()?;

            match self.packet.kind {
                PacketKind::Tnt
                | PacketKind::Fup
                | PacketKind::TraceStop
                | PacketKind::Psb
                | PacketKind::Tsc
                | PacketKind::Tma
                | PacketKind::Cbr
                | PacketKind::ModeTsx
                | PacketKind::Psbend => {
                    log::error!("Missing TIP after FUP");
                    self.pkt_state = PktState::ErrResync;
                    return Err(Fault::Mismatch);
                }

                PacketKind::Ovf => return Err(self.on_overflow()),

                PacketKind::TipPgd => {
                    self.state.from_ip = self.ip;
                    self.state.to_ip = 0;
                    if self.packet.count != 0 {
                        self.set_ip();
                        log::debug!("Omitting PGD ip {:#x}", self.ip);
                    }
                    self.pge = false;
                    self.continuous_period = false;
                    return Ok(());
                }

                PacketKind::TipPge => {
                    self.pge = true;
                    log::debug!("Omitting PGE ip {:#x}", self.ip);
                    self.state.from_ip = 0;
                    if self.packet.count == 0 {
                        self.state.to_ip = 0;
                    } else {
                        self.set_ip();
                        self.state.to_ip = self.ip;
                    }
                    return Ok(());
                }

                PacketKind::Tip => {
                    self.state.from_ip = self.ip;
                    if self.packet.count == 0 {
                        self.state.to_ip = 0;
                    } else {
                        self.set_ip();
                        self.state.to_ip = self.ip;
                    }
                    return Ok(());
                }

                PacketKind::Pip => self.cr3 = self.packet.payload & (BIT63 - 1),

                PacketKind::Mtc => {
                    self.calc_mtc_timestamp();
                    if self.period_type == PeriodType::Mtc {
                        self.state.kind |= SampleType::INSTRUCTION;
                    }
                }

                PacketKind::Cyc => self.calc_cyc_timestamp(),

                PacketKind::ModeExec => self.exec_mode = self.packet.payload,

                PacketKind::Vmcs | PacketKind::Mnt | PacketKind::Pad => {}

                _ => return Err(self.bug()),
            }
        }
    }

    /// Main dispatcher while in sync
    pub(crate) fn walk_trace(&mut self) -> StepResult {
        let mut no_tip = false;

        loop {
            self.next_packet()?;

            let mut redispatch = true;
            while redispatch {
                redispatch = false;

                match self.packet.kind {
                    PacketKind::Tnt => {
                        if self.packet.count != 0 {
                            self.tnt = self.packet;
                            self.pkt_state = PktState::Tnt;
                            match self.walk_tnt() {
                                Err(Fault::Again) => {}
                                other => return other,
                            }
                        }
                    }

                    PacketKind::TipPgd => {
                        if self.packet.count != 0 {
                            self.set_last_ip();
                        }
                        self.pkt_state = PktState::TipPgd;
                        return self.walk_tip();
                    }

                    PacketKind::TipPge => {
                        self.pge = true;
                        if self.packet.count == 0 {
                            log::debug!("{:#x}: Skipping zero TIP.PGE", self.pos);
                        } else {
                            self.set_ip();
                            self.state.from_ip = 0;
                            self.state.to_ip = self.ip;
                            return Ok(());
                        }
                    }

                    PacketKind::Ovf => return Err(self.on_overflow()),

                    PacketKind::Tip => {
                        if self.packet.count != 0 {
                            self.set_last_ip();
                        }
                        self.pkt_state = PktState::Tip;
                        return self.walk_tip();
                    }

                    PacketKind::Fup => {
                        if self.packet.count == 0 {
                            log::debug!("{:#x}: Skipping zero FUP", self.pos);
                            no_tip = false;
                        } else {
                            self.set_last_ip();
                            match self.walk_fup() {
                                Err(Fault::Again) => {
                                    if no_tip {
                                        no_tip = false;
                                    } else {
                                        return self.walk_fup_tip();
                                    }
                                }
                                Err(fault) => return Err(fault),
                                Ok(()) => {
                                    self.pkt_state = if no_tip {
                                        PktState::FupNoTip
                                    } else {
                                        PktState::Fup
                                    };
                                    return Ok(());
                                }
                            }
                        }
                    }

                    PacketKind::TraceStop => {
                        self.pge = false;
                        self.continuous_period = false;
                        self.clear_tx_flags();
                        self.timing.have_tma = false;
                    }

                    PacketKind::Psb => {
                        self.last_ip = 0;
                        self.have_last_ip = true;
                        self.timing.have_tma = false;
                        self.stack.clear();
                        match self.walk_psbend() {
                            Err(Fault::Again) => redispatch = true,
                            Err(fault) => return Err(fault),
                            Ok(()) => {}
                        }
                    }

                    PacketKind::Pip => self.cr3 = self.packet.payload & (BIT63 - 1),

                    PacketKind::Mtc => {
                        self.calc_mtc_timestamp();
                        if self.period_type == PeriodType::Mtc && self.mtc_insn {
                            // Only sample when an instruction has executed
                            // since the last MTC
                            self.mtc_insn = false;
                            if self.timing.timestamp != 0 {
                                self.state.kind = SampleType::INSTRUCTION;
                                self.state.from_ip = self.ip;
                                self.state.to_ip = 0;
                                self.mtc_insn = false;
                                return Ok(());
                            }
                        }
                    }

                    PacketKind::Tsc => self.calc_tsc_timestamp(),
                    PacketKind::Tma => self.calc_tma(),
                    PacketKind::Cyc => self.calc_cyc_timestamp(),
                    PacketKind::Cbr => self.calc_cbr(),

                    PacketKind::ModeExec => self.exec_mode = self.packet.payload,

                    PacketKind::ModeTsx => {
                        // MODE.TSX need not be followed by FUP
                        if self.pge {
                            self.mode_tsx(&mut no_tip)?;
                            redispatch = true;
                        } else {
                            self.update_in_tx();
                        }
                    }

                    PacketKind::Psbend
                    | PacketKind::Vmcs
                    | PacketKind::Mnt
                    | PacketKind::Pad => {}

                    _ => return Err(self.bug()),
                }
            }
        }
    }

    /// Walk PSB+ packets to get in sync
    fn walk_psb(&mut self) -> StepResult {
        loop {
            self.next_packet()?;

            match self.packet.kind {
                PacketKind::TipPgd => {
                    self.continuous_period = false;
                    log::error!("Unexpected packet");
                    return Err(Fault::Mismatch);
                }

                PacketKind::TipPge | PacketKind::Tip => {
                    log::error!("Unexpected packet");
                    return Err(Fault::Mismatch);
                }

                PacketKind::Fup => {
                    self.pge = true;
                    if self.have_ip() {
                        let current_ip = self.ip;
                        self.set_ip();
                        if current_ip != 0 {
                            log::debug!("Setting IP {:#x}", self.ip);
                        }
                    }
                }

                PacketKind::Mtc => self.calc_mtc_timestamp(),
                PacketKind::Tsc => self.calc_tsc_timestamp(),
                PacketKind::Tma => self.calc_tma(),
                PacketKind::Cyc => self.calc_cyc_timestamp(),
                PacketKind::Cbr => self.calc_cbr(),

                PacketKind::Pip => self.cr3 = self.packet.payload & (BIT63 - 1),

                PacketKind::ModeExec => self.exec_mode = self.packet.payload,
                PacketKind::ModeTsx => self.update_in_tx(),

                PacketKind::TraceStop | PacketKind::Tnt => {
                    if self.packet.kind == PacketKind::TraceStop {
                        self.pge = false;
                        self.continuous_period = false;
                        self.clear_tx_flags();
                    }
                    self.timing.have_tma = false;
                    log::error!("Unexpected packet");
                    self.pkt_state = if self.ip != 0 {
                        PktState::InSync
                    } else {
                        PktState::ErrResync
                    };
                    return Err(Fault::Mismatch);
                }

                PacketKind::Ovf => return Err(self.on_overflow()),

                PacketKind::Psbend => return Ok(()),

                _ => {}
            }
        }
    }

    /// Search forward for any packet carrying a full IP
    fn walk_to_ip(&mut self) -> StepResult {
        loop {
            self.next_packet()?;

            match self.packet.kind {
                PacketKind::TipPgd | PacketKind::TipPge | PacketKind::Tip => {
                    if self.packet.kind == PacketKind::TipPgd {
                        self.continuous_period = false;
                    }
                    self.pge = self.packet.kind != PacketKind::TipPgd;
                    if self.have_ip() {
                        self.set_ip();
                    }
                    if self.ip != 0 {
                        return Ok(());
                    }
                }

                PacketKind::Fup => {
                    if self.have_ip() {
                        self.set_ip();
                    }
                    if self.ip != 0 {
                        return Ok(());
                    }
                }

                PacketKind::Mtc => self.calc_mtc_timestamp(),
                PacketKind::Tsc => self.calc_tsc_timestamp(),
                PacketKind::Tma => self.calc_tma(),
                PacketKind::Cyc => self.calc_cyc_timestamp(),
                PacketKind::Cbr => self.calc_cbr(),

                PacketKind::Pip => self.cr3 = self.packet.payload & (BIT63 - 1),

                PacketKind::ModeExec => self.exec_mode = self.packet.payload,
                PacketKind::ModeTsx => self.update_in_tx(),

                PacketKind::Ovf => return Err(self.on_overflow()),

                PacketKind::TraceStop => {
                    self.pge = false;
                    self.continuous_period = false;
                    self.clear_tx_flags();
                    self.timing.have_tma = false;
                }

                PacketKind::Psb => {
                    self.last_ip = 0;
                    self.have_last_ip = true;
                    self.timing.have_tma = false;
                    self.stack.clear();
                    self.walk_psb()?;
                    if self.ip != 0 {
                        // Do not have a sample
                        self.state.kind = SampleType::NONE;
                        return Ok(());
                    }
                }

                _ => {}
            }
        }
    }

    /// Scan for a full IP and publish the "decoder is at this IP now" record
    pub(crate) fn sync_ip(&mut self) -> StepResult {
        self.set_fup_tx_flags = false;

        log::debug!("Scanning for full IP");
        self.walk_to_ip()?;

        self.pkt_state = PktState::InSync;
        if self.overflow {
            log::debug!("Recovered from overflow");
        }
        self.overflow = false;

        self.state.from_ip = 0;
        self.state.to_ip = self.ip;
        log::debug!("Setting IP {:#x}", self.ip);

        Ok(())
    }

    /// Find the next PSB and process its PSB+ header to establish context
    pub(crate) fn sync(&mut self) -> StepResult {
        self.pge = false;
        self.continuous_period = false;
        self.have_last_ip = false;
        self.last_ip = 0;
        self.ip = 0;
        self.timing.have_tma = false;
        self.stack.clear();

        self.scan_for_psb()?;

        self.have_last_ip = true;
        self.pkt_state = PktState::NoIp;

        self.walk_psb()?;

        if self.ip != 0 {
            // Do not have a sample
            self.state.kind = SampleType::NONE;
            self.pkt_state = PktState::InSync;
            Ok(())
        } else {
            self.sync_ip()
        }
    }
}
