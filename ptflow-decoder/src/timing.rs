//! Timestamp reconstruction
//!
//! Five packet kinds carry time: TSC (a full 7-byte timestamp), MTC (an 8-bit
//! slice of the crystal clock counter), TMA (the TSC/CTC alignment emitted
//! right after a TSC), CBR (core-to-bus ratio, i.e. current frequency) and
//! CYC (elapsed core cycles). This module fuses them into one non-decreasing
//! `timestamp`, plus a cycle-accurate estimate between explicit timestamps
//! once a cycle-to-TSC rate is known.
//!
//! The cycle rate comes from two places: the CBR-based nominal rate, and an
//! opportunistic calibration that looks ahead from a CYC-adjacent TSC/MTC
//! anchor to the next one and divides elapsed TSC by elapsed cycles.

use ptflow_packet::{Packet, PacketKind, error::PacketError};

use crate::{Decoder, DecoderConfig, ProvideTrace, WalkInsn};

/// A TSC packet can slip past MTC packets so that the timestamp appears to go
/// backwards. One estimate is that can be up to about 40 CPU cycles, which is
/// certainly less than 0x1000 TSC ticks, but accept slippage an order of
/// magnitude more to be on the safe side.
const TSC_SLIP: u32 = 0x10000;

/// Timestamp-reconstruction state
pub(crate) struct Timing {
    /// Current reconstructed timestamp
    pub(crate) timestamp: u64,
    /// Timestamp at the last TSC packet
    pub(crate) tsc_timestamp: u64,
    /// Provider-supplied seed, consumed by the first TSC after a
    /// discontinuity
    pub(crate) ref_timestamp: u64,
    /// Timestamp corresponding to CTC value zero of the current TMA epoch
    pub(crate) ctc_timestamp: u64,
    /// CTC ticks accumulated from MTC packets since the last TMA
    pub(crate) ctc_delta: u64,
    /// Core cycles accumulated from CYC packets since the last anchor
    pub(crate) cycle_cnt: u64,
    /// Timestamp the running cycle count is measured from
    pub(crate) cyc_ref_timestamp: u64,
    /// Last seen 8-bit MTC value
    pub(crate) last_mtc: u32,
    pub(crate) tsc_ctc_ratio_n: u32,
    pub(crate) tsc_ctc_ratio_d: u32,
    /// Shortcut multiplier, nonzero iff the ratio divides evenly
    pub(crate) tsc_ctc_mult: u32,
    pub(crate) tsc_slip: u32,
    /// Mask of CTC bits below the MTC slice
    pub(crate) ctc_rem_mask: u32,
    pub(crate) mtc_shift: u32,
    /// Last seen core-to-bus ratio, 0 when unknown
    pub(crate) cbr: u32,
    pub(crate) max_non_turbo_ratio: u32,
    pub(crate) max_non_turbo_ratio_fp: f64,
    /// Nominal TSC ticks per cycle at the current CBR
    pub(crate) cbr_cyc_to_tsc: f64,
    /// Calibrated TSC ticks per cycle
    pub(crate) calc_cyc_to_tsc: f64,
    pub(crate) have_calc_cyc_to_tsc: bool,
    pub(crate) have_tma: bool,
    pub(crate) have_cyc: bool,
    /// The TMA-derived `last_mtc` is missing high bits when `mtc_shift > 8`;
    /// backfill it from the next MTC
    pub(crate) fixup_last_mtc: bool,
    /// Instructions walked since the last explicit timestamp
    pub(crate) timestamp_insn_cnt: u64,
}

impl Timing {
    pub(crate) fn new(config: &DecoderConfig) -> Self {
        let tsc_ctc_ratio_n = config.tsc_ctc_ratio_n;
        let tsc_ctc_ratio_d = if tsc_ctc_ratio_n == 0 {
            0
        } else {
            config.tsc_ctc_ratio_d
        };
        let tsc_ctc_mult = if tsc_ctc_ratio_d != 0 && tsc_ctc_ratio_n % tsc_ctc_ratio_d == 0 {
            tsc_ctc_ratio_n / tsc_ctc_ratio_d
        } else {
            0
        };
        let mtc_shift = config.mtc_period;

        Self {
            timestamp: 0,
            tsc_timestamp: 0,
            ref_timestamp: 0,
            ctc_timestamp: 0,
            ctc_delta: 0,
            cycle_cnt: 0,
            cyc_ref_timestamp: 0,
            last_mtc: 0,
            tsc_ctc_ratio_n,
            tsc_ctc_ratio_d,
            tsc_ctc_mult,
            tsc_slip: TSC_SLIP,
            ctc_rem_mask: 1u32.wrapping_shl(mtc_shift).wrapping_sub(1),
            mtc_shift,
            cbr: 0,
            max_non_turbo_ratio: config.max_non_turbo_ratio,
            max_non_turbo_ratio_fp: f64::from(config.max_non_turbo_ratio),
            cbr_cyc_to_tsc: 0.0,
            calc_cyc_to_tsc: 0.0,
            have_calc_cyc_to_tsc: false,
            have_tma: false,
            have_cyc: false,
            fixup_last_mtc: false,
            timestamp_insn_cnt: 0,
        }
    }
}

/// `(t / d) * n + ((t % d) * n) / d`: scale `t` by `n/d` without overflowing
/// the intermediate product on 64-bit operands
pub(crate) fn multdiv(t: u64, n: u32, d: u32) -> u64 {
    if d == 0 {
        return 0;
    }
    let (n, d) = (u64::from(n), u64::from(d));
    (t / d) * n + ((t % d) * n) / d
}

/// MTC provides a 8-bit slice of CTC but the TMA packet only provides the
/// lower 16 bits of CTC. If `mtc_shift > 8` then some of the MTC bits are not
/// in the CTC provided by the TMA packet. Fix up the `last_mtc` calculated
/// from the TMA packet by copying the missing bits from the current MTC
/// assuming the least difference between the two, and that the current MTC
/// comes after `last_mtc`.
fn fixup_last_mtc(mtc: u32, mtc_shift: u32, last_mtc: &mut u32) {
    let first_missing_bit = 1u32 << (16 - mtc_shift);
    let mask = !(first_missing_bit - 1);

    *last_mtc |= mtc & mask;
    if *last_mtc >= mtc {
        *last_mtc = last_mtc.wrapping_sub(first_missing_bit) & 0xff;
    }
}

/// 8-bit MTC difference assuming at most one wrap
fn mtc_delta(mtc: u32, last_mtc: u32) -> u32 {
    if mtc > last_mtc {
        mtc - last_mtc
    } else {
        mtc + 256 - last_mtc
    }
}

/// Working copy of the timing fields for the calibration lookahead, advanced
/// over packets that are not consumed
struct CycCalib {
    cycle_cnt: u64,
    cbr: u32,
    last_mtc: u32,
    ctc_timestamp: u64,
    ctc_delta: u64,
    tsc_timestamp: u64,
    timestamp: u64,
    have_tma: bool,
    fixup_last_mtc: bool,
    from_mtc: bool,
    cbr_cyc_to_tsc: f64,
}

/// Lookahead verdict for one packet
enum Step {
    Continue,
    Stop,
    /// A second CYC-adjacent anchor with this timestamp: calibrate
    Anchor(u64),
}

impl<'a, P, W> Decoder<'a, P, W>
where
    P: ProvideTrace<'a>,
    W: WalkInsn,
{
    /// TSC: stitch the 7-byte payload under the top byte of the running
    /// anchor, suppress slip-sized backward motion, treat larger backward
    /// motion as a 56-bit wrap
    pub(crate) fn calc_tsc_timestamp(&mut self) {
        let payload = self.packet.payload;
        let t = &mut self.timing;

        t.have_tma = false;

        if t.ref_timestamp != 0 {
            let mut timestamp = payload | (t.ref_timestamp & (0xff << 56));
            if timestamp < t.ref_timestamp {
                if t.ref_timestamp - timestamp > (1 << 55) {
                    timestamp += 1 << 56;
                }
            } else if timestamp - t.ref_timestamp > (1 << 55) {
                timestamp -= 1 << 56;
            }
            t.tsc_timestamp = timestamp;
            t.timestamp = timestamp;
            t.ref_timestamp = 0;
            t.timestamp_insn_cnt = 0;
        } else if t.timestamp != 0 {
            let mut timestamp = payload | (t.timestamp & (0xff << 56));
            t.tsc_timestamp = timestamp;
            if timestamp < t.timestamp && t.timestamp - timestamp < u64::from(t.tsc_slip) {
                log::debug!("Suppressing backwards timestamp {timestamp:#x}");
                timestamp = t.timestamp;
            }
            if timestamp < t.timestamp {
                log::debug!("Wraparound timestamp {timestamp:#x}");
                timestamp += 1 << 56;
                t.tsc_timestamp = timestamp;
            }
            t.timestamp = timestamp;
            t.timestamp_insn_cnt = 0;
        }

        if self.last_packet_type == Some(PacketKind::Cyc) {
            self.timing.cyc_ref_timestamp = self.timing.timestamp;
            self.timing.cycle_cnt = 0;
            self.timing.have_calc_cyc_to_tsc = false;
            self.calibrate_cyc_to_tsc(false);
        }

        log::debug!("Setting timestamp {:#x}", self.timing.timestamp);
    }

    /// TMA: anchor the CTC epoch against the TSC timestamp
    pub(crate) fn calc_tma(&mut self) {
        let ctc = self.packet.payload as u32;
        let fc = u32::from(self.packet.count);
        let t = &mut self.timing;

        if t.tsc_ctc_ratio_d == 0 {
            return;
        }

        let ctc_rem = ctc & t.ctc_rem_mask;
        t.last_mtc = (ctc >> t.mtc_shift) & 0xff;
        t.ctc_timestamp = t.tsc_timestamp.wrapping_sub(u64::from(fc));
        if t.tsc_ctc_mult != 0 {
            t.ctc_timestamp = t
                .ctc_timestamp
                .wrapping_sub(u64::from(ctc_rem) * u64::from(t.tsc_ctc_mult));
        } else {
            t.ctc_timestamp = t.ctc_timestamp.wrapping_sub(multdiv(
                u64::from(ctc_rem),
                t.tsc_ctc_ratio_n,
                t.tsc_ctc_ratio_d,
            ));
        }
        t.ctc_delta = 0;
        t.have_tma = true;
        t.fixup_last_mtc = true;
        log::debug!(
            "CTC timestamp {:#x} last MTC {:#x} CTC rem {:#x}",
            t.ctc_timestamp,
            t.last_mtc,
            ctc_rem
        );
    }

    /// MTC: advance the CTC epoch by the 8-bit slice difference
    pub(crate) fn calc_mtc_timestamp(&mut self) {
        let mtc = self.packet.payload as u32;
        let t = &mut self.timing;

        if !t.have_tma {
            return;
        }

        if t.mtc_shift > 8 && t.fixup_last_mtc {
            t.fixup_last_mtc = false;
            fixup_last_mtc(mtc, t.mtc_shift, &mut t.last_mtc);
        }

        t.ctc_delta += u64::from(mtc_delta(mtc, t.last_mtc)) << t.mtc_shift;

        let timestamp = if t.tsc_ctc_mult != 0 {
            t.ctc_timestamp + t.ctc_delta * u64::from(t.tsc_ctc_mult)
        } else {
            t.ctc_timestamp + multdiv(t.ctc_delta, t.tsc_ctc_ratio_n, t.tsc_ctc_ratio_d)
        };

        if timestamp < t.timestamp {
            log::debug!(
                "Suppressing MTC timestamp {timestamp:#x} less than current timestamp {:#x}",
                t.timestamp
            );
        } else {
            t.timestamp = timestamp;
        }

        t.timestamp_insn_cnt = 0;
        t.last_mtc = mtc;

        if self.last_packet_type == Some(PacketKind::Cyc) {
            self.timing.cyc_ref_timestamp = self.timing.timestamp;
            self.timing.cycle_cnt = 0;
            self.timing.have_calc_cyc_to_tsc = false;
            self.calibrate_cyc_to_tsc(true);
        }
    }

    /// CBR: refresh the nominal cycle-to-TSC rate
    pub(crate) fn calc_cbr(&mut self) {
        let cbr = self.packet.payload as u32;
        let t = &mut self.timing;

        if t.cbr == cbr {
            return;
        }
        t.cbr = cbr;
        t.cbr_cyc_to_tsc = t.max_non_turbo_ratio_fp / f64::from(cbr);
    }

    /// CYC: accumulate cycles and extrapolate from the cycle reference when a
    /// rate is known
    pub(crate) fn calc_cyc_timestamp(&mut self) {
        let t = &mut self.timing;
        let reference = t.cyc_ref_timestamp;

        t.have_cyc = true;
        t.cycle_cnt += self.packet.payload;

        if reference == 0 {
            return;
        }

        let timestamp = if t.have_calc_cyc_to_tsc {
            (reference as f64 + t.cycle_cnt as f64 * t.calc_cyc_to_tsc) as u64
        } else if t.cbr != 0 {
            (reference as f64 + t.cycle_cnt as f64 * t.cbr_cyc_to_tsc) as u64
        } else {
            return;
        };

        if timestamp < t.timestamp {
            log::debug!(
                "Suppressing CYC timestamp {timestamp:#x} less than current timestamp {:#x}",
                t.timestamp
            );
        } else {
            t.timestamp = timestamp;
        }

        t.timestamp_insn_cnt = 0;
    }

    /// The previous packet was a CYC, so the timestamp just set is a
    /// cycle-accurate anchor: look ahead for a second anchor and calibrate
    /// the observed cycle-to-TSC rate from the span between them
    fn calibrate_cyc_to_tsc(&mut self, from_mtc: bool) {
        if let Some(cyc_to_tsc) = self.cyc_to_tsc_lookahead(from_mtc) {
            self.timing.calc_cyc_to_tsc = cyc_to_tsc;
            self.timing.have_calc_cyc_to_tsc = true;
        }
    }

    /// Walk packets ahead in the current window, without consuming them,
    /// until a second CYC-adjacent TSC or MTC anchor is found or the attempt
    /// must be abandoned (trace stop, overflow, frequency change, backward
    /// time, or end of window)
    #[expect(clippy::too_many_lines)]
    fn cyc_to_tsc_lookahead(&self, from_mtc: bool) -> Option<f64> {
        let t = &self.timing;
        let mut data = CycCalib {
            cycle_cnt: 0,
            cbr: 0,
            last_mtc: t.last_mtc,
            ctc_timestamp: t.ctc_timestamp,
            ctc_delta: t.ctc_delta,
            tsc_timestamp: t.tsc_timestamp,
            timestamp: t.timestamp,
            have_tma: t.have_tma,
            fixup_last_mtc: t.fixup_last_mtc,
            from_mtc,
            cbr_cyc_to_tsc: 0.0,
        };

        let window = self.window();
        let mut cursor = 0usize;
        let mut step = self.pkt_step;
        let mut pos = self.pos;
        let mut last_packet_type = self.last_packet_type;

        loop {
            // Next non-PAD packet in the window
            let packet = loop {
                cursor += step;
                pos += step as u64;
                if cursor >= window.len() {
                    return None;
                }
                match Packet::parse(&window[cursor..]) {
                    Ok(packet) => {
                        step = packet.size as usize;
                        if packet.kind != PacketKind::Pad {
                            break packet;
                        }
                    }
                    Err(PacketError::NeedMoreBytes | PacketError::Invalid) => return None,
                    Err(_) => return None,
                }
            };

            let verdict = match packet.kind {
                PacketKind::Tnt
                | PacketKind::TipPge
                | PacketKind::Tip
                | PacketKind::Fup
                | PacketKind::Psb
                | PacketKind::Pip
                | PacketKind::ModeExec
                | PacketKind::ModeTsx
                | PacketKind::Psbend
                | PacketKind::Pad
                | PacketKind::Vmcs
                | PacketKind::Mnt => Step::Continue,

                PacketKind::Mtc => {
                    if data.have_tma {
                        let mtc = packet.payload as u32;
                        if t.mtc_shift > 8 && data.fixup_last_mtc {
                            data.fixup_last_mtc = false;
                            fixup_last_mtc(mtc, t.mtc_shift, &mut data.last_mtc);
                        }
                        data.ctc_delta += u64::from(mtc_delta(mtc, data.last_mtc)) << t.mtc_shift;
                        data.last_mtc = mtc;

                        let timestamp = if t.tsc_ctc_mult != 0 {
                            data.ctc_timestamp + data.ctc_delta * u64::from(t.tsc_ctc_mult)
                        } else {
                            data.ctc_timestamp
                                + multdiv(data.ctc_delta, t.tsc_ctc_ratio_n, t.tsc_ctc_ratio_d)
                        };

                        if timestamp < data.timestamp {
                            Step::Stop
                        } else if last_packet_type == Some(PacketKind::Cyc) {
                            Step::Anchor(timestamp)
                        } else {
                            data.timestamp = timestamp;
                            Step::Continue
                        }
                    } else {
                        Step::Continue
                    }
                }

                PacketKind::Tsc => {
                    let mut timestamp = packet.payload | (data.timestamp & (0xff << 56));
                    if data.from_mtc
                        && timestamp < data.timestamp
                        && data.timestamp - timestamp < u64::from(t.tsc_slip)
                    {
                        Step::Stop
                    } else {
                        if timestamp < data.timestamp {
                            timestamp += 1 << 56;
                        }
                        if last_packet_type == Some(PacketKind::Cyc) {
                            Step::Anchor(timestamp)
                        } else if data.from_mtc {
                            Step::Stop
                        } else {
                            data.tsc_timestamp = timestamp;
                            data.timestamp = timestamp;
                            Step::Continue
                        }
                    }
                }

                PacketKind::Tma => {
                    if data.from_mtc {
                        Step::Stop
                    } else if t.tsc_ctc_ratio_d == 0 {
                        Step::Continue
                    } else {
                        let ctc = packet.payload as u32;
                        let fc = u32::from(packet.count);
                        let ctc_rem = ctc & t.ctc_rem_mask;

                        data.last_mtc = (ctc >> t.mtc_shift) & 0xff;
                        data.ctc_timestamp = data.tsc_timestamp.wrapping_sub(u64::from(fc));
                        if t.tsc_ctc_mult != 0 {
                            data.ctc_timestamp = data
                                .ctc_timestamp
                                .wrapping_sub(u64::from(ctc_rem) * u64::from(t.tsc_ctc_mult));
                        } else {
                            data.ctc_timestamp = data.ctc_timestamp.wrapping_sub(multdiv(
                                u64::from(ctc_rem),
                                t.tsc_ctc_ratio_n,
                                t.tsc_ctc_ratio_d,
                            ));
                        }
                        data.ctc_delta = 0;
                        data.have_tma = true;
                        data.fixup_last_mtc = true;
                        Step::Continue
                    }
                }

                PacketKind::Cyc => {
                    data.cycle_cnt += packet.payload;
                    Step::Continue
                }

                PacketKind::Cbr => {
                    let cbr = packet.payload as u32;
                    if data.cbr != 0 && data.cbr != cbr {
                        Step::Stop
                    } else {
                        data.cbr = cbr;
                        data.cbr_cyc_to_tsc = t.max_non_turbo_ratio_fp / f64::from(cbr);
                        Step::Continue
                    }
                }

                // TIP.PGD, TRACESTOP, OVF and anything unrecognized abandon
                // the attempt
                _ => Step::Stop,
            };

            match verdict {
                Step::Continue => last_packet_type = Some(packet.kind),
                Step::Stop => return None,
                Step::Anchor(timestamp) => {
                    if data.cbr == 0 && t.cbr != 0 {
                        data.cbr = t.cbr;
                        data.cbr_cyc_to_tsc = t.cbr_cyc_to_tsc;
                    }
                    if data.cycle_cnt == 0 {
                        return None;
                    }

                    let cyc_to_tsc =
                        timestamp.wrapping_sub(t.timestamp) as f64 / data.cycle_cnt as f64;

                    if data.cbr != 0
                        && cyc_to_tsc > data.cbr_cyc_to_tsc
                        && cyc_to_tsc / data.cbr_cyc_to_tsc > 1.25
                    {
                        log::debug!(
                            "Timestamp: calculated {cyc_to_tsc} TSC ticks per cycle too big \
                             (c.f. CBR-based value {}), pos {pos:#x}",
                            data.cbr_cyc_to_tsc
                        );
                        return None;
                    }

                    if data.cbr != 0 {
                        log::debug!(
                            "Timestamp: calculated {cyc_to_tsc} TSC ticks per cycle \
                             c.f. CBR-based value {}, pos {pos:#x}",
                            data.cbr_cyc_to_tsc
                        );
                    } else {
                        log::debug!(
                            "Timestamp: calculated {cyc_to_tsc} TSC ticks per cycle \
                             c.f. unknown CBR-based value, pos {pos:#x}"
                        );
                    }
                    return Some(cyc_to_tsc);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multdiv_matches_plain_division_on_small_operands() {
        assert_eq!(multdiv(1000, 3, 2), 1500);
        assert_eq!(multdiv(7, 10, 3), 23);
        assert_eq!(multdiv(123, 0, 7), 0);
        assert_eq!(multdiv(123, 7, 0), 0);
    }

    #[test]
    fn multdiv_does_not_overflow_large_operands() {
        // (t / d) * n dominates; the naive t * n would overflow
        let t = u64::MAX / 2;
        assert_eq!(multdiv(t, 2, 2), t);
        assert_eq!(multdiv(t, 4, 2), t * 2 + 1);
    }

    #[test]
    fn mtc_delta_wraps_at_256() {
        assert_eq!(mtc_delta(0x02, 0xfe), 4);
        assert_eq!(mtc_delta(0x10, 0x08), 8);
        assert_eq!(mtc_delta(0x08, 0x08), 256);
    }

    #[test]
    fn fixup_backfills_closest_preceding_mtc() {
        // mtc_shift 9: TMA supplied bits [15:9] truncated to 7 bits
        let mut last_mtc = 0x05;
        fixup_last_mtc(0x86, 9, &mut last_mtc);
        assert_eq!(last_mtc, 0x85);

        // Backfilled value would be ahead of the new MTC: step one missing
        // bit back
        let mut last_mtc = 0x7f;
        fixup_last_mtc(0x81, 9, &mut last_mtc);
        assert_eq!(last_mtc, 0x7f);
    }
}
