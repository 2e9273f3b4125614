//! Shared helpers for decoder integration tests: a packet-stream builder and
//! an instruction walker scripted from a synthetic program map.

use std::collections::BTreeMap;

use ptflow_decoder::{InsnBranch, InsnOp, PtInsn, TraceError, TraceState, WalkError, WalkInsn};

/// Byte-stream builder for synthesized packet sequences
#[derive(Default, Clone)]
pub struct Stream {
    bytes: Vec<u8>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn psb(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x02, 0x82].repeat(8));
        self
    }

    pub fn psbend(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x02, 0x23]);
        self
    }

    pub fn pad(mut self) -> Self {
        self.bytes.push(0x00);
        self
    }

    pub fn tsc(mut self, value: u64) -> Self {
        self.bytes.push(0x19);
        self.bytes.extend_from_slice(&value.to_le_bytes()[..7]);
        self
    }

    pub fn mtc(mut self, ctc: u8) -> Self {
        self.bytes.extend_from_slice(&[0x59, ctc]);
        self
    }

    pub fn tma(mut self, ctc: u16, fc: u16) -> Self {
        self.bytes.extend_from_slice(&[
            0x02,
            0x73,
            ctc as u8,
            (ctc >> 8) as u8,
            0,
            fc as u8,
            ((fc >> 8) & 1) as u8,
        ]);
        self
    }

    pub fn cbr(mut self, ratio: u8) -> Self {
        self.bytes.extend_from_slice(&[0x02, 0x03, ratio, 0]);
        self
    }

    /// CYC packet; `cycles` must fit the 5-bit short form plus continuations
    pub fn cyc(mut self, mut cycles: u64) -> Self {
        let mut byte = ((cycles & 0x1f) << 3) as u8 | 0b011;
        cycles >>= 5;
        if cycles != 0 {
            byte |= 0b100;
        }
        self.bytes.push(byte);
        while cycles != 0 {
            let mut byte = ((cycles & 0x7f) << 1) as u8;
            cycles >>= 7;
            if cycles != 0 {
                byte |= 1;
            }
            self.bytes.push(byte);
        }
        self
    }

    pub fn ovf(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x02, 0xf3]);
        self
    }

    pub fn trace_stop(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x02, 0x83]);
        self
    }

    pub fn pip(mut self, cr3: u64) -> Self {
        self.bytes.extend_from_slice(&[0x02, 0x43]);
        self.bytes.extend_from_slice(&(cr3 << 1).to_le_bytes()[..6]);
        self
    }

    pub fn mode_exec_64(mut self) -> Self {
        self.bytes.extend_from_slice(&[0x99, 0b0000_0001]);
        self
    }

    pub fn mode_tsx(mut self, in_tx: bool, abort: bool) -> Self {
        let mode = (u8::from(abort) << 1) | u8::from(in_tx);
        self.bytes.extend_from_slice(&[0x99, 0b0010_0000 | mode]);
        self
    }

    fn ip_packet(mut self, header: u8, ip: u64) -> Self {
        // Full 6-byte IP form (header IPBytes 0b011)
        self.bytes.push(0b0110_0000 | header);
        self.bytes.extend_from_slice(&ip.to_le_bytes()[..6]);
        self
    }

    pub fn tip(self, ip: u64) -> Self {
        self.ip_packet(0b01101, ip)
    }

    pub fn tip_pge(self, ip: u64) -> Self {
        self.ip_packet(0b10001, ip)
    }

    pub fn tip_pgd(self, ip: u64) -> Self {
        self.ip_packet(0b00001, ip)
    }

    pub fn fup(self, ip: u64) -> Self {
        self.ip_packet(0b11101, ip)
    }

    /// Short TNT packet from outcomes in execution order (up to 6)
    pub fn tnt(mut self, outcomes: &[bool]) -> Self {
        assert!(!outcomes.is_empty() && outcomes.len() <= 6);
        let k = outcomes.len();
        let mut byte = 1u8 << (k + 1);
        for (i, taken) in outcomes.iter().enumerate() {
            byte |= u8::from(*taken) << (k - i);
        }
        self.bytes.push(byte);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }
}

/// Instruction walker scripted from a map of IP to instruction
#[derive(Default, Clone)]
pub struct MapWalker {
    insns: BTreeMap<u64, PtInsn>,
    outside_filter: Vec<std::ops::Range<u64>>,
}

impl MapWalker {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, ip: u64, op: InsnOp, branch: InsnBranch, length: u8, rel: i32) {
        self.insns.insert(
            ip,
            PtInsn {
                op,
                branch,
                length,
                rel,
            },
        );
    }

    pub fn nop(&mut self, ip: u64, length: u8) -> &mut Self {
        self.insert(ip, InsnOp::Other, InsnBranch::NoBranch, length, 0);
        self
    }

    pub fn cond(&mut self, ip: u64, length: u8, rel: i32) -> &mut Self {
        self.insert(ip, InsnOp::Jcc, InsnBranch::Conditional, length, rel);
        self
    }

    pub fn jmp(&mut self, ip: u64, length: u8, rel: i32) -> &mut Self {
        self.insert(ip, InsnOp::Jmp, InsnBranch::Unconditional, length, rel);
        self
    }

    pub fn ind_jmp(&mut self, ip: u64, length: u8) -> &mut Self {
        self.insert(ip, InsnOp::Jmp, InsnBranch::Indirect, length, 0);
        self
    }

    pub fn call(&mut self, ip: u64, length: u8, rel: i32) -> &mut Self {
        self.insert(ip, InsnOp::Call, InsnBranch::Unconditional, length, rel);
        self
    }

    pub fn ret(&mut self, ip: u64) -> &mut Self {
        self.insert(ip, InsnOp::Ret, InsnBranch::Indirect, 1, 0);
        self
    }

    /// Mark an address range as outside the trace filter
    pub fn filter_out(&mut self, range: std::ops::Range<u64>) -> &mut Self {
        self.outside_filter.push(range);
        self
    }
}

impl WalkInsn for MapWalker {
    fn walk_insn(
        &mut self,
        insn: &mut PtInsn,
        insn_cnt: &mut u64,
        ip: &mut u64,
        to_ip: u64,
        max_insn_cnt: u64,
    ) -> Result<(), WalkError> {
        loop {
            if to_ip != 0 && *ip == to_ip {
                return Ok(());
            }
            let Some(cur) = self.insns.get(ip) else {
                return Err(WalkError::MissingText);
            };
            *insn = *cur;
            *insn_cnt += 1;
            if cur.branch != InsnBranch::NoBranch {
                return Ok(());
            }
            if max_insn_cnt != 0 && *insn_cnt >= max_insn_cnt {
                return Ok(());
            }
            *ip += u64::from(cur.length);
        }
    }

    fn is_outside_filter(&mut self, ip: u64) -> bool {
        self.outside_filter.iter().any(|range| range.contains(&ip))
    }
}

/// Decode until the provider runs dry, collecting every record before the
/// terminal NoData
pub fn decode_all<'a, P>(
    decoder: &mut ptflow_decoder::Decoder<'a, P, MapWalker>,
) -> Vec<TraceState>
where
    P: ptflow_decoder::ProvideTrace<'a>,
{
    let mut records = Vec::new();
    loop {
        let state = *decoder.decode();
        if state.err == Some(TraceError::NoData) {
            return records;
        }
        records.push(state);
        assert!(records.len() < 25_000, "runaway decode");
    }
}

/// Branch records must carry non-decreasing timestamps
pub fn assert_monotonic_timestamps(records: &[TraceState]) {
    let mut last = 0;
    for record in records {
        if record.err.is_none() {
            assert!(
                record.timestamp >= last,
                "timestamp went backwards: {:#x} after {last:#x}",
                record.timestamp
            );
            last = record.timestamp;
        }
    }
}
