mod common;

use common::{MapWalker, Stream, assert_monotonic_timestamps, decode_all};
use ptflow_decoder::{
    Decoder, DecoderConfig, PeriodType, SampleFlag, SampleType, SliceTrace, TraceChunk, TraceError,
    TraceState, find_overlap,
};

/// A plausible TSC anchor with a zero top byte
const T1: u64 = 1 << 48;

fn record_key(record: &TraceState) -> (SampleType, u64, u64, SampleFlag, u64, Option<TraceError>) {
    (
        record.kind,
        record.from_ip,
        record.to_ip,
        record.flags,
        record.timestamp,
        record.err,
    )
}

#[test]
fn tip_pge_then_tnt_resolves_branches() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x40_0000)
        .tnt(&[true, false])
        .into_bytes();
    let mut walker = MapWalker::new();
    walker.cond(0x40_0000, 3, 0x0d).cond(0x40_0010, 3, 0x20);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 3);

    assert_eq!(records[0].kind, SampleType::BRANCH);
    assert_eq!(records[0].from_ip, 0);
    assert_eq!(records[0].to_ip, 0x40_0000);

    // Taken conditional branch
    assert_eq!(records[1].kind, SampleType::BRANCH);
    assert_eq!(records[1].from_ip, 0x40_0000);
    assert_eq!(records[1].to_ip, 0x40_0010);

    // Not-taken: the fall-through edge
    assert_eq!(records[2].kind, SampleType::BRANCH);
    assert_eq!(records[2].from_ip, 0x40_0010);
    assert_eq!(records[2].to_ip, 0x40_0013);

    assert_eq!(records[0].timestamp, T1);
    assert_monotonic_timestamps(&records);
}

#[test]
fn tnt_exhaustion_forces_new_packet() {
    // Two TNT bits, then a third conditional branch that can only resolve
    // once the second TNT packet arrives
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x40_0000)
        .tnt(&[true, false])
        .tnt(&[true])
        .into_bytes();
    let mut walker = MapWalker::new();
    walker
        .cond(0x40_0000, 3, 0x0d)
        .cond(0x40_0010, 3, 0x20)
        .cond(0x40_0013, 3, 0x2d);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 4);
    assert_eq!(records[3].from_ip, 0x40_0013);
    assert_eq!(records[3].to_ip, 0x40_0043);
}

#[test]
fn shadow_stack_balances_matched_calls_and_returns() {
    let n = 10u64;
    let mut walker = MapWalker::new();
    for i in 0..n {
        let site = 0x1000 + 5 * i;
        walker.call(site, 5, (0x2000i64 - (site as i64 + 5)) as i32);
    }
    walker.ret(0x2000);

    // Compressed returns consume one taken bit each
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tnt(&[true; 6])
        .tnt(&[true; 4])
        .into_bytes();

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    // Sync record plus a call and a return per pair
    assert_eq!(records.len(), 1 + 2 * n as usize);
    for i in 0..n {
        let call = &records[1 + 2 * i as usize];
        let ret = &records[2 + 2 * i as usize];
        let site = 0x1000 + 5 * i;
        assert_eq!(call.from_ip, site);
        assert_eq!(call.to_ip, 0x2000);
        assert_eq!(ret.from_ip, 0x2000);
        // Each RET lands on the pushed return address
        assert_eq!(ret.to_ip, site + 5);
    }
}

#[test]
fn ret_without_return_compression_is_a_mismatch() {
    let mut walker = MapWalker::new();
    walker.call(0x1000, 5, 0xffb);
    walker.ret(0x2000);

    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tnt(&[true, true])
        .into_bytes();

    let mut config = DecoderConfig::default();
    config.return_compression(false);
    let mut decoder = Decoder::new(SliceTrace::single(&data, T1), walker, config);
    let records = decode_all(&mut decoder);

    // Sync, the call, then the RET that cannot be compressed
    assert_eq!(records.len(), 3);
    assert_eq!(records[2].err, Some(TraceError::Mismatch));
    assert_eq!(records[2].from_ip, 0x2000);
}

#[test]
fn loop_guard_catches_self_branch() {
    let mut walker = MapWalker::new();
    walker.cond(0x1000, 3, 0xffd).jmp(0x2000, 2, -2);

    // Leave one TNT bit pending so the decoder keeps walking without
    // consuming packets
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tnt(&[true, true])
        .into_bytes();

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    let last = records.last().unwrap();
    assert_eq!(last.err, Some(TraceError::NeverEndingLoop));
    assert_eq!(last.from_ip, 0x2000);
    // The self-branch is recognized well before the iteration cap
    assert!(records.len() < 10);
}

#[test]
fn loop_guard_trips_at_iteration_cap() {
    let mut walker = MapWalker::new();
    walker.cond(0x800, 4, 0x7fc);
    // A long chain of forward jumps that never revisits an address
    for i in 0..10_400u64 {
        walker.jmp(0x1000 + 2 * i, 2, 0);
    }

    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x800)
        .tnt(&[true, true])
        .into_bytes();

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    let last = records.last().unwrap();
    assert_eq!(last.err, Some(TraceError::NeverEndingLoop));
    // Sync + taken conditional + 10001 tolerated jumps + the failure
    assert_eq!(records.len(), 10_004);
}

#[test]
fn splitting_the_stream_anywhere_is_idempotent() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tnt(&[true, false])
        .pad()
        .tsc(T1 + 100)
        .tnt(&[true])
        .into_bytes();

    let walker = {
        let mut walker = MapWalker::new();
        walker
            .cond(0x1000, 3, 0x0d)
            .cond(0x1010, 3, 0x20)
            .cond(0x1013, 3, 0x2d);
        walker
    };

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker.clone(),
        DecoderConfig::default(),
    );
    let baseline: Vec<_> = decode_all(&mut decoder).iter().map(record_key).collect();
    assert_eq!(baseline.len(), 4);

    for split in 1..data.len() {
        let mut source = SliceTrace::single(&data[..split], T1);
        source.push(TraceChunk {
            data: &data[split..],
            consecutive: true,
            ref_timestamp: 0,
            trace_nr: 1,
        });
        let mut decoder = Decoder::new(source, walker.clone(), DecoderConfig::default());
        let records: Vec<_> = decode_all(&mut decoder).iter().map(record_key).collect();
        assert_eq!(records, baseline, "split at byte {split} diverged");
    }
}

#[test]
fn overlap_stitching_matches_unified_decode() {
    let segment = |tsc: u64, ip: u64| {
        Stream::new()
            .psb()
            .tsc(tsc)
            .psbend()
            .tip_pge(ip)
            .tnt(&[true])
            .into_bytes()
    };

    let walker = {
        let mut walker = MapWalker::new();
        walker
            .cond(0x1000, 3, 0x0d)
            .cond(0x2000, 3, 0x0d)
            .cond(0x3000, 3, 0x0d);
        walker
    };

    let seg1 = segment(T1, 0x1000);
    let seg2 = segment(T1 + 0x1000, 0x2000);
    let seg3 = segment(T1 + 0x2000, 0x3000);

    let mut buf_a = seg1.clone();
    buf_a.extend_from_slice(&seg2);
    let mut buf_b = seg2.clone();
    buf_b.extend_from_slice(&seg3);
    let mut unified = buf_a.clone();
    unified.extend_from_slice(&seg3);

    let overlap = find_overlap(&buf_a, &buf_b, true);
    assert!(overlap.consecutive);
    assert_eq!(overlap.start, seg2.len());

    let mut decoder = Decoder::new(
        SliceTrace::single(&unified, T1),
        walker.clone(),
        DecoderConfig::default(),
    );
    let baseline: Vec<_> = decode_all(&mut decoder).iter().map(record_key).collect();
    assert_eq!(baseline.len(), 6);

    let mut source = SliceTrace::single(&buf_a, T1);
    source.push(TraceChunk {
        data: &buf_b[overlap.start..],
        consecutive: overlap.consecutive,
        ref_timestamp: 0,
        trace_nr: 1,
    });
    let mut decoder = Decoder::new(source, walker, DecoderConfig::default());
    let records: Vec<_> = decode_all(&mut decoder).iter().map(record_key).collect();

    assert_eq!(records, baseline);
}

#[test]
fn overflow_packet_reports_and_resyncs() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .ovf()
        .fup(0x3000)
        .into_bytes();

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        MapWalker::new(),
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 3);
    assert_eq!(records[1].err, Some(TraceError::Overflow));
    assert_eq!(records[1].from_ip, 0x1000);
    // The next step re-synchronizes on the FUP's full IP
    assert_eq!(records[2].err, None);
    assert_eq!(records[2].from_ip, 0);
    assert_eq!(records[2].to_ip, 0x3000);
}

#[test]
fn cyc_calibration_extrapolates_between_timestamps() {
    let t2 = T1 + 400;
    let t3 = t2 + 100;

    // Two CYC-adjacent TSCs 100 ticks and 50 cycles apart calibrate
    // 2.0 ticks per cycle; the first CYC after the anchor then advances the
    // clock without an explicit timestamp.
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .cyc(100)
        .cyc(100)
        .tsc(t2)
        .cyc(30)
        .tnt(&[true])
        .cyc(20)
        .tsc(t3)
        .tnt(&[true])
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.cond(0x1000, 3, 0x0d).cond(0x1010, 3, 0x0d);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 3);
    // 30 cycles at the calibrated 2.0 ticks/cycle
    assert_eq!(records[1].timestamp, t2 + 60);
    assert_eq!(records[2].timestamp, t3);
    assert_monotonic_timestamps(&records);
}

#[test]
fn oversized_cyc_calibration_is_rejected() {
    let t2 = T1 + 50;

    // 100 ticks over 4 cycles is 25 ticks/cycle, far above the CBR-derived
    // 1.0, so the calibration must be discarded and the CBR rate used
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .cbr(16)
        .psbend()
        .tip_pge(0x1000)
        .cyc(10)
        .tsc(t2)
        .cyc(2)
        .tnt(&[true])
        .cyc(2)
        .tsc(t2 + 100)
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.cond(0x1000, 3, 0x0d);

    let mut config = DecoderConfig::default();
    config.max_non_turbo_ratio(16);
    let mut decoder = Decoder::new(SliceTrace::single(&data, T1), walker, config);
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 2);
    // CBR-based rate of 1.0: two cycles past the anchor
    assert_eq!(records[1].timestamp, t2 + 2);
}

#[test]
fn mode_tsx_fup_marks_transaction() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x500)
        .mode_tsx(true, false)
        .fup(0x500)
        .tip(0x600)
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.ind_jmp(0x500, 2);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 3);

    // The transaction state change applies at the FUP address
    assert_eq!(records[1].kind, SampleType::TRANSACTION);
    assert_eq!(records[1].from_ip, 0x500);
    assert_eq!(records[1].to_ip, 0);
    assert!(records[1].flags.contains(SampleFlag::IN_TX));

    // The branch out of it carries the in-transaction flag
    assert_eq!(records[2].kind, SampleType::BRANCH);
    assert_eq!(records[2].from_ip, 0x500);
    assert_eq!(records[2].to_ip, 0x600);
    assert!(records[2].flags.contains(SampleFlag::IN_TX));
    assert!(!records[2].flags.contains(SampleFlag::ASYNC));
}

#[test]
fn mode_tsx_abort_flags_the_completing_branch() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x500)
        .mode_tsx(false, true)
        .fup(0x500)
        .tip(0x600)
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.ind_jmp(0x500, 2);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 3);
    assert_eq!(records[1].kind, SampleType::TRANSACTION);
    assert!(records[1].flags.contains(SampleFlag::ABORT_TX));
    assert_eq!(records[2].from_ip, 0x500);
    assert_eq!(records[2].to_ip, 0x600);
    assert!(records[2].flags.contains(SampleFlag::ABORT_TX));
    assert!(!records[2].flags.contains(SampleFlag::IN_TX));
}

#[test]
fn tma_anchors_mtc_timestamps() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .tma(0x100, 9)
        .psbend()
        .tip_pge(0x1000)
        .mtc(0x22)
        .tnt(&[true])
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.cond(0x1000, 3, 0x0d);

    let mut config = DecoderConfig::default();
    config.mtc_period(3).tsc_ctc_ratio(10, 2);
    let mut decoder = Decoder::new(SliceTrace::single(&data, T1), walker, config);
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 2);
    // ctc_timestamp = T1 - 9; two MTC steps of 8 CTC ticks at 5 TSC each
    assert_eq!(records[1].timestamp, T1 - 9 + 80);
}

#[test]
fn bad_packet_reports_and_decoding_continues() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .raw(&[0x05])
        .tnt(&[true])
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.cond(0x1000, 3, 0x0d);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 3);
    assert_eq!(records[1].err, Some(TraceError::BadPacket));
    // The cursor advanced past the bad byte and decoding resumed
    assert_eq!(records[2].err, None);
    assert_eq!(records[2].from_ip, 0x1000);
    assert_eq!(records[2].to_ip, 0x1010);
}

#[test]
fn discontinuous_chunk_restarts_synchronization() {
    let first = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tnt(&[true])
        .into_bytes();
    let second = Stream::new()
        .psb()
        .tsc(T1 + 0x1_0000)
        .psbend()
        .tip_pge(0x2000)
        .tnt(&[true])
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.cond(0x1000, 3, 0x0d).cond(0x2000, 3, 0x0d);

    let mut source = SliceTrace::single(&first, T1);
    source.push(TraceChunk {
        data: &second,
        consecutive: false,
        ref_timestamp: T1 + 0x1_0000,
        trace_nr: 2,
    });

    let mut decoder = Decoder::new(source, walker, DecoderConfig::default());
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 4);
    assert_eq!(records[1].trace_nr, 1);
    // Re-synchronized into the new capture
    assert_eq!(records[2].from_ip, 0);
    assert_eq!(records[2].to_ip, 0x2000);
    assert_eq!(records[2].trace_nr, 2);
    assert_eq!(records[2].timestamp, T1 + 0x1_0000);
}

#[test]
fn pip_updates_cr3_in_records() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .pip(0xabc000)
        .tnt(&[true])
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.cond(0x1000, 3, 0x0d);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].cr3, 0);
    assert_eq!(records[1].cr3, 0xabc000);
}

#[test]
fn tip_pgd_filter_exit_zeroes_destination() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .raw(&[0x01]) // TIP.PGD, IP suppressed
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.jmp(0x1000, 2, 0x3ffe); // lands at 0x5000, outside the filter
    walker.filter_out(0x5000..0x6000);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 2);
    assert_eq!(records[1].from_ip, 0x1000);
    assert_eq!(records[1].to_ip, 0);
    assert_eq!(records[1].err, None);
}

#[test]
fn indirect_branch_mid_tnt_takes_deferred_tip() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tnt(&[true, true])
        .tip(0x3000)
        .into_bytes();

    let mut walker = MapWalker::new();
    walker
        .cond(0x1000, 3, 0xffd)
        .ind_jmp(0x2000, 2)
        .cond(0x3000, 3, 0x0d);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 4);
    // The indirect branch resolves through the TIP without consuming a bit
    assert_eq!(records[2].from_ip, 0x2000);
    assert_eq!(records[2].to_ip, 0x3000);
    // The remaining bit then resolves the next conditional
    assert_eq!(records[3].from_ip, 0x3000);
    assert_eq!(records[3].to_ip, 0x3010);
}

#[test]
fn missing_deferred_tip_is_a_mismatch() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tnt(&[true, true])
        .tsc(T1 + 100)
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.cond(0x1000, 3, 0xffd).ind_jmp(0x2000, 2);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.last().unwrap().err, Some(TraceError::Mismatch));
}

#[test]
fn async_fup_tip_sets_async_flag() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .fup(0x1000)
        .tip(0x1600)
        .into_bytes();

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        MapWalker::new(),
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 2);
    assert_eq!(records[1].from_ip, 0x1000);
    assert_eq!(records[1].to_ip, 0x1600);
    assert!(records[1].flags.contains(SampleFlag::ASYNC));
    assert_eq!(records[1].err, None);
}

#[test]
fn trace_stop_then_pge_reenables() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .mode_exec_64()
        .trace_stop()
        .tip_pge(0x2000)
        .tnt(&[true])
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.cond(0x2000, 3, 0x0d);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 3);
    assert_eq!(records[1].from_ip, 0);
    assert_eq!(records[1].to_ip, 0x2000);
    assert_eq!(records[2].from_ip, 0x2000);
    assert_eq!(records[2].to_ip, 0x2010);
}

#[test]
fn tip_pgd_disables_tracing_at_indirect_branch() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tip_pgd(0x5000)
        .into_bytes();

    let mut walker = MapWalker::new();
    walker.ind_jmp(0x1000, 2);

    let mut decoder = Decoder::new(
        SliceTrace::single(&data, T1),
        walker,
        DecoderConfig::default(),
    );
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 2);
    // The destination is withheld when generation is disabled
    assert_eq!(records[1].from_ip, 0x1000);
    assert_eq!(records[1].to_ip, 0);
    assert_eq!(records[1].err, None);
}

#[test]
fn instruction_period_emits_samples() {
    let data = Stream::new()
        .psb()
        .tsc(T1)
        .psbend()
        .tip_pge(0x1000)
        .tnt(&[true])
        .into_bytes();

    let mut walker = MapWalker::new();
    walker
        .nop(0x1000, 2)
        .nop(0x1002, 2)
        .cond(0x1004, 3, 9);

    let mut config = DecoderConfig::default();
    config.period(2, PeriodType::Instructions);
    let mut decoder = Decoder::new(SliceTrace::single(&data, T1), walker, config);
    let records = decode_all(&mut decoder);

    assert_eq!(records.len(), 3);
    // The sampling budget expired mid-walk
    assert_eq!(records[1].kind, SampleType::INSTRUCTION);
    assert_eq!(records[1].from_ip, 0x1002);
    assert_eq!(records[1].to_ip, 0);
    // Then the pending conditional branch resolved
    assert_eq!(records[2].kind, SampleType::BRANCH);
    assert_eq!(records[2].from_ip, 0x1004);
    assert_eq!(records[2].to_ip, 0x1010);
}

#[test]
fn empty_source_reports_no_data() {
    let mut decoder = Decoder::new(
        SliceTrace::new(),
        MapWalker::new(),
        DecoderConfig::default(),
    );
    assert_eq!(decoder.decode().err, Some(TraceError::NoData));
    assert_eq!(decoder.decode().err, Some(TraceError::NoData));
}
