use anyhow::{Context, Result};
use clap::Parser;
use ptflow_decoder::{Decoder, DecoderConfig, ImageWalker, SliceTrace, TraceError};

use std::{fs::File, num::ParseIntError, path::PathBuf};

/// Decode a raw Intel PT packet stream against a flat code image.
///
/// The trace file holds nothing but PT packet bytes (extract the AUX data
/// when starting from a perf.data file). Set the environment variable
/// `RUST_LOG=trace` for packet-level logging.
#[derive(Parser)]
struct Cmdline {
    /// Path of the raw PT packet bytes
    #[arg(short, long)]
    trace: PathBuf,
    /// Path of the flat code image the trace executed from
    #[arg(short, long)]
    image: PathBuf,
    /// Virtual address the image is loaded at
    #[arg(short, long, value_parser = parse_int, default_value = "0x400000")]
    base: u64,
    /// Externally-known timestamp near the start of the capture
    #[arg(long, value_parser = parse_int, default_value = "0x1")]
    ref_tsc: u64,
    /// The trace was recorded without return compression
    #[arg(long)]
    no_return_compression: bool,
    /// MTC period exponent the trace was recorded with
    #[arg(long, default_value_t = 0)]
    mtc_period: u32,
    /// TSC:CTC ratio numerator from CPUID 15H
    #[arg(long, default_value_t = 0)]
    tsc_ctc_ratio_n: u32,
    /// TSC:CTC ratio denominator from CPUID 15H
    #[arg(long, default_value_t = 0)]
    tsc_ctc_ratio_d: u32,
    /// Max non-turbo ratio, for cycle-accurate timing
    #[arg(long, default_value_t = 0)]
    max_non_turbo_ratio: u32,
    /// Emit one JSON object per record instead of plain text
    #[arg(long)]
    json: bool,
}

fn parse_int(arg: &str) -> Result<u64, ParseIntError> {
    match arg.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => arg.parse(),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cmdline = Cmdline::parse();

    let trace_file = File::open(&cmdline.trace).context("Failed to open trace file")?;
    // SAFETY: check the safety requirements of memmap2 documentation
    let trace = unsafe { memmap2::Mmap::map(&trace_file).context("Failed to mmap trace file")? };

    let image_file = File::open(&cmdline.image).context("Failed to open image file")?;
    // SAFETY: check the safety requirements of memmap2 documentation
    let image = unsafe { memmap2::Mmap::map(&image_file).context("Failed to mmap image file")? };

    let mut config = DecoderConfig::default();
    config
        .return_compression(!cmdline.no_return_compression)
        .mtc_period(cmdline.mtc_period)
        .tsc_ctc_ratio(cmdline.tsc_ctc_ratio_n, cmdline.tsc_ctc_ratio_d)
        .max_non_turbo_ratio(cmdline.max_non_turbo_ratio);

    let source = SliceTrace::single(&trace, cmdline.ref_tsc);
    let walker = ImageWalker::new(&image, cmdline.base);
    let mut decoder = Decoder::new(source, walker, config);

    let mut records = 0u64;
    let mut errors = 0u64;
    loop {
        let state = decoder.decode();
        if state.err == Some(TraceError::NoData) {
            break;
        }
        records += 1;

        if cmdline.json {
            println!(
                "{}",
                serde_json::to_string(state).context("Failed to serialize record")?
            );
            continue;
        }

        match state.err {
            Some(err) => {
                errors += 1;
                println!("{:#014x}: error: {err}", state.from_ip);
            }
            None => println!(
                "{:#014x} -> {:#014x}  ts {:#x}  insns {}",
                state.from_ip, state.to_ip, state.timestamp, state.tot_insn_cnt
            ),
        }
    }

    if !cmdline.json {
        eprintln!("{records} records, {errors} errors");
    }

    Ok(())
}
