//! Overlap detection between captured trace buffers
//!
//! Snapshot-style capture can hand the consumer two buffers that share a
//! suffix/prefix of duplicated data. Decodable data must begin at a PSB, so
//! overlap is resolved at PSB granularity: preferably by comparing the TSC of
//! the last complete PSB+ in the first buffer against the TSCs of PSB+
//! regions in the second, and by raw byte comparison when the trace carries
//! no TSCs.

use core::cmp::Ordering;

use memchr::memmem;
use ptflow_packet::{PSB_BYTES, Packet, PacketKind};

/// Result of [`find_overlap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlap {
    /// Offset into the second buffer where non-overlapped data starts; the
    /// buffer length when it holds nothing decodable beyond the overlap
    pub start: usize,
    /// Whether the data at `start` continues the first buffer without a sync
    /// gap
    pub consecutive: bool,
}

/// Offset of the first PSB in `buf`
fn next_psb(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, &PSB_BYTES)
}

/// Offset of the following PSB, skipping the one `buf` starts with
fn step_psb(buf: &[u8]) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }
    memmem::find(&buf[1..], &PSB_BYTES).map(|idx| idx + 1)
}

/// Offset of the last PSB in `buf`
fn last_psb(buf: &[u8]) -> Option<usize> {
    memmem::rfind(buf, &PSB_BYTES)
}

/// TSC of the PSB+ region `buf` starts at, plus the remaining buffer length
/// measured at the TSC packet. Stops at PSBEND (a PSB+ that carries a TSC
/// carries it before there) or undecodable bytes.
fn next_tsc(buf: &[u8]) -> Option<(u64, usize)> {
    let mut offset = 0;
    while offset < buf.len() {
        let packet = Packet::parse(&buf[offset..]).ok()?;
        match packet.kind {
            PacketKind::Tsc => return Some((packet.payload, buf.len() - offset)),
            PacketKind::Psbend => return None,
            _ => offset += packet.size as usize,
        }
    }
    None
}

/// Compare 7-byte TSC values allowing for the possibility that TSC wrapped
/// around. Generally it is not possible to know if TSC has wrapped, so this
/// assumes the absolute difference is less than half the maximum.
pub(crate) fn tsc_cmp(tsc1: u64, tsc2: u64) -> Ordering {
    const HALFWAY: u64 = 1 << 55;

    if tsc1 == tsc2 {
        Ordering::Equal
    } else if tsc1 < tsc2 {
        if tsc2 - tsc1 < HALFWAY {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    } else if tsc1 - tsc2 < HALFWAY {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// TSC-driven overlap search. `buf_a` and `buf_b` are positioned at a PSB;
/// the returned offset is into `buf_b`.
fn find_overlap_tsc(buf_a: &[u8], buf_b: &[u8], consecutive: &mut bool) -> usize {
    let Some(p) = last_psb(buf_a) else {
        return 0; // No PSB in buf_a => no overlap
    };

    let (tsc_a, rem_a) = match next_tsc(&buf_a[p..]) {
        Some(found) => found,
        None => {
            // The last PSB+ in buf_a is incomplete, so go back one more
            let before = &buf_a[..p];
            let Some(p) = last_psb(before) else {
                return 0; // No full PSB+ => assume no overlap
            };
            match next_tsc(&before[p..]) {
                Some(found) => found,
                None => return 0, // No TSC in buf_a => assume no overlap
            }
        }
    };

    let mut b_off = 0;
    loop {
        // Ignore PSB+ with no TSC
        if let Some((tsc_b, rem_b)) = next_tsc(&buf_b[b_off..]) {
            match tsc_cmp(tsc_a, tsc_b) {
                Ordering::Equal if rem_b >= rem_a => {
                    // Same TSC, so buffers are consecutive
                    *consecutive = true;
                    return buf_b.len() - (rem_b - rem_a);
                }
                Ordering::Less => return b_off, // tsc_a < tsc_b => no overlap
                _ => {}
            }
        }

        match step_psb(&buf_b[b_off..]) {
            Some(step) => b_off += step,
            None => return buf_b.len(), // No more PSB in buf_b => no data
        }
    }
}

/// Determine where non-overlapped trace data starts in `buf_b`, given that
/// `buf_a` was captured immediately before it and the two may share
/// duplicated data.
///
/// `have_tsc` selects the TSC comparison path; without it the buffers are
/// compared byte-wise at PSB boundaries.
#[must_use]
pub fn find_overlap(buf_a: &[u8], buf_b: &[u8], have_tsc: bool) -> Overlap {
    let mut consecutive = false;

    // Buffer 'b' must start at a PSB so throw away everything before that
    let Some(b_psb) = next_psb(buf_b) else {
        return Overlap {
            start: buf_b.len(),
            consecutive,
        }; // No PSB => nothing decodable
    };
    let b = &buf_b[b_psb..];

    let Some(a_psb) = next_psb(buf_a) else {
        return Overlap {
            start: b_psb,
            consecutive,
        }; // No PSB in 'a' => no overlap
    };
    let mut a = &buf_a[a_psb..];

    if have_tsc {
        let start = b_psb + find_overlap_tsc(a, b, &mut consecutive);
        return Overlap { start, consecutive };
    }

    // Buffer 'b' cannot end within buffer 'a' so, for comparison purposes,
    // the head of 'a' beyond 'b's length can be skipped.
    while b.len() < a.len() {
        match step_psb(a) {
            Some(step) => a = &a[step..],
            None => {
                return Overlap {
                    start: b_psb,
                    consecutive,
                }; // No overlap
            }
        }
    }

    // Now b.len() >= a.len()
    loop {
        // Potential overlap, so check the bytes
        if a == &b[..a.len()] {
            consecutive = true;
            return Overlap {
                start: b_psb + a.len(),
                consecutive,
            };
        }

        // Try again at the next PSB in buffer 'a'
        match step_psb(a) {
            Some(step) => a = &a[step..],
            None => {
                return Overlap {
                    start: b_psb,
                    consecutive,
                }; // No overlap
            }
        }
    }
}
