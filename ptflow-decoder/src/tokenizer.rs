//! Byte cursor and packet fetch
//!
//! The decoder reads packets from a window that is either a borrowed chunk
//! from the trace provider or a slice of the internal splice buffer. The
//! splice buffer comes into play when a packet (or a PSB marker, during
//! synchronization) straddles a chunk boundary: the tail of the old chunk and
//! the head of the new one are concatenated there, and the unread remainder
//! of the new chunk is parked in `next_buf` until the window drains.

use memchr::memmem;
use ptflow_packet::{PKT_MAX_SZ, PSB_BYTES, PSB_LEN, Packet, PacketKind, error::PacketError};

use crate::{
    Decoder, PktState, ProvideTrace, WalkInsn,
    error::{Fault, StepResult},
};

/// Where the cursor currently reads from
#[derive(Debug, Clone, Copy)]
pub(crate) enum Window<'a> {
    /// A chunk borrowed from the provider, already advanced past consumed
    /// bytes
    Chunk(&'a [u8]),
    /// `temp_buf[start..end]` of the owning decoder
    Temp { start: usize, end: usize },
}

impl Window<'_> {
    pub(crate) fn empty() -> Self {
        Window::Chunk(&[])
    }
}

impl<'a, P, W> Decoder<'a, P, W>
where
    P: ProvideTrace<'a>,
    W: WalkInsn,
{
    /// The unconsumed bytes at the cursor
    pub(crate) fn window(&self) -> &[u8] {
        match self.buf {
            Window::Chunk(chunk) => chunk,
            Window::Temp { start, end } => &self.temp_buf[start..end],
        }
    }

    fn advance(&mut self, step: usize) {
        match &mut self.buf {
            Window::Chunk(chunk) => *chunk = &chunk[step..],
            Window::Temp { start, .. } => *start += step,
        }
    }

    /// Acknowledge the rest of the window as consumed without decoding it
    fn consume_window(&mut self) {
        self.pos += self.window().len() as u64;
        self.buf = Window::empty();
    }

    /// Ask the provider for a fresh chunk.
    ///
    /// A non-consecutive chunk resets IP and timestamp context, records the
    /// provider's reference timestamp and capture number, and reports
    /// `Relink` so the decode loop restarts from the new state.
    fn fetch_chunk(&mut self) -> StepResult {
        self.pkt_step = 0;

        log::debug!("Getting more data");
        let Some(chunk) = self.source.next_chunk() else {
            log::debug!("No more data");
            return Err(Fault::NoData);
        };
        self.buf = Window::Chunk(chunk.data);
        if chunk.data.is_empty() {
            log::debug!("No more data");
            return Err(Fault::NoData);
        }
        if !chunk.consecutive {
            self.ip = 0;
            self.pkt_state = PktState::NoPsb;
            self.timing.ref_timestamp = chunk.ref_timestamp;
            self.timing.timestamp = 0;
            self.timing.have_tma = false;
            self.state.trace_nr = chunk.trace_nr;
            log::debug!("Reference timestamp {:#x}", chunk.ref_timestamp);
            return Err(Fault::Relink);
        }

        Ok(())
    }

    /// Continue into the chunk remainder parked by a splice, or fetch fresh
    pub(crate) fn fetch_next_chunk(&mut self) -> StepResult {
        if let Some(next) = self.next_buf.take() {
            self.buf = Window::Chunk(next);
            Ok(())
        } else {
            self.fetch_chunk()
        }
    }

    /// Reject the byte at the cursor and advance past it.
    ///
    /// Recovery state is ERR1: the automaton state is kept (unless we are
    /// still hunting for a PSB) and the driver retries from it.
    pub(crate) fn bad_packet(&mut self) -> Fault {
        self.clear_tx_flags();
        self.timing.have_tma = false;
        self.pkt_len = 1;
        self.pkt_step = 1;
        log::trace!(
            "{:#010x}: bad byte {:#04x}",
            self.pos,
            self.window().first().copied().unwrap_or(0)
        );
        if self.pkt_state != PktState::NoPsb {
            log::error!("Bad packet");
        }
        Fault::BadPacket
    }

    /// Advance past the previous packet and tokenize the next one, splicing
    /// across a chunk boundary when needed. PAD packets are skipped.
    pub(crate) fn next_packet(&mut self) -> StepResult {
        self.last_packet_type = Some(self.packet.kind);

        loop {
            self.pos += self.pkt_step as u64;
            self.advance(self.pkt_step);

            if self.window().is_empty() {
                self.fetch_next_chunk()?;
            }

            let packet = match Packet::parse(self.window()) {
                Ok(packet) => packet,
                Err(PacketError::NeedMoreBytes)
                    if self.window().len() < PKT_MAX_SZ && self.next_buf.is_none() =>
                {
                    self.split_packet()?
                }
                Err(_) => return Err(self.bad_packet()),
            };

            self.packet = packet;
            self.pkt_len = packet.size as usize;
            self.pkt_step = packet.size as usize;
            log::trace!(
                "{:#010x}: {} payload {:#x} count {} size {}",
                self.pos,
                packet.kind,
                packet.payload,
                packet.count,
                self.pkt_len
            );

            if packet.kind != PacketKind::Pad {
                return Ok(());
            }
        }
    }

    /// Tokenize a packet that straddles the chunk boundary: concatenate the
    /// window tail with the head of the next chunk in the splice buffer, up
    /// to the maximum packet size, and park the remainder of the new chunk.
    fn split_packet(&mut self) -> Result<Packet, Fault> {
        let old_len = self.window().len();
        match self.buf {
            Window::Chunk(chunk) => self.temp_buf[..old_len].copy_from_slice(chunk),
            Window::Temp { start, end } => self.temp_buf.copy_within(start..end, 0),
        }

        if let Err(fault) = self.fetch_chunk() {
            self.pos += old_len as u64;
            return Err(fault);
        }

        let n = (PKT_MAX_SZ - old_len).min(self.window().len());
        if let Window::Chunk(chunk) = self.buf {
            self.temp_buf[old_len..old_len + n].copy_from_slice(&chunk[..n]);
        }
        let len = old_len + n;

        match Packet::parse(&self.temp_buf[..len]) {
            Ok(packet) if packet.size as usize >= old_len => {
                let consumed_of_next = packet.size as usize - old_len;
                if let Window::Chunk(chunk) = self.buf {
                    self.next_buf = Some(&chunk[consumed_of_next..]);
                }
                self.buf = Window::Temp {
                    start: 0,
                    end: packet.size as usize,
                };
                Ok(packet)
            }
            _ => {
                // Still not a packet at the maximum splice size: restore the
                // windows and reject the byte
                if let Window::Chunk(chunk) = self.buf {
                    self.next_buf = Some(chunk);
                }
                self.buf = Window::Temp {
                    start: 0,
                    end: old_len,
                };
                Err(self.bad_packet())
            }
        }
    }

    /// Longest PSB prefix sitting at the very end of the window, in bytes
    fn part_psb(&self) -> usize {
        let window = self.window();
        let end = window.len();
        for i in (1..PSB_LEN).rev() {
            if i > end {
                continue;
            }
            if window[end - i..] == PSB_BYTES[..i] {
                return i;
            }
        }
        0
    }

    /// Length of the PSB suffix at the start of the window completing a
    /// marker split `part` bytes before it, or 0 if the window does not
    /// continue the marker
    fn rest_psb(&self, part: usize) -> usize {
        let rest = PSB_LEN - part;
        let window = self.window();
        if rest > window.len() || window[..rest] != PSB_BYTES[part..] {
            return 0;
        }
        rest
    }

    /// A PSB prefix of `part` bytes ends the current window; check the next
    /// chunk for the rest and, when confirmed, present the reconstructed
    /// marker from the splice buffer at its original stream offset
    fn split_psb(&mut self, part: usize) -> StepResult {
        self.consume_window();
        self.fetch_next_chunk()?;

        let rest = self.rest_psb(part);
        if rest == 0 {
            return Ok(());
        }

        self.pos -= part as u64;
        if let Window::Chunk(chunk) = self.buf {
            self.next_buf = Some(&chunk[rest..]);
        }
        self.temp_buf[..PSB_LEN].copy_from_slice(&PSB_BYTES);
        self.buf = Window::Temp {
            start: 0,
            end: PSB_LEN,
        };

        Ok(())
    }

    /// Hunt forward for the next PSB marker and tokenize it, handling markers
    /// split across chunk boundaries
    pub(crate) fn scan_for_psb(&mut self) -> StepResult {
        log::debug!("Scanning for PSB");
        loop {
            if self.window().is_empty() {
                self.fetch_next_chunk()?;
            }

            if let Some(idx) = memmem::find(self.window(), &PSB_BYTES) {
                self.pkt_step = idx;
                return self.next_packet();
            }

            let part = self.part_psb();
            if part != 0 {
                self.split_psb(part)?;
            } else {
                self.consume_window();
            }
        }
    }
}
