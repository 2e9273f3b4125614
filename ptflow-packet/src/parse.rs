//! Header-byte dispatch and per-kind framing
//!
//! The first byte of every packet selects its parser. Single-byte opcodes are
//! resolved through a 256-entry table built at compile time from the header
//! bit patterns; the `0x02` prefix opens the two-byte opcode space which is
//! resolved by a second-level match.

use crate::{
    PKT_MAX_SZ, PSB_BYTES, PSB_LEN, Packet, PacketKind,
    error::{PacketError, PacketResult},
};

const BIT63: u64 = 1 << 63;

type PacketParser = fn(&[u8], u8) -> PacketResult<Packet>;

const PARSERS: [PacketParser; 256] = {
    let mut parsers: [PacketParser; 256] = [parse_invalid; 256];

    let mut index = 0;

    loop {
        if index >= 256 {
            break;
        }
        let cur_index = index;
        index += 1;

        let parser = if cur_index == 0b0000_0000 {
            // 00000000
            parse_pad
        } else if cur_index & 0b0001_1111 == 0b0000_0001 {
            // xxx00001
            parse_tip_pgd
        } else if cur_index == 0b0000_0010 {
            // 00000010
            parse_ext
        } else if cur_index & 0b0000_0011 == 0b0000_0011 {
            // xxxxxx11
            parse_cyc
        } else if cur_index & 0b0000_0001 == 0b0000_0000 {
            // xxxxxxx0 but not 00000000 and 00000010
            parse_short_tnt
        } else if cur_index & 0b0001_1111 == 0b0000_1101 {
            // xxx01101
            parse_tip
        } else if cur_index & 0b0001_1111 == 0b0001_0001 {
            // xxx10001
            parse_tip_pge
        } else if cur_index == 0b0001_1001 {
            // 00011001
            parse_tsc
        } else if cur_index & 0b0001_1111 == 0b0001_1101 {
            // xxx11101
            parse_fup
        } else if cur_index == 0b0101_1001 {
            // 01011001
            parse_mtc
        } else if cur_index == 0b1001_1001 {
            // 10011001
            parse_mode
        } else {
            // Anything else
            parse_invalid
        };

        parsers[cur_index] = parser;
    }

    parsers
};

pub(crate) fn parse(buf: &[u8]) -> PacketResult<Packet> {
    let Some(byte) = buf.first() else {
        return Err(PacketError::NeedMoreBytes);
    };
    PARSERS[*byte as usize](buf, *byte)
}

fn parse_invalid(_buf: &[u8], _byte: u8) -> PacketResult<Packet> {
    Err(PacketError::Invalid)
}

fn parse_pad(_buf: &[u8], _byte: u8) -> PacketResult<Packet> {
    Ok(Packet::new(PacketKind::Pad, 0, 0, 1))
}

/// Short TNT: the byte carries up to 6 outcome bits below a stop bit, with
/// bit 0 clear. The payload is left-aligned so the first outcome is bit 63
/// and the stop bit is shifted out.
fn parse_short_tnt(_buf: &[u8], byte: u8) -> PacketResult<Packet> {
    debug_assert!(byte != 0 && byte & 1 == 0, "not a short TNT header");

    // Highest set bit is the stop bit; it is at position 1..=7.
    let stop = 7 - byte.leading_zeros();
    let count = stop - 1;
    let payload = (byte as u64) << (64 - stop);

    Ok(Packet::new(PacketKind::Tnt, payload, count as u16, 1))
}

/// Long TNT: 6-byte payload after the `02 a3` opcode, same stop-bit scheme as
/// the short form for up to 47 outcome bits.
fn parse_long_tnt(buf: &[u8]) -> PacketResult<Packet> {
    let Some(bytes) = buf.first_chunk::<8>() else {
        return Err(PacketError::NeedMoreBytes);
    };
    // The opcode bytes sit in the low 16 bits and are treated like any other
    // payload bits when hunting for the stop bit, exactly as the hardware
    // manual frames it (a payload of all zeroes cannot occur on the wire).
    let mut payload = u64::from_le_bytes(*bytes);

    let mut count = 47u16;
    while count != 0 {
        if payload & BIT63 != 0 {
            break;
        }
        payload <<= 1;
        count -= 1;
    }

    Ok(Packet::new(PacketKind::Tnt, payload << 1, count, 8))
}

fn parse_tip(buf: &[u8], byte: u8) -> PacketResult<Packet> {
    parse_ip(buf, byte, PacketKind::Tip)
}

fn parse_tip_pge(buf: &[u8], byte: u8) -> PacketResult<Packet> {
    parse_ip(buf, byte, PacketKind::TipPge)
}

fn parse_tip_pgd(buf: &[u8], byte: u8) -> PacketResult<Packet> {
    parse_ip(buf, byte, PacketKind::TipPgd)
}

fn parse_fup(buf: &[u8], byte: u8) -> PacketResult<Packet> {
    parse_ip(buf, byte, PacketKind::Fup)
}

/// TIP/TIP.PGE/TIP.PGD/FUP share the IP-bytes encoding in the top 3 header
/// bits. The payload is returned raw; expansion against the last IP is the
/// consumer's job.
fn parse_ip(buf: &[u8], byte: u8, kind: PacketKind) -> PacketResult<Packet> {
    let ip_bytes = byte >> 5;
    let (count, nbytes) = match ip_bytes {
        0b000 => return Ok(Packet::new(kind, 0, 0, 1)),
        0b001 => (1, 2usize),
        0b010 => (2, 4),
        0b011 => (3, 6),
        0b100 => (4, 6),
        0b110 => (6, 8),
        _ => return Err(PacketError::Invalid),
    };

    let Some(payload_buf) = buf.get(1..1 + nbytes) else {
        return Err(PacketError::NeedMoreBytes);
    };
    let mut bytes = [0u8; 8];
    bytes[..nbytes].copy_from_slice(payload_buf);
    let payload = u64::from_le_bytes(bytes);

    Ok(Packet::new(kind, payload, count, 1 + nbytes as u8))
}

fn parse_tsc(buf: &[u8], _byte: u8) -> PacketResult<Packet> {
    let Some([b1, b2, b3, b4, b5, b6, b7]) = buf.get(1..).and_then(|buf| buf.first_chunk::<7>())
    else {
        return Err(PacketError::NeedMoreBytes);
    };
    let payload = u64::from_le_bytes([*b1, *b2, *b3, *b4, *b5, *b6, *b7, 0]);

    Ok(Packet::new(PacketKind::Tsc, payload, 0, 8))
}

fn parse_mtc(buf: &[u8], _byte: u8) -> PacketResult<Packet> {
    let Some(ctc) = buf.get(1) else {
        return Err(PacketError::NeedMoreBytes);
    };

    Ok(Packet::new(PacketKind::Mtc, *ctc as u64, 0, 2))
}

fn parse_mode(buf: &[u8], _byte: u8) -> PacketResult<Packet> {
    let Some(byte) = buf.get(1) else {
        return Err(PacketError::NeedMoreBytes);
    };
    let leaf_id = byte >> 5;
    let mode = byte & 0b0001_1111;

    match leaf_id {
        0b000 => {
            let bitness = match mode & 0b0000_0011 {
                0b00 => 16,
                0b01 => 64,
                0b10 => 32,
                _ => return Err(PacketError::Invalid),
            };
            Ok(Packet::new(PacketKind::ModeExec, bitness, 0, 2))
        }
        0b001 => {
            if mode & 0b0000_0011 == 0b11 {
                return Err(PacketError::Invalid);
            }
            Ok(Packet::new(
                PacketKind::ModeTsx,
                (mode & 0b0000_0011) as u64,
                0,
                2,
            ))
        }
        _ => Err(PacketError::Invalid),
    }
}

/// CYC: 5 value bits in the first byte, then 7 more per continuation byte for
/// as long as the exp bit is set.
fn parse_cyc(buf: &[u8], byte: u8) -> PacketResult<Packet> {
    let mut payload = (byte >> 3) as u64;
    let mut exp = byte & 0b0000_0100 != 0;
    let mut offs = 1usize;

    let mut shift = 5u32;
    while exp {
        if offs > 9 {
            return Err(PacketError::Invalid);
        }
        let Some(byte) = buf.get(offs) else {
            return Err(PacketError::NeedMoreBytes);
        };
        offs += 1;
        exp = byte & 1 != 0;
        payload |= ((byte >> 1) as u64) << shift;
        shift += 7;
    }

    Ok(Packet::new(PacketKind::Cyc, payload, 0, offs as u8))
}

/// Two-byte opcode space behind the 0x02 prefix
fn parse_ext(buf: &[u8], _byte: u8) -> PacketResult<Packet> {
    let Some(opcode) = buf.get(1) else {
        return Err(PacketError::NeedMoreBytes);
    };

    match opcode {
        0x23 => Ok(Packet::new(PacketKind::Psbend, 0, 0, 2)),
        0x03 => parse_cbr(buf),
        0x43 => parse_pip(buf),
        0x83 => Ok(Packet::new(PacketKind::TraceStop, 0, 0, 2)),
        0x73 => parse_tma(buf),
        0xa3 => parse_long_tnt(buf),
        0xc8 => parse_vmcs(buf),
        0xf3 => Ok(Packet::new(PacketKind::Ovf, 0, 0, 2)),
        0x82 => parse_psb(buf),
        0xc3 => parse_mnt(buf),
        _ => Err(PacketError::Invalid),
    }
}

fn parse_cbr(buf: &[u8]) -> PacketResult<Packet> {
    if buf.len() < 4 {
        return Err(PacketError::NeedMoreBytes);
    }

    Ok(Packet::new(PacketKind::Cbr, buf[2] as u64, 0, 4))
}

fn parse_pip(buf: &[u8]) -> PacketResult<Packet> {
    let Some([b2, b3, b4, b5, b6, b7]) = buf.get(2..).and_then(|buf| buf.first_chunk::<6>()) else {
        return Err(PacketError::NeedMoreBytes);
    };
    // Bit 0 of the payload is RSVD/NR; the CR3 value starts at bit 1.
    let payload = u64::from_le_bytes([*b2, *b3, *b4, *b5, *b6, *b7, 0, 0]) >> 1;

    Ok(Packet::new(PacketKind::Pip, payload, 0, 8))
}

fn parse_tma(buf: &[u8]) -> PacketResult<Packet> {
    if buf.len() < 7 {
        return Err(PacketError::NeedMoreBytes);
    }
    let ctc = u16::from_le_bytes([buf[2], buf[3]]) as u64;
    let fc = buf[5] as u16 | (((buf[6] & 1) as u16) << 8);

    Ok(Packet::new(PacketKind::Tma, ctc, fc, 7))
}

fn parse_vmcs(buf: &[u8]) -> PacketResult<Packet> {
    let Some([b2, b3, b4, b5, b6]) = buf.get(2..).and_then(|buf| buf.first_chunk::<5>()) else {
        return Err(PacketError::NeedMoreBytes);
    };
    let payload = u64::from_le_bytes([*b2, *b3, *b4, *b5, *b6, 0, 0, 0]) << 12;

    Ok(Packet::new(PacketKind::Vmcs, payload, 0, 7))
}

fn parse_psb(buf: &[u8]) -> PacketResult<Packet> {
    let Some(bytes) = buf.first_chunk::<PSB_LEN>() else {
        return Err(PacketError::NeedMoreBytes);
    };
    if bytes != &PSB_BYTES {
        return Err(PacketError::Invalid);
    }

    Ok(Packet::new(PacketKind::Psb, 0, 0, PSB_BYTES.len() as u8))
}

fn parse_mnt(buf: &[u8]) -> PacketResult<Packet> {
    let Some(b2) = buf.get(2) else {
        return Err(PacketError::NeedMoreBytes);
    };
    if *b2 != 0x88 {
        return Err(PacketError::Invalid);
    }
    let Some(bytes) = buf.get(3..).and_then(|buf| buf.first_chunk::<8>()) else {
        return Err(PacketError::NeedMoreBytes);
    };
    let payload = u64::from_le_bytes(*bytes);

    Ok(Packet::new(PacketKind::Mnt, payload, 0, 11))
}

// Every packet must fit the splice buffer sized by PKT_MAX_SZ.
const _: () = assert!(PSB_BYTES.len() <= PKT_MAX_SZ);
