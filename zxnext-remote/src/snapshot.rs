//! `.sna` and `.nex` snapshot image parsing.
//!
//! Parsing is pure: a [`SnapshotImage`] is a list of 16 KiB banks plus an
//! ordered register write list ending with `PC`. The session replays it
//! over the wire as `WRITE_BANK` pairs followed by `SET_REGISTER` calls.

use std::path::Path;

use dzrp_protocol::reg;

use crate::error::DebugError;

/// Size of a 16 KiB memory bank as stored in snapshot files.
pub const BANK16_SIZE: usize = 0x4000;

const SNA_HEADER: usize = 27;
const SNA_48K_LEN: usize = SNA_HEADER + 3 * BANK16_SIZE;
const SNA_128K_PREFIX: usize = SNA_48K_LEN + 4; // + PC, port 0x7FFD, TR-DOS flag

const NEX_HEADER: usize = 512;
const NEX_BANK_FLAGS: usize = 112;

/// Parsed snapshot, ready to replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotImage {
    /// `(register index, value)` in write order; `PC` is always last.
    pub registers: Vec<(u8, u16)>,
    pub border: Option<u8>,
    /// 16 KiB banks in file order.
    pub banks: Vec<(u8, Vec<u8>)>,
}

/// Load a snapshot file, dispatching on the extension.
pub fn load(path: &Path) -> Result<SnapshotImage, DebugError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let data = std::fs::read(path)?;
    match ext.as_str() {
        "sna" => parse_sna(&data),
        "nex" => parse_nex(&data),
        other => Err(DebugError::Snapshot(format!(
            "unsupported snapshot format '{}'",
            other
        ))),
    }
}

fn rd16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn header_registers(header: &[u8]) -> Vec<(u8, u16)> {
    vec![
        (reg::I, header[0] as u16),
        (reg::HL2, rd16(header, 1)),
        (reg::DE2, rd16(header, 3)),
        (reg::BC2, rd16(header, 5)),
        (reg::AF2, rd16(header, 7)),
        (reg::HL, rd16(header, 9)),
        (reg::DE, rd16(header, 11)),
        (reg::BC, rd16(header, 13)),
        (reg::IY, rd16(header, 15)),
        (reg::IX, rd16(header, 17)),
        (reg::R, header[20] as u16),
        (reg::AF, rd16(header, 21)),
        (reg::IM, header[25] as u16),
    ]
}

/// Parse a `.sna` image (48K or 128K, distinguished by layout).
pub fn parse_sna(data: &[u8]) -> Result<SnapshotImage, DebugError> {
    if data.len() < SNA_48K_LEN {
        return Err(DebugError::Snapshot(format!(
            ".sna file of {} bytes is truncated",
            data.len()
        )));
    }
    let header = &data[..SNA_HEADER];
    // The canonical register set has no interrupt-enable slot, so the
    // IFF2 bit only gets logged.
    if header[19] & 0x04 == 0 {
        log::debug!(".sna image saved with interrupts disabled");
    }

    if data.len() == SNA_48K_LEN {
        parse_sna_48k(data, header)
    } else {
        parse_sna_128k(data, header)
    }
}

fn parse_sna_48k(data: &[u8], header: &[u8]) -> Result<SnapshotImage, DebugError> {
    let ram = &data[SNA_HEADER..];
    let sp = rd16(header, 23);
    // 48K images keep PC on the stack; it must lie inside the image.
    if !(0x4000..=0xFFFE).contains(&sp) {
        return Err(DebugError::Snapshot(format!(
            "48K .sna stack pointer {:#06x} lies outside RAM",
            sp
        )));
    }
    let pc = rd16(ram, (sp - 0x4000) as usize);

    let mut registers = header_registers(header);
    registers.push((reg::SP, sp.wrapping_add(2)));
    registers.push((reg::PC, pc));

    Ok(SnapshotImage {
        registers,
        border: Some(header[26] & 0x07),
        banks: vec![
            (5, ram[..BANK16_SIZE].to_vec()),
            (2, ram[BANK16_SIZE..2 * BANK16_SIZE].to_vec()),
            (0, ram[2 * BANK16_SIZE..3 * BANK16_SIZE].to_vec()),
        ],
    })
}

fn parse_sna_128k(data: &[u8], header: &[u8]) -> Result<SnapshotImage, DebugError> {
    if data.len() < SNA_128K_PREFIX {
        return Err(DebugError::Snapshot(format!(
            ".sna file of {} bytes is truncated",
            data.len()
        )));
    }
    let ram = &data[SNA_HEADER..SNA_48K_LEN];
    let pc = rd16(data, SNA_48K_LEN);
    let port_7ffd = data[SNA_48K_LEN + 2];
    let paged = port_7ffd & 0x07;
    // Slot paging has no command in the protocol; bank contents still
    // land in the right place via WRITE_BANK.
    log::debug!("128K .sna pages bank {} at 0xC000", paged);

    let mut banks = vec![
        (5u8, ram[..BANK16_SIZE].to_vec()),
        (2u8, ram[BANK16_SIZE..2 * BANK16_SIZE].to_vec()),
        (paged, ram[2 * BANK16_SIZE..3 * BANK16_SIZE].to_vec()),
    ];

    let remaining: Vec<u8> = (0..8)
        .filter(|b| *b != 5 && *b != 2 && *b != paged)
        .collect();
    let expected = SNA_128K_PREFIX + remaining.len() * BANK16_SIZE;
    if data.len() != expected {
        return Err(DebugError::Snapshot(format!(
            "128K .sna of {} bytes, expected {}",
            data.len(),
            expected
        )));
    }
    let mut offset = SNA_128K_PREFIX;
    for bank in remaining {
        banks.push((bank, data[offset..offset + BANK16_SIZE].to_vec()));
        offset += BANK16_SIZE;
    }

    let mut registers = header_registers(header);
    registers.push((reg::SP, rd16(header, 23)));
    registers.push((reg::PC, pc));

    Ok(SnapshotImage {
        registers,
        border: Some(header[26] & 0x07),
        banks,
    })
}

/// Parse a `.nex` image. Only `SP` and `PC` come from the file; the other
/// registers are left to the NEX loader stub on the remote.
pub fn parse_nex(data: &[u8]) -> Result<SnapshotImage, DebugError> {
    if data.len() < NEX_HEADER {
        return Err(DebugError::Snapshot(format!(
            ".nex file of {} bytes is truncated",
            data.len()
        )));
    }
    if &data[0..4] != b"Next" {
        return Err(DebugError::Snapshot("missing 'Next' magic".to_string()));
    }
    let version = String::from_utf8_lossy(&data[4..8]).to_string();
    if !version.starts_with('V') {
        return Err(DebugError::Snapshot(format!(
            "bad .nex version field '{}'",
            version
        )));
    }

    let num_banks = data[9] as usize;
    let screen = data[10];
    let sp = rd16(data, 12);
    let pc = rd16(data, 14);
    let flags = &data[18..18 + NEX_BANK_FLAGS];

    let mut offset = NEX_HEADER;
    // Optional palette precedes layer2/lores loading screens.
    let has_palette = screen & 0x80 == 0 && screen & 0x05 != 0;
    if has_palette {
        offset += 512;
    }
    for (bit, size) in [
        (0x01, 49152), // layer2
        (0x02, 6912),  // ULA
        (0x04, 12288), // LoRes
        (0x08, 12288), // Timex HiRes
        (0x10, 12288), // Timex HiCol
    ] {
        if screen & bit != 0 {
            offset += size;
        }
    }

    let mut banks = Vec::new();
    let order = (0..NEX_BANK_FLAGS as u8).map(nex_bank_order);
    for bank in order {
        if flags[bank as usize] == 0 {
            continue;
        }
        if data.len() < offset + BANK16_SIZE {
            return Err(DebugError::Snapshot(format!(
                ".nex bank {} is truncated",
                bank
            )));
        }
        banks.push((bank, data[offset..offset + BANK16_SIZE].to_vec()));
        offset += BANK16_SIZE;
    }
    if banks.len() != num_banks {
        log::warn!(
            ".nex header promises {} banks, flag table marks {}",
            num_banks,
            banks.len()
        );
    }

    let mut registers = vec![(reg::SP, sp)];
    if pc != 0 {
        // PC of zero means "stay in the loader"
        registers.push((reg::PC, pc));
    }

    Ok(SnapshotImage {
        registers,
        border: None,
        banks,
    })
}

/// Bank load order: 5, 2, 0, 1, 3, 4, 6, 7, then ascending.
fn nex_bank_order(position: u8) -> u8 {
    match position {
        0 => 5,
        1 => 2,
        2 => 0,
        3 => 1,
        4 => 3,
        5 => 4,
        6 => 6,
        7 => 7,
        n => n,
    }
}
