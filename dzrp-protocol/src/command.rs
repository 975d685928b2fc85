//! DZRP command encoding and response/notification decoding.
//!
//! One entry per opcode. Requests are encoded into [`Frame`]s; response
//! payloads are decoded by the typed helpers below. Responses echo the
//! request opcode with bit 7 set.

use crate::frame::{Frame, ProtocolError};

/// Protocol version exchanged in `INIT`.
pub const DZRP_VERSION: [u8; 3] = [1, 0, 0];

/// Bit set on every response opcode.
pub const RESPONSE_FLAG: u8 = 0x80;

// Command opcodes
pub const CMD_INIT: u8 = 0x01;
pub const CMD_GET_REGISTERS: u8 = 0x02;
pub const CMD_SET_REGISTER: u8 = 0x03;
pub const CMD_WRITE_BANK: u8 = 0x04;
pub const CMD_CONTINUE: u8 = 0x05;
pub const CMD_PAUSE: u8 = 0x06;
pub const CMD_ADD_BP: u8 = 0x07;
pub const CMD_REMOVE_BP: u8 = 0x08;
pub const CMD_ADD_WP: u8 = 0x09;
pub const CMD_REMOVE_WP: u8 = 0x0A;
pub const CMD_READ_MEM: u8 = 0x0B;
pub const CMD_WRITE_MEM: u8 = 0x0C;
pub const CMD_GET_SLOTS: u8 = 0x0D;
pub const CMD_READ_STATE: u8 = 0x0E;
pub const CMD_WRITE_STATE: u8 = 0x0F;
pub const CMD_GET_TBBLUE_REG: u8 = 0x10;
pub const CMD_GET_SPRITES_PAL: u8 = 0x11;
pub const CMD_GET_SPRITES: u8 = 0x12;
pub const CMD_GET_SPRITE_PATTERNS: u8 = 0x13;
pub const CMD_GET_SPRITE_CLIP: u8 = 0x14;
pub const CMD_SET_BORDER: u8 = 0x15;

// Notification opcodes (disjoint number space, bit 7 clear)
pub const NTF_PAUSE: u8 = 1;

/// Size of one memory bank transferred by `WRITE_BANK`.
pub const BANK_SIZE: usize = 0x2000;

/// Register indices for `SET_REGISTER` and the `GET_REGISTERS` layout.
///
/// Indices 0..=11 address 16-bit words, 12..=14 single bytes.
pub mod reg {
    pub const PC: u8 = 0;
    pub const SP: u8 = 1;
    pub const AF: u8 = 2;
    pub const BC: u8 = 3;
    pub const DE: u8 = 4;
    pub const HL: u8 = 5;
    pub const IX: u8 = 6;
    pub const IY: u8 = 7;
    pub const AF2: u8 = 8; // AF'
    pub const BC2: u8 = 9; // BC'
    pub const DE2: u8 = 10; // DE'
    pub const HL2: u8 = 11; // HL'
    pub const I: u8 = 12;
    pub const R: u8 = 13;
    pub const IM: u8 = 14;

    pub const COUNT: usize = 15;

    /// Wire width in bytes of the value for the given index.
    pub fn width(index: u8) -> usize {
        if index <= HL2 {
            2
        } else {
            1
        }
    }
}

/// Read a 16-bit little-endian value from a slice.
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16, ProtocolError> {
    if offset + 2 > data.len() {
        return Err(ProtocolError::Malformed(format!(
            "expected u16 at offset {}, payload is {} bytes",
            offset,
            data.len()
        )));
    }
    Ok(u16::from_le_bytes([data[offset], data[offset + 1]]))
}

/// Write a 16-bit little-endian value to a vector.
pub fn write_u16_le(vec: &mut Vec<u8>, value: u16) {
    vec.extend_from_slice(&value.to_le_bytes());
}

/// Watchpoint access kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAccess {
    Read,
    Write,
    ReadWrite,
}

impl WatchAccess {
    pub fn bits(self) -> u8 {
        match self {
            WatchAccess::Read => 0x01,
            WatchAccess::Write => 0x02,
            WatchAccess::ReadWrite => 0x03,
        }
    }
}

/// A DZRP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init,
    GetRegisters,
    SetRegister { index: u8, value: u16 },
    WriteBank { bank: u8, data: Vec<u8> },
    Continue { bp1: Option<u16>, bp2: Option<u16> },
    Pause,
    AddBreakpoint { addr: u16 },
    RemoveBreakpoint { id: u16 },
    AddWatchpoint { addr: u16, size: u16, access: WatchAccess },
    RemoveWatchpoint { addr: u16, size: u16 },
    ReadMem { addr: u16, size: u16 },
    WriteMem { addr: u16, data: Vec<u8> },
    GetSlots,
    ReadState,
    WriteState { data: Vec<u8> },
    GetTbblueReg { reg: u8 },
    GetSpritesPalette { index: u8 },
    GetSprites { slot: u8, count: u8 },
    GetSpritePatterns { index: u8, count: u8 },
    GetSpriteClip,
    SetBorder { color: u8 },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Init => CMD_INIT,
            Command::GetRegisters => CMD_GET_REGISTERS,
            Command::SetRegister { .. } => CMD_SET_REGISTER,
            Command::WriteBank { .. } => CMD_WRITE_BANK,
            Command::Continue { .. } => CMD_CONTINUE,
            Command::Pause => CMD_PAUSE,
            Command::AddBreakpoint { .. } => CMD_ADD_BP,
            Command::RemoveBreakpoint { .. } => CMD_REMOVE_BP,
            Command::AddWatchpoint { .. } => CMD_ADD_WP,
            Command::RemoveWatchpoint { .. } => CMD_REMOVE_WP,
            Command::ReadMem { .. } => CMD_READ_MEM,
            Command::WriteMem { .. } => CMD_WRITE_MEM,
            Command::GetSlots => CMD_GET_SLOTS,
            Command::ReadState => CMD_READ_STATE,
            Command::WriteState { .. } => CMD_WRITE_STATE,
            Command::GetTbblueReg { .. } => CMD_GET_TBBLUE_REG,
            Command::GetSpritesPalette { .. } => CMD_GET_SPRITES_PAL,
            Command::GetSprites { .. } => CMD_GET_SPRITES,
            Command::GetSpritePatterns { .. } => CMD_GET_SPRITE_PATTERNS,
            Command::GetSpriteClip => CMD_GET_SPRITE_CLIP,
            Command::SetBorder { .. } => CMD_SET_BORDER,
        }
    }

    /// Encode the request into a frame.
    pub fn encode(&self) -> Frame {
        let payload = match self {
            Command::Init => DZRP_VERSION.to_vec(),
            Command::GetRegisters
            | Command::Pause
            | Command::GetSlots
            | Command::ReadState
            | Command::GetSpriteClip => vec![],
            Command::SetRegister { index, value } => {
                let mut p = vec![*index];
                match reg::width(*index) {
                    2 => write_u16_le(&mut p, *value),
                    _ => p.push(*value as u8),
                }
                p
            }
            Command::WriteBank { bank, data } => {
                let mut p = Vec::with_capacity(1 + data.len());
                p.push(*bank);
                p.extend_from_slice(data);
                p
            }
            Command::Continue { bp1, bp2 } => {
                let mut p = Vec::with_capacity(6);
                for bp in [bp1, bp2] {
                    match bp {
                        Some(addr) => {
                            p.push(1);
                            write_u16_le(&mut p, *addr);
                        }
                        None => {
                            p.push(0);
                            write_u16_le(&mut p, 0);
                        }
                    }
                }
                p
            }
            Command::AddBreakpoint { addr } => addr.to_le_bytes().to_vec(),
            Command::RemoveBreakpoint { id } => id.to_le_bytes().to_vec(),
            Command::AddWatchpoint { addr, size, access } => {
                let mut p = Vec::with_capacity(5);
                write_u16_le(&mut p, *addr);
                write_u16_le(&mut p, *size);
                p.push(access.bits());
                p
            }
            Command::RemoveWatchpoint { addr, size } => {
                let mut p = Vec::with_capacity(4);
                write_u16_le(&mut p, *addr);
                write_u16_le(&mut p, *size);
                p
            }
            Command::ReadMem { addr, size } => {
                let mut p = Vec::with_capacity(4);
                write_u16_le(&mut p, *addr);
                write_u16_le(&mut p, *size);
                p
            }
            Command::WriteMem { addr, data } => {
                let mut p = Vec::with_capacity(2 + data.len());
                write_u16_le(&mut p, *addr);
                p.extend_from_slice(data);
                p
            }
            Command::WriteState { data } => data.clone(),
            Command::GetTbblueReg { reg } => vec![*reg],
            Command::GetSpritesPalette { index } => vec![*index],
            Command::GetSprites { slot, count } => vec![*slot, *count],
            Command::GetSpritePatterns { index, count } => vec![*index, *count],
            Command::SetBorder { color } => vec![*color],
        };
        Frame::new(self.opcode(), payload)
    }
}

/// Remote capability flags returned by `INIT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u8);

impl Capabilities {
    pub const BREAKPOINTS: u8 = 0x01;
    pub const WATCHPOINTS: u8 = 0x02;
    pub const STATE: u8 = 0x04;
    pub const TBBLUE: u8 = 0x08;

    /// Remote supports native software breakpoints.
    pub fn breakpoints(self) -> bool {
        self.0 & Self::BREAKPOINTS != 0
    }

    pub fn watchpoints(self) -> bool {
        self.0 & Self::WATCHPOINTS != 0
    }

    pub fn state(self) -> bool {
        self.0 & Self::STATE != 0
    }

    pub fn tbblue(self) -> bool {
        self.0 & Self::TBBLUE != 0
    }
}

/// Decoded `INIT` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResponse {
    pub version: [u8; 3],
    pub capabilities: Capabilities,
    pub machine: String,
}

impl InitResponse {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 5 {
            return Err(ProtocolError::Malformed(format!(
                "INIT response of {} bytes",
                payload.len()
            )));
        }
        let name_len = payload[4] as usize;
        if payload.len() < 5 + name_len {
            return Err(ProtocolError::Malformed(
                "INIT response truncates machine name".to_string(),
            ));
        }
        let machine = String::from_utf8_lossy(&payload[5..5 + name_len]).to_string();
        Ok(InitResponse {
            version: [payload[0], payload[1], payload[2]],
            capabilities: Capabilities(payload[3]),
            machine,
        })
    }
}

/// Reason byte carried in a pause notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakNumber {
    NoReason = 0,
    ManualBreak = 1,
    BreakpointHit = 2,
    WatchpointRead = 3,
    WatchpointWrite = 4,
}

impl BreakNumber {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(BreakNumber::NoReason),
            1 => Ok(BreakNumber::ManualBreak),
            2 => Ok(BreakNumber::BreakpointHit),
            3 => Ok(BreakNumber::WatchpointRead),
            4 => Ok(BreakNumber::WatchpointWrite),
            other => Err(ProtocolError::Malformed(format!(
                "unknown break number {}",
                other
            ))),
        }
    }
}

/// Decoded `NTF_PAUSE` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseNotification {
    pub break_number: BreakNumber,
    pub break_address: u16,
    /// Remote-supplied reason suffix; may be empty.
    pub reason: String,
}

impl PauseNotification {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(ProtocolError::Malformed(format!(
                "pause notification of {} bytes",
                payload.len()
            )));
        }
        let break_number = BreakNumber::from_u8(payload[0])?;
        let break_address = read_u16_le(payload, 1)?;
        let reason_len = payload[3] as usize;
        if payload.len() < 4 + reason_len {
            return Err(ProtocolError::Malformed(
                "pause notification truncates reason".to_string(),
            ));
        }
        let reason = String::from_utf8_lossy(&payload[4..4 + reason_len]).to_string();
        Ok(PauseNotification {
            break_number,
            break_address,
            reason,
        })
    }

    /// Encode a notification payload. The client never sends these; this
    /// exists for loopback tests and mock remotes.
    pub fn to_payload(&self) -> Vec<u8> {
        let reason = self.reason.as_bytes();
        let mut p = Vec::with_capacity(4 + reason.len());
        p.push(self.break_number as u8);
        write_u16_le(&mut p, self.break_address);
        p.push(reason.len() as u8);
        p.extend_from_slice(reason);
        p
    }
}

/// Decode a `GET_REGISTERS` payload into the canonical word array.
pub fn parse_register_dump(payload: &[u8]) -> Result<[u16; reg::COUNT], ProtocolError> {
    // 12 words + I, R, IM
    if payload.len() < 27 {
        return Err(ProtocolError::Malformed(format!(
            "register dump of {} bytes, expected 27",
            payload.len()
        )));
    }
    let mut words = [0u16; reg::COUNT];
    for (i, word) in words.iter_mut().enumerate().take(12) {
        *word = read_u16_le(payload, i * 2)?;
    }
    words[reg::I as usize] = payload[24] as u16;
    words[reg::R as usize] = payload[25] as u16;
    words[reg::IM as usize] = payload[26] as u16;
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continue_two_breakpoints() {
        let frame = Command::Continue {
            bp1: Some(0x7003),
            bp2: Some(0x1234),
        }
        .encode();
        assert_eq!(frame.opcode, CMD_CONTINUE);
        assert_eq!(
            frame.payload,
            vec![0x01, 0x03, 0x70, 0x01, 0x34, 0x12]
        );
    }

    #[test]
    fn test_continue_no_breakpoints() {
        let frame = Command::Continue { bp1: None, bp2: None }.encode();
        assert_eq!(frame.payload, vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_set_register_width_by_index() {
        let wide = Command::SetRegister {
            index: reg::HL,
            value: 0xBEEF,
        }
        .encode();
        assert_eq!(wide.payload, vec![reg::HL, 0xEF, 0xBE]);

        let narrow = Command::SetRegister {
            index: reg::IM,
            value: 0x0002,
        }
        .encode();
        assert_eq!(narrow.payload, vec![reg::IM, 0x02]);
    }

    #[test]
    fn test_init_response_parse() {
        let mut payload = vec![1, 0, 0, 0x0F, 4];
        payload.extend_from_slice(b"Next");
        let init = InitResponse::parse(&payload).unwrap();
        assert_eq!(init.version, [1, 0, 0]);
        assert!(init.capabilities.breakpoints());
        assert!(init.capabilities.watchpoints());
        assert!(init.capabilities.state());
        assert!(init.capabilities.tbblue());
        assert_eq!(init.machine, "Next");
    }

    #[test]
    fn test_pause_notification_roundtrip() {
        let ntf = PauseNotification {
            break_number: BreakNumber::WatchpointWrite,
            break_address: 0x4000,
            reason: "size=2".to_string(),
        };
        let parsed = PauseNotification::parse(&ntf.to_payload()).unwrap();
        assert_eq!(parsed, ntf);
    }

    #[test]
    fn test_pause_notification_bad_break_number() {
        assert!(PauseNotification::parse(&[9, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_register_dump_layout() {
        let mut payload = Vec::new();
        for i in 0..12u16 {
            write_u16_le(&mut payload, 0x1000 + i);
        }
        payload.extend_from_slice(&[0x3F, 0x7F, 0x01]);
        let words = parse_register_dump(&payload).unwrap();
        assert_eq!(words[reg::PC as usize], 0x1000);
        assert_eq!(words[reg::HL2 as usize], 0x100B);
        assert_eq!(words[reg::I as usize], 0x3F);
        assert_eq!(words[reg::R as usize], 0x7F);
        assert_eq!(words[reg::IM as usize], 0x01);
    }

    #[test]
    fn test_register_dump_too_short() {
        assert!(parse_register_dump(&[0u8; 26]).is_err());
    }
}
