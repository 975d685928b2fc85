//! Canonical Z80 register snapshot and the cache discipline around it.
//!
//! The snapshot is the ordered word array the remote uses on the wire (see
//! `dzrp_protocol::reg` for the index assignment). `I`, `R` and `IM` live
//! in the low byte of their word.

use dzrp_protocol::command::{parse_register_dump, reg};

use crate::error::DebugError;

/// One register snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    words: [u16; reg::COUNT],
}

impl Registers {
    pub fn from_payload(payload: &[u8]) -> Result<Self, DebugError> {
        let words = parse_register_dump(payload)
            .map_err(|e| DebugError::Protocol(e.to_string()))?;
        Ok(Registers { words })
    }

    pub fn word(&self, index: u8) -> u16 {
        self.words[index as usize]
    }

    pub fn set_word(&mut self, index: u8, value: u16) {
        self.words[index as usize] = value;
    }

    pub fn pc(&self) -> u16 {
        self.words[reg::PC as usize]
    }

    pub fn sp(&self) -> u16 {
        self.words[reg::SP as usize]
    }

    /// Resolved value of a named register or register half.
    pub fn value_of(&self, spec: RegisterSpec) -> u16 {
        match spec {
            RegisterSpec::Word(i) => self.word(i),
            RegisterSpec::High(i) => self.word(i) >> 8,
            RegisterSpec::Low(i) => self.word(i) & 0xFF,
        }
    }
}

/// How a register name maps onto the word array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSpec {
    Word(u8),
    High(u8),
    Low(u8),
}

impl RegisterSpec {
    pub fn index(self) -> u8 {
        match self {
            RegisterSpec::Word(i) | RegisterSpec::High(i) | RegisterSpec::Low(i) => i,
        }
    }
}

/// Resolve a register name (case-insensitive, shadow names with `'`).
pub fn lookup_register(name: &str) -> Option<RegisterSpec> {
    use RegisterSpec::{High, Low, Word};
    let upper = name.to_ascii_uppercase();
    let spec = match upper.as_str() {
        "PC" => Word(reg::PC),
        "SP" => Word(reg::SP),
        "AF" => Word(reg::AF),
        "BC" => Word(reg::BC),
        "DE" => Word(reg::DE),
        "HL" => Word(reg::HL),
        "IX" => Word(reg::IX),
        "IY" => Word(reg::IY),
        "AF'" => Word(reg::AF2),
        "BC'" => Word(reg::BC2),
        "DE'" => Word(reg::DE2),
        "HL'" => Word(reg::HL2),
        "I" => Word(reg::I),
        "R" => Word(reg::R),
        "IM" => Word(reg::IM),
        "A" => High(reg::AF),
        "F" => Low(reg::AF),
        "B" => High(reg::BC),
        "C" => Low(reg::BC),
        "D" => High(reg::DE),
        "E" => Low(reg::DE),
        "H" => High(reg::HL),
        "L" => Low(reg::HL),
        "A'" => High(reg::AF2),
        "F'" => Low(reg::AF2),
        "B'" => High(reg::BC2),
        "C'" => Low(reg::BC2),
        "D'" => High(reg::DE2),
        "E'" => Low(reg::DE2),
        "H'" => High(reg::HL2),
        "L'" => Low(reg::HL2),
        "IXH" => High(reg::IX),
        "IXL" => Low(reg::IX),
        "IYH" => High(reg::IY),
        "IYL" => Low(reg::IY),
        _ => return None,
    };
    Some(spec)
}

/// Cached snapshot with a validity flag.
///
/// Single writer (the dispatcher installs fresh snapshots), single reader
/// (stepping controller and expression evaluator). Invalidated before any
/// resume, on register writes, on snapshot/state loads and on disconnect.
#[derive(Debug, Default)]
pub struct RegisterCache {
    regs: Registers,
    valid: bool,
}

impl RegisterCache {
    pub fn install(&mut self, regs: Registers) {
        self.regs = regs;
        self.valid = true;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn get(&self) -> Option<Registers> {
        if self.valid {
            Some(self.regs)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Registers {
        let mut regs = Registers::default();
        regs.set_word(reg::AF, 0x42A5);
        regs.set_word(reg::HL, 0x1234);
        regs.set_word(reg::AF2, 0x9B01);
        regs.set_word(reg::I, 0x3F);
        regs
    }

    #[test]
    fn test_lookup_words_and_halves() {
        let regs = sample();
        let a = lookup_register("a").unwrap();
        assert_eq!(regs.value_of(a), 0x42);
        let f = lookup_register("F").unwrap();
        assert_eq!(regs.value_of(f), 0xA5);
        let hl = lookup_register("HL").unwrap();
        assert_eq!(regs.value_of(hl), 0x1234);
        let shadow_a = lookup_register("A'").unwrap();
        assert_eq!(regs.value_of(shadow_a), 0x9B);
        assert_eq!(regs.value_of(lookup_register("I").unwrap()), 0x3F);
        assert!(lookup_register("XY").is_none());
    }

    #[test]
    fn test_cache_invalidation() {
        let mut cache = RegisterCache::default();
        assert!(cache.get().is_none());
        cache.install(sample());
        assert_eq!(cache.get().unwrap().word(reg::HL), 0x1234);
        cache.invalidate();
        assert!(cache.get().is_none());
    }
}
