//! Stepping: opcode classification and the step state machine.
//!
//! The remote only offers `CONTINUE(bp1?, bp2?)`. Step-over, step-into and
//! step-out are synthesized here by bounding each resume with up to two
//! single-use PC breakpoints computed from the instruction under PC, and
//! classifying every pause notification against the active step.
//!
//! The opcode helpers stop well short of a disassembler: instruction
//! lengths, static branch targets and the RET/CALL/block families are all
//! the step logic needs.

use dzrp_protocol::BreakNumber;

/// Reason string reported for a manual break.
pub const MANUAL_BREAK_REASON: &str = "Manual break.";

const fn ins_x(op: u8) -> u8 {
    op >> 6
}

const fn ins_y(op: u8) -> u8 {
    (op >> 3) & 0x07
}

const fn ins_z(op: u8) -> u8 {
    op & 0x07
}

const fn ins_q(op: u8) -> u8 {
    (op >> 3) & 0x01
}

/// RET, RETI/RETN and every conditional RET.
pub fn is_ret(op0: u8, op1: u8) -> bool {
    op0 == 0xC9
        || (op0 == 0xED && (op1 == 0x4D || op1 == 0x45))
        || (op0 & 0b1100_0111) == 0b1100_0000
}

/// CALL nn and the conditional CALLs.
pub fn is_call(op: u8) -> bool {
    op == 0xCD || (op & 0b1100_0111) == 0b1100_0100
}

pub fn is_rst(op: u8) -> bool {
    (op & 0b1100_0111) == 0b1100_0111
}

/// LDIR/LDDR/CPIR/CPDR/INIR/INDR/OTIR/OTDR.
pub fn is_block(op0: u8, op1: u8) -> bool {
    op0 == 0xED && (op1 & 0b1111_0100) == 0b1011_0000
}

fn ed_len(op: u8) -> u8 {
    // LD (nn),dd / LD dd,(nn) carry a 16-bit address
    match op {
        0x43 | 0x4B | 0x53 | 0x5B | 0x63 | 0x6B | 0x73 | 0x7B => 4,
        _ => 2,
    }
}

/// Does this unprefixed opcode address memory through (HL)? Under a DD/FD
/// prefix those forms gain a displacement byte.
fn uses_hl_indirect(op: u8) -> bool {
    match op {
        0x76 => false, // HALT
        0x70..=0x77 => true,
        op if (op & 0xC7) == 0x46 => true, // LD r,(HL)
        op if (op & 0xC7) == 0x86 => true, // ALU A,(HL)
        _ => false,
    }
}

fn indexed_len(op1: u8) -> u8 {
    match op1 {
        0xCB => 4,                        // DD CB d op
        0x34 | 0x35 => 3,                 // INC/DEC (IX+d)
        0x36 => 4,                        // LD (IX+d),n
        0xDD | 0xFD | 0xED => 1,          // prefix chain: first byte acts alone
        op if uses_hl_indirect(op) => 2 + main_len(op),
        op => 1 + main_len(op),
    }
}

fn main_len(op: u8) -> u8 {
    match ins_x(op) {
        0 => match ins_z(op) {
            0 => {
                if ins_y(op) <= 1 {
                    1 // NOP, EX AF,AF'
                } else {
                    2 // DJNZ, JR, JR cc
                }
            }
            1 => {
                if ins_q(op) == 0 {
                    3 // LD rp,nn
                } else {
                    1 // ADD HL,rp
                }
            }
            2 => {
                if op & 0x20 == 0 {
                    1 // LD (BC)/(DE),A and back
                } else {
                    3 // LD (nn),HL/A and back
                }
            }
            6 => 2, // LD r,n
            _ => 1,
        },
        1 | 2 => 1,
        _ => match ins_z(op) {
            2 | 4 => 3, // JP cc,nn / CALL cc,nn
            3 => match ins_y(op) {
                0 => 3, // JP nn
                2 | 3 => 2, // OUT (n),A / IN A,(n)
                _ => 1,
            },
            5 => {
                if op == 0xCD {
                    3
                } else {
                    1 // PUSH (prefixes are handled before this table)
                }
            }
            6 => 2, // ALU A,n
            _ => 1,
        },
    }
}

/// Length in bytes of the instruction starting at `bytes[0]`.
pub fn instruction_len(bytes: &[u8]) -> u8 {
    let op0 = bytes.first().copied().unwrap_or(0);
    let op1 = bytes.get(1).copied().unwrap_or(0);
    match op0 {
        0xCB => 2,
        0xED => ed_len(op1),
        0xDD | 0xFD => indexed_len(op1),
        op => main_len(op),
    }
}

/// Statically known branch target, if the instruction has one.
pub fn branch_target(pc: u16, bytes: &[u8]) -> Option<u16> {
    let op0 = bytes.first().copied().unwrap_or(0);
    let imm16 = || {
        let lo = bytes.get(1).copied().unwrap_or(0) as u16;
        let hi = bytes.get(2).copied().unwrap_or(0) as u16;
        hi << 8 | lo
    };
    let rel = || {
        let d = bytes.get(1).copied().unwrap_or(0) as i8;
        pc.wrapping_add(2).wrapping_add(d as u16)
    };
    match op0 {
        0xC3 | 0xCD => Some(imm16()),                          // JP nn, CALL nn
        0x18 | 0x10 => Some(rel()),                            // JR, DJNZ
        0x20 | 0x28 | 0x30 | 0x38 => Some(rel()),              // JR cc
        op if (op & 0xC7) == 0xC2 => Some(imm16()),            // JP cc,nn
        op if (op & 0xC7) == 0xC4 => Some(imm16()),            // CALL cc,nn
        op if (op & 0xC7) == 0xC7 => Some((op & 0x38) as u16), // RST
        _ => None,
    }
}

/// The at-most-two ephemeral PC breakpoints bounding one resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBreakpoints {
    pub bp1: Option<u16>,
    pub bp2: Option<u16>,
}

/// Breakpoints for a step-into: fall-through, plus the branch target when
/// it is statically known.
pub fn step_into_breakpoints(pc: u16, bytes: &[u8]) -> StepBreakpoints {
    let fall = pc.wrapping_add(instruction_len(bytes) as u16);
    let target = branch_target(pc, bytes).filter(|t| *t != fall);
    StepBreakpoints {
        bp1: Some(fall),
        bp2: target,
    }
}

/// Breakpoints for a step-over: call-family and block instructions run to
/// the instruction after; everything else behaves like step-into.
pub fn step_over_breakpoints(pc: u16, bytes: &[u8]) -> StepBreakpoints {
    let op0 = bytes.first().copied().unwrap_or(0);
    let op1 = bytes.get(1).copied().unwrap_or(0);
    if is_call(op0) || is_rst(op0) || is_block(op0, op1) {
        StepBreakpoints {
            bp1: Some(pc.wrapping_add(instruction_len(bytes) as u16)),
            bp2: None,
        }
    } else {
        step_into_breakpoints(pc, bytes)
    }
}

/// What kind of resume is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Continue,
    StepOver,
    StepInto,
    StepOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPhase {
    Idle,
    Running,
    Classifying,
}

/// Result of evaluating the breakpoint table at the pause address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitOutcome {
    /// At least one entry wants to surface the pause.
    pub pause: bool,
    /// User-visible reason (only meaningful when `pause`).
    pub reason: String,
}

/// Everything the classifier needs about one pause notification.
#[derive(Debug)]
pub struct PauseContext {
    pub break_number: BreakNumber,
    pub break_address: u16,
    /// SP and PC from the refreshed register cache.
    pub sp: u16,
    pub pc: u16,
    /// Two bytes at the PC of the previous resume (step-out only).
    pub prev_opcodes: [u8; 2],
    /// Breakpoint/watchpoint evaluation at the pause address, if any
    /// entries were registered there.
    pub hit: Option<HitOutcome>,
    /// Sticky manual-pause flag.
    pub pause_requested: bool,
}

/// What the session should do with the pause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDecision {
    /// Surface the pause; the string is the user-visible reason (empty for
    /// a plain step landing).
    Report(String),
    /// Re-issue the resume with the same ephemeral breakpoints.
    ResumeSame,
    /// Compute a fresh inner step from the current PC and resume.
    ResumeInner,
}

/// Per-resume stepping state.
///
/// Owned bookkeeping, no stored callbacks: the session drives it with
/// `note_resume` before each `CONTINUE` and `on_pause` after each
/// notification.
#[derive(Debug)]
pub struct StepController {
    kind: StepKind,
    phase: StepPhase,
    start_sp: u16,
    prev_sp: u16,
    prev_pc: u16,
}

impl StepController {
    pub fn begin(kind: StepKind, sp: u16, pc: u16) -> Self {
        StepController {
            kind,
            phase: StepPhase::Idle,
            start_sp: sp,
            prev_sp: sp,
            prev_pc: pc,
        }
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    /// PC at the moment the previous resume was issued.
    pub fn prev_pc(&self) -> u16 {
        self.prev_pc
    }

    /// Record SP/PC as the resume goes out.
    pub fn note_resume(&mut self, sp: u16, pc: u16) {
        self.prev_sp = sp;
        self.prev_pc = pc;
        self.phase = StepPhase::Running;
    }

    /// Classify a pause notification.
    pub fn on_pause(&mut self, cx: &PauseContext) -> StepDecision {
        self.phase = StepPhase::Classifying;
        let decision = self.classify(cx);
        self.phase = match decision {
            StepDecision::Report(_) => StepPhase::Idle,
            _ => StepPhase::Running,
        };
        decision
    }

    fn classify(&self, cx: &PauseContext) -> StepDecision {
        // A sticky pause converts any stop that is not a surfacing
        // breakpoint hit into a manual break.
        if cx.pause_requested {
            if cx.break_number == BreakNumber::BreakpointHit {
                if let Some(hit) = &cx.hit {
                    if hit.pause {
                        return StepDecision::Report(hit.reason.clone());
                    }
                }
            }
            return StepDecision::Report(MANUAL_BREAK_REASON.to_string());
        }

        match cx.break_number {
            BreakNumber::ManualBreak => {
                StepDecision::Report(MANUAL_BREAK_REASON.to_string())
            }
            BreakNumber::BreakpointHit
            | BreakNumber::WatchpointRead
            | BreakNumber::WatchpointWrite => match &cx.hit {
                Some(hit) if hit.pause => StepDecision::Report(hit.reason.clone()),
                Some(_) => self.resume_decision(),
                // Nothing registered locally: surface rather than spin.
                None => StepDecision::Report(String::new()),
            },
            BreakNumber::NoReason => match self.kind {
                StepKind::Continue | StepKind::StepInto | StepKind::StepOver => {
                    StepDecision::Report(String::new())
                }
                StepKind::StepOut => {
                    let popped = cx.sp > self.start_sp && cx.sp > self.prev_sp;
                    if popped && is_ret(cx.prev_opcodes[0], cx.prev_opcodes[1]) {
                        StepDecision::Report(String::new())
                    } else {
                        StepDecision::ResumeInner
                    }
                }
            },
        }
    }

    fn resume_decision(&self) -> StepDecision {
        match self.kind {
            // The inner step window has moved; recompute it.
            StepKind::StepOut => StepDecision::ResumeInner,
            _ => StepDecision::ResumeSame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ret_classification() {
        assert!(is_ret(0xC9, 0x00)); // RET
        assert!(is_ret(0xED, 0x4D)); // RETI
        assert!(is_ret(0xED, 0x45)); // RETN
        assert!(is_ret(0xC8, 0x00)); // RET Z
        for op in [0xC0, 0xD0, 0xD8, 0xE0, 0xE8, 0xF0, 0xF8] {
            assert!(is_ret(op, 0x00), "RET cc {:#04x}", op);
        }
        assert!(!is_ret(0xD9, 0x00)); // EXX
        assert!(!is_ret(0xC1, 0x00)); // POP BC
        assert!(!is_ret(0xED, 0x44)); // NEG
        assert!(!is_ret(0x00, 0xC9)); // NOP before a RET
    }

    #[test]
    fn test_instruction_lengths() {
        let cases: &[(&[u8], u8)] = &[
            (&[0x00], 1),             // NOP
            (&[0x3E, 0x42], 2),       // LD A,n
            (&[0x01, 0x34, 0x12], 3), // LD BC,nn
            (&[0x18, 0x05], 2),       // JR d
            (&[0x10, 0xF0], 2),       // DJNZ d
            (&[0x22, 0x00, 0x40], 3), // LD (nn),HL
            (&[0x3A, 0x00, 0x40], 3), // LD A,(nn)
            (&[0x0A], 1),             // LD A,(BC)
            (&[0x76], 1),             // HALT
            (&[0xCD, 0x34, 0x12], 3), // CALL nn
            (&[0xC4, 0x34, 0x12], 3), // CALL NZ,nn
            (&[0xC3, 0x34, 0x12], 3), // JP nn
            (&[0xC7], 1),             // RST 0
            (&[0xC9], 1),             // RET
            (&[0xD3, 0xFE], 2),       // OUT (n),A
            (&[0xDB, 0xFE], 2),       // IN A,(n)
            (&[0xC6, 0x01], 2),       // ADD A,n
            (&[0xE3], 1),             // EX (SP),HL
            (&[0xCB, 0x47], 2),       // BIT 0,A
            (&[0xED, 0xB0], 2),       // LDIR
            (&[0xED, 0x4B, 0x00, 0x40], 4), // LD BC,(nn)
            (&[0xDD, 0x21, 0x00, 0x40], 4), // LD IX,nn
            (&[0xDD, 0x34, 0x01], 3), // INC (IX+d)
            (&[0xDD, 0x36, 0x01, 0x42], 4), // LD (IX+d),n
            (&[0xDD, 0xCB, 0x01, 0x46], 4), // BIT 0,(IX+d)
            (&[0xDD, 0x7E, 0x01], 3), // LD A,(IX+d)
            (&[0xDD, 0x86, 0x01], 3), // ADD A,(IX+d)
            (&[0xFD, 0xE5], 2),       // PUSH IY
            (&[0xFD, 0xE9], 2),       // JP (IY)
            (&[0xDD, 0xDD, 0x00], 1), // stray prefix
        ];
        for (bytes, len) in cases {
            assert_eq!(
                instruction_len(bytes),
                *len,
                "length of {:02X?}",
                bytes
            );
        }
    }

    #[test]
    fn test_branch_targets() {
        assert_eq!(branch_target(0x7000, &[0xCD, 0x34, 0x12]), Some(0x1234));
        assert_eq!(branch_target(0x7000, &[0xC3, 0x00, 0x80]), Some(0x8000));
        assert_eq!(branch_target(0x7000, &[0xDC, 0x00, 0x90]), Some(0x9000)); // CALL C,nn
        assert_eq!(branch_target(0x8000, &[0x18, 0xFE]), Some(0x8000)); // JR -2
        assert_eq!(branch_target(0x1000, &[0x20, 0x05]), Some(0x1007)); // JR NZ,+5
        assert_eq!(branch_target(0x1000, &[0x10, 0xF0]), Some(0x0FF2)); // DJNZ -16
        assert_eq!(branch_target(0x1000, &[0xFF, 0x00]), Some(0x0038)); // RST 38h
        assert_eq!(branch_target(0x1000, &[0x3E, 0x42]), None);
        assert_eq!(branch_target(0x1000, &[0xC9]), None); // RET: not static
        assert_eq!(branch_target(0x1000, &[0xE9]), None); // JP (HL): not static
    }

    #[test]
    fn test_step_over_call_uses_one_breakpoint() {
        let bps = step_over_breakpoints(0x7000, &[0xCD, 0x34, 0x12]);
        assert_eq!(bps.bp1, Some(0x7003));
        assert_eq!(bps.bp2, None);
    }

    #[test]
    fn test_step_over_block_instruction() {
        let bps = step_over_breakpoints(0x7000, &[0xED, 0xB0]);
        assert_eq!(bps.bp1, Some(0x7002));
        assert_eq!(bps.bp2, None);
    }

    #[test]
    fn test_step_into_call_covers_target() {
        let bps = step_into_breakpoints(0x7000, &[0xCD, 0x34, 0x12]);
        assert_eq!(bps.bp1, Some(0x7003));
        assert_eq!(bps.bp2, Some(0x1234));
    }

    #[test]
    fn test_step_over_conditional_jump_covers_both_paths() {
        let bps = step_over_breakpoints(0x1000, &[0x20, 0x05]);
        assert_eq!(bps.bp1, Some(0x1002));
        assert_eq!(bps.bp2, Some(0x1007));
    }

    #[test]
    fn test_step_wraps_at_address_space_end() {
        let bps = step_into_breakpoints(0xFFFF, &[0x00]);
        assert_eq!(bps.bp1, Some(0x0000));
        assert_eq!(bps.bp2, None);
    }

    fn pause_cx(
        break_number: BreakNumber,
        sp: u16,
        prev_opcodes: [u8; 2],
        hit: Option<HitOutcome>,
        pause_requested: bool,
    ) -> PauseContext {
        PauseContext {
            break_number,
            break_address: 0,
            sp,
            pc: 0x9000,
            prev_opcodes,
            hit,
            pause_requested,
        }
    }

    #[test]
    fn test_step_out_terminates_on_popped_ret() {
        let mut ctl = StepController::begin(StepKind::StepOut, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        let cx = pause_cx(BreakNumber::NoReason, 0x8002, [0xC9, 0x00], None, false);
        assert_eq!(ctl.on_pause(&cx), StepDecision::Report(String::new()));
    }

    #[test]
    fn test_step_out_continues_without_pop() {
        let mut ctl = StepController::begin(StepKind::StepOut, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        // RET NZ not taken: SP unchanged
        let cx = pause_cx(BreakNumber::NoReason, 0x8000, [0xC0, 0x00], None, false);
        assert_eq!(ctl.on_pause(&cx), StepDecision::ResumeInner);
    }

    #[test]
    fn test_step_out_continues_on_pop_without_ret() {
        let mut ctl = StepController::begin(StepKind::StepOut, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        // POP BC raised SP but the opcode is not a return
        let cx = pause_cx(BreakNumber::NoReason, 0x8002, [0xC1, 0x00], None, false);
        assert_eq!(ctl.on_pause(&cx), StepDecision::ResumeInner);
    }

    #[test]
    fn test_step_out_push_pop_pair_does_not_terminate() {
        let mut ctl = StepController::begin(StepKind::StepOut, 0x8000, 0x7000);
        // A PUSH lowered SP below start...
        ctl.note_resume(0x7FFE, 0x7000);
        // ...then a POP brought it back to the starting level: sp is not
        // above start_sp, so this is not a return out of the frame.
        let cx = pause_cx(BreakNumber::NoReason, 0x8000, [0xC1, 0x00], None, false);
        assert_eq!(ctl.on_pause(&cx), StepDecision::ResumeInner);
    }

    #[test]
    fn test_manual_pause_forces_manual_break() {
        let mut ctl = StepController::begin(StepKind::Continue, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        let cx = pause_cx(BreakNumber::NoReason, 0x8000, [0, 0], None, true);
        assert_eq!(
            ctl.on_pause(&cx),
            StepDecision::Report(MANUAL_BREAK_REASON.to_string())
        );
    }

    #[test]
    fn test_manual_pause_keeps_real_breakpoint_reason() {
        let mut ctl = StepController::begin(StepKind::Continue, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        let hit = HitOutcome {
            pause: true,
            reason: "Breakpoint hit @9000h.".to_string(),
        };
        let cx = pause_cx(BreakNumber::BreakpointHit, 0x8000, [0, 0], Some(hit), true);
        assert_eq!(
            ctl.on_pause(&cx),
            StepDecision::Report("Breakpoint hit @9000h.".to_string())
        );
    }

    #[test]
    fn test_suppressed_hit_resumes() {
        let mut ctl = StepController::begin(StepKind::StepOver, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        let hit = HitOutcome {
            pause: false,
            reason: String::new(),
        };
        let cx = pause_cx(
            BreakNumber::BreakpointHit,
            0x8000,
            [0, 0],
            Some(hit.clone()),
            false,
        );
        assert_eq!(ctl.on_pause(&cx), StepDecision::ResumeSame);

        let mut ctl = StepController::begin(StepKind::StepOut, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        let cx = pause_cx(BreakNumber::BreakpointHit, 0x8000, [0, 0], Some(hit), false);
        assert_eq!(ctl.on_pause(&cx), StepDecision::ResumeInner);
    }

    #[test]
    fn test_step_landing_reports_empty_reason() {
        let mut ctl = StepController::begin(StepKind::StepInto, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        let cx = pause_cx(BreakNumber::NoReason, 0x8000, [0, 0], None, false);
        assert_eq!(ctl.on_pause(&cx), StepDecision::Report(String::new()));
    }

    #[test]
    fn test_watchpoint_hit_surfaces() {
        let mut ctl = StepController::begin(StepKind::Continue, 0x8000, 0x7000);
        ctl.note_resume(0x8000, 0x7000);
        let hit = HitOutcome {
            pause: true,
            reason: "Watchpoint write access at address 0x4000 (16384).".to_string(),
        };
        let cx = pause_cx(BreakNumber::WatchpointWrite, 0x8000, [0, 0], Some(hit), false);
        assert!(matches!(ctl.on_pause(&cx), StepDecision::Report(r) if r.starts_with("Watchpoint")));
    }
}
