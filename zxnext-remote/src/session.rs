//! The consumer-facing debug session.
//!
//! [`ZxNextRemote`] owns the connection, register cache, breakpoint table
//! and the per-resume stepping controller, and exposes the operation
//! contract the rest of the debugger builds on.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Instant;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use dzrp_protocol::{
    fmt_hex, BreakNumber, Capabilities, Command, PauseNotification, ProtocolError, WatchAccess,
};

use crate::breakpoints::{Breakpoint, BreakpointKind, BreakpointTable, Watchpoint};
use crate::connection::{DzrpConnection, PauseHandle};
use crate::error::DebugError;
use crate::events::{EventSink, LabelResolver, LogEventSink, NoLabels};
use crate::expr;
use crate::installer::{BreakpointInstaller, ProtocolInstaller, TrapInstaller};
use crate::registers::{lookup_register, RegisterCache, RegisterSpec, Registers};
use crate::settings::Settings;
use crate::snapshot::{self, SnapshotImage};
use crate::step::{
    self, PauseContext, StepBreakpoints, StepController, StepDecision, StepKind,
};

/// Result of a step-over or step-into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepResult {
    /// Hex byte dump of the instruction the step started on.
    pub instruction: String,
    /// Break reason if the step surfaced something other than a plain
    /// landing.
    pub reason: Option<String>,
}

struct ResumeOutcome {
    reason: String,
    instruction: String,
}

/// A debug session against one DZRP remote.
pub struct ZxNextRemote {
    conn: DzrpConnection,
    settings: Settings,
    regs: RegisterCache,
    table: BreakpointTable,
    installer: Box<dyn BreakpointInstaller>,
    events: Box<dyn EventSink>,
    labels: Box<dyn LabelResolver>,
    capabilities: Capabilities,
    machine: String,
    warned_conditions: HashSet<String>,
}

impl ZxNextRemote {
    /// Connect, run the INIT exchange and pick the breakpoint installer
    /// from the capability bits. Auto-loads a snapshot if the settings
    /// name one.
    pub fn connect(settings: Settings) -> Result<Self, DebugError> {
        let mut conn = DzrpConnection::open(
            &settings.endpoint,
            settings.connect_timeout,
            settings.response_timeout,
        )?;
        let init = conn.init()?;
        let installer: Box<dyn BreakpointInstaller> = if init.capabilities.breakpoints() {
            Box::new(ProtocolInstaller)
        } else {
            Box::new(TrapInstaller::new())
        };
        let mut session = ZxNextRemote {
            conn,
            settings,
            regs: RegisterCache::default(),
            table: BreakpointTable::new(),
            installer,
            events: Box::new(LogEventSink),
            labels: Box::new(NoLabels),
            capabilities: init.capabilities,
            machine: init.machine,
            warned_conditions: HashSet::new(),
        };
        if let Some(path) = session.settings.auto_load.clone() {
            session.load_snapshot(&path)?;
        }
        Ok(session)
    }

    pub fn set_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.events = sink;
    }

    pub fn set_label_resolver(&mut self, labels: Box<dyn LabelResolver>) {
        self.labels = labels;
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Handle for pausing a running program from another thread.
    pub fn pause_handle(&self) -> PauseHandle {
        self.conn.pause_handle()
    }

    /// Request a pause of the current resume.
    pub fn pause(&self) -> Result<(), DebugError> {
        self.conn.pause_handle().pause()
    }

    // ---- registers ----

    /// Current register snapshot, fetching it if the cache is invalid.
    pub fn get_registers(&mut self) -> Result<Registers, DebugError> {
        if let Some(regs) = self.regs.get() {
            return Ok(regs);
        }
        let payload = self.conn.transact(&Command::GetRegisters)?;
        let regs = Registers::from_payload(&payload)?;
        self.regs.install(regs);
        Ok(regs)
    }

    /// Write a register by name and return the value it actually holds.
    pub fn set_register(&mut self, name: &str, value: u16) -> Result<u16, DebugError> {
        self.ensure_idle("set a register")?;
        let spec = lookup_register(name)
            .ok_or_else(|| DebugError::Validation(format!("unknown register '{}'", name)))?;
        let index = spec.index();
        let word = match spec {
            RegisterSpec::Word(_) => value,
            RegisterSpec::High(_) => {
                (self.get_registers()?.word(index) & 0x00FF) | ((value & 0xFF) << 8)
            }
            RegisterSpec::Low(_) => {
                (self.get_registers()?.word(index) & 0xFF00) | (value & 0xFF)
            }
        };
        self.conn.transact(&Command::SetRegister { index, value: word })?;
        self.regs.invalidate();
        Ok(self.get_registers()?.value_of(spec))
    }

    // ---- memory ----

    pub fn read_memory(&mut self, addr: u16, size: u16) -> Result<Vec<u8>, DebugError> {
        self.conn.read_mem(addr, size)
    }

    pub fn write_memory(&mut self, addr: u16, data: &[u8]) -> Result<(), DebugError> {
        self.conn.write_mem(addr, data)
    }

    // ---- breakpoints ----

    /// Install a user breakpoint. Returns the breakpoint id, or 0 (with a
    /// warning) when the request is invalid or the remote is exhausted.
    pub fn set_breakpoint(
        &mut self,
        addr: i64,
        condition: Option<&str>,
        log: Option<&str>,
    ) -> Result<u16, DebugError> {
        self.ensure_idle("set a breakpoint")?;
        if !(0..=0xFFFF).contains(&addr) {
            self.events
                .warning(&format!("breakpoint address {:#x} is out of range", addr));
            return Ok(0);
        }
        let addr = addr as u16;
        let id = self.installer.add(&mut self.conn, addr)?;
        if id == 0 {
            self.events.warning("remote has no free breakpoints");
            return Ok(0);
        }
        let inserted = self.table.insert_user(Breakpoint {
            id,
            address: addr,
            condition: condition.map(str::to_string),
            log: log.map(str::to_string),
            kind: BreakpointKind::User,
        });
        if !inserted {
            self.events
                .warning(&format!("remote reused breakpoint id {}", id));
            let _ = self.installer.remove(&mut self.conn, id, addr);
            return Ok(0);
        }
        Ok(id)
    }

    pub fn remove_breakpoint(&mut self, id: u16) -> Result<(), DebugError> {
        self.ensure_idle("remove a breakpoint")?;
        let bp = self
            .table
            .remove_user(id)
            .ok_or_else(|| DebugError::Validation(format!("unknown breakpoint id {}", id)))?;
        self.installer.remove(&mut self.conn, id, bp.address)
    }

    /// Replace the assertion set. Each entry is `(address, violation
    /// predicate)`: the assert pauses when the predicate evaluates true.
    pub fn set_assert_breakpoints(
        &mut self,
        asserts: &[(u16, String)],
    ) -> Result<(), DebugError> {
        self.ensure_idle("change assertions")?;
        let new: Vec<Breakpoint> = asserts
            .iter()
            .map(|(addr, cond)| Breakpoint {
                id: 0,
                address: *addr,
                condition: Some(cond.clone()),
                log: None,
                kind: BreakpointKind::Assert,
            })
            .collect();
        let old = self.table.replace_asserts(new);
        if self.table.asserts_enabled() {
            for bp in old {
                if bp.id != 0 {
                    self.installer.remove(&mut self.conn, bp.id, bp.address)?;
                }
            }
            self.install_asserts()?;
        }
        Ok(())
    }

    pub fn enable_asserts(&mut self, enable: bool) -> Result<(), DebugError> {
        self.ensure_idle("toggle assertions")?;
        if enable == self.table.asserts_enabled() {
            return Ok(());
        }
        if enable {
            self.install_asserts()?;
        } else {
            self.uninstall_asserts()?;
        }
        self.table.set_asserts_enabled(enable);
        Ok(())
    }

    fn install_asserts(&mut self) -> Result<(), DebugError> {
        for i in 0..self.table.asserts().len() {
            let addr = self.table.asserts()[i].address;
            let id = self.installer.add(&mut self.conn, addr)?;
            self.table.asserts_mut()[i].id = id;
        }
        Ok(())
    }

    fn uninstall_asserts(&mut self) -> Result<(), DebugError> {
        for i in 0..self.table.asserts().len() {
            let (id, addr) = {
                let bp = &self.table.asserts()[i];
                (bp.id, bp.address)
            };
            if id != 0 {
                self.installer.remove(&mut self.conn, id, addr)?;
                self.table.asserts_mut()[i].id = 0;
            }
        }
        Ok(())
    }

    /// Replace one logpoint group. Entries are `(address, format string)`.
    pub fn set_logpoints(
        &mut self,
        group: &str,
        points: &[(u16, String)],
    ) -> Result<(), DebugError> {
        self.ensure_idle("change logpoints")?;
        let new: Vec<Breakpoint> = points
            .iter()
            .map(|(addr, fmt)| Breakpoint {
                id: 0,
                address: *addr,
                condition: None,
                log: Some(fmt.clone()),
                kind: BreakpointKind::Log,
            })
            .collect();
        let old = self.table.replace_logpoints(group, new);
        if self.table.group_enabled(group) {
            for bp in old {
                if bp.id != 0 {
                    self.installer.remove(&mut self.conn, bp.id, bp.address)?;
                }
            }
            self.install_logpoint_group(group)?;
        }
        Ok(())
    }

    /// Enable or disable logpoint groups by name.
    pub fn enable_logpoints(&mut self, groups: &[&str], enable: bool) -> Result<(), DebugError> {
        self.ensure_idle("toggle logpoints")?;
        for group in groups {
            if self.table.logpoint_group_mut(group).is_none() {
                self.events
                    .warning(&format!("unknown logpoint group '{}'", group));
                continue;
            }
            if self.table.group_enabled(group) == enable {
                continue;
            }
            if enable {
                self.install_logpoint_group(group)?;
            } else {
                self.uninstall_logpoint_group(group)?;
            }
            self.table.set_group_enabled(group, enable);
        }
        Ok(())
    }

    fn install_logpoint_group(&mut self, group: &str) -> Result<(), DebugError> {
        let addresses: Vec<u16> = match self.table.logpoint_group_mut(group) {
            Some(points) => points.iter().map(|bp| bp.address).collect(),
            None => return Ok(()),
        };
        for (i, addr) in addresses.into_iter().enumerate() {
            let id = self.installer.add(&mut self.conn, addr)?;
            if let Some(points) = self.table.logpoint_group_mut(group) {
                points[i].id = id;
            }
        }
        Ok(())
    }

    fn uninstall_logpoint_group(&mut self, group: &str) -> Result<(), DebugError> {
        let installed: Vec<(u16, u16)> = match self.table.logpoint_group_mut(group) {
            Some(points) => points
                .iter()
                .filter(|bp| bp.id != 0)
                .map(|bp| (bp.id, bp.address))
                .collect(),
            None => return Ok(()),
        };
        for (id, addr) in installed {
            self.installer.remove(&mut self.conn, id, addr)?;
        }
        if let Some(points) = self.table.logpoint_group_mut(group) {
            for bp in points.iter_mut() {
                bp.id = 0;
            }
        }
        Ok(())
    }

    // ---- watchpoints ----

    pub fn set_watchpoint(
        &mut self,
        addr: u16,
        size: u16,
        access: WatchAccess,
        condition: Option<&str>,
    ) -> Result<(), DebugError> {
        self.ensure_idle("set a watchpoint")?;
        if !self.capabilities.watchpoints() {
            return Err(DebugError::Unsupported("watchpoints"));
        }
        if size == 0 {
            return Err(DebugError::Validation(
                "watchpoint size must be nonzero".to_string(),
            ));
        }
        self.conn
            .transact(&Command::AddWatchpoint { addr, size, access })?;
        self.table.add_watchpoint(Watchpoint {
            address: addr,
            size,
            access,
            condition: condition.map(str::to_string),
        });
        Ok(())
    }

    pub fn remove_watchpoint(&mut self, addr: u16, size: u16) -> Result<(), DebugError> {
        self.ensure_idle("remove a watchpoint")?;
        self.table
            .remove_watchpoint(addr, size)
            .ok_or_else(|| {
                DebugError::Validation(format!(
                    "no watchpoint at {:#06x} with size {}",
                    addr, size
                ))
            })?;
        self.conn
            .transact(&Command::RemoveWatchpoint { addr, size })?;
        Ok(())
    }

    // ---- execution control ----

    /// Run until a breakpoint, watchpoint or manual pause. Returns the
    /// user-visible break reason.
    pub fn resume(&mut self) -> Result<String, DebugError> {
        Ok(self.run_resume(StepKind::Continue)?.reason)
    }

    pub fn step_into(&mut self) -> Result<StepResult, DebugError> {
        self.step(StepKind::StepInto)
    }

    pub fn step_over(&mut self) -> Result<StepResult, DebugError> {
        self.step(StepKind::StepOver)
    }

    pub fn step_out(&mut self) -> Result<String, DebugError> {
        Ok(self.run_resume(StepKind::StepOut)?.reason)
    }

    fn step(&mut self, kind: StepKind) -> Result<StepResult, DebugError> {
        let outcome = self.run_resume(kind)?;
        Ok(StepResult {
            instruction: outcome.instruction,
            reason: if outcome.reason.is_empty() {
                None
            } else {
                Some(outcome.reason)
            },
        })
    }

    fn run_resume(&mut self, kind: StepKind) -> Result<ResumeOutcome, DebugError> {
        if self.conn.is_resuming() {
            return Err(DebugError::Validation(
                "a resume is already in flight".to_string(),
            ));
        }
        // A pause requested while idle belongs to no resume.
        self.conn.clear_pause_request();
        self.table.rebuild_index();

        let regs = self.get_registers()?;
        let mut pc = regs.pc();
        let mut sp = regs.sp();

        let instruction = if kind == StepKind::Continue {
            String::new()
        } else {
            let bytes = self.read_instruction(pc)?;
            let len = step::instruction_len(&bytes) as usize;
            fmt_hex(&bytes[..len])
        };

        let mut controller = StepController::begin(kind, sp, pc);
        let mut bps = self.initial_breakpoints(kind, pc)?;
        let started = Instant::now();

        loop {
            controller.note_resume(sp, pc);
            self.regs.invalidate();
            self.conn.transact(&Command::Continue {
                bp1: bps.bp1,
                bp2: bps.bp2,
            })?;
            let ntf = self.conn.wait_pause()?;

            let regs = self.get_registers()?;
            pc = regs.pc();
            sp = regs.sp();

            let prev_opcodes = if kind == StepKind::StepOut {
                let bytes = self.conn.read_mem(controller.prev_pc(), 2)?;
                [bytes[0], bytes[1]]
            } else {
                [0, 0]
            };

            let hit = self.evaluate_pause(&ntf, regs)?;
            let cx = PauseContext {
                break_number: ntf.break_number,
                break_address: ntf.break_address,
                sp,
                pc,
                prev_opcodes,
                hit,
                pause_requested: self.conn.pause_requested(),
            };

            match controller.on_pause(&cx) {
                StepDecision::Report(reason) => {
                    self.conn.clear_pause_request();
                    return Ok(ResumeOutcome {
                        reason,
                        instruction,
                    });
                }
                StepDecision::ResumeSame => {}
                StepDecision::ResumeInner => {
                    bps = self.inner_step_breakpoints(pc)?;
                }
            }

            if kind == StepKind::StepOut && started.elapsed() > self.settings.step_out_watchdog
            {
                log::warn!(
                    "step-out gave up after {:.1?} without leaving the frame",
                    started.elapsed()
                );
                return Err(DebugError::Transport(ProtocolError::Timeout));
            }
        }
    }

    fn initial_breakpoints(
        &mut self,
        kind: StepKind,
        pc: u16,
    ) -> Result<StepBreakpoints, DebugError> {
        Ok(match kind {
            StepKind::Continue => StepBreakpoints {
                bp1: None,
                bp2: None,
            },
            // Step-out is a repeated step-into.
            StepKind::StepInto | StepKind::StepOut => self.inner_step_breakpoints(pc)?,
            StepKind::StepOver => {
                let bytes = self.read_instruction(pc)?;
                let bps = step::step_over_breakpoints(pc, &bytes);
                self.augment_dynamic_target(&bytes, bps)?
            }
        })
    }

    fn inner_step_breakpoints(&mut self, pc: u16) -> Result<StepBreakpoints, DebugError> {
        let bytes = self.read_instruction(pc)?;
        let bps = step::step_into_breakpoints(pc, &bytes);
        self.augment_dynamic_target(&bytes, bps)
    }

    /// RET-family and register-indirect jumps have no static target, but
    /// at step time the destination sits in the stack top or a register;
    /// reading it tightens the step window so the landing is caught.
    fn augment_dynamic_target(
        &mut self,
        bytes: &[u8; 4],
        mut bps: StepBreakpoints,
    ) -> Result<StepBreakpoints, DebugError> {
        if bps.bp2.is_some() {
            return Ok(bps);
        }
        let target = self.dynamic_target(bytes)?;
        bps.bp2 = target.filter(|t| Some(*t) != bps.bp1);
        Ok(bps)
    }

    fn dynamic_target(&mut self, bytes: &[u8; 4]) -> Result<Option<u16>, DebugError> {
        use dzrp_protocol::reg;
        let (op0, op1) = (bytes[0], bytes[1]);
        if step::is_ret(op0, op1) {
            let sp = self.get_registers()?.sp();
            let data = self.conn.read_mem(sp, 2)?;
            return Ok(Some(u16::from_le_bytes([data[0], data[1]])));
        }
        Ok(match (op0, op1) {
            (0xE9, _) => Some(self.get_registers()?.word(reg::HL)),
            (0xDD, 0xE9) => Some(self.get_registers()?.word(reg::IX)),
            (0xFD, 0xE9) => Some(self.get_registers()?.word(reg::IY)),
            _ => None,
        })
    }

    /// Read up to four instruction bytes at PC, zero-padded at the end of
    /// the address space.
    fn read_instruction(&mut self, pc: u16) -> Result<[u8; 4], DebugError> {
        let available = (0x10000u32 - pc as u32).min(4) as u16;
        let data = self.conn.read_mem(pc, available)?;
        let mut bytes = [0u8; 4];
        bytes[..data.len()].copy_from_slice(&data);
        Ok(bytes)
    }

    // ---- pause classification ----

    fn evaluate_pause(
        &mut self,
        ntf: &PauseNotification,
        regs: Registers,
    ) -> Result<Option<step::HitOutcome>, DebugError> {
        match ntf.break_number {
            BreakNumber::BreakpointHit => Ok(self.evaluate_breakpoint_hit(ntf.break_address, regs)),
            BreakNumber::WatchpointRead | BreakNumber::WatchpointWrite => {
                Ok(Some(self.evaluate_watchpoint_hit(ntf, regs)))
            }
            _ => Ok(None),
        }
    }

    fn evaluate_breakpoint_hit(
        &mut self,
        addr: u16,
        regs: Registers,
    ) -> Option<step::HitOutcome> {
        let entries: Vec<Breakpoint> = self.table.hits_at(addr).to_vec();
        if entries.is_empty() {
            return None;
        }
        let mut pause = false;
        let mut assert_reason: Option<String> = None;
        let mut plain_reason: Option<String> = None;

        for bp in &entries {
            let satisfied = match &bp.condition {
                None => true,
                Some(cond) => self.eval_condition(cond, regs),
            };
            if !satisfied {
                continue;
            }
            if let Some(fmt) = &bp.log {
                // A satisfied entry with a log line never pauses.
                match expr::format_log(fmt, &regs, &mut self.conn) {
                    Ok(text) => self.events.logpoint(&text),
                    Err(e) => self.warn_condition_once(fmt, &e.to_string()),
                }
                continue;
            }
            pause = true;
            if bp.kind == BreakpointKind::Assert {
                if assert_reason.is_none() {
                    let cond = bp.condition.clone().unwrap_or_default();
                    assert_reason = Some(format!("Assertion failed: {}", cond));
                }
            } else if plain_reason.is_none() {
                let mut reason = format!("Breakpoint hit @{:04X}h.", addr);
                if let Some(cond) = &bp.condition {
                    reason.push_str(&format!(" Condition: {}", cond));
                }
                plain_reason = Some(reason);
            }
        }

        Some(step::HitOutcome {
            pause,
            reason: assert_reason.or(plain_reason).unwrap_or_default(),
        })
    }

    fn evaluate_watchpoint_hit(
        &mut self,
        ntf: &PauseNotification,
        regs: Registers,
    ) -> step::HitOutcome {
        let write = ntf.break_number == BreakNumber::WatchpointWrite;
        let watchpoints: Vec<Watchpoint> = self
            .table
            .watchpoints_covering(ntf.break_address, write)
            .into_iter()
            .cloned()
            .collect();

        // No local record (remote-only watchpoint) means no guard to check.
        let satisfied = watchpoints.is_empty()
            || watchpoints.iter().any(|wp| match wp.condition.clone() {
                None => true,
                Some(cond) => self.eval_condition(&cond, regs),
            });
        if !satisfied {
            return step::HitOutcome {
                pause: false,
                reason: String::new(),
            };
        }

        let access = if write { "write" } else { "read" };
        let mut parts = self.labels.labels_for(ntf.break_address);
        parts.push(format!("{}", ntf.break_address));
        let mut reason = format!(
            "Watchpoint {} access at address 0x{:04X} ({}).",
            access,
            ntf.break_address,
            parts.join(", ")
        );
        if !ntf.reason.is_empty() {
            reason.push(' ');
            reason.push_str(&ntf.reason);
        }
        step::HitOutcome {
            pause: true,
            reason,
        }
    }

    fn eval_condition(&mut self, cond: &str, regs: Registers) -> bool {
        match expr::evaluate(cond, &regs, &mut self.conn) {
            Ok(value) => value != 0,
            Err(e) => {
                // Unevaluable guards suppress the hit.
                self.warn_condition_once(cond, &e.to_string());
                false
            }
        }
    }

    fn warn_condition_once(&mut self, key: &str, error: &str) {
        if self.warned_conditions.insert(key.to_string()) {
            self.events
                .warning(&format!("cannot evaluate '{}': {}", key, error));
        }
    }

    // ---- snapshots and state ----

    /// Load a `.sna` or `.nex` image and replay it onto the remote.
    pub fn load_snapshot(&mut self, path: &Path) -> Result<(), DebugError> {
        self.ensure_idle("load a snapshot")?;
        let image = snapshot::load(path)?;
        self.apply_snapshot(&image)
    }

    fn apply_snapshot(&mut self, image: &SnapshotImage) -> Result<(), DebugError> {
        for (bank, data) in &image.banks {
            if data.len() != snapshot::BANK16_SIZE {
                return Err(DebugError::Snapshot(format!(
                    "bank {} has {} bytes",
                    bank,
                    data.len()
                )));
            }
            // One 16 KiB bank is two wire banks.
            let half = snapshot::BANK16_SIZE / 2;
            self.conn.transact(&Command::WriteBank {
                bank: bank * 2,
                data: data[..half].to_vec(),
            })?;
            self.conn.transact(&Command::WriteBank {
                bank: bank * 2 + 1,
                data: data[half..].to_vec(),
            })?;
        }
        if let Some(border) = image.border {
            self.conn.transact(&Command::SetBorder { color: border })?;
        }
        for (index, value) in &image.registers {
            self.conn.transact(&Command::SetRegister {
                index: *index,
                value: *value,
            })?;
        }
        self.regs.invalidate();
        self.events.state_invalidated();
        Ok(())
    }

    /// Save the remote's opaque state blob, gzipped, to disk.
    pub fn save_state(&mut self, path: &Path) -> Result<(), DebugError> {
        self.ensure_idle("save state")?;
        if !self.capabilities.state() {
            return Err(DebugError::Unsupported("state save/restore"));
        }
        let blob = self.conn.transact(&Command::ReadState)?;
        let file = std::fs::File::create(path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&blob)?;
        encoder.finish()?;
        Ok(())
    }

    pub fn restore_state(&mut self, path: &Path) -> Result<(), DebugError> {
        self.ensure_idle("restore state")?;
        if !self.capabilities.state() {
            return Err(DebugError::Unsupported("state save/restore"));
        }
        let file = std::fs::File::open(path)?;
        let mut blob = Vec::new();
        GzDecoder::new(file).read_to_end(&mut blob)?;
        self.conn.transact(&Command::WriteState { data: blob })?;
        self.regs.invalidate();
        self.events.state_invalidated();
        Ok(())
    }

    // ---- slots and ZX Next passthroughs ----

    pub fn get_slots(&mut self) -> Result<[u8; 8], DebugError> {
        let payload = self.conn.transact(&Command::GetSlots)?;
        if payload.len() < 8 {
            return Err(DebugError::Protocol(format!(
                "GET_SLOTS returned {} bytes",
                payload.len()
            )));
        }
        let mut slots = [0u8; 8];
        slots.copy_from_slice(&payload[..8]);
        Ok(slots)
    }

    pub fn get_tbblue_register(&mut self, register: u8) -> Result<u8, DebugError> {
        self.ensure_tbblue()?;
        let payload = self.conn.transact(&Command::GetTbblueReg { reg: register })?;
        payload
            .first()
            .copied()
            .ok_or_else(|| DebugError::Protocol("empty TBBlue response".to_string()))
    }

    pub fn get_sprites_palette(&mut self, index: u8) -> Result<Vec<u8>, DebugError> {
        self.ensure_tbblue()?;
        self.conn.transact(&Command::GetSpritesPalette { index })
    }

    pub fn get_sprites(&mut self, slot: u8, count: u8) -> Result<Vec<u8>, DebugError> {
        self.ensure_tbblue()?;
        self.conn.transact(&Command::GetSprites { slot, count })
    }

    pub fn get_sprite_patterns(&mut self, index: u8, count: u8) -> Result<Vec<u8>, DebugError> {
        self.ensure_tbblue()?;
        self.conn
            .transact(&Command::GetSpritePatterns { index, count })
    }

    pub fn get_sprite_clip(&mut self) -> Result<[u8; 4], DebugError> {
        self.ensure_tbblue()?;
        let payload = self.conn.transact(&Command::GetSpriteClip)?;
        if payload.len() < 4 {
            return Err(DebugError::Protocol(format!(
                "GET_SPRITE_CLIP returned {} bytes",
                payload.len()
            )));
        }
        Ok([payload[0], payload[1], payload[2], payload[3]])
    }

    pub fn set_border(&mut self, color: u8) -> Result<(), DebugError> {
        self.conn.transact(&Command::SetBorder { color })?;
        Ok(())
    }

    // ---- teardown ----

    /// Remove every installed breakpoint and close the connection.
    /// Idempotent; remote errors during cleanup are logged and swallowed.
    pub fn disconnect(&mut self) {
        let user: Vec<(u16, u16)> = self
            .table
            .user_breakpoints()
            .map(|bp| (bp.id, bp.address))
            .collect();
        for (id, addr) in user {
            if let Err(e) = self.installer.remove(&mut self.conn, id, addr) {
                log::debug!("breakpoint {} cleanup failed: {}", id, e);
            }
            self.table.remove_user(id);
        }
        if self.table.asserts_enabled() {
            let _ = self.uninstall_asserts();
        }
        self.regs.invalidate();
        self.conn.disconnect();
    }

    fn ensure_idle(&self, what: &str) -> Result<(), DebugError> {
        if self.conn.is_resuming() {
            return Err(DebugError::Validation(format!(
                "cannot {} during an active resume",
                what
            )));
        }
        Ok(())
    }

    fn ensure_tbblue(&self) -> Result<(), DebugError> {
        if !self.capabilities.tbblue() {
            return Err(DebugError::Unsupported("TBBlue queries"));
        }
        Ok(())
    }
}

/// Derive the stored assert condition from a source-level assertion
/// predicate: the table keeps the *violation* predicate, so the assertion
/// text is inverted.
pub fn assert_condition_from_predicate(predicate: &str) -> String {
    format!("!({})", predicate)
}
