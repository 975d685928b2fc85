//! Breakpoint installation strategies.
//!
//! The session talks to a [`BreakpointInstaller`] and never learns which
//! one is active. [`ProtocolInstaller`] is the plain `ADD_BP`/`REMOVE_BP`
//! path; [`TrapInstaller`] additionally preserves the displaced byte for
//! remotes whose add overwrites the opcode with an RST trap, and restores
//! it on removal.

use std::collections::HashMap;

use dzrp_protocol::command::read_u16_le;
use dzrp_protocol::Command;

use crate::connection::DzrpConnection;
use crate::error::DebugError;

pub trait BreakpointInstaller {
    /// Install a breakpoint and return the remote-assigned id (0 when the
    /// remote is out of breakpoints).
    fn add(&mut self, conn: &mut DzrpConnection, addr: u16) -> Result<u16, DebugError>;

    fn remove(&mut self, conn: &mut DzrpConnection, id: u16, addr: u16)
        -> Result<(), DebugError>;
}

fn protocol_add(conn: &mut DzrpConnection, addr: u16) -> Result<u16, DebugError> {
    let payload = conn.transact(&Command::AddBreakpoint { addr })?;
    read_u16_le(&payload, 0).map_err(|e| DebugError::Protocol(e.to_string()))
}

/// Native software breakpoints.
pub struct ProtocolInstaller;

impl BreakpointInstaller for ProtocolInstaller {
    fn add(&mut self, conn: &mut DzrpConnection, addr: u16) -> Result<u16, DebugError> {
        protocol_add(conn, addr)
    }

    fn remove(
        &mut self,
        conn: &mut DzrpConnection,
        id: u16,
        _addr: u16,
    ) -> Result<(), DebugError> {
        conn.transact(&Command::RemoveBreakpoint { id })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Displaced {
    address: u16,
    opcode: u8,
}

/// Opcode-substitution shim.
///
/// Invariant: for every id this installer knows, the byte at its address
/// in remote memory is the trap opcode until removal, at which point the
/// displaced byte is written back.
#[derive(Default)]
pub struct TrapInstaller {
    displaced: HashMap<u16, Displaced>,
}

impl TrapInstaller {
    pub fn new() -> Self {
        TrapInstaller::default()
    }
}

impl BreakpointInstaller for TrapInstaller {
    fn add(&mut self, conn: &mut DzrpConnection, addr: u16) -> Result<u16, DebugError> {
        // Without the displaced byte the restore invariant cannot hold, so
        // a failed read refuses the whole add.
        let byte = conn.read_mem(addr, 1).map_err(|e| {
            DebugError::Validation(format!(
                "cannot read displaced byte at {:#06x}: {}",
                addr, e
            ))
        })?;
        let id = protocol_add(conn, addr)?;
        if id != 0 {
            self.displaced.insert(
                id,
                Displaced {
                    address: addr,
                    opcode: byte[0],
                },
            );
        }
        Ok(id)
    }

    fn remove(
        &mut self,
        conn: &mut DzrpConnection,
        id: u16,
        _addr: u16,
    ) -> Result<(), DebugError> {
        conn.transact(&Command::RemoveBreakpoint { id })?;
        if let Some(d) = self.displaced.remove(&id) {
            conn.write_mem(d.address, &[d.opcode])?;
        }
        Ok(())
    }
}
