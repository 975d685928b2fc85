use dzrp_protocol::ProtocolError;

use crate::expr::ExprError;

/// The overarching error type for all debugger operations.
#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    /// Transport failure (connection refused, timeout, closed). The
    /// current operation fails; the session survives where the link does.
    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),
    /// Protocol violation (malformed frame, unexpected opcode). Fatal to
    /// the session.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The remote lacks the capability for the requested operation.
    #[error("not supported by this remote: {0}")]
    Unsupported(&'static str),
    /// Request rejected before reaching the wire.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Condition or log expression could not be evaluated.
    #[error("expression error: {0}")]
    Expression(#[from] ExprError),
    /// Snapshot or state file could not be parsed or applied.
    #[error("snapshot error: {0}")]
    Snapshot(String),
    /// Host file I/O (snapshot and state files).
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
}
