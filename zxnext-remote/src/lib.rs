//! # zxnext-remote
//!
//! Execution and breakpoint control for Z80 remotes speaking DZRP: a real
//! ZX Spectrum Next behind a UART bridge, or an emulator behind a socket.
//!
//! The remote only understands `CONTINUE` with up to two one-shot PC
//! breakpoints; everything a debugger front-end expects — step-over,
//! step-into, step-out, conditional breakpoints, logpoints, assertions,
//! watchpoint guards — is synthesized on this side of the wire:
//!
//! * [`session::ZxNextRemote`] is the operation surface.
//! * [`step`] classifies opcodes and drives the per-resume state machine.
//! * [`breakpoints`] keeps the table and the per-address hit index.
//! * [`expr`] evaluates guard expressions and logpoint format strings.
//! * [`snapshot`] parses `.sna`/`.nex` images for replay.
//! * [`installer`] hides whether the remote has native breakpoints or
//!   needs the trap-byte shim.

pub mod breakpoints;
pub mod connection;
pub mod error;
pub mod events;
pub mod expr;
pub mod installer;
pub mod registers;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod step;

pub use connection::{DzrpConnection, PauseHandle};
pub use error::DebugError;
pub use events::{EventSink, LabelResolver, LogEventSink, NoLabels};
pub use registers::{lookup_register, Registers};
pub use session::{assert_condition_from_predicate, StepResult, ZxNextRemote};
pub use settings::Settings;

pub use dzrp_protocol::{Capabilities, Endpoint, WatchAccess};
