//! # DZRP wire protocol
//!
//! Client-side implementation of the DZRP debugging protocol used to talk
//! to a Z80 remote (a real ZX Spectrum Next behind a UART bridge, or an
//! emulator exposing a socket).
//!
//! ## Wire format
//!
//! Every frame, in both directions:
//!
//! ```text
//! [len:u32-LE][channel:u8][opcode:u8][payload...]
//! ```
//!
//! The length field counts everything after itself, channel byte included.
//! The debugger uses channel 1 (`UART_DATA`) exclusively.
//!
//! ## Frame kinds
//!
//! | Direction | Opcode | Meaning |
//! |-----------|--------|---------|
//! | client → remote | `0x01..=0x15` | request (see [`command`]) |
//! | remote → client | request opcode with bit 7 set | response |
//! | remote → client | `NTF_PAUSE = 1` | asynchronous pause notification |
//!
//! Inbound frames with bit 7 clear are notifications; responses always
//! carry bit 7. Multi-byte integers are little-endian throughout.

pub mod command;
pub mod frame;
pub mod transport;

pub use command::{
    reg, BreakNumber, Capabilities, Command, InitResponse, PauseNotification, WatchAccess,
    DZRP_VERSION, NTF_PAUSE, RESPONSE_FLAG,
};
pub use frame::{fmt_hex, Frame, FrameBuffer, ProtocolError, CHANNEL_UART_DATA, MAX_FRAME_LEN};
pub use transport::{connect, Endpoint, FrameReader, FrameWriter};
