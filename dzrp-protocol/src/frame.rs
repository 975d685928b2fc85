//! Frame layer: length-prefixed framing and partial-read reassembly.

use std::io::{Read, Write};

/// Channel tag used for all debugger traffic.
pub const CHANNEL_UART_DATA: u8 = 1;

/// Upper bound on a single frame body. A remote state blob is the largest
/// payload we ever expect; anything beyond this is a corrupt length field.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Protocol error types
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// I/O error during read/write
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    /// No data arrived within the allotted time
    #[error("timed out waiting for the remote")]
    Timeout,
    /// Remote closed the connection
    #[error("connection closed")]
    ConnectionClosed,
    /// Length field exceeds [`MAX_FRAME_LEN`]
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    /// Frame or payload does not match the expected layout
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Opcode not recognized by this protocol revision
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProtocolError::Timeout
            }
            _ => ProtocolError::Io(e),
        }
    }
}

/// A complete frame: channel tag, opcode and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u8,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame on the debugger channel.
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Frame {
            channel: CHANNEL_UART_DATA,
            opcode,
            payload,
        }
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Vec<u8> {
        // len covers channel + opcode + payload
        let len = (2 + self.payload.len()) as u32;
        let mut out = Vec::with_capacity(6 + self.payload.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.push(self.channel);
        out.push(self.opcode);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Write the frame and flush.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(&self.encode())?;
        writer.flush()?;
        Ok(())
    }

    /// Read one complete frame (blocking).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Frame, ProtocolError> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;

        if len < 2 {
            return Err(ProtocolError::Malformed(format!(
                "length field {} is too short for channel and opcode",
                len
            )));
        }
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;

        Ok(Frame {
            channel: body[0],
            opcode: body[1],
            payload: body[2..].to_vec(),
        })
    }
}

/// Reassembles frames from arbitrarily chunked reads.
///
/// Used by transports that deliver data in datagram-sized pieces rather
/// than as a byte stream.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer::default()
    }

    /// Append raw bytes received from the wire.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one has fully arrived.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.pending.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([
            self.pending[0],
            self.pending[1],
            self.pending[2],
            self.pending[3],
        ]) as usize;

        if len < 2 {
            return Err(ProtocolError::Malformed(format!(
                "length field {} is too short for channel and opcode",
                len
            )));
        }
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let total = 4 + len;
        if self.pending.len() < total {
            return Ok(None);
        }

        let frame = Frame {
            channel: self.pending[4],
            opcode: self.pending[5],
            payload: self.pending[6..total].to_vec(),
        };
        self.pending.drain(..total);
        Ok(Some(frame))
    }
}

/// Format bytes as a hex string for trace output.
pub fn fmt_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        // [len:u32-LE][channel][opcode][payload]
        let frame = Frame::new(0x05, vec![0xAB, 0xCD]);
        assert_eq!(
            frame.encode(),
            vec![0x04, 0x00, 0x00, 0x00, 0x01, 0x05, 0xAB, 0xCD]
        );
    }

    #[test]
    fn test_roundtrip() {
        let frame = Frame::new(0x82, vec![1, 2, 3, 4, 5]);
        let encoded = frame.encode();
        let decoded = Frame::read_from(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_short_length_rejected() {
        let bytes = [0x01, 0x00, 0x00, 0x00, 0x01];
        let err = Frame::read_from(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_buffer_reassembles_split_frames() {
        let frame = Frame::new(0x0B, vec![0x00, 0x80, 0x10, 0x00]);
        let encoded = frame.encode();

        let mut buf = FrameBuffer::new();
        // Feed one byte at a time; the frame must only appear once complete.
        for (i, byte) in encoded.iter().enumerate() {
            buf.extend(&[*byte]);
            let got = buf.next_frame().unwrap();
            if i + 1 < encoded.len() {
                assert!(got.is_none());
            } else {
                assert_eq!(got.unwrap(), frame);
            }
        }
    }

    #[test]
    fn test_buffer_two_frames_in_one_chunk() {
        let a = Frame::new(0x02, vec![]);
        let b = Frame::new(0x06, vec![0x01]);
        let mut bytes = a.encode();
        bytes.extend(b.encode());

        let mut buf = FrameBuffer::new();
        buf.extend(&bytes);
        assert_eq!(buf.next_frame().unwrap().unwrap(), a);
        assert_eq!(buf.next_frame().unwrap().unwrap(), b);
        assert!(buf.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = FrameBuffer::new();
        buf.extend(&(u32::MAX).to_le_bytes());
        assert!(matches!(
            buf.next_frame(),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
