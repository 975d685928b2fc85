//! Request dispatcher over a DZRP connection.
//!
//! Strictly one request in flight at a time. The single exception is the
//! resume window: between a `CONTINUE` and its matching pause
//! notification, the only command another thread may write is `PAUSE`
//! (through a [`PauseHandle`]); its ack is tolerated wherever it lands.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dzrp_protocol::command::CMD_PAUSE;
use dzrp_protocol::{
    fmt_hex, transport, Command, Endpoint, FrameReader, FrameWriter, InitResponse,
    PauseNotification, ProtocolError, CHANNEL_UART_DATA, NTF_PAUSE, RESPONSE_FLAG,
};

use crate::error::DebugError;
use crate::expr::{ExprError, MemoryAccess};

/// Poll granularity while waiting for a pause notification.
const PAUSE_POLL: Duration = Duration::from_millis(200);

pub struct DzrpConnection {
    reader: FrameReader,
    writer: Arc<Mutex<FrameWriter>>,
    pending_pauses: VecDeque<PauseNotification>,
    response_timeout: Duration,
    resume_in_flight: Arc<AtomicBool>,
    pause_requested: Arc<AtomicBool>,
    connected: bool,
}

impl DzrpConnection {
    /// Connect to the remote. No traffic beyond the TCP/serial/WebSocket
    /// handshake; callers follow up with [`init`](Self::init).
    pub fn open(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self, DebugError> {
        log::debug!("connecting to {}", endpoint);
        let (reader, writer) = transport::connect(endpoint, connect_timeout)?;
        Ok(DzrpConnection {
            reader,
            writer: Arc::new(Mutex::new(writer)),
            pending_pauses: VecDeque::new(),
            response_timeout,
            resume_in_flight: Arc::new(AtomicBool::new(false)),
            pause_requested: Arc::new(AtomicBool::new(false)),
            connected: true,
        })
    }

    /// Exchange protocol versions and capabilities.
    pub fn init(&mut self) -> Result<InitResponse, DebugError> {
        let payload = self.transact(&Command::Init)?;
        let init = InitResponse::parse(&payload).map_err(|e| self.fatal(e))?;
        log::debug!(
            "remote '{}' protocol {}.{}.{} caps {:#04x}",
            init.machine,
            init.version[0],
            init.version[1],
            init.version[2],
            init.capabilities.0
        );
        Ok(init)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_resuming(&self) -> bool {
        self.resume_in_flight.load(Ordering::SeqCst)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn clear_pause_request(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Handle for requesting a pause from another thread.
    pub fn pause_handle(&self) -> PauseHandle {
        PauseHandle {
            writer: self.writer.clone(),
            pause_requested: self.pause_requested.clone(),
            resume_in_flight: self.resume_in_flight.clone(),
        }
    }

    /// Send a request and block for its response payload.
    pub fn transact(&mut self, cmd: &Command) -> Result<Vec<u8>, DebugError> {
        if !self.connected {
            return Err(DebugError::Transport(ProtocolError::ConnectionClosed));
        }
        if matches!(cmd, Command::Continue { .. }) && self.is_resuming() {
            return Err(DebugError::Validation(
                "a resume is already in flight".to_string(),
            ));
        }

        let frame = cmd.encode();
        log::trace!("-> {:02X} {}", frame.opcode, fmt_hex(&frame.payload));
        self.write(&frame)?;

        if matches!(cmd, Command::Continue { .. }) {
            self.resume_in_flight.store(true, Ordering::SeqCst);
        }

        let expected = cmd.opcode() | RESPONSE_FLAG;
        let result = self.await_response(expected);
        if result.is_err() && matches!(cmd, Command::Continue { .. }) {
            self.resume_in_flight.store(false, Ordering::SeqCst);
        }
        result
    }

    fn await_response(&mut self, expected: u8) -> Result<Vec<u8>, DebugError> {
        let deadline = Instant::now() + self.response_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(DebugError::Transport(ProtocolError::Timeout));
            }
            let frame = match self.reader.read_frame(deadline - now) {
                Ok(frame) => frame,
                Err(ProtocolError::Timeout) => {
                    return Err(DebugError::Transport(ProtocolError::Timeout))
                }
                Err(e) => return Err(self.fatal(e)),
            };
            log::trace!("<- {:02X} {}", frame.opcode, fmt_hex(&frame.payload));
            if frame.channel != CHANNEL_UART_DATA {
                log::warn!("skipping frame on unexpected channel {}", frame.channel);
                continue;
            }
            if frame.opcode & RESPONSE_FLAG != 0 {
                if frame.opcode == expected {
                    return Ok(frame.payload);
                }
                if frame.opcode == RESPONSE_FLAG | CMD_PAUSE {
                    // ack for a PAUSE written by the pause handle
                    log::debug!("dropping stray pause ack");
                    continue;
                }
                self.connected = false;
                return Err(DebugError::Protocol(format!(
                    "expected response {:#04x}, got {:#04x}",
                    expected, frame.opcode
                )));
            }
            if frame.opcode == NTF_PAUSE {
                let ntf = PauseNotification::parse(&frame.payload)
                    .map_err(|e| self.fatal(e))?;
                self.pending_pauses.push_back(ntf);
                continue;
            }
            log::warn!("ignoring unknown notification {:#04x}", frame.opcode);
        }
    }

    /// Block until the pause notification terminating the active resume.
    ///
    /// Waits indefinitely while the program runs free; once a manual pause
    /// has been requested the remote gets one response timeout to deliver
    /// the notification before the wait turns into a fatal error.
    pub fn wait_pause(&mut self) -> Result<PauseNotification, DebugError> {
        let mut deadline: Option<Instant> = None;
        loop {
            if let Some(ntf) = self.pending_pauses.pop_front() {
                self.resume_in_flight.store(false, Ordering::SeqCst);
                return Ok(ntf);
            }
            if deadline.is_none() && self.pause_requested() {
                deadline = Some(Instant::now() + self.response_timeout);
                // The handle may have set the flag before the resume went
                // out; make sure the remote actually sees a PAUSE.
                let _ = self.write(&Command::Pause.encode());
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    self.connected = false;
                    self.resume_in_flight.store(false, Ordering::SeqCst);
                    return Err(DebugError::Transport(ProtocolError::Timeout));
                }
            }
            let frame = match self.reader.read_frame(PAUSE_POLL) {
                Ok(frame) => frame,
                Err(ProtocolError::Timeout) => continue,
                Err(e) => {
                    self.resume_in_flight.store(false, Ordering::SeqCst);
                    return Err(self.fatal(e));
                }
            };
            log::trace!("<- {:02X} {}", frame.opcode, fmt_hex(&frame.payload));
            if frame.channel != CHANNEL_UART_DATA {
                continue;
            }
            if frame.opcode == NTF_PAUSE {
                self.resume_in_flight.store(false, Ordering::SeqCst);
                return Ok(PauseNotification::parse(&frame.payload).map_err(|e| self.fatal(e))?);
            }
            if frame.opcode == RESPONSE_FLAG | CMD_PAUSE {
                log::debug!("dropping stray pause ack");
                continue;
            }
            self.connected = false;
            self.resume_in_flight.store(false, Ordering::SeqCst);
            return Err(DebugError::Protocol(format!(
                "unexpected frame {:#04x} during resume",
                frame.opcode
            )));
        }
    }

    /// Read a memory block.
    pub fn read_mem(&mut self, addr: u16, size: u16) -> Result<Vec<u8>, DebugError> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let data = self.transact(&Command::ReadMem { addr, size })?;
        if data.len() != size as usize {
            return Err(DebugError::Protocol(format!(
                "READ_MEM returned {} bytes, requested {}",
                data.len(),
                size
            )));
        }
        Ok(data)
    }

    /// Write a memory block.
    pub fn write_mem(&mut self, addr: u16, data: &[u8]) -> Result<(), DebugError> {
        if data.is_empty() {
            return Ok(());
        }
        self.transact(&Command::WriteMem {
            addr,
            data: data.to_vec(),
        })?;
        Ok(())
    }

    /// Tear down the connection. Idempotent.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Ok(mut writer) = self.writer.lock() {
            writer.shutdown();
        }
    }

    fn write(&mut self, frame: &dzrp_protocol::Frame) -> Result<(), DebugError> {
        let writer = self.writer.clone();
        let mut guard = writer
            .lock()
            .map_err(|_| DebugError::Protocol("writer lock poisoned".to_string()))?;
        if let Err(e) = guard.write_frame(frame) {
            self.connected = false;
            return Err(DebugError::Transport(e));
        }
        Ok(())
    }

    fn fatal(&mut self, e: ProtocolError) -> DebugError {
        self.connected = false;
        match e {
            ProtocolError::Malformed(msg) => DebugError::Protocol(msg),
            ProtocolError::UnknownOpcode(op) => {
                DebugError::Protocol(format!("unknown opcode {:#04x}", op))
            }
            other => DebugError::Transport(other),
        }
    }
}

impl MemoryAccess for DzrpConnection {
    fn read_byte(&mut self, addr: u16) -> Result<u8, ExprError> {
        let data = self
            .read_mem(addr, 1)
            .map_err(|e| ExprError::Memory(e.to_string()))?;
        Ok(data[0])
    }
}

/// Cloneable cross-thread pause requester.
///
/// Sets the sticky pause flag and, if a resume is in flight, writes a
/// `PAUSE` command directly; the session thread consumes both the ack and
/// the resulting notification.
#[derive(Clone)]
pub struct PauseHandle {
    writer: Arc<Mutex<FrameWriter>>,
    pause_requested: Arc<AtomicBool>,
    resume_in_flight: Arc<AtomicBool>,
}

impl PauseHandle {
    pub fn pause(&self) -> Result<(), DebugError> {
        self.pause_requested.store(true, Ordering::SeqCst);
        if self.resume_in_flight.load(Ordering::SeqCst) {
            let frame = Command::Pause.encode();
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| DebugError::Protocol("writer lock poisoned".to_string()))?;
            writer.write_frame(&frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dzrp_protocol::command::{CMD_CONTINUE, CMD_GET_SLOTS, CMD_READ_MEM};
    use dzrp_protocol::{BreakNumber, Frame};
    use std::io::{BufReader, BufWriter};
    use std::net::TcpListener;
    use std::thread;

    fn ntf_frame(break_number: BreakNumber, addr: u16) -> Frame {
        let ntf = PauseNotification {
            break_number,
            break_address: addr,
            reason: String::new(),
        };
        Frame::new(NTF_PAUSE, ntf.to_payload())
    }

    fn open_pair(
        server: impl FnOnce(std::net::TcpStream) + Send + 'static,
    ) -> (DzrpConnection, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            server(stream);
        });
        let conn = DzrpConnection::open(
            &Endpoint::Tcp(addr.to_string()),
            Duration::from_secs(1),
            Duration::from_millis(500),
        )
        .unwrap();
        (conn, handle)
    }

    #[test]
    fn test_notification_queued_during_transact() {
        let (mut conn, handle) = open_pair(|stream| {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            let req = Frame::read_from(&mut reader).unwrap();
            assert_eq!(req.opcode, CMD_GET_SLOTS);
            // Notification slips in ahead of the response.
            ntf_frame(BreakNumber::NoReason, 0x1234)
                .write_to(&mut writer)
                .unwrap();
            Frame::new(CMD_GET_SLOTS | RESPONSE_FLAG, vec![0; 8])
                .write_to(&mut writer)
                .unwrap();
        });

        let payload = conn.transact(&Command::GetSlots).unwrap();
        assert_eq!(payload.len(), 8);
        // The queued notification terminates the next wait.
        let ntf = conn.wait_pause().unwrap();
        assert_eq!(ntf.break_address, 0x1234);
        handle.join().unwrap();
    }

    #[test]
    fn test_second_continue_rejected_while_resuming() {
        let (mut conn, handle) = open_pair(|stream| {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            let req = Frame::read_from(&mut reader).unwrap();
            assert_eq!(req.opcode, CMD_CONTINUE);
            Frame::new(CMD_CONTINUE | RESPONSE_FLAG, vec![])
                .write_to(&mut writer)
                .unwrap();
            // Keep the stream open until the client is done.
            let _ = Frame::read_from(&mut reader);
        });

        conn.transact(&Command::Continue {
            bp1: None,
            bp2: None,
        })
        .unwrap();
        assert!(conn.is_resuming());
        let err = conn
            .transact(&Command::Continue {
                bp1: None,
                bp2: None,
            })
            .unwrap_err();
        assert!(matches!(err, DebugError::Validation(_)));
        conn.disconnect();
        handle.join().unwrap();
    }

    #[test]
    fn test_request_timeout_is_not_fatal() {
        let (mut conn, handle) = open_pair(|stream| {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            // Ignore the first request entirely.
            let _ = Frame::read_from(&mut reader).unwrap();
            // Serve the second.
            let req = Frame::read_from(&mut reader).unwrap();
            assert_eq!(req.opcode, CMD_READ_MEM);
            Frame::new(CMD_READ_MEM | RESPONSE_FLAG, vec![0xAA])
                .write_to(&mut writer)
                .unwrap();
        });

        let err = conn.read_mem(0x4000, 1).unwrap_err();
        assert!(matches!(
            err,
            DebugError::Transport(ProtocolError::Timeout)
        ));
        assert!(conn.is_connected());
        let data = conn.read_mem(0x4000, 1).unwrap();
        assert_eq!(data, vec![0xAA]);
        handle.join().unwrap();
    }

    #[test]
    fn test_unexpected_response_is_fatal() {
        let (mut conn, handle) = open_pair(|stream| {
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            let _ = Frame::read_from(&mut reader).unwrap();
            Frame::new(0xFF, vec![]).write_to(&mut writer).unwrap();
        });

        let err = conn.transact(&Command::GetSlots).unwrap_err();
        assert!(matches!(err, DebugError::Protocol(_)));
        assert!(!conn.is_connected());
        handle.join().unwrap();
    }
}
