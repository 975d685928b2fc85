//! Transport endpoints: TCP, serial UART and WebSocket.
//!
//! A connection is split into a [`FrameReader`] and a [`FrameWriter`] with
//! independent ownership, so a pause request can be written from another
//! thread while the session thread is blocked reading.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::WebSocket;

use crate::frame::{Frame, FrameBuffer, ProtocolError};

/// How long a WebSocket poll tick waits before releasing the socket lock.
const WS_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Remote endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `host:port` TCP address (emulator remotes).
    Tcp(String),
    /// Serial device (ZX Next UART bridge).
    Serial { device: String, baud: u32 },
    /// `ws://` URL (browser-hosted emulator remotes).
    WebSocket(String),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Serial { device, baud } => write!(f, "{}@{}", device, baud),
            Endpoint::WebSocket(url) => write!(f, "{}", url),
        }
    }
}

/// Byte-stream transports (TCP and serial).
enum StreamInner {
    Tcp(TcpStream),
    Serial(Box<dyn SerialPort>),
}

impl StreamInner {
    fn try_clone(&self) -> Result<Self, ProtocolError> {
        match self {
            StreamInner::Tcp(s) => Ok(StreamInner::Tcp(s.try_clone()?)),
            StreamInner::Serial(s) => Ok(StreamInner::Serial(
                s.try_clone().map_err(serial_to_io)?,
            )),
        }
    }

    fn set_read_timeout(&mut self, dur: Duration) -> Result<(), ProtocolError> {
        match self {
            StreamInner::Tcp(s) => s.set_read_timeout(Some(dur))?,
            StreamInner::Serial(s) => s.set_timeout(dur).map_err(serial_to_io)?,
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if let StreamInner::Tcp(s) = self {
            let _ = s.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn serial_to_io(e: serialport::Error) -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

impl Read for StreamInner {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            StreamInner::Tcp(s) => s.read(buf),
            StreamInner::Serial(s) => s.read(buf),
        }
    }
}

impl Write for StreamInner {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StreamInner::Tcp(s) => s.write(buf),
            StreamInner::Serial(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            StreamInner::Tcp(s) => s.flush(),
            StreamInner::Serial(s) => s.flush(),
        }
    }
}

type WsSocket = WebSocket<MaybeTlsStream<TcpStream>>;

/// WebSocket handle shared between the reader and writer halves. The lock
/// is only held for one poll tick at a time, so writes interleave with a
/// blocked read within [`WS_POLL_INTERVAL`].
#[derive(Clone)]
struct WsShared(Arc<Mutex<WsSocket>>);

/// Reading half of a connection.
pub enum FrameReader {
    Stream {
        reader: BufReader<StreamInner>,
        timeout: Option<Duration>,
    },
    Ws {
        socket: WsShared,
        buffer: FrameBuffer,
    },
}

impl FrameReader {
    /// Read one frame, waiting at most `timeout`.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Frame, ProtocolError> {
        match self {
            FrameReader::Stream {
                reader,
                timeout: current,
            } => {
                if *current != Some(timeout) {
                    reader.get_mut().set_read_timeout(timeout)?;
                    *current = Some(timeout);
                }
                Frame::read_from(reader)
            }
            FrameReader::Ws { socket, buffer } => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(frame) = buffer.next_frame()? {
                        return Ok(frame);
                    }
                    let result = {
                        let mut ws = socket.0.lock().expect("websocket lock poisoned");
                        ws.read()
                    };
                    match result {
                        Ok(WsMessage::Binary(data)) => buffer.extend(&data),
                        Ok(WsMessage::Ping(data)) => {
                            let mut ws = socket.0.lock().expect("websocket lock poisoned");
                            let _ = ws.send(WsMessage::Pong(data));
                        }
                        Ok(WsMessage::Close(_)) => return Err(ProtocolError::ConnectionClosed),
                        Ok(_) => {} // text/pong/raw frames carry no protocol data
                        Err(tungstenite::Error::Io(e))
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            if Instant::now() >= deadline {
                                return Err(ProtocolError::Timeout);
                            }
                        }
                        Err(tungstenite::Error::ConnectionClosed)
                        | Err(tungstenite::Error::AlreadyClosed) => {
                            return Err(ProtocolError::ConnectionClosed)
                        }
                        Err(tungstenite::Error::Io(e)) => return Err(e.into()),
                        Err(e) => {
                            return Err(ProtocolError::Malformed(format!(
                                "websocket error: {}",
                                e
                            )))
                        }
                    }
                }
            }
        }
    }
}

/// Writing half of a connection. Cheap to wrap in `Arc<Mutex<_>>` and hand
/// to a pause handle.
pub enum FrameWriter {
    Stream(BufWriter<StreamInner>),
    Ws(WsShared),
}

impl FrameWriter {
    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        match self {
            FrameWriter::Stream(writer) => frame.write_to(writer),
            FrameWriter::Ws(socket) => {
                let mut ws = socket.0.lock().expect("websocket lock poisoned");
                ws.send(WsMessage::Binary(frame.encode())).map_err(|e| {
                    ProtocolError::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        e.to_string(),
                    ))
                })
            }
        }
    }

    /// Close the connection. Idempotent; errors from an already-dead peer
    /// are discarded.
    pub fn shutdown(&mut self) {
        match self {
            FrameWriter::Stream(writer) => {
                let _ = writer.flush();
                writer.get_mut().shutdown();
            }
            FrameWriter::Ws(socket) => {
                if let Ok(mut ws) = socket.0.lock() {
                    let _ = ws.close(None);
                    let _ = ws.flush();
                }
            }
        }
    }
}

/// Connect to an endpoint and split into reader and writer halves.
pub fn connect(
    endpoint: &Endpoint,
    connect_timeout: Duration,
) -> Result<(FrameReader, FrameWriter), ProtocolError> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let mut last_err = None;
            for sock_addr in addr.to_socket_addrs()? {
                match TcpStream::connect_timeout(&sock_addr, connect_timeout) {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        let read_half = StreamInner::Tcp(stream.try_clone()?);
                        let write_half = StreamInner::Tcp(stream);
                        return Ok((
                            FrameReader::Stream {
                                reader: BufReader::new(read_half),
                                timeout: None,
                            },
                            FrameWriter::Stream(BufWriter::new(write_half)),
                        ));
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err
                .map(ProtocolError::from)
                .unwrap_or_else(|| {
                    ProtocolError::Malformed(format!("address '{}' did not resolve", addr))
                }))
        }
        Endpoint::Serial { device, baud } => {
            let port = serialport::new(device.as_str(), *baud)
                .timeout(connect_timeout)
                .open()
                .map_err(serial_to_io)?;
            let read_half = StreamInner::Serial(port.try_clone().map_err(serial_to_io)?);
            let write_half = StreamInner::Serial(port);
            Ok((
                FrameReader::Stream {
                    reader: BufReader::new(read_half),
                    timeout: None,
                },
                FrameWriter::Stream(BufWriter::new(write_half)),
            ))
        }
        Endpoint::WebSocket(url) => {
            let (socket, _response) = tungstenite::connect(url.as_str()).map_err(|e| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    e.to_string(),
                ))
            })?;
            // Short read timeout turns the blocking read into a poll tick
            // so the writer half gets a chance at the lock.
            if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
                stream.set_read_timeout(Some(WS_POLL_INTERVAL))?;
            }
            let shared = WsShared(Arc::new(Mutex::new(socket)));
            Ok((
                FrameReader::Ws {
                    socket: shared.clone(),
                    buffer: FrameBuffer::new(),
                },
                FrameWriter::Ws(shared),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_frame_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);

            let frame = Frame::read_from(&mut reader).unwrap();
            assert_eq!(frame.opcode, 0x02);

            Frame::new(0x82, vec![0xAA]).write_to(&mut writer).unwrap();
        });

        let endpoint = Endpoint::Tcp(addr.to_string());
        let (mut reader, mut writer) =
            connect(&endpoint, Duration::from_secs(1)).unwrap();

        writer.write_frame(&Frame::new(0x02, vec![])).unwrap();
        let resp = reader.read_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(resp.opcode, 0x82);
        assert_eq!(resp.payload, vec![0xAA]);

        writer.shutdown();
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Keep the connection open but silent.
        let server = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
        });

        let endpoint = Endpoint::Tcp(addr.to_string());
        let (mut reader, _writer) = connect(&endpoint, Duration::from_secs(1)).unwrap();

        let err = reader.read_frame(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout));
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // Port 1 is essentially never listening.
        let endpoint = Endpoint::Tcp("127.0.0.1:1".to_string());
        assert!(connect(&endpoint, Duration::from_millis(200)).is_err());
    }
}
